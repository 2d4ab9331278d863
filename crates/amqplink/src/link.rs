//! Link state machine shared by senders and receivers.
//!
//! State is only ever changed by events the connection routes to the link's
//! channel, or by the link's own open/detach calls. Owners read it before every
//! send or receive step.

use std::fmt;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::engine::{AttachParams, DeliveryOutcome, LinkHandle, Role};
use crate::error::{AmqpError, Result};
use crate::message::Message;
use crate::session::Session;

/// Link lifecycle. `Closed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
    Error,
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Error)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Opening => "opening",
            LinkState::Open => "open",
            LinkState::Closing => "closing",
            LinkState::Closed => "closed",
            LinkState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Event routed from the connection to one link.
#[derive(Debug, Clone)]
pub(crate) enum LinkEvent {
    Attached { max_message_size: Option<u64> },
    Detached { error: Option<String> },
    Credit(u32),
    Delivery { delivery_id: u64, message: Message, settled: bool },
    Disposition { delivery_id: u64, outcome: DeliveryOutcome },
    ConnectionClosed { error: Option<String> },
}

pub(crate) struct LinkCore {
    session: Session,
    name: String,
    role: Role,
    handle: Option<LinkHandle>,
    events: Option<UnboundedReceiver<LinkEvent>>,
    state: LinkState,
    error: Option<String>,
    max_message_size: u64,
}

impl LinkCore {
    pub(crate) fn new(session: &Session, name: String, role: Role, max_message_size: u64) -> Self {
        Self {
            session: session.clone(),
            name,
            role,
            handle: None,
            events: None,
            state: LinkState::Idle,
            error: None,
            max_message_size,
        }
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn handle(&self) -> Option<LinkHandle> {
        self.handle
    }

    pub(crate) fn state(&self) -> LinkState {
        self.state
    }

    pub(crate) fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Negotiated maximum message size.
    pub(crate) fn max_message_size(&self) -> u64 {
        self.max_message_size
    }

    /// Sends ATTACH. A no-op unless the link is idle.
    pub(crate) fn attach(&mut self, params: &AttachParams) -> Result<()> {
        if self.state != LinkState::Idle {
            return Ok(());
        }
        self.set_state(LinkState::Opening);
        match self.session.attach_link(params) {
            Ok((handle, events)) => {
                self.handle = Some(handle);
                self.events = Some(events);
                Ok(())
            }
            Err(e) => {
                self.error = Some(e.to_string());
                self.set_state(LinkState::Error);
                Err(AmqpError::Connection {
                    reason: format!(
                        "failed to open {:?} link {}: {}; confirm credentials and address",
                        self.role, self.name, e
                    ),
                })
            }
        }
    }

    /// Takes the next routed event, applying any state change it implies.
    pub(crate) fn next_event(&mut self) -> Option<LinkEvent> {
        let events = self.events.as_mut()?;
        let event = match events.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => {
                self.events = None;
                if !self.state.is_terminal() {
                    self.fail("link channel closed".to_string());
                }
                return None;
            }
        };

        match &event {
            LinkEvent::Attached { max_message_size } => {
                if let Some(size) = max_message_size {
                    if *size > 0 && *size < self.max_message_size {
                        self.max_message_size = *size;
                    }
                }
                if self.state == LinkState::Opening {
                    self.set_state(LinkState::Open);
                }
            }
            LinkEvent::Detached { error: Some(reason) } => {
                if !self.state.is_terminal() {
                    self.fail(reason.clone());
                }
            }
            LinkEvent::Detached { error: None } => {
                if !self.state.is_terminal() {
                    self.set_state(LinkState::Closed);
                }
            }
            LinkEvent::ConnectionClosed { error } => {
                if !self.state.is_terminal() {
                    self.fail(error.clone().unwrap_or_else(|| "connection closed".to_string()));
                }
            }
            _ => {}
        }
        Some(event)
    }

    pub(crate) fn fail(&mut self, reason: String) {
        warn!(link = %self.name, role = ?self.role, reason = %reason, "link failed");
        self.error = Some(reason);
        self.set_state(LinkState::Error);
    }

    /// Detaches the link and stops routing to it. Safe to call repeatedly.
    pub(crate) fn detach(&mut self) {
        if let Some(handle) = self.handle.take() {
            if matches!(self.state, LinkState::Opening | LinkState::Open) {
                self.set_state(LinkState::Closing);
            }
            if let Err(e) = self.session.detach_link(handle) {
                debug!(link = %self.name, error = %e, "detach failed");
            }
        }
        self.events = None;
        if self.state != LinkState::Error {
            self.set_state(LinkState::Closed);
        }
    }

    fn set_state(&mut self, new_state: LinkState) {
        if self.state != new_state {
            debug!(link = %self.name, role = ?self.role, from = %self.state, to = %new_state, "link state changed");
            self.state = new_state;
        }
    }
}

impl Drop for LinkCore {
    fn drop(&mut self) {
        self.detach();
    }
}
