//! Sender link.
//!
//! Messages handed to `send_async` wait in an outbound queue until the link is
//! open and has credit, then are transferred in queue order. Each send is
//! identified by a caller-chosen tag; its outcome is reported later through
//! `take_completions`, never as a return value.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SendConfig;
use crate::engine::{AttachParams, DeliveryOutcome, ReceiverSettleMode, Role, SenderSettleMode};
use crate::error::Result;
use crate::link::{LinkCore, LinkEvent, LinkState};
use crate::message::{Message, SendResult};
use crate::session::Session;
use crate::tick::TickCounter;
use crate::value::PropertyMap;

/// Final outcome of one `send_async` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCompletion {
    pub tag: u64,
    pub result: SendResult,
}

struct Outbound {
    tag: u64,
    message: Message,
    expires_at: Option<u64>,
}

struct InFlight {
    tag: u64,
    expires_at: Option<u64>,
}

/// Sending half of a link: queues messages and transfers them under link credit.
pub struct MessageSender {
    link: LinkCore,
    counter: TickCounter,
    source: String,
    target: String,
    settle_mode: SenderSettleMode,
    link_credit: Option<u32>,
    properties: PropertyMap,
    credit: u32,
    next_delivery_id: u64,
    outbound: VecDeque<Outbound>,
    in_flight: HashMap<u64, InFlight>,
    completions: Vec<SendCompletion>,
}

impl MessageSender {
    /// Creates a sender on `session`. The link is not attached until `open`.
    pub fn new(session: &Session, source: &str, target: &str, name: Option<String>, config: &SendConfig) -> Self {
        let name = name.unwrap_or_else(|| format!("sender-link-{}", Uuid::new_v4()));
        Self {
            counter: session.connection().counter().clone(),
            link: LinkCore::new(session, name, Role::Sender, config.max_message_size),
            source: source.to_string(),
            target: target.to_string(),
            settle_mode: config.send_settle_mode,
            link_credit: config.link_credit,
            properties: config.link_properties.clone(),
            credit: 0,
            next_delivery_id: 0,
            outbound: VecDeque::new(),
            in_flight: HashMap::new(),
            completions: Vec::new(),
        }
    }

    /// Attaches the link.
    ///
    /// Fails with a connection error when the ATTACH cannot be sent, which is
    /// usually a bad target address or rejected credentials.
    pub fn open(&mut self) -> Result<()> {
        let params = AttachParams {
            name: self.link.name().to_string(),
            role: Role::Sender,
            source: self.source.clone(),
            target: self.target.clone(),
            send_settle_mode: self.settle_mode,
            receive_settle_mode: ReceiverSettleMode::PeekLock,
            max_message_size: self.link.max_message_size(),
            initial_credit: None,
            properties: self.properties.clone(),
        };
        self.link.attach(&params)
    }

    pub fn name(&self) -> &str {
        self.link.name()
    }

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    pub fn error(&self) -> Option<&str> {
        self.link.error()
    }

    pub fn settle_mode(&self) -> SenderSettleMode {
        self.settle_mode
    }

    pub fn max_message_size(&self) -> u64 {
        self.link.max_message_size()
    }

    pub fn credit(&self) -> u32 {
        self.credit
    }

    /// Messages queued or awaiting a disposition.
    pub fn pending(&self) -> usize {
        self.outbound.len() + self.in_flight.len()
    }

    /// Queues `message` for transfer. A zero `timeout` never expires.
    pub fn send_async(&mut self, tag: u64, message: Message, timeout: Duration) {
        let expires_at = if timeout.is_zero() {
            None
        } else {
            Some(self.counter.current_ms().saturating_add(timeout.as_millis() as u64))
        };
        self.outbound.push_back(Outbound { tag, message, expires_at });
    }

    /// Applies routed events, expires stale messages, queued or unsettled, and transfers what credit allows.
    pub fn pump(&mut self) {
        while let Some(event) = self.link.next_event() {
            match event {
                LinkEvent::Credit(credit) => self.credit = credit,
                LinkEvent::Disposition { delivery_id, outcome } => self.on_disposition(delivery_id, outcome),
                LinkEvent::Attached { .. } => {
                    debug!(link = %self.link.name(), max_message_size = self.link.max_message_size(), "sender attached")
                }
                _ => {}
            }
        }

        if self.link.state().is_terminal() {
            self.cancel_all();
            return;
        }
        self.expire();
        if self.link.state() == LinkState::Open {
            self.flush();
        }
    }

    /// Drains outcomes recorded since the last call.
    pub fn take_completions(&mut self) -> Vec<SendCompletion> {
        std::mem::take(&mut self.completions)
    }

    /// Detaches the link, cancelling anything not yet settled.
    pub fn destroy(&mut self) {
        self.link.detach();
        self.cancel_all();
    }

    fn complete(&mut self, tag: u64, result: SendResult) {
        self.completions.push(SendCompletion { tag, result });
    }

    fn on_disposition(&mut self, delivery_id: u64, outcome: DeliveryOutcome) {
        let Some(InFlight { tag, .. }) = self.in_flight.remove(&delivery_id) else {
            debug!(link = %self.link.name(), delivery_id, "disposition for unknown delivery");
            return;
        };
        let result = match outcome {
            DeliveryOutcome::Accepted => SendResult::Ok,
            DeliveryOutcome::Rejected { condition, description } => {
                SendResult::Error(match description {
                    Some(d) => format!("{}: {}", condition, d),
                    None => condition,
                })
            }
            DeliveryOutcome::Released => SendResult::Error("released by peer".to_string()),
            DeliveryOutcome::Modified => SendResult::Error("modified by peer".to_string()),
        };
        self.complete(tag, result);
    }

    fn expire(&mut self) {
        let now = self.counter.current_ms();
        let mut kept = VecDeque::with_capacity(self.outbound.len());
        for item in self.outbound.drain(..) {
            match item.expires_at {
                Some(expiry) if now >= expiry => {
                    debug!(link = %self.link.name(), tag = item.tag, "message expired before transfer");
                    self.completions.push(SendCompletion { tag: item.tag, result: SendResult::Timeout });
                }
                _ => kept.push_back(item),
            }
        }
        self.outbound = kept;

        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, item)| item.expires_at.is_some_and(|expiry| now >= expiry))
            .map(|(delivery_id, _)| *delivery_id)
            .collect();
        for delivery_id in expired {
            if let Some(item) = self.in_flight.remove(&delivery_id) {
                debug!(link = %self.link.name(), tag = item.tag, delivery_id, "message expired awaiting disposition");
                self.complete(item.tag, SendResult::Timeout);
            }
        }
    }

    fn flush(&mut self) {
        let Some(handle) = self.link.handle() else {
            return;
        };
        let connection = self.link.session().connection().clone();
        let settled = self.settle_mode == SenderSettleMode::Settled;
        let mut budget = self.link_credit.unwrap_or(u32::MAX);

        while self.credit > 0 && budget > 0 {
            let Some(item) = self.outbound.pop_front() else {
                break;
            };
            let max = self.link.max_message_size();
            if max > 0 && item.message.size() > max {
                warn!(link = %self.link.name(), size = item.message.size(), max, "message exceeds link max message size");
                self.complete(
                    item.tag,
                    SendResult::Error(format!("message too large: {} bytes (max {})", item.message.size(), max)),
                );
                continue;
            }

            let delivery_id = self.next_delivery_id;
            self.next_delivery_id += 1;
            match connection.transfer(handle, delivery_id, &item.message, settled) {
                Ok(()) => {
                    self.credit -= 1;
                    budget -= 1;
                    if settled {
                        self.complete(item.tag, SendResult::Ok);
                    } else {
                        self.in_flight.insert(
                            delivery_id,
                            InFlight {
                                tag: item.tag,
                                expires_at: item.expires_at,
                            },
                        );
                    }
                }
                Err(e) => {
                    warn!(link = %self.link.name(), error = %e, "transfer failed");
                    self.complete(item.tag, SendResult::Error(e.to_string()));
                }
            }
        }
    }

    fn cancel_all(&mut self) {
        let outbound: Vec<u64> = self.outbound.drain(..).map(|item| item.tag).collect();
        let mut in_flight: Vec<(u64, u64)> = self.in_flight.drain().map(|(id, item)| (id, item.tag)).collect();
        in_flight.sort_unstable();
        let in_flight = in_flight.into_iter().map(|(_, tag)| tag);
        for tag in outbound.into_iter().chain(in_flight) {
            self.complete(tag, SendResult::Cancelled);
        }
    }
}

impl std::fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSender")
            .field("name", &self.link.name())
            .field("state", &self.link.state())
            .field("credit", &self.credit)
            .field("pending", &self.pending())
            .finish()
    }
}
