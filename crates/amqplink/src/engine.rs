//! The transport engine seam.
//!
//! A `TransportEngine` owns the socket, TLS, SASL and AMQP frame codec. The core
//! drives it with one non-blocking `tick` per iteration and reads back the typed
//! events that pass produced. Everything above this trait is protocol state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::auth::Auth;
use crate::error::Result;
use crate::message::Message;
use crate::value::PropertyMap;

/// Engine-assigned session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u32);

/// Engine-assigned link identifier, unique per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkHandle(pub u32);

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Sender,
    Receiver,
}

/// Whether transfers from a sender wait for a disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderSettleMode {
    Unsettled,
    Settled,
    Mixed,
}

/// Whether received messages are locked until accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiverSettleMode {
    PeekLock,
    ReceiveAndDelete,
}

/// Parameters for opening the connection.
#[derive(Debug, Clone)]
pub struct OpenParams {
    pub hostname: String,
    pub port: u16,
    pub container_id: String,
    pub auth: Auth,
    pub max_frame_size: u32,
    pub channel_max: Option<u16>,
    pub idle_timeout_ms: Option<u64>,
    pub properties: PropertyMap,
    pub idle_empty_frame_ratio: f64,
    pub trace: bool,
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: Option<u32>,
}

/// Parameters for an ATTACH.
#[derive(Debug, Clone)]
pub struct AttachParams {
    pub name: String,
    pub role: Role,
    pub source: String,
    pub target: String,
    pub send_settle_mode: SenderSettleMode,
    pub receive_settle_mode: ReceiverSettleMode,
    pub max_message_size: u64,
    /// Credit granted with the attach (receivers only).
    pub initial_credit: Option<u32>,
    pub properties: PropertyMap,
}

/// Terminal state of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Accepted,
    Rejected { condition: String, description: Option<String> },
    Released,
    Modified,
}

/// What one `tick` observed.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The peer answered an ATTACH.
    Attached { link: LinkHandle, max_message_size: Option<u64> },
    /// The peer detached a link; `error` is set when it was refused or failed.
    Detached { link: LinkHandle, error: Option<String> },
    /// New link credit for a sender.
    Credit { link: LinkHandle, credit: u32 },
    /// A message arrived on a receiver.
    Delivery { link: LinkHandle, delivery_id: u64, message: Message, settled: bool },
    /// The peer settled a sent delivery.
    Disposition { link: LinkHandle, delivery_id: u64, outcome: DeliveryOutcome },
    /// The connection is gone.
    ConnectionClosed { error: Option<String> },
}

impl EngineEvent {
    pub fn link(&self) -> Option<LinkHandle> {
        match self {
            EngineEvent::Attached { link, .. }
            | EngineEvent::Detached { link, .. }
            | EngineEvent::Credit { link, .. }
            | EngineEvent::Delivery { link, .. }
            | EngineEvent::Disposition { link, .. } => Some(*link),
            EngineEvent::ConnectionClosed { .. } => None,
        }
    }
}

/// Wire-level AMQP engine driven by a [`Connection`](crate::connection::Connection).
///
/// Errors from `tick` are classified with [`AmqpError::is_fatal`](crate::error::AmqpError::is_fatal):
/// transient ones are absorbed and the tick is retried on the next pass.
pub trait TransportEngine: Send {
    /// Establishes the transport and sends OPEN.
    fn open(&mut self, params: &OpenParams) -> Result<()>;

    /// Performs one bounded, non-blocking I/O pass.
    fn tick(&mut self) -> Result<Vec<EngineEvent>>;

    fn begin_session(&mut self, params: &SessionParams) -> Result<SessionHandle>;

    fn end_session(&mut self, session: SessionHandle) -> Result<()>;

    /// Sends ATTACH. The peer's answer arrives later as `Attached` or `Detached`.
    fn attach(&mut self, session: SessionHandle, params: &AttachParams) -> Result<LinkHandle>;

    fn detach(&mut self, link: LinkHandle) -> Result<()>;

    /// Queues a transfer on a sender link.
    fn transfer(&mut self, link: LinkHandle, delivery_id: u64, message: &Message, settled: bool) -> Result<()>;

    /// Settles a received delivery.
    fn settle(&mut self, link: LinkHandle, delivery_id: u64, outcome: DeliveryOutcome) -> Result<()>;

    /// Grants credit on a receiver link.
    fn flow(&mut self, link: LinkHandle, credit: u32) -> Result<()>;

    /// Sends CLOSE and releases the transport.
    fn close(&mut self) -> Result<()>;
}

/// Creates engines for connections a client opens itself.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Box<dyn TransportEngine>;
}
