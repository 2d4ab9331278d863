//! AMQP 1.0 client engine: connection, session and link state machines, CBS token renewal, management request/response

pub mod address;
pub mod async_client;
pub mod auth;
pub mod cbs;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod constants;
pub mod deadline;
pub mod engine;
pub mod error;
pub mod link;
pub mod message;
pub mod mgmt;
pub mod receive_client;
pub mod receiver;
pub mod retry;
pub mod sas;
pub mod send_client;
pub mod sender;
pub mod session;
pub mod sim;
pub mod tick;
pub mod value;

pub use address::{Address, Source, Target};
pub use async_client::{AsyncAmqpClient, AsyncReceiveClient, AsyncSendClient};
pub use auth::{Auth, SasTokenAuth, TokenExpiry};
pub use cbs::{CbsAuthenticator, CbsStatus, Sleeper, ThreadSleeper, TokenProgress};
pub use client::{AmqpClient, ClientOptions, WorkStatus};
pub use codec::{Codec, JsonCodec};
pub use config::{CbsConfig, ClientConfig, ConnectionConfig, ReceiveConfig, SendConfig, SessionConfig};
pub use connection::{Connection, ConnectionBuilder, ConnectionStatus};
pub use engine::{EngineEvent, EngineFactory, ReceiverSettleMode, SenderSettleMode, TransportEngine};
pub use error::{AmqpError, Result};
pub use link::LinkState;
pub use message::{BatchMessage, Gather, Message, MessageProperties, MessageState, SendResult};
pub use mgmt::{MgmtOperation, MgmtOptions, MgmtResponse, MgmtResult};
pub use receive_client::{MessageCallback, MessageIter, ReceiveClient};
pub use receiver::MessageReceiver;
pub use retry::TokenRetryPolicy;
pub use send_client::SendClient;
pub use sender::{MessageSender, SendCompletion};
pub use session::Session;
pub use tick::TickCounter;
pub use value::{AmqpValue, AnnotationMap, PropertyMap};
