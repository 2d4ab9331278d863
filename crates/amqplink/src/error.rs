use thiserror::Error;

#[derive(Debug, Error)]
pub enum AmqpError {
    #[error("connection error: {reason}")]
    Connection { reason: String },

    #[error("connection closed: {}", reason.as_deref().unwrap_or("no reason given"))]
    ConnectionClosed { reason: Option<String> },

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("transient transport error: {reason}")]
    Transport { reason: String },

    #[error("authentication failed: {reason}")]
    Authentication { reason: String },

    #[error("token expired: {reason}")]
    TokenExpired { reason: String },

    #[error("token authentication failed with status {status_code}: {description}")]
    TokenAuthFailure { status_code: u32, description: String },

    #[error("{failed} of {total} messages failed to send")]
    MessageSendFailed { failed: usize, total: usize },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("management operation failed: {reason}")]
    Management { reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("message too large: {size} bytes (max {max_size})")]
    MessageTooLarge { size: u64, max_size: u64 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AmqpError {
    /// Returns true when the error means the transport can no longer be used.
    ///
    /// Transient transport errors are absorbed by `Connection::tick` and retried on
    /// the next pass; everything below is reported as closure.
    pub fn is_fatal(&self) -> bool {
        match self {
            AmqpError::ConnectionReset => true,
            AmqpError::ConnectionClosed { .. } => true,
            AmqpError::Connection { .. } => true,
            AmqpError::Io(_) => true,
            AmqpError::Transport { .. } => false,
            AmqpError::Authentication { .. } => false,
            AmqpError::TokenExpired { .. } => false,
            AmqpError::TokenAuthFailure { .. } => false,
            AmqpError::MessageSendFailed { .. } => false,
            AmqpError::Timeout { .. } => false,
            AmqpError::Management { .. } => false,
            AmqpError::InvalidArgument(_) => false,
            AmqpError::InvalidAddress { .. } => false,
            AmqpError::MessageTooLarge { .. } => false,
            AmqpError::Codec(_) => false,
            AmqpError::Worker(_) => false,
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        AmqpError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

impl From<serde_json::Error> for AmqpError {
    fn from(err: serde_json::Error) -> Self {
        AmqpError::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AmqpError>;
