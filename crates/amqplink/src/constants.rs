//! Protocol defaults and well-known node names.

/// Default TLS port for AMQP.
pub const DEFAULT_AMQPS_PORT: u16 = 5671;

/// Default plain-text port for AMQP.
pub const DEFAULT_AMQP_PORT: u16 = 5672;

/// Default maximum frame size, also used for session windows.
pub const MAX_FRAME_SIZE_BYTES: u32 = 63488;

/// Default maximum message size negotiated on links.
pub const MAX_MESSAGE_LENGTH_BYTES: u64 = 1024 * 1024;

/// Default receiver prefetch.
pub const DEFAULT_PREFETCH: u32 = 300;

/// Default node for management requests.
pub const MGMT_TARGET: &str = "$management";

/// Node accepting CBS token requests.
pub const CBS_NODE: &str = "$cbs";

/// Default response field holding the management status code.
pub const MGMT_STATUS_CODE_FIELD: &str = "statusCode";

/// Default response field holding the management status description.
pub const MGMT_DESCRIPTION_FIELD: &str = "statusDescription";

/// CBS response field names.
pub const CBS_STATUS_CODE_FIELD: &str = "status-code";
pub const CBS_DESCRIPTION_FIELD: &str = "status-description";

/// CBS operations.
pub const CBS_PUT_TOKEN: &str = "put-token";

/// Default lifetime of generated SAS tokens.
pub const AUTH_EXPIRATION_SECS: u64 = 3600;

/// Tokens are refreshed this long before they expire.
pub const AUTH_REFRESH_SECS: u64 = 600;

/// Default timeout for token negotiation.
pub const AUTH_TIMEOUT_SECS: u64 = 10;

/// Default SAS token type.
pub const SAS_TOKEN_TYPE: &str = "servicebus.windows.net:sastoken";

/// Default ratio of empty frames to idle time.
pub const IDLE_EMPTY_FRAME_RATIO: f64 = 0.5;

/// Receive-side annotation keys.
pub const ANNOTATION_SEQUENCE_NUMBER: &[u8] = b"x-opt-sequence-number";
pub const ANNOTATION_OFFSET: &[u8] = b"x-opt-offset";
pub const ANNOTATION_ENQUEUED_TIME: &[u8] = b"x-opt-enqueued-time";
pub const ANNOTATION_PARTITION_KEY: &[u8] = b"x-opt-partition-key";
