use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::{
    AUTH_REFRESH_SECS, AUTH_TIMEOUT_SECS, DEFAULT_PREFETCH, IDLE_EMPTY_FRAME_RATIO,
    MAX_FRAME_SIZE_BYTES, MAX_MESSAGE_LENGTH_BYTES,
};
use crate::engine::{ReceiverSettleMode, SenderSettleMode};
use crate::retry::TokenRetryPolicy;
use crate::value::PropertyMap;

/// Connection-level settings passed to the transport engine on open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Maximum frame size in bytes (default: 63488).
    pub max_frame_size: u32,
    /// Maximum number of channels, engine default when unset.
    pub channel_max: Option<u16>,
    /// Idle timeout in milliseconds, engine default when unset.
    pub idle_timeout_ms: Option<u64>,
    /// Properties sent in the OPEN frame.
    pub properties: PropertyMap,
    /// Ratio of the remote idle timeout at which empty frames are sent, 0.0..=1.0.
    pub idle_empty_frame_ratio: f64,
    /// Log every engine event at `trace` level.
    pub trace_frames: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE_BYTES,
            channel_max: None,
            idle_timeout_ms: None,
            properties: PropertyMap::new(),
            idle_empty_frame_ratio: IDLE_EMPTY_FRAME_RATIO,
            trace_frames: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            incoming_window: MAX_FRAME_SIZE_BYTES,
            outgoing_window: MAX_FRAME_SIZE_BYTES,
            handle_max: None,
        }
    }
}

/// Sender link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SendConfig {
    /// Messages not sent within this many milliseconds of being queued fail
    /// with a timeout. 0 disables expiry.
    pub msg_timeout_ms: u64,
    pub send_settle_mode: SenderSettleMode,
    pub max_message_size: u64,
    /// Upper bound on transfers per connection iteration.
    pub link_credit: Option<u32>,
    /// Properties sent in the ATTACH frame.
    pub link_properties: PropertyMap,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            msg_timeout_ms: 0,
            send_settle_mode: SenderSettleMode::Unsettled,
            max_message_size: MAX_MESSAGE_LENGTH_BYTES,
            link_credit: None,
            link_properties: PropertyMap::new(),
        }
    }
}

/// Receiver link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReceiveConfig {
    /// Shut the client down after this many milliseconds without a message.
    /// 0 means listen forever.
    pub timeout_ms: u64,
    pub receive_settle_mode: ReceiverSettleMode,
    /// Link credit; also the upper bound on batch size (default: 300).
    pub prefetch: u32,
    pub max_message_size: u64,
    pub link_properties: PropertyMap,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            receive_settle_mode: ReceiverSettleMode::PeekLock,
            prefetch: DEFAULT_PREFETCH,
            max_message_size: MAX_MESSAGE_LENGTH_BYTES,
            link_properties: PropertyMap::new(),
        }
    }
}

/// Token negotiation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CbsConfig {
    /// Time allowed for a PUT-token request to complete (default: 10s).
    pub auth_timeout_ms: u64,
    /// Refresh this many seconds before the token expires (default: 600).
    pub refresh_window_secs: u64,
    pub retry: TokenRetryPolicy,
}

impl Default for CbsConfig {
    fn default() -> Self {
        Self {
            auth_timeout_ms: AUTH_TIMEOUT_SECS * 1000,
            refresh_window_secs: AUTH_REFRESH_SECS,
            retry: TokenRetryPolicy::default(),
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Container id, random when unset.
    pub client_name: Option<String>,
    pub connection: ConnectionConfig,
    pub session: SessionConfig,
    pub send: SendConfig,
    pub receive: ReceiveConfig,
    pub cbs: CbsConfig,
}

impl ClientConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ClientConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        let ratio = self.connection.idle_empty_frame_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            anyhow::bail!("idle_empty_frame_ratio must be between 0.0 and 1.0, got {}", ratio);
        }
        if self.receive.prefetch == 0 {
            anyhow::bail!("prefetch must be at least 1");
        }
        if self.connection.max_frame_size < 512 {
            anyhow::bail!("max_frame_size must be at least 512, got {}", self.connection.max_frame_size);
        }
        Ok(())
    }
}
