//! Seam between application values and encoded message bodies.
//!
//! The core never interprets a body; it asks a `Codec` to produce or read one.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{AmqpError, Result};

/// Encodes application values into message bodies and back.
pub trait Codec: Send + Sync {
    /// Content type recorded on messages produced by this codec.
    fn content_type(&self) -> &str;

    /// Encodes a value into a body.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes>;

    /// Decodes a body into a value.
    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T>;
}

/// JSON body codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        "application/json"
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        let data = serde_json::to_vec(value)?;
        Ok(Bytes::from(data))
    }

    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T> {
        if body.is_empty() {
            return Err(AmqpError::Codec("empty body".to_string()));
        }
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct PartitionInfo {
        name: String,
        partition_ids: Vec<String>,
    }

    #[test]
    fn test_json_codec() {
        let codec = JsonCodec;
        let info = PartitionInfo {
            name: "hub".to_string(),
            partition_ids: vec!["0".to_string(), "1".to_string()],
        };
        let body = codec.encode(&info).unwrap();
        let decoded: PartitionInfo = codec.decode(&body).unwrap();
        assert_eq!(decoded, info);
        assert_eq!(codec.content_type(), "application/json");
    }

    #[test]
    fn test_json_codec_errors() {
        let codec = JsonCodec;
        assert!(matches!(
            codec.decode::<PartitionInfo>(b""),
            Err(AmqpError::Codec(_))
        ));
        assert!(matches!(
            codec.decode::<PartitionInfo>(b"not json"),
            Err(AmqpError::Codec(_))
        ));
    }
}
