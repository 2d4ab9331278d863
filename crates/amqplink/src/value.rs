//! Typed values carried in message properties and annotations.
//!
//! This is only the in-memory representation the core needs to read and write
//! properties (CBS/management fields, receive annotations). Turning these into
//! wire bytes is the transport engine's job.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A property or annotation value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AmqpValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    /// Milliseconds since the UNIX epoch.
    Timestamp(i64),
}

impl AmqpValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmqpValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AmqpValue::Int(v) => Some(*v),
            AmqpValue::UInt(v) => i64::try_from(*v).ok(),
            AmqpValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AmqpValue::UInt(v) => Some(*v),
            AmqpValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmqpValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AmqpValue::Null)
    }
}

impl fmt::Display for AmqpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmqpValue::Null => write!(f, "null"),
            AmqpValue::Bool(v) => write!(f, "{}", v),
            AmqpValue::Int(v) => write!(f, "{}", v),
            AmqpValue::UInt(v) => write!(f, "{}", v),
            AmqpValue::Double(v) => write!(f, "{}", v),
            AmqpValue::String(v) => write!(f, "{}", v),
            AmqpValue::Binary(v) => write!(f, "<{} bytes>", v.len()),
            AmqpValue::Timestamp(v) => write!(f, "ts:{}", v),
        }
    }
}

impl From<&str> for AmqpValue {
    fn from(v: &str) -> Self {
        AmqpValue::String(v.to_string())
    }
}

impl From<String> for AmqpValue {
    fn from(v: String) -> Self {
        AmqpValue::String(v)
    }
}

impl From<i64> for AmqpValue {
    fn from(v: i64) -> Self {
        AmqpValue::Int(v)
    }
}

impl From<i32> for AmqpValue {
    fn from(v: i32) -> Self {
        AmqpValue::Int(v as i64)
    }
}

impl From<u64> for AmqpValue {
    fn from(v: u64) -> Self {
        AmqpValue::UInt(v)
    }
}

impl From<u32> for AmqpValue {
    fn from(v: u32) -> Self {
        AmqpValue::UInt(v as u64)
    }
}

impl From<bool> for AmqpValue {
    fn from(v: bool) -> Self {
        AmqpValue::Bool(v)
    }
}

impl From<f64> for AmqpValue {
    fn from(v: f64) -> Self {
        AmqpValue::Double(v)
    }
}

impl From<Vec<u8>> for AmqpValue {
    fn from(v: Vec<u8>) -> Self {
        AmqpValue::Binary(v)
    }
}

/// String-keyed application properties.
pub type PropertyMap = BTreeMap<String, AmqpValue>;

/// Byte-keyed annotation map (message and delivery annotations).
pub type AnnotationMap = BTreeMap<Bytes, AmqpValue>;
