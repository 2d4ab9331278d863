//! Messages and their client-side send lifecycle.
//!
//! A `Message` is an opaque encoded body plus the property and annotation maps the
//! core reads and writes. On the send side it also tracks where it is in the
//! pipeline: queued, handed to the sender link, or finished.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codec;
use crate::constants::{
    ANNOTATION_ENQUEUED_TIME, ANNOTATION_OFFSET, ANNOTATION_PARTITION_KEY,
    ANNOTATION_SEQUENCE_NUMBER,
};
use crate::error::Result;
use crate::value::{AmqpValue, AnnotationMap, PropertyMap};

/// Send-side message state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    WaitingToBeSent,
    WaitingForAck,
    Complete,
    Failed,
}

impl MessageState {
    /// Returns true for `Complete` and `Failed`.
    pub fn is_done(&self) -> bool {
        matches!(self, MessageState::Complete | MessageState::Failed)
    }
}

/// Outcome of a send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    /// Accepted by the peer, or transferred pre-settled.
    Ok,
    /// Rejected by the peer or failed locally.
    Error(String),
    /// Not sent before the message timeout elapsed.
    Timeout,
    /// Discarded because the link or connection went away first.
    Cancelled,
}

/// Standard message properties the core uses for request/response correlation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Message {
    body: Bytes,
    pub properties: MessageProperties,
    pub application_properties: PropertyMap,
    /// Message annotations.
    pub annotations: AnnotationMap,
    pub delivery_annotations: AnnotationMap,
    state: MessageState,
    idle_time: u64,
    send_result: Option<SendResult>,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            properties: MessageProperties::default(),
            application_properties: PropertyMap::new(),
            annotations: AnnotationMap::new(),
            delivery_annotations: AnnotationMap::new(),
            state: MessageState::WaitingToBeSent,
            idle_time: 0,
            send_result: None,
        }
    }

    /// Encodes `value` with `codec` and records the codec's content type.
    pub fn encode_body<C: Codec, T: Serialize>(codec: &C, value: &T) -> Result<Self> {
        let mut message = Self::new(codec.encode(value)?);
        message.properties.content_type = Some(codec.content_type().to_string());
        Ok(message)
    }

    pub fn decode_body<C: Codec, T: DeserializeOwned>(&self, codec: &C) -> Result<T> {
        codec.decode(&self.body)
    }

    pub fn with_application_property(mut self, key: impl Into<String>, value: impl Into<AmqpValue>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: &[u8], value: impl Into<AmqpValue>) -> Self {
        self.annotations.insert(Bytes::copy_from_slice(key), value.into());
        self
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Encoded body size in bytes.
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    /// Tick at which the message was queued for sending.
    pub fn idle_time(&self) -> u64 {
        self.idle_time
    }

    /// Result recorded when the send finished, if it has.
    pub fn send_result(&self) -> Option<&SendResult> {
        self.send_result.as_ref()
    }

    pub fn annotation(&self, key: &[u8]) -> Option<&AmqpValue> {
        self.annotations.get(key)
    }

    pub fn sequence_number(&self) -> Option<i64> {
        self.annotation(ANNOTATION_SEQUENCE_NUMBER).and_then(AmqpValue::as_i64)
    }

    pub fn offset(&self) -> Option<&str> {
        self.annotation(ANNOTATION_OFFSET).and_then(AmqpValue::as_str)
    }

    /// Enqueued time, milliseconds since the epoch.
    pub fn enqueued_time(&self) -> Option<i64> {
        self.annotation(ANNOTATION_ENQUEUED_TIME).and_then(AmqpValue::as_i64)
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.annotation(ANNOTATION_PARTITION_KEY).and_then(AmqpValue::as_str)
    }

    pub(crate) fn mark_queued(&mut self, now_ms: u64) {
        self.idle_time = now_ms;
        self.state = MessageState::WaitingToBeSent;
        self.send_result = None;
    }

    pub(crate) fn mark_in_flight(&mut self) {
        self.state = MessageState::WaitingForAck;
    }

    /// Records the final send outcome.
    pub(crate) fn on_message_sent(&mut self, result: SendResult) {
        self.state = if result == SendResult::Ok {
            MessageState::Complete
        } else {
            MessageState::Failed
        };
        self.send_result = Some(result);
    }
}

/// Several messages sent as one call.
#[derive(Debug, Clone, Default)]
pub struct BatchMessage {
    messages: Vec<Message>,
}

impl BatchMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Total encoded size of the batch.
    pub fn size(&self) -> u64 {
        self.messages.iter().map(Message::size).sum()
    }
}

impl FromIterator<Message> for BatchMessage {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        Self {
            messages: iter.into_iter().collect(),
        }
    }
}

/// Flattens whatever a send call was given into individual messages.
pub trait Gather {
    fn gather(self) -> Vec<Message>;
}

impl Gather for Message {
    fn gather(self) -> Vec<Message> {
        vec![self]
    }
}

impl Gather for Vec<Message> {
    fn gather(self) -> Vec<Message> {
        self
    }
}

impl Gather for BatchMessage {
    fn gather(self) -> Vec<Message> {
        self.messages
    }
}
