// src/codec.rs
use crate::errors::{QueueError, Result};
use crate::message::QueueMessage;

/// Payload codec boundary. Queues serialize outgoing messages and deserialize
/// deliveries through this trait; a decode failure surfaces as
/// [`QueueError::Deserialization`] and flows through the queue's configured
/// exception-handling policy like any handler failure.
pub trait MessageCodec<T>: Send + Sync {
    fn serialize(&self, message: &T) -> Result<Vec<u8>>;

    fn deserialize(&self, payload: &[u8]) -> Result<T>;

    /// Content type stamped onto published messages.
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }
}

/// JSON codec, the default wire format.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl<T: QueueMessage> MessageCodec<T> for JsonCodec {
    fn serialize(&self, message: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(message).map_err(QueueError::Serialization)
    }

    fn deserialize(&self, payload: &[u8]) -> Result<T> {
        serde_json::from_slice(payload).map_err(|e| QueueError::Deserialization(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        "application/json"
    }
}
