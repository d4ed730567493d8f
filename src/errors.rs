// src/errors.rs

use serde_json::Error as SerdeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Invalid `QueueCreationOptions`. Raised before any broker I/O and never retried.
    #[error("invalid queue configuration: {0}")]
    Configuration(String),

    #[error("RabbitMQ connection error: {0}")]
    Connection(String),

    #[error("RabbitMQ channel error: {0}")]
    Channel(String),

    /// Transient broker unavailability during a publish. Surfaced to the
    /// caller of `send_message`; retrying is the caller's concern.
    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] SerdeError),

    /// Malformed delivered payload. Routed through the same policy machinery
    /// as a handler failure.
    #[error("failed to deserialize message: {0}")]
    Deserialization(String),

    /// Failure raised by application message-handling logic.
    #[error("message handler failed: {0}")]
    Handler(String),

    /// Internal inconsistency, e.g. a dead-lettering handler wired to a queue
    /// that has no companion error queue. Indicates a programming error.
    #[error("unsupported exception handling policy: {0}")]
    UnsupportedPolicy(String),

    #[error("operation was cancelled")]
    Cancelled,
}

// Custom Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

impl QueueError {
    /// Creates a `Handler` error from an application failure, keeping the
    /// full anyhow context chain in the message.
    pub fn handler(error: anyhow::Error) -> Self {
        QueueError::Handler(format!("{error:#}"))
    }

    /// Short stable name for the error category, recorded in
    /// `ExceptionDescription` envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueError::Configuration(_) => "configuration",
            QueueError::Connection(_) => "connection",
            QueueError::Channel(_) => "channel",
            QueueError::Publish(_) => "publish",
            QueueError::Serialization(_) => "serialization",
            QueueError::Deserialization(_) => "deserialization",
            QueueError::Handler(_) => "handler",
            QueueError::UnsupportedPolicy(_) => "unsupported_policy",
            QueueError::Cancelled => "cancelled",
        }
    }
}
