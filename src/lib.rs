// src/lib.rs
//
// Typed message queues over RabbitMQ.
//
// Callers ask `TypedQueuesFactory` for a queue bound to a message type, then
// send typed messages or subscribe a handler without touching connection,
// channel or serialization mechanics. Each queue carries a failure-handling
// contract: drop, retry with linear backoff, or dead-letter to a companion
// `"<name>.Errors"` queue.

pub mod codec;
pub mod config;
pub mod connection;
pub mod errors;
pub mod factory;
pub mod handlers;
pub mod message;
pub mod options;
pub mod queue;

// Re-export the public surface to simplify imports elsewhere
pub use codec::{JsonCodec, MessageCodec};
pub use config::{Credentials, QueuesConfig};
pub use connection::ConnectionManager;
pub use errors::{QueueError, Result};
pub use factory::TypedQueuesFactory;
pub use handlers::{
    EmptyExceptionHandler, ErrorQueuingExceptionHandler, ExceptionDescription, ExceptionHandler,
    ExceptionHandlersFactory, FailedDelivery,
};
pub use message::{FnMessageHandler, MessageHandler, QueueMessage};
pub use options::{
    error_queue_name, ExceptionHandlingPolicy, HandlerSource, QueueCreationOptions,
    ERROR_QUEUE_SUFFIX,
};
pub use queue::{cancel_signal, CancelSignal, TypedQueue};
