// src/options.rs
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{QueueError, Result};
use crate::handlers::ExceptionHandler;

/// Suffix appended to a queue name to form its companion error queue name.
/// External consumers depend on this exact spelling.
pub const ERROR_QUEUE_SUFFIX: &str = ".Errors";

pub fn error_queue_name(queue_name: &str) -> String {
    format!("{queue_name}{ERROR_QUEUE_SUFFIX}")
}

/// What happens to a delivery when handling it fails. Policies are mutually
/// exclusive per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionHandlingPolicy {
    /// The failure is logged and the message is consumed anyway.
    None,
    /// The delivery is re-run locally with linear backoff, bounded by
    /// `retries_count`; an exhausted message is dropped (or dead-lettered if
    /// the queue happens to have an error queue).
    Retry,
    /// The failure is wrapped into an `ExceptionDescription` and published to
    /// the companion `"<name>.Errors"` queue.
    SendToErrorQueue,
}

/// Per-queue creation options handed to `TypedQueuesFactory::create`.
///
/// At least one of `exception_handling_policy` / `exception_handler` must be
/// set; when both are, the explicit handler wins.
#[derive(Clone)]
pub struct QueueCreationOptions {
    pub queue_name: String,
    pub retries_count: u32,
    pub retry_initial_timeout: Duration,
    pub exception_handling_policy: Option<ExceptionHandlingPolicy>,
    pub exception_handler: Option<Arc<dyn ExceptionHandler>>,
}

impl QueueCreationOptions {
    pub fn new(queue_name: impl Into<String>) -> Self {
        QueueCreationOptions {
            queue_name: queue_name.into(),
            retries_count: 0,
            retry_initial_timeout: Duration::from_secs(1),
            exception_handling_policy: None,
            exception_handler: None,
        }
    }

    pub fn with_policy(mut self, policy: ExceptionHandlingPolicy) -> Self {
        self.exception_handling_policy = Some(policy);
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    pub fn with_retries(mut self, count: u32, initial_timeout: Duration) -> Self {
        self.retries_count = count;
        self.retry_initial_timeout = initial_timeout;
        self
    }

    /// Fails with [`QueueError::Configuration`] before any broker I/O.
    pub fn validate(&self) -> Result<()> {
        if self.queue_name.trim().is_empty() {
            return Err(QueueError::Configuration(
                "queue name cannot be empty".to_string(),
            ));
        }
        if self.exception_handling_policy.is_none() && self.exception_handler.is_none() {
            return Err(QueueError::Configuration(
                "exception_handling_policy and exception_handler cannot both be unset".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolves the nullable field pair into a single tagged source, removing
    /// the both-unset ambiguity past the validation boundary.
    pub fn handler_source(&self) -> Result<HandlerSource> {
        if let Some(handler) = &self.exception_handler {
            return Ok(HandlerSource::Explicit(Arc::clone(handler)));
        }
        match self.exception_handling_policy {
            Some(policy) => Ok(HandlerSource::Policy(policy)),
            None => Err(QueueError::Configuration(
                "exception_handling_policy and exception_handler cannot both be unset".to_string(),
            )),
        }
    }
}

impl fmt::Debug for QueueCreationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueCreationOptions")
            .field("queue_name", &self.queue_name)
            .field("retries_count", &self.retries_count)
            .field("retry_initial_timeout", &self.retry_initial_timeout)
            .field("exception_handling_policy", &self.exception_handling_policy)
            .field("exception_handler", &self.exception_handler.as_ref().map(|_| "<handler>"))
            .finish()
    }
}

/// Where the queue's failure-handling strategy comes from: a policy resolved
/// through `ExceptionHandlersFactory`, or a caller-supplied handler.
#[derive(Clone)]
pub enum HandlerSource {
    Policy(ExceptionHandlingPolicy),
    Explicit(Arc<dyn ExceptionHandler>),
}
