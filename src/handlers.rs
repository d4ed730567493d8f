// src/handlers.rs
//
// Exception-handling strategies and the envelope routed to error queues.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{QueueError, Result};
use crate::options::ExceptionHandlingPolicy;
use crate::queue::TypedQueue;

/// Envelope published to a companion error queue when a delivery fails
/// terminally: the original message's broker metadata and payload, the error,
/// and when it happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionDescription {
    pub queue_name: String,
    pub message_id: Option<String>,
    /// Original payload, lossy UTF-8.
    pub payload: String,
    pub error_message: String,
    pub error_kind: String,
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

impl ExceptionDescription {
    pub fn from_failure(failure: &FailedDelivery<'_>) -> Self {
        ExceptionDescription {
            queue_name: failure.queue_name.to_string(),
            message_id: failure.message_id.clone(),
            payload: String::from_utf8_lossy(failure.payload).into_owned(),
            error_message: failure.error.to_string(),
            error_kind: failure.error.kind().to_string(),
            attempts: failure.attempts,
            occurred_at: Utc::now(),
        }
    }
}

/// Context handed to an exception handler once a delivery has failed
/// terminally (after any retries). Type-erased: handlers see the raw payload,
/// not the decoded message.
pub struct FailedDelivery<'a> {
    pub queue_name: &'a str,
    pub message_id: Option<String>,
    pub payload: &'a [u8],
    pub error: &'a QueueError,
    /// Total delivery attempts made, including the original one.
    pub attempts: u32,
}

/// Strategy invoked for a terminally failed delivery. The consumer loop
/// acknowledges the message afterwards in every case; an error returned from
/// here is logged, never propagated out of the loop.
#[async_trait]
pub trait ExceptionHandler: Send + Sync {
    async fn handle(
        &self,
        failure: &FailedDelivery<'_>,
        error_queue: Option<&TypedQueue<ExceptionDescription>>,
    ) -> Result<()>;
}

/// Logs the failure and lets the message be consumed. Used for the `None`
/// policy and for `Retry` queues that exhausted their attempts without a
/// companion error queue.
pub struct EmptyExceptionHandler;

#[async_trait]
impl ExceptionHandler for EmptyExceptionHandler {
    async fn handle(
        &self,
        failure: &FailedDelivery<'_>,
        _error_queue: Option<&TypedQueue<ExceptionDescription>>,
    ) -> Result<()> {
        warn!(
            queue = failure.queue_name,
            attempts = failure.attempts,
            error = %failure.error,
            "Dropping failed message"
        );
        Ok(())
    }
}

/// Wraps the failure into an [`ExceptionDescription`] and publishes it to the
/// companion error queue. Best-effort: the caller acknowledges the original
/// message whether or not this publish succeeds.
pub struct ErrorQueuingExceptionHandler;

#[async_trait]
impl ExceptionHandler for ErrorQueuingExceptionHandler {
    async fn handle(
        &self,
        failure: &FailedDelivery<'_>,
        error_queue: Option<&TypedQueue<ExceptionDescription>>,
    ) -> Result<()> {
        let error_queue = error_queue.ok_or_else(|| {
            QueueError::UnsupportedPolicy(format!(
                "queue '{}' is wired for dead-lettering but has no companion error queue",
                failure.queue_name
            ))
        })?;

        let description = ExceptionDescription::from_failure(failure);
        error_queue.send_message(&description, None).await?;

        info!(
            queue = failure.queue_name,
            error_queue = error_queue.name(),
            attempts = failure.attempts,
            "Dead-lettered failed message"
        );
        Ok(())
    }
}

/// Pure mapping from policy to handler strategy; no broker I/O. The enum is
/// closed, so the mapping is total.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExceptionHandlersFactory;

impl ExceptionHandlersFactory {
    pub fn create_handler(&self, policy: ExceptionHandlingPolicy) -> Arc<dyn ExceptionHandler> {
        match policy {
            ExceptionHandlingPolicy::None | ExceptionHandlingPolicy::Retry => {
                Arc::new(EmptyExceptionHandler)
            }
            ExceptionHandlingPolicy::SendToErrorQueue => Arc::new(ErrorQueuingExceptionHandler),
        }
    }
}
