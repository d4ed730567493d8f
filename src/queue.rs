// src/queue.rs
//
// The typed queue primitive: one declared RabbitMQ queue bound to a message
// type, with publish, subscribe and policy-driven failure dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures_lite::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::MessageCodec;
use crate::errors::{QueueError, Result};
use crate::handlers::{ExceptionDescription, ExceptionHandler, FailedDelivery};
use crate::message::{MessageHandler, QueueMessage};
use crate::options::ExceptionHandlingPolicy;

/// Cooperative cancellation signal accepted by `send_message` and
/// `subscribe`. Flip the sender to `true` to cancel.
pub type CancelSignal = watch::Receiver<bool>;

/// Convenience constructor for a cancellation signal pair.
pub fn cancel_signal() -> (watch::Sender<bool>, CancelSignal) {
    watch::channel(false)
}

/// Resolves once the signal reads `true`; pends forever when no signal was
/// supplied or its sender is gone.
async fn wait_cancelled(cancel: &mut Option<CancelSignal>) {
    match cancel {
        Some(rx) => {
            if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                // Sender dropped without cancelling
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

/// A strongly-typed view over one named queue. Owns its channel (never the
/// shared connection), its codec, the resolved exception handler and,
/// for `SendToErrorQueue` queues, the companion error queue.
pub struct TypedQueue<T: QueueMessage> {
    name: String,
    channel: Channel,
    codec: Arc<dyn MessageCodec<T>>,
    retries_count: u32,
    retry_initial_timeout: Duration,
    policy: Option<ExceptionHandlingPolicy>,
    exception_handler: Arc<dyn ExceptionHandler>,
    error_queue: Option<Arc<TypedQueue<ExceptionDescription>>>,
    subscription: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl<T: QueueMessage> TypedQueue<T> {
    /// Configures the channel and declares the durable queue topology.
    /// Declaration is idempotent on the broker side.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn bind(
        name: String,
        channel: Channel,
        prefetch_count: u16,
        codec: Arc<dyn MessageCodec<T>>,
        retries_count: u32,
        retry_initial_timeout: Duration,
        policy: Option<ExceptionHandlingPolicy>,
        exception_handler: Arc<dyn ExceptionHandler>,
        error_queue: Option<Arc<TypedQueue<ExceptionDescription>>>,
    ) -> Result<Self> {
        if prefetch_count > 0 {
            debug!(queue = %name, "Setting channel QoS to {}", prefetch_count);
            channel
                .basic_qos(prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| QueueError::Channel(format!("Failed to set QoS: {}", e)))?;
        }

        // Publisher confirms so send_message suspends until the broker has
        // the message
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::Channel(format!("Failed to enable confirm mode: {}", e)))?;

        channel
            .queue_declare(
                &name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Channel(format!("Failed to declare queue: {}", e)))?;

        debug!(queue = %name, "Queue declared");

        Ok(TypedQueue {
            name,
            channel,
            codec,
            retries_count,
            retry_initial_timeout,
            policy,
            exception_handler,
            error_queue,
            subscription: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn error_queue(&self) -> Option<&Arc<TypedQueue<ExceptionDescription>>> {
        self.error_queue.as_ref()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Serializes `message` and publishes it to this queue, suspending until
    /// the broker confirms receipt. Returns `&Self` for chaining.
    ///
    /// Fails with [`QueueError::Publish`] when the channel or connection is
    /// unavailable; this layer never retries a publish. A fired `cancel`
    /// signal aborts the wait with [`QueueError::Cancelled`].
    pub async fn send_message(
        &self,
        message: &T,
        cancel: Option<CancelSignal>,
    ) -> Result<&Self> {
        if self.is_disposed() {
            return Err(QueueError::Publish(format!(
                "queue '{}' has been disposed",
                self.name
            )));
        }

        let payload = self.codec.serialize(message)?;
        let properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_content_type(self.codec.content_type().into())
            .with_timestamp(Utc::now().timestamp() as u64);

        let mut cancel = cancel;
        let publish = async {
            let confirm = self
                .channel
                .basic_publish(
                    "",
                    &self.name,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await
                .map_err(|e| QueueError::Publish(e.to_string()))?;
            confirm
                .await
                .map_err(|e| QueueError::Publish(e.to_string()))?;
            Ok::<(), QueueError>(())
        };

        tokio::select! {
            result = publish => result?,
            _ = wait_cancelled(&mut cancel) => return Err(QueueError::Cancelled),
        }

        debug!(queue = %self.name, "Published message");
        Ok(self)
    }

    /// Registers `handler` as the consumer for this queue and starts
    /// delivering in the background. Deliveries are processed on their own
    /// tasks, so handler invocations run concurrently.
    ///
    /// Only one subscription per queue instance is active at a time:
    /// re-subscribing replaces the prior registration and aborts its consumer
    /// task. A fired `cancel` signal stops future deliveries being
    /// dispatched; in-flight handler invocations are not aborted.
    pub fn subscribe(
        self: &Arc<Self>,
        handler: Arc<dyn MessageHandler<T>>,
        cancel: Option<CancelSignal>,
    ) -> Arc<Self> {
        let queue = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut cancel = cancel;
            let consumer_tag = format!("consumer-{}", Uuid::new_v4());
            let mut consumer = match queue
                .channel
                .basic_consume(
                    &queue.name,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
            {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!(queue = %queue.name, "Failed to start consumer: {}", e);
                    return;
                }
            };

            info!(queue = %queue.name, consumer_tag = %consumer_tag, "Started consuming");

            loop {
                tokio::select! {
                    _ = wait_cancelled(&mut cancel) => {
                        info!(queue = %queue.name, "Subscription cancelled");
                        break;
                    }
                    delivery = consumer.next() => {
                        match delivery {
                            Some(Ok(delivery)) => {
                                let queue = Arc::clone(&queue);
                                let handler = Arc::clone(&handler);
                                tokio::spawn(async move {
                                    queue.process_delivery(handler, delivery).await;
                                });
                            }
                            Some(Err(e)) => {
                                error!(queue = %queue.name, "Error receiving delivery: {}", e);
                                if !queue.channel.status().connected() {
                                    warn!(queue = %queue.name, "Channel disconnected, stopping consumer");
                                    break;
                                }
                            }
                            None => {
                                warn!(queue = %queue.name, "Consumer stream ended");
                                break;
                            }
                        }
                    }
                }
            }
        });

        let mut guard = match self.subscription.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = guard.replace(task) {
            warn!(queue = %self.name, "Replacing existing subscription");
            previous.abort();
        }

        Arc::clone(self)
    }

    /// One delivered message, end to end: decode + handle with retries per
    /// policy, then terminal dispatch and acknowledgement. Errors never
    /// escape; the consumer loop stays alive across individual failures.
    async fn process_delivery(&self, handler: Arc<dyn MessageHandler<T>>, delivery: Delivery) {
        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string());

        // Retries apply only under the Retry policy; an explicit handler or
        // any other policy gets a single attempt.
        let retries = match self.policy {
            Some(ExceptionHandlingPolicy::Retry) => self.retries_count,
            _ => 0,
        };

        let outcome = deliver_with_retries(&self.name, retries, self.retry_initial_timeout, || {
            let handler = Arc::clone(&handler);
            let codec = Arc::clone(&self.codec);
            let data = delivery.data.clone();
            Box::pin(async move {
                let message = codec.deserialize(&data)?;
                handler.handle(message).await.map_err(QueueError::handler)
            })
        })
        .await;

        match outcome {
            Ok(attempts) => {
                if attempts > 1 {
                    info!(queue = %self.name, attempts, "Message handled after retries");
                }
            }
            Err((err, attempts)) => {
                error!(
                    queue = %self.name,
                    attempts,
                    error = %err,
                    "Delivery failed terminally"
                );
                let failure = FailedDelivery {
                    queue_name: &self.name,
                    message_id,
                    payload: &delivery.data,
                    error: &err,
                    attempts,
                };
                if let Err(handler_err) = self
                    .exception_handler
                    .handle(&failure, self.error_queue.as_deref())
                    .await
                {
                    error!(
                        queue = %self.name,
                        error = %handler_err,
                        "Exception handler failed; message dropped"
                    );
                }
            }
        }

        // Acknowledge in every branch so a failed message never wedges the
        // queue
        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(queue = %self.name, "Failed to acknowledge message: {}", e);
        }
    }

    /// Aborts the subscription, disposes the companion error queue and closes
    /// the channel. The shared connection stays open. Idempotent: repeated
    /// calls are a no-op.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let task = match self.subscription.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }

        if let Some(error_queue) = &self.error_queue {
            Box::pin(error_queue.dispose()).await?;
        }

        self.channel
            .close(0, "Disposing queue")
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))?;

        info!(queue = %self.name, "Queue disposed");
        Ok(())
    }
}

impl<T: QueueMessage> Drop for TypedQueue<T> {
    fn drop(&mut self) {
        let task = match self.subscription.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            task.abort();
        }
    }
}

/// Runs `attempt` up to `retries_count + 1` times, waiting
/// `retry_initial_timeout * attempt_number` between attempts (linear backoff).
/// Returns the number of attempts made, or the last error with that count.
pub(crate) async fn deliver_with_retries<F>(
    queue_name: &str,
    retries_count: u32,
    retry_initial_timeout: Duration,
    mut attempt: F,
) -> std::result::Result<u32, (QueueError, u32)>
where
    F: FnMut() -> BoxFuture<'static, Result<()>>,
{
    let mut attempt_number = 0u32;
    loop {
        attempt_number += 1;
        match attempt().await {
            Ok(()) => return Ok(attempt_number),
            Err(err) => {
                if attempt_number > retries_count {
                    return Err((err, attempt_number));
                }
                warn!(
                    queue = queue_name,
                    error = %err,
                    "Handler failed, retry attempt {}/{}",
                    attempt_number,
                    retries_count
                );
                sleep(retry_initial_timeout * attempt_number).await;
            }
        }
    }
}
