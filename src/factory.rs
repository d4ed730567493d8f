// src/factory.rs
//
// The typed queues factory: a type-indexed cache of queues sharing one broker
// connection, wiring each queue to its resolved exception-handling strategy
// and, when the policy demands it, to a recursively provisioned companion
// error queue.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec::JsonCodec;
use crate::config::QueuesConfig;
use crate::connection::ConnectionManager;
use crate::errors::{QueueError, Result};
use crate::handlers::{ExceptionDescription, ExceptionHandlersFactory};
use crate::message::QueueMessage;
use crate::options::{
    error_queue_name, ExceptionHandlingPolicy, HandlerSource, QueueCreationOptions,
};
use crate::queue::TypedQueue;

/// Type-erased view over a cached queue, used for transitive disposal when
/// the factory closes.
#[async_trait]
trait AnyQueue: Send + Sync {
    fn queue_name(&self) -> &str;
    async fn dispose_queue(&self) -> Result<()>;
}

#[async_trait]
impl<T: QueueMessage> AnyQueue for TypedQueue<T> {
    fn queue_name(&self) -> &str {
        self.name()
    }

    async fn dispose_queue(&self) -> Result<()> {
        self.dispose().await
    }
}

struct RegistryEntry {
    /// Downcast back to `Arc<TypedQueue<T>>` by the typed accessor.
    queue: Arc<dyn Any + Send + Sync>,
    disposer: Arc<dyn AnyQueue>,
}

type RegistryKey = (TypeId, String);

/// Creates, caches and wires together typed queues. One instance owns one
/// shared broker connection; queues are cached per `(message type, queue
/// name)` and handed out as `Arc`s, so repeated requests never re-provision
/// broker resources.
pub struct TypedQueuesFactory {
    connection: Arc<ConnectionManager>,
    handlers_factory: ExceptionHandlersFactory,
    prefetch_count: u16,
    registry: Mutex<HashMap<RegistryKey, RegistryEntry>>,
}

impl TypedQueuesFactory {
    pub fn new(config: &QueuesConfig) -> Self {
        TypedQueuesFactory {
            connection: Arc::new(ConnectionManager::new(config)),
            handlers_factory: ExceptionHandlersFactory,
            prefetch_count: config.prefetch_count,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the queue for `(T, options.queue_name)`, creating it on first
    /// request. Validation failures surface as [`QueueError::Configuration`]
    /// before any broker I/O.
    ///
    /// The registry lock is held across construction, so concurrent calls for
    /// the same key build the underlying queue, channel and error-queue chain
    /// exactly once.
    pub async fn create<T: QueueMessage>(
        &self,
        options: QueueCreationOptions,
    ) -> Result<Arc<TypedQueue<T>>> {
        options.validate()?;
        let mut registry = self.registry.lock().await;
        self.create_locked::<T>(&mut registry, options).await
    }

    async fn create_locked<T: QueueMessage>(
        &self,
        registry: &mut HashMap<RegistryKey, RegistryEntry>,
        options: QueueCreationOptions,
    ) -> Result<Arc<TypedQueue<T>>> {
        let key = (TypeId::of::<T>(), options.queue_name.clone());
        if let Some(entry) = registry.get(&key) {
            debug!(queue = %options.queue_name, "Returning cached queue");
            return Arc::clone(&entry.queue)
                .downcast::<TypedQueue<T>>()
                .map_err(|_| {
                    QueueError::Configuration(format!(
                        "registry entry for '{}' has an unexpected type",
                        options.queue_name
                    ))
                });
        }

        let source = options.handler_source()?;
        let policy = options.exception_handling_policy;

        // SendToErrorQueue provisions the companion queue first. Its policy is
        // forced to None, which terminates the recursion: an error queue never
        // routes to another error queue.
        let error_queue = match policy {
            Some(ExceptionHandlingPolicy::SendToErrorQueue) => {
                let error_options =
                    QueueCreationOptions::new(error_queue_name(&options.queue_name))
                        .with_retries(options.retries_count, options.retry_initial_timeout)
                        .with_policy(ExceptionHandlingPolicy::None);
                let queue = Box::pin(
                    self.create_locked::<ExceptionDescription>(registry, error_options),
                )
                .await?;
                Some(queue)
            }
            _ => None,
        };

        let exception_handler = match source {
            HandlerSource::Explicit(handler) => handler,
            HandlerSource::Policy(p) => self.handlers_factory.create_handler(p),
        };

        let channel = self.connection.create_channel().await?;
        let queue = Arc::new(
            TypedQueue::bind(
                options.queue_name.clone(),
                channel,
                self.prefetch_count,
                Arc::new(JsonCodec),
                options.retries_count,
                options.retry_initial_timeout,
                policy,
                exception_handler,
                error_queue,
            )
            .await?,
        );

        info!(queue = %options.queue_name, "Created typed queue");
        registry.insert(
            key,
            RegistryEntry {
                queue: Arc::clone(&queue) as Arc<dyn Any + Send + Sync>,
                disposer: Arc::clone(&queue) as Arc<dyn AnyQueue>,
            },
        );
        Ok(queue)
    }

    /// Disposes every cached queue, then closes the shared connection. The
    /// connection lives exactly as long as the factory.
    pub async fn close(&self) -> Result<()> {
        let mut registry = self.registry.lock().await;
        for (_, entry) in registry.drain() {
            if let Err(e) = entry.disposer.dispose_queue().await {
                warn!(
                    queue = entry.disposer.queue_name(),
                    error = %e,
                    "Failed to dispose queue during factory close"
                );
            }
        }
        self.connection.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Order {
        id: u64,
    }

    fn offline_factory() -> TypedQueuesFactory {
        // Construction is lazy; no connection is opened until a queue is
        // actually created
        TypedQueuesFactory::new(&QueuesConfig::new(vec!["localhost:5672".to_string()]))
    }

    #[tokio::test]
    async fn create_rejects_missing_policy_and_handler() {
        let factory = offline_factory();
        let result = factory
            .create::<Order>(QueueCreationOptions::new("Orders"))
            .await;

        match result {
            Err(QueueError::Configuration(_)) => {}
            other => panic!(
                "expected Configuration error before broker I/O, got {:?}",
                other.map(|_| ())
            ),
        }
    }

    #[tokio::test]
    async fn create_rejects_empty_queue_name() {
        let factory = offline_factory();
        let result = factory
            .create::<Order>(
                QueueCreationOptions::new("").with_policy(ExceptionHandlingPolicy::None),
            )
            .await;

        assert!(matches!(result, Err(QueueError::Configuration(_))));
    }

    #[tokio::test]
    async fn close_without_queues_is_a_no_op() {
        let factory = offline_factory();
        assert!(factory.close().await.is_ok());
    }
}
