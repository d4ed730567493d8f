// src/message.rs
use std::future::Future;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Anything that can travel through a typed queue. Blanket-implemented; a
/// plain serde struct is enough.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> QueueMessage for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Consumer contract for a typed queue. A returned error routes the delivery
/// through the queue's configured exception-handling policy.
#[async_trait]
pub trait MessageHandler<T: QueueMessage>: Send + Sync {
    async fn handle(&self, message: T) -> anyhow::Result<()>;
}

/// Adapter so plain async closures can subscribe to a queue without a named
/// handler type.
pub struct FnMessageHandler<F> {
    f: F,
}

impl<F> FnMessageHandler<F> {
    pub fn new(f: F) -> Self {
        FnMessageHandler { f }
    }
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for FnMessageHandler<F>
where
    T: QueueMessage,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, message: T) -> anyhow::Result<()> {
        (self.f)(message).await
    }
}
