// Integration tests for the typed queues factory and its failure policies.
//
// These need a running RabbitMQ instance (AMQP_HOSTS, default
// localhost:5672 with guest/guest) and are ignored by default.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use typed_queues::{
    ExceptionDescription, ExceptionHandlingPolicy, FnMessageHandler, QueueCreationOptions,
    QueuesConfig, TypedQueuesFactory,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Payment {
    id: u32,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> QueuesConfig {
    init_tracing();
    let hosts = std::env::var("AMQP_HOSTS").unwrap_or_else(|_| "localhost:5672".to_string());
    QueuesConfig::new(hosts.split(',').map(str::to_string).collect())
}

// Fresh name per run so reruns do not see leftover messages
fn unique(base: &str) -> String {
    format!("{}-{}", base, Uuid::new_v4())
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn factory_returns_the_same_queue_for_the_same_key() {
    let factory = TypedQueuesFactory::new(&test_config());
    let name = unique("Orders");
    let options =
        QueueCreationOptions::new(&name).with_policy(ExceptionHandlingPolicy::None);

    let (first, second) = tokio::join!(
        factory.create::<Payment>(options.clone()),
        factory.create::<Payment>(options.clone()),
    );

    let first = first.expect("first create");
    let second = second.expect("second create");
    assert!(Arc::ptr_eq(&first, &second));

    factory.close().await.expect("close");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn send_to_error_queue_provisions_a_companion_queue() {
    let factory = TypedQueuesFactory::new(&test_config());
    let name = unique("Orders");

    let queue = factory
        .create::<Payment>(
            QueueCreationOptions::new(&name)
                .with_policy(ExceptionHandlingPolicy::SendToErrorQueue),
        )
        .await
        .expect("create");

    let error_queue = queue.error_queue().expect("companion error queue");
    assert_eq!(error_queue.name(), format!("{name}.Errors"));
    // The companion must not chain further
    assert!(error_queue.error_queue().is_none());

    factory.close().await.expect("close");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn retry_policy_bounds_handler_invocations() {
    let factory = TypedQueuesFactory::new(&test_config());
    let name = unique("Orders");

    let queue = factory
        .create::<Payment>(
            QueueCreationOptions::new(&name)
                .with_policy(ExceptionHandlingPolicy::Retry)
                .with_retries(3, Duration::from_millis(20)),
        )
        .await
        .expect("create");

    let calls = Arc::new(AtomicU32::new(0));
    let (done_tx, mut done_rx) = mpsc::channel::<u32>(8);

    let handler_calls = Arc::clone(&calls);
    queue.subscribe(
        Arc::new(FnMessageHandler::new(move |_payment: Payment| {
            let calls = Arc::clone(&handler_calls);
            let done_tx = done_tx.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                done_tx.send(call).await.ok();
                // Would pass on the tenth call, but the policy stops at four
                if call < 10 {
                    anyhow::bail!("transient failure on attempt {call}");
                }
                Ok(())
            }
        })),
        None,
    );

    queue
        .send_message(&Payment { id: 1 }, None)
        .await
        .expect("send");

    // 1 original + 3 retries, then the message is dropped
    for _ in 0..4 {
        timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .expect("handler should be invoked")
            .expect("channel open");
    }
    assert!(timeout(Duration::from_millis(500), done_rx.recv()).await.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    factory.close().await.expect("close");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn failed_messages_are_dead_lettered_exactly_once() {
    let factory = TypedQueuesFactory::new(&test_config());
    let name = unique("Orders");

    let queue = factory
        .create::<Payment>(
            QueueCreationOptions::new(&name)
                .with_policy(ExceptionHandlingPolicy::SendToErrorQueue),
        )
        .await
        .expect("create");

    let (dead_tx, mut dead_rx) = mpsc::channel::<ExceptionDescription>(8);
    let error_queue = queue.error_queue().expect("companion error queue").clone();
    error_queue.subscribe(
        Arc::new(FnMessageHandler::new(move |description: ExceptionDescription| {
            let dead_tx = dead_tx.clone();
            async move {
                dead_tx.send(description).await.ok();
                Ok::<_, anyhow::Error>(())
            }
        })),
        None,
    );

    queue.subscribe(
        Arc::new(FnMessageHandler::new(|payment: Payment| async move {
            anyhow::ensure!(payment.id == 0, "cannot process payment {}", payment.id);
            Ok(())
        })),
        None,
    );

    queue
        .send_message(&Payment { id: 42 }, None)
        .await
        .expect("send");

    let description = timeout(Duration::from_secs(5), dead_rx.recv())
        .await
        .expect("dead letter should arrive")
        .expect("channel open");

    assert_eq!(description.queue_name, name);
    assert!(description.payload.contains("42"));
    assert!(!description.error_message.is_empty());
    assert!(description.message_id.is_some());

    // Exactly one dead letter for one failed message
    assert!(timeout(Duration::from_millis(500), dead_rx.recv()).await.is_err());

    factory.close().await.expect("close");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn retry_backoff_is_linear_before_eventual_success() {
    let factory = TypedQueuesFactory::new(&test_config());
    let name = unique("Payments");

    let queue = factory
        .create::<Payment>(
            QueueCreationOptions::new(&name)
                .with_policy(ExceptionHandlingPolicy::Retry)
                .with_retries(2, Duration::from_millis(100)),
        )
        .await
        .expect("create");

    let calls = Arc::new(AtomicU32::new(0));
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

    let handler_calls = Arc::clone(&calls);
    queue.subscribe(
        Arc::new(FnMessageHandler::new(move |_payment: Payment| {
            let calls = Arc::clone(&handler_calls);
            let done_tx = done_tx.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call < 3 {
                    anyhow::bail!("transient failure on attempt {call}")
                }
                done_tx.send(()).await.ok();
                Ok(())
            }
        })),
        None,
    );

    let started = Instant::now();
    queue
        .send_message(&Payment { id: 1 }, None)
        .await
        .expect("send");

    timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .expect("third attempt should succeed")
        .expect("channel open");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Linear backoff: 100ms after the first failure, 200ms after the second
    assert!(
        started.elapsed() >= Duration::from_millis(300),
        "expected at least 300ms of backoff, elapsed {:?}",
        started.elapsed()
    );
    // Retry never creates an error queue
    assert!(queue.error_queue().is_none());

    factory.close().await.expect("close");
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn disposal_is_idempotent_and_stops_sends() {
    let factory = TypedQueuesFactory::new(&test_config());
    let name = unique("Orders");

    let queue = factory
        .create::<Payment>(
            QueueCreationOptions::new(&name).with_policy(ExceptionHandlingPolicy::None),
        )
        .await
        .expect("create");

    queue.dispose().await.expect("first dispose");
    queue.dispose().await.expect("second dispose is a no-op");
    assert!(queue.is_disposed());

    assert!(queue.send_message(&Payment { id: 1 }, None).await.is_err());

    factory.close().await.expect("close");
}
