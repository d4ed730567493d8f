// src/connection.rs
use std::time::Duration;

use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info};

use crate::config::QueuesConfig;
use crate::errors::{QueueError, Result};

/// Owns the single broker connection shared by every queue built from one
/// factory. Reconnects transparently, cycling through the configured hosts in
/// order with capped, jittered backoff between rounds.
///
/// Publishes in flight during a reconnection window fail with
/// [`QueueError::Publish`]; retrying those is the caller's concern.
pub struct ConnectionManager {
    hosts: Vec<String>,
    uris: Vec<String>,
    connection: Mutex<Option<Connection>>,
    max_reconnect_attempts: u32,
    recovery_interval: Duration,
}

impl ConnectionManager {
    pub fn new(config: &QueuesConfig) -> Self {
        ConnectionManager {
            hosts: config.hosts.clone(),
            uris: config.amqp_uris(),
            connection: Mutex::new(None),
            max_reconnect_attempts: config.max_reconnect_attempts,
            recovery_interval: config.network_recovery_interval(),
        }
    }

    /// Create a new channel on the shared connection, establishing the
    /// connection first if needed. Each queue owns its own channel so that one
    /// queue's backpressure cannot block another's throughput.
    pub async fn create_channel(&self) -> Result<Channel> {
        let mut guard = self.connection.lock().await;
        let connection = self.ensure_connected(&mut guard).await?;

        connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))
    }

    async fn ensure_connected<'a>(
        &self,
        guard: &'a mut Option<Connection>,
    ) -> Result<&'a Connection> {
        let connected = guard
            .as_ref()
            .map_or(false, |conn| conn.status().connected());
        if !connected {
            if guard.take().is_some() {
                error!("Connection to RabbitMQ lost, attempting recovery");
            }
            *guard = Some(self.establish_connection().await?);
        }
        guard
            .as_ref()
            .ok_or_else(|| QueueError::Connection("No active connection".to_string()))
    }

    async fn establish_connection(&self) -> Result<Connection> {
        let mut attempts = 0u32;
        let mut delay = self.recovery_interval.as_millis() as u64;

        loop {
            for (host, uri) in self.hosts.iter().zip(&self.uris) {
                info!("Attempting to connect to RabbitMQ at {}", host);

                match Connection::connect(uri, ConnectionProperties::default()).await {
                    Ok(conn) => {
                        info!("Successfully connected to RabbitMQ at {}", host);
                        return Ok(conn);
                    }
                    Err(err) => {
                        attempts += 1;
                        error!(
                            "Failed to connect to RabbitMQ at {} (attempt {}/{}): {:?}",
                            host, attempts, self.max_reconnect_attempts, err
                        );

                        if attempts >= self.max_reconnect_attempts {
                            error!("Max reconnection attempts reached. Giving up.");
                            return Err(QueueError::Connection(err.to_string()));
                        }
                    }
                }
            }

            // Jittered backoff between full rounds over the host list
            let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
            let sleep_ms = (delay as i64 + jitter as i64).max(1) as u64;
            info!("Waiting {}ms before next reconnect round", sleep_ms);
            sleep(Duration::from_millis(sleep_ms)).await;

            delay = std::cmp::min(delay * 2, 30_000); // Cap at 30 seconds
        }
    }

    /// Gracefully close the connection. Idempotent; a manager without a live
    /// connection is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.take() {
            info!("Closing RabbitMQ connection gracefully");
            conn.close(0, "Closing connection")
                .await
                .map_err(|e| QueueError::Connection(e.to_string()))?;
        }
        Ok(())
    }
}
