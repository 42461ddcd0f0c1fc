//! Redis replication bus.
//!
//! Publishing goes through a multiplexed [`ConnectionManager`]. Listening
//! uses a dedicated connection in subscribe mode, since Redis refuses regular
//! commands on a connection that is subscribed.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::traits::{Bus, BusMessage, BusReceiver, TransportError};

/// Redis bus configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Delay before re-establishing a lost subscription.
    pub reconnect_delay: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Redis pub/sub bus.
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
    healthy: Arc<AtomicBool>,
    config: RedisConfig,
}

impl RedisBus {
    /// Connect the publish connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or Redis is unreachable.
    pub async fn connect(config: RedisConfig) -> Result<Self, TransportError> {
        let client = Client::open(config.url.as_str())?;
        let publisher = ConnectionManager::new(client.clone()).await?;

        info!(url = %config.url, "Redis bus connected");

        Ok(Self {
            client,
            publisher,
            healthy: Arc::new(AtomicBool::new(true)),
            config,
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, TransportError> {
        let mut conn = self.publisher.clone();
        let receivers: usize = conn
            .publish(topic, payload.as_ref())
            .await
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
        Ok(receivers)
    }

    async fn listen(&self, prefix: &str) -> Result<BusReceiver, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pattern = format!("{prefix}*");

        tokio::spawn(subscription_loop(
            self.client.clone(),
            pattern,
            tx,
            Arc::clone(&self.healthy),
            self.config.reconnect_delay,
        ));

        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "redis"
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Keep a pattern subscription alive until the receiving side goes away.
async fn subscription_loop(
    client: Client,
    pattern: String,
    tx: mpsc::UnboundedSender<BusMessage>,
    healthy: Arc<AtomicBool>,
    reconnect_delay: Duration,
) {
    loop {
        match run_subscription(&client, &pattern, &tx, &healthy).await {
            Ok(()) if tx.is_closed() => {
                debug!(pattern = %pattern, "Bus listener dropped, stopping subscription");
                return;
            }
            Ok(()) => warn!(pattern = %pattern, "Redis subscription stream ended"),
            Err(e) => warn!(pattern = %pattern, error = %e, "Redis subscription failed"),
        }

        healthy.store(false, Ordering::SeqCst);
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

async fn run_subscription(
    client: &Client,
    pattern: &str,
    tx: &mpsc::UnboundedSender<BusMessage>,
    healthy: &AtomicBool,
) -> redis::RedisResult<()> {
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.psubscribe(pattern).await?;

    healthy.store(true, Ordering::SeqCst);
    info!(pattern = %pattern, "Redis subscription established");

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let message = BusMessage::new(
            msg.get_channel_name(),
            Bytes::copy_from_slice(msg.get_payload_bytes()),
        );
        if tx.send(message).is_err() {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_default() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisBus::connect(RedisConfig {
            url: "not a url".into(),
            ..Default::default()
        })
        .await;
        assert!(result.is_err());
    }
}
