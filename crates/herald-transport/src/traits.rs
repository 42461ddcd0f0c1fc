//! Replication bus abstraction traits for Herald.
//!
//! A bus connects otherwise independent server processes. Every process
//! publishes to topics and listens on every topic under a common prefix.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
}

impl BusMessage {
    /// Create a new bus message.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The bus connection is down.
    #[error("Bus connection closed")]
    ConnectionClosed,

    /// Failed to publish.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Failed to subscribe.
    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    /// Redis error.
    #[cfg(feature = "redis-bus")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Receiving half of a bus subscription.
pub type BusReceiver = mpsc::UnboundedReceiver<BusMessage>;

/// A publish/subscribe bus shared by server processes.
///
/// Publishing and listening use separate connections, so a listening
/// process can keep issuing commands.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload on a topic.
    ///
    /// Returns the number of listeners the bus delivered the payload to,
    /// including the publishing process itself if it listens on the topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, TransportError>;

    /// Start receiving every message published on topics starting with
    /// `prefix`.
    async fn listen(&self, prefix: &str) -> Result<BusReceiver, TransportError>;

    /// Get the bus name (e.g., "redis", "memory").
    fn name(&self) -> &'static str;

    /// Check if the bus is currently connected.
    fn is_healthy(&self) -> bool {
        true
    }
}
