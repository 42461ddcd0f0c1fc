//! In-process replication bus.
//!
//! Every clone of a [`MemoryBus`] shares the same topic space, so several
//! channel managers inside one process behave like separate server nodes
//! attached to one Redis instance.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{trace, warn};

use crate::traits::{Bus, BusMessage, BusReceiver, TransportError};

/// Default capacity of the shared broadcast buffer.
const DEFAULT_CAPACITY: usize = 4096;

/// A bus backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct MemoryBus {
    sender: broadcast::Sender<BusMessage>,
    online: Arc<AtomicBool>,
}

impl MemoryBus {
    /// Create a new bus.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new bus with a specific buffer capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate losing (or regaining) the bus connection.
    ///
    /// While offline, publishing fails and nothing is delivered.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of active listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize, TransportError> {
        if !self.is_healthy() {
            return Err(TransportError::ConnectionClosed);
        }

        trace!(topic = %topic, bytes = payload.len(), "Publishing on memory bus");
        // No listeners is not an error, just nobody to deliver to.
        Ok(self
            .sender
            .send(BusMessage::new(topic, payload))
            .unwrap_or_default())
    }

    async fn listen(&self, prefix: &str) -> Result<BusReceiver, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut source = self.sender.subscribe();
        let prefix = prefix.to_string();

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) => {
                        if !message.topic.starts_with(&prefix) {
                            continue;
                        }
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memory bus listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_healthy(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_listeners_with_prefix() {
        let bus = MemoryBus::new();
        let mut herald = bus.listen("herald:").await.unwrap();
        let mut other = bus.listen("other:").await.unwrap();

        let receivers = bus
            .publish("herald:app:1", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        // Both listeners share the underlying channel.
        assert_eq!(receivers, 2);

        let message = herald.recv().await.unwrap();
        assert_eq!(message.topic, "herald:app:1");
        assert_eq!(&message.payload[..], b"hello");

        bus.publish("other:x", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(other.recv().await.unwrap().topic, "other:x");
        assert!(herald.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_listeners() {
        let bus = MemoryBus::new();
        let receivers = bus.publish("herald:x", Bytes::new()).await.unwrap();
        assert_eq!(receivers, 0);
    }

    #[tokio::test]
    async fn test_offline_bus_rejects_publish() {
        let bus = MemoryBus::new();
        bus.set_online(false);
        assert!(!bus.is_healthy());
        assert!(matches!(
            bus.publish("herald:x", Bytes::new()).await,
            Err(TransportError::ConnectionClosed)
        ));

        bus.set_online(true);
        assert!(bus.publish("herald:x", Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_clones_share_topics() {
        let bus = MemoryBus::new();
        let peer = bus.clone();
        let mut rx = peer.listen("herald:").await.unwrap();

        bus.publish("herald:requests", Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(&rx.recv().await.unwrap().payload[..], b"ping");
        assert_eq!(bus.listener_count(), 1);
    }
}
