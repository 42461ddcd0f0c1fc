//! Shared fixtures for Herald benchmarks.

use herald_protocol::PusherMessage;
use serde_json::json;
use std::sync::Arc;
use tenvis_herald_core::{
    App, ConnectionHandle, ConnectionRegistry, LocalChannelManager, ManagerConfig, Outbound,
};
use tokio::sync::mpsc;

/// The app every benchmark runs under.
#[must_use]
pub fn bench_app() -> Arc<App> {
    Arc::new(App::new("bench", "BenchKey", "BenchSecret").with_client_messages(true))
}

/// A connection with the receiving end of its outbound queue.
pub struct Subscriber {
    pub connection: Arc<ConnectionHandle>,
    pub rx: mpsc::UnboundedReceiver<Outbound>,
}

impl Subscriber {
    /// Discard queued frames, returning how many there were.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while self.rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }
}

/// A local manager sized for benchmarks.
#[must_use]
pub fn manager() -> LocalChannelManager {
    LocalChannelManager::with_config(
        Arc::new(ConnectionRegistry::new()),
        ManagerConfig {
            max_channels: usize::MAX,
            max_subscriptions_per_connection: usize::MAX,
        },
    )
}

/// Open a connection on the manager's registry.
#[must_use]
pub fn open(manager: &LocalChannelManager) -> Subscriber {
    let (tx, rx) = mpsc::unbounded_channel();
    Subscriber {
        connection: manager.registry().open(bench_app(), tx),
        rx,
    }
}

/// A manager with `size` connections subscribed to `channel`.
#[must_use]
pub fn fanout_fixture(channel: &str, size: usize) -> (LocalChannelManager, Vec<Subscriber>) {
    let manager = manager();
    let subscribers = (0..size)
        .map(|_| {
            let subscriber = open(&manager);
            manager
                .subscribe(&subscriber.connection, channel, None)
                .ok();
            subscriber
        })
        .collect();
    (manager, subscribers)
}

/// An application event with a payload of roughly `size` bytes.
#[must_use]
pub fn event(channel: &str, size: usize) -> PusherMessage {
    let body = json!({ "body": "x".repeat(size) }).to_string();
    PusherMessage::channel_event("bench-event", channel, json!(body))
}
