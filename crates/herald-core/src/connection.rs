//! Connection registry.
//!
//! A [`ConnectionHandle`] is the server side of one client socket: the app it
//! belongs to, the channels it joined and the queue its socket task drains.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use herald_protocol::{codec, PusherMessage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::app::App;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A Pusher socket id, two random integers joined by a dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketId(String);

impl SocketId {
    /// Generate a random socket id.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let left: u32 = rng.gen_range(1..=1_000_000_000);
        let right: u32 = rng.gen_range(1..=1_000_000_000);
        Self(format!("{left}.{right}"))
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SocketId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SocketId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Something for the socket task to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send a text frame.
    Text(String),
    /// Send a close frame and stop.
    Close { code: u16, reason: String },
}

/// Server-side state of a client socket.
#[derive(Debug)]
pub struct ConnectionHandle {
    socket_id: SocketId,
    app: Arc<App>,
    sender: mpsc::UnboundedSender<Outbound>,
    channels: DashSet<String>,
    last_seen: AtomicU64,
    user_id: OnceLock<String>,
    closing: AtomicBool,
}

impl ConnectionHandle {
    /// Create a handle with an explicit socket id.
    #[must_use]
    pub fn new(socket_id: SocketId, app: Arc<App>, sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            socket_id,
            app,
            sender,
            channels: DashSet::new(),
            last_seen: AtomicU64::new(now_millis()),
            user_id: OnceLock::new(),
            closing: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn socket_id(&self) -> &SocketId {
        &self.socket_id
    }

    #[must_use]
    pub fn app(&self) -> &Arc<App> {
        &self.app
    }

    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app.id
    }

    /// Queue an encoded frame.
    ///
    /// Returns `false` if the socket task is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.sender.send(Outbound::Text(text.into())).is_ok()
    }

    /// Encode and queue a message.
    pub fn send(&self, message: &PusherMessage) -> bool {
        match codec::encode(message) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(socket_id = %self.socket_id, error = %e, "Failed to encode message");
                false
            }
        }
    }

    /// Ask the socket task to close the connection.
    ///
    /// Only the first call has any effect.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        if !self.mark_closing() {
            return;
        }
        debug!(socket_id = %self.socket_id, code, "Closing connection");
        let _ = self.sender.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Stop accepting new work without queueing a close frame.
    ///
    /// Returns `false` if the connection was already closing.
    pub fn mark_closing(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Record activity from the client.
    pub fn touch(&self) {
        self.last_seen.store(now_millis(), Ordering::Relaxed);
    }

    /// When the client was last heard from, in epoch milliseconds.
    #[must_use]
    pub fn last_seen(&self) -> u64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    /// Check if the client has been silent for longer than `timeout`.
    #[must_use]
    pub fn is_stale(&self, now_ms: u64, timeout: Duration) -> bool {
        now_ms.saturating_sub(self.last_seen()) > timeout.as_millis() as u64
    }

    /// Record a subscription. Returns `false` if it already existed.
    pub fn add_channel(&self, channel: &str) -> bool {
        self.channels.insert(channel.to_string())
    }

    /// Forget a subscription. Returns `false` if it did not exist.
    pub fn remove_channel(&self, channel: &str) -> bool {
        self.channels.remove(channel).is_some()
    }

    #[must_use]
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels.contains(channel)
    }

    /// Channels this connection is subscribed to.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.key().clone()).collect()
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// The user this connection signed in as.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.get().map(String::as_str)
    }

    /// Bind the connection to a user. Returns `false` if already signed in.
    pub fn set_user_id(&self, user_id: impl Into<String>) -> bool {
        self.user_id.set(user_id.into()).is_ok()
    }
}

/// Every connection served by this process.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<SocketId, Arc<ConnectionHandle>>,
    per_app: DashMap<String, usize>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection under a fresh, unique socket id.
    pub fn open(&self, app: Arc<App>, sender: mpsc::UnboundedSender<Outbound>) -> Arc<ConnectionHandle> {
        loop {
            match self.connections.entry(SocketId::generate()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    let handle = Arc::new(ConnectionHandle::new(
                        slot.key().clone(),
                        Arc::clone(&app),
                        sender,
                    ));
                    slot.insert(Arc::clone(&handle));
                    *self.per_app.entry(app.id.clone()).or_insert(0) += 1;
                    trace!(socket_id = %handle.socket_id(), app_id = %app.id, "Connection registered");
                    return handle;
                }
            }
        }
    }

    /// Remove a connection. Returns `None` if it was already removed.
    pub fn remove(&self, socket_id: &SocketId) -> Option<Arc<ConnectionHandle>> {
        let (_, handle) = self.connections.remove(socket_id)?;
        if let Some(mut count) = self.per_app.get_mut(handle.app_id()) {
            *count = count.saturating_sub(1);
        }
        self.per_app.remove_if(handle.app_id(), |_, count| *count == 0);
        Some(handle)
    }

    #[must_use]
    pub fn get(&self, socket_id: &SocketId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(socket_id).map(|c| Arc::clone(c.value()))
    }

    /// Total number of connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of connections for an app.
    #[must_use]
    pub fn count_for_app(&self, app_id: &str) -> usize {
        self.per_app.get(app_id).map_or(0, |c| *c)
    }

    /// Connections that have been silent for longer than `timeout`.
    #[must_use]
    pub fn stale(&self, timeout: Duration) -> Vec<Arc<ConnectionHandle>> {
        let now = now_millis();
        self.connections
            .iter()
            .filter(|c| c.is_stale(now, timeout))
            .map(|c| Arc::clone(c.value()))
            .collect()
    }
}
