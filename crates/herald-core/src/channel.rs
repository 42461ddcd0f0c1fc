//! Channel abstraction for Herald.
//!
//! Channels are named rooms where connections subscribe to receive events.
//! The name prefix decides the kind: `private-` and `presence-` channels need
//! a signed subscription, presence channels also track who is in them.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::connection::{ConnectionHandle, SocketId};
use crate::presence::Presence;

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 164;

/// A channel identifier.
pub type ChannelId = String;

/// The kind of a channel, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    /// Classify a channel name.
    #[must_use]
    pub fn of(name: &str) -> Self {
        if name.starts_with("presence-") {
            ChannelKind::Presence
        } else if name.starts_with("private-") {
            ChannelKind::Private
        } else {
            ChannelKind::Public
        }
    }

    /// Whether subscribing needs a signature.
    #[must_use]
    pub fn requires_auth(self) -> bool {
        !matches!(self, ChannelKind::Public)
    }

    #[must_use]
    pub fn is_presence(self) -> bool {
        matches!(self, ChannelKind::Presence)
    }
}

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '=' | '@' | ',' | '.' | ';'))
    {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// A channel: its local subscribers and, for presence channels, the roster.
#[derive(Debug)]
pub struct Channel {
    /// Channel name.
    name: ChannelId,
    kind: ChannelKind,
    /// Subscribed connections by socket id.
    subscribers: HashMap<SocketId, Arc<ConnectionHandle>>,
    /// Presence roster, empty for other kinds.
    pub(crate) presence: Presence,
}

impl Channel {
    /// Create a new channel.
    #[must_use]
    pub fn new(name: impl Into<ChannelId>) -> Self {
        let name = name.into();
        Self {
            kind: ChannelKind::of(&name),
            name,
            subscribers: HashMap::new(),
            presence: Presence::new(),
        }
    }

    /// Get the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Get the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a connection is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, socket_id: &SocketId) -> bool {
        self.subscribers.contains_key(socket_id)
    }

    /// Subscribe a connection to this channel.
    ///
    /// Returns `true` if the connection was not subscribed before.
    pub fn subscribe(&mut self, connection: Arc<ConnectionHandle>) -> bool {
        let socket_id = connection.socket_id().clone();
        let added = self.subscribers.insert(socket_id.clone(), connection).is_none();
        if added {
            debug!(channel = %self.name, socket_id = %socket_id, "Connection subscribed");
        }
        added
    }

    /// Unsubscribe a connection from this channel.
    ///
    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&mut self, socket_id: &SocketId) -> bool {
        let removed = self.subscribers.remove(socket_id).is_some();
        if removed {
            debug!(channel = %self.name, socket_id = %socket_id, "Connection unsubscribed");
        }
        removed
    }

    /// Deliver an encoded frame to every subscriber except `except`.
    ///
    /// Returns the number of connections the frame was queued for.
    pub fn publish(&self, payload: &str, except: Option<&SocketId>) -> usize {
        trace!(channel = %self.name, "Publishing message");
        self.subscribers
            .iter()
            .filter(|(id, _)| Some(*id) != except)
            .filter(|(_, connection)| connection.send_text(payload))
            .count()
    }

    /// Get the presence roster.
    #[must_use]
    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Check if the channel is empty (no subscribers).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
