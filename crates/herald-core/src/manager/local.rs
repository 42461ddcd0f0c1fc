//! Single-process channel manager.
//!
//! Channels are keyed by `(app_id, name)` in a sharded map; a channel's
//! subscribers and presence roster share one entry, so they change together.

use async_trait::async_trait;
use dashmap::DashMap;
use herald_protocol::{codec, PusherMessage};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::{ChannelManager, ManagerError, SubscribeOutcome, UnsubscribeOutcome};
use crate::channel::{validate_channel_name, Channel, ChannelId, ChannelKind};
use crate::connection::{ConnectionHandle, ConnectionRegistry, SocketId};
use crate::presence::{JoinOutcome, PresenceMember};

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum number of channels.
    pub max_channels: usize,
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_channels: 100_000,
            max_subscriptions_per_connection: 100,
        }
    }
}

type ChannelKey = (String, ChannelId);

fn key(app_id: &str, channel: &str) -> ChannelKey {
    (app_id.to_string(), channel.to_string())
}

/// Channel state of this process.
pub struct LocalChannelManager {
    /// Channels indexed by app and name.
    channels: DashMap<ChannelKey, Channel>,
    /// Connections served by this process.
    registry: Arc<ConnectionRegistry>,
    /// Configuration.
    config: ManagerConfig,
}

impl LocalChannelManager {
    /// Create a new manager with default configuration.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_config(registry, ManagerConfig::default())
    }

    /// Create a new manager with custom configuration.
    #[must_use]
    pub fn with_config(registry: Arc<ConnectionRegistry>, config: ManagerConfig) -> Self {
        info!("Creating channel manager with config: {:?}", config);
        Self {
            channels: DashMap::new(),
            registry,
            config,
        }
    }

    /// Connections served by this process.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get manager statistics.
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            channel_count: self.channels.len(),
            connection_count: self.registry.len(),
            total_subscriptions: self.channels.iter().map(|c| c.subscriber_count()).sum(),
        }
    }

    /// Subscribe a connection to a channel.
    ///
    /// Subscribing twice is a no-op reported as not newly subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid, a presence channel
    /// has no member, or limits are exceeded.
    pub fn subscribe(
        &self,
        connection: &Arc<ConnectionHandle>,
        channel_name: &str,
        member: Option<PresenceMember>,
    ) -> Result<SubscribeOutcome, ManagerError> {
        validate_channel_name(channel_name).map_err(ManagerError::InvalidChannel)?;

        let member = match (ChannelKind::of(channel_name).is_presence(), member) {
            (true, None) => return Err(ManagerError::MissingMember(channel_name.to_string())),
            (true, member) => member,
            (false, _) => None,
        };

        if connection.is_closing() {
            return Err(ManagerError::ConnectionClosed);
        }
        if connection.is_subscribed(channel_name) {
            return Ok(SubscribeOutcome::default());
        }
        if connection.channel_count() >= self.config.max_subscriptions_per_connection {
            return Err(ManagerError::MaxSubscriptionsReached);
        }

        let key = key(connection.app_id(), channel_name);
        // Checked before taking the entry lock: len() visits every shard.
        if !self.channels.contains_key(&key) && self.channels.len() >= self.config.max_channels {
            return Err(ManagerError::MaxChannelsReached);
        }

        let mut entry = self.channels.entry(key).or_insert_with(|| {
            debug!(channel = %channel_name, "Creating new channel");
            Channel::new(channel_name)
        });

        let newly_subscribed = entry.subscribe(Arc::clone(connection));
        let member_added = member.and_then(|member| {
            match entry.presence.join(connection.socket_id(), member.clone()) {
                JoinOutcome::Added => Some(member),
                JoinOutcome::AlreadyPresent => None,
            }
        });
        connection.add_channel(channel_name);
        let subscribers = entry.subscriber_count();
        drop(entry);

        // A close that raced this call may have missed the new channel.
        if connection.is_closing() {
            self.unsubscribe(connection, channel_name);
            return Err(ManagerError::ConnectionClosed);
        }

        debug!(
            channel = %channel_name,
            socket_id = %connection.socket_id(),
            subscribers,
            "Subscribed"
        );

        Ok(SubscribeOutcome {
            newly_subscribed,
            member_added,
        })
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// Empty channels are removed.
    pub fn unsubscribe(&self, connection: &ConnectionHandle, channel_name: &str) -> UnsubscribeOutcome {
        let was_subscribed = connection.remove_channel(channel_name);
        let key = key(connection.app_id(), channel_name);

        let mut member_removed = None;
        if let Some(mut entry) = self.channels.get_mut(&key) {
            entry.unsubscribe(connection.socket_id());
            member_removed = entry.presence.leave(connection.socket_id());

            debug!(
                channel = %channel_name,
                socket_id = %connection.socket_id(),
                subscribers = entry.subscriber_count(),
                "Unsubscribed"
            );
        }

        if self.channels.remove_if(&key, |_, c| c.is_empty()).is_some() {
            debug!(channel = %channel_name, "Deleted empty channel");
        }

        UnsubscribeOutcome {
            was_subscribed,
            member_removed,
        }
    }

    /// Unsubscribe a connection from all channels.
    pub fn unsubscribe_all(&self, connection: &ConnectionHandle) -> Vec<(String, UnsubscribeOutcome)> {
        let outcomes = connection
            .channels()
            .into_iter()
            .map(|channel| {
                let outcome = self.unsubscribe(connection, &channel);
                (channel, outcome)
            })
            .collect();

        debug!(socket_id = %connection.socket_id(), "Unsubscribed from all channels");
        outcomes
    }

    /// Deliver a message to local subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded.
    pub fn publish(
        &self,
        app_id: &str,
        channel_name: &str,
        message: &PusherMessage,
        except: Option<&SocketId>,
    ) -> Result<usize, ManagerError> {
        let payload = codec::encode(message)?;
        Ok(self.publish_encoded(app_id, channel_name, &payload, except))
    }

    /// Deliver an already encoded frame to local subscribers.
    ///
    /// Returns the number of subscribers that received the frame.
    pub fn publish_encoded(
        &self,
        app_id: &str,
        channel_name: &str,
        payload: &str,
        except: Option<&SocketId>,
    ) -> usize {
        match self.channels.get(&key(app_id, channel_name)) {
            Some(entry) => {
                let count = entry.publish(payload, except);
                trace!(channel = %channel_name, recipients = count, "Published message");
                count
            }
            None => {
                trace!(channel = %channel_name, "Publish to channel without local subscribers");
                0
            }
        }
    }

    /// Check if a channel exists.
    #[must_use]
    pub fn channel_exists(&self, app_id: &str, channel_name: &str) -> bool {
        self.channels.contains_key(&key(app_id, channel_name))
    }

    /// Get the local subscriber count for a channel.
    #[must_use]
    pub fn subscriber_count(&self, app_id: &str, channel_name: &str) -> usize {
        self.channels
            .get(&key(app_id, channel_name))
            .map(|c| c.subscriber_count())
            .unwrap_or(0)
    }

    /// Local channels of an app with their subscriber counts.
    #[must_use]
    pub fn channel_counts(&self, app_id: &str) -> Vec<(String, usize)> {
        self.channels
            .iter()
            .filter(|c| c.key().0 == app_id)
            .map(|c| (c.name().to_string(), c.subscriber_count()))
            .collect()
    }

    /// Local presence roster of a channel.
    #[must_use]
    pub fn members(&self, app_id: &str, channel_name: &str) -> BTreeMap<String, Value> {
        self.channels
            .get(&key(app_id, channel_name))
            .map(|c| c.presence().roster())
            .unwrap_or_default()
    }

    /// Number of connections this process serves for an app.
    #[must_use]
    pub fn connection_count(&self, app_id: &str) -> usize {
        self.registry.count_for_app(app_id)
    }
}

#[async_trait]
impl ChannelManager for LocalChannelManager {
    fn local(&self) -> &LocalChannelManager {
        self
    }

    async fn broadcast(
        &self,
        app_id: &str,
        channel: &str,
        message: &PusherMessage,
        except: Option<&SocketId>,
    ) -> Result<usize, ManagerError> {
        self.publish(app_id, channel, message, except)
    }

    async fn global_connection_count(&self, app_id: &str) -> usize {
        self.connection_count(app_id)
    }

    async fn channel_members(&self, app_id: &str, channel: &str) -> BTreeMap<String, Value> {
        self.members(app_id, channel)
    }

    async fn global_channels(&self, app_id: &str) -> BTreeMap<String, usize> {
        self.channel_counts(app_id).into_iter().collect()
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Manager statistics.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    /// Number of active channels.
    pub channel_count: usize,
    /// Number of connected clients.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}
