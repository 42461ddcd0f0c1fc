//! Channel managers.
//!
//! A channel manager owns subscriptions and presence rosters and delivers
//! broadcasts. Two implementations exist:
//!
//! - [`LocalChannelManager`] serves a single process.
//! - [`ReplicatedChannelManager`] relays broadcasts to peer processes over a
//!   bus and answers cluster-wide queries by asking every peer.
//!
//! Subscriptions are always local: a socket lives in exactly one process.

mod local;
mod replicated;

pub use local::{LocalChannelManager, ManagerConfig, ManagerStats};
pub use replicated::{ReplicatedChannelManager, ReplicationConfig};

use async_trait::async_trait;
use herald_protocol::{ProtocolError, PusherMessage};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tenvis_herald_transport::TransportError;
use thiserror::Error;

use crate::connection::{ConnectionHandle, SocketId};
use crate::presence::PresenceMember;

/// Channel manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidChannel(&'static str),

    /// Presence subscription without a member.
    #[error("Presence channel {0} requires channel data")]
    MissingMember(String),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,

    /// Maximum channels reached.
    #[error("Maximum channels reached")]
    MaxChannelsReached,

    /// The connection is closing.
    #[error("Connection is closing")]
    ConnectionClosed,

    /// Encoding failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The bus failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What a subscription changed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscribeOutcome {
    /// The connection was not subscribed before.
    pub newly_subscribed: bool,
    /// Set when a presence user joined through their first socket.
    pub member_added: Option<PresenceMember>,
}

/// What an unsubscription changed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnsubscribeOutcome {
    /// The connection was subscribed before.
    pub was_subscribed: bool,
    /// Set when a presence user left through their last socket.
    pub member_removed: Option<PresenceMember>,
}

/// Owner of channel state.
///
/// Mutations go to the local manager. Broadcasts and the aggregate reads
/// (`global_*`, `channel_members`) span the cluster in replicated mode.
#[async_trait]
pub trait ChannelManager: Send + Sync {
    /// The process-local state.
    fn local(&self) -> &LocalChannelManager;

    /// Subscribe a connection, joining the presence roster if `member` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel name is invalid, a presence channel
    /// has no member, or a limit is reached.
    fn subscribe(
        &self,
        connection: &Arc<ConnectionHandle>,
        channel: &str,
        member: Option<PresenceMember>,
    ) -> Result<SubscribeOutcome, ManagerError> {
        self.local().subscribe(connection, channel, member)
    }

    /// Unsubscribe a connection.
    fn unsubscribe(&self, connection: &ConnectionHandle, channel: &str) -> UnsubscribeOutcome {
        self.local().unsubscribe(connection, channel)
    }

    /// Unsubscribe a connection from every channel it joined.
    fn unsubscribe_all(&self, connection: &ConnectionHandle) -> Vec<(String, UnsubscribeOutcome)> {
        self.local().unsubscribe_all(connection)
    }

    /// Deliver a message to every subscriber of a channel, optionally
    /// excluding one socket.
    ///
    /// Returns the number of local deliveries.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded.
    async fn broadcast(
        &self,
        app_id: &str,
        channel: &str,
        message: &PusherMessage,
        except: Option<&SocketId>,
    ) -> Result<usize, ManagerError>;

    /// Number of connections for an app across the cluster.
    async fn global_connection_count(&self, app_id: &str) -> usize;

    /// Presence roster of a channel across the cluster.
    async fn channel_members(&self, app_id: &str, channel: &str) -> BTreeMap<String, Value>;

    /// Occupied channels of an app across the cluster, with subscription
    /// counts.
    async fn global_channels(&self, app_id: &str) -> BTreeMap<String, usize>;

    /// Get the manager name (e.g., "local", "redis").
    fn name(&self) -> &'static str;
}
