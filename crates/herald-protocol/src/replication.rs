//! Frames exchanged between server processes over the replication bus.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A broadcast to be fanned out by every process to its own sockets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    /// The process that published the envelope.
    pub node_id: String,
    pub app_id: String,
    pub channel: String,
    /// The encoded client frame, forwarded as-is.
    pub payload: String,
    /// Socket excluded from delivery (the sender of a client event).
    #[serde(default)]
    pub except: Option<String>,
}

/// A query answered by every process from its local state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateQuery {
    /// Number of live connections for the app.
    ConnectionCount,
    /// Presence members of a channel.
    ChannelMembers { channel: String },
    /// Occupied channels with their subscription counts.
    Channels,
}

/// One process's contribution to an aggregate query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregateAnswer {
    ConnectionCount(usize),
    ChannelMembers(Vec<(String, Value)>),
    Channels(Vec<(String, usize)>),
}

/// Everything that travels on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationFrame {
    Broadcast(BroadcastEnvelope),
    Request {
        request_id: String,
        node_id: String,
        app_id: String,
        query: AggregateQuery,
    },
    Response {
        request_id: String,
        node_id: String,
        answer: AggregateAnswer,
    },
}

/// Topic naming for the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    /// Create topic names under the given prefix.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The common prefix of every topic.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Topic carrying broadcasts for one application.
    #[must_use]
    pub fn app(&self, app_id: &str) -> String {
        format!("{}:app:{}", self.prefix, app_id)
    }

    /// Shared topic for aggregate requests and responses.
    #[must_use]
    pub fn requests(&self) -> String {
        format!("{}:requests", self.prefix)
    }
}
