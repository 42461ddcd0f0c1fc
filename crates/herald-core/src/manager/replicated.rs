//! Channel manager replicated over a bus.
//!
//! Every process listens on `{prefix}*`. Broadcasts are published on the
//! app topic before the local fan-out; peers skip their own envelopes by node
//! id. Aggregate reads publish a request on the shared requests topic, every
//! peer answers from its local state, and the requester merges the answers
//! with its own until all expected peers replied or the timeout elapsed.

use async_trait::async_trait;
use dashmap::DashMap;
use herald_protocol::codec::{self, decode_replication, encode_replication};
use herald_protocol::{
    AggregateAnswer, AggregateQuery, BroadcastEnvelope, PusherMessage, ReplicationFrame, Topics,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tenvis_herald_transport::{Bus, BusMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{ChannelManager, LocalChannelManager, ManagerError};
use crate::connection::SocketId;

/// Replication settings.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Prefix of every bus topic.
    pub prefix: String,
    /// How long aggregate reads wait for peers.
    pub request_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            prefix: "herald".to_string(),
            request_timeout: Duration::from_secs(3),
        }
    }
}

/// A channel manager that spans every process attached to the same bus.
pub struct ReplicatedChannelManager {
    local: LocalChannelManager,
    bus: Arc<dyn Bus>,
    topics: Topics,
    node_id: String,
    /// Requests waiting for peer answers.
    pending: DashMap<String, mpsc::UnboundedSender<AggregateAnswer>>,
    listening: AtomicBool,
    config: ReplicationConfig,
}

impl ReplicatedChannelManager {
    /// Wrap a local manager. Call [`start`](Self::start) to receive from peers.
    #[must_use]
    pub fn new(local: LocalChannelManager, bus: Arc<dyn Bus>, config: ReplicationConfig) -> Self {
        let node_id = Uuid::new_v4().to_string();
        info!(node_id = %node_id, bus = bus.name(), prefix = %config.prefix, "Creating replicated channel manager");
        Self {
            local,
            bus,
            topics: Topics::new(config.prefix.clone()),
            node_id,
            pending: DashMap::new(),
            listening: AtomicBool::new(false),
            config,
        }
    }

    /// This process's id on the bus.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Start consuming the bus.
    ///
    /// The returned task stops when the manager is dropped or the bus
    /// subscription ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus subscription fails.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, ManagerError> {
        let mut rx = self.bus.listen(self.topics.prefix()).await?;
        self.listening.store(true, Ordering::SeqCst);

        let manager: Weak<Self> = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_bus_message(message).await;
            }
            debug!("Bus listener stopped");
        }))
    }

    async fn handle_bus_message(&self, message: BusMessage) {
        let frame = match decode_replication(&message.payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Dropping undecodable bus message");
                return;
            }
        };

        match frame {
            ReplicationFrame::Broadcast(envelope) => {
                if envelope.node_id == self.node_id {
                    return;
                }
                let except = envelope.except.map(SocketId::from);
                let delivered = self.local.publish_encoded(
                    &envelope.app_id,
                    &envelope.channel,
                    &envelope.payload,
                    except.as_ref(),
                );
                trace!(channel = %envelope.channel, delivered, "Relayed peer broadcast");
            }
            ReplicationFrame::Request {
                request_id,
                node_id,
                app_id,
                query,
            } => {
                if node_id == self.node_id {
                    return;
                }
                let answer = self.local_answer(&app_id, &query);
                let response = ReplicationFrame::Response {
                    request_id,
                    node_id: self.node_id.clone(),
                    answer,
                };
                if let Err(e) = self.publish_frame(&self.topics.requests(), &response).await {
                    warn!(error = %e, "Failed to answer peer request");
                }
            }
            ReplicationFrame::Response {
                request_id, answer, ..
            } => {
                if let Some(waiting) = self.pending.get(&request_id) {
                    let _ = waiting.send(answer);
                }
            }
        }
    }

    async fn publish_frame(&self, topic: &str, frame: &ReplicationFrame) -> Result<usize, ManagerError> {
        let payload = encode_replication(frame)?;
        Ok(self.bus.publish(topic, payload).await?)
    }

    /// This process's answer to a query.
    fn local_answer(&self, app_id: &str, query: &AggregateQuery) -> AggregateAnswer {
        match query {
            AggregateQuery::ConnectionCount => {
                AggregateAnswer::ConnectionCount(self.local.connection_count(app_id))
            }
            AggregateQuery::ChannelMembers { channel } => AggregateAnswer::ChannelMembers(
                self.local.members(app_id, channel).into_iter().collect(),
            ),
            AggregateQuery::Channels => AggregateAnswer::Channels(self.local.channel_counts(app_id)),
        }
    }

    /// Ask every process, this one included.
    ///
    /// Falls back to the local answer alone if the bus is unavailable.
    async fn aggregate(&self, app_id: &str, query: AggregateQuery) -> Vec<AggregateAnswer> {
        let mut answers = vec![self.local_answer(app_id, &query)];
        // Peers cannot answer while our subscription is down.
        if !self.bus.is_healthy() {
            debug!(bus = self.bus.name(), "Bus unhealthy, answering from local state");
            return answers;
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.insert(request_id.clone(), tx);

        let request = ReplicationFrame::Request {
            request_id: request_id.clone(),
            node_id: self.node_id.clone(),
            app_id: app_id.to_string(),
            query,
        };
        let receivers = match self.publish_frame(&self.topics.requests(), &request).await {
            Ok(receivers) => receivers,
            Err(e) => {
                warn!(error = %e, "Aggregate request failed, answering from local state");
                self.pending.remove(&request_id);
                return answers;
            }
        };

        // Our own listener counts as a receiver but never answers.
        let expected = if self.listening.load(Ordering::SeqCst) {
            receivers.saturating_sub(1)
        } else {
            receivers
        };

        let deadline = Instant::now() + self.config.request_timeout;
        let mut received = 0;
        while received < expected {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(answer)) => {
                    answers.push(answer);
                    received += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(received, expected, "Aggregate request timed out, using partial answers");
                    break;
                }
            }
        }

        self.pending.remove(&request_id);
        answers
    }
}

#[async_trait]
impl ChannelManager for ReplicatedChannelManager {
    fn local(&self) -> &LocalChannelManager {
        &self.local
    }

    async fn broadcast(
        &self,
        app_id: &str,
        channel: &str,
        message: &PusherMessage,
        except: Option<&SocketId>,
    ) -> Result<usize, ManagerError> {
        let payload = codec::encode(message)?;

        let envelope = ReplicationFrame::Broadcast(BroadcastEnvelope {
            node_id: self.node_id.clone(),
            app_id: app_id.to_string(),
            channel: channel.to_string(),
            payload: payload.clone(),
            except: except.map(ToString::to_string),
        });
        if let Err(e) = self.publish_frame(&self.topics.app(app_id), &envelope).await {
            warn!(channel = %channel, error = %e, "Failed to replicate broadcast, delivering locally only");
        }

        Ok(self.local.publish_encoded(app_id, channel, &payload, except))
    }

    async fn global_connection_count(&self, app_id: &str) -> usize {
        self.aggregate(app_id, AggregateQuery::ConnectionCount)
            .await
            .into_iter()
            .map(|answer| match answer {
                AggregateAnswer::ConnectionCount(count) => count,
                _ => 0,
            })
            .sum()
    }

    async fn channel_members(&self, app_id: &str, channel: &str) -> BTreeMap<String, Value> {
        let query = AggregateQuery::ChannelMembers {
            channel: channel.to_string(),
        };
        let mut roster = BTreeMap::new();
        for answer in self.aggregate(app_id, query).await {
            if let AggregateAnswer::ChannelMembers(members) = answer {
                roster.extend(members);
            }
        }
        roster
    }

    async fn global_channels(&self, app_id: &str) -> BTreeMap<String, usize> {
        let mut channels = BTreeMap::new();
        for answer in self.aggregate(app_id, AggregateQuery::Channels).await {
            if let AggregateAnswer::Channels(counts) = answer {
                for (channel, count) in counts {
                    *channels.entry(channel).or_insert(0) += count;
                }
            }
        }
        channels
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
