//! # herald-protocol
//!
//! Wire protocol definitions for the Herald broadcasting server.
//!
//! Clients speak the Pusher WebSocket protocol: JSON frames with an `event`
//! name, an optional `channel` and opaque `data`. Server processes talk to
//! each other with MessagePack-encoded replication frames.
//!
//! ## Event Families
//!
//! - `pusher:*` - Connection control (subscribe, ping, signin, errors)
//! - `pusher_internal:*` - Subscription and presence notifications
//! - `client-*` - Peer-to-peer events relayed between subscribers
//!
//! ## Example
//!
//! ```rust
//! use herald_protocol::{codec, PusherMessage};
//!
//! let message = PusherMessage::member_removed("presence-room", "2");
//!
//! let encoded = codec::encode(&message).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded, message);
//! ```

pub mod codec;
pub mod messages;
pub mod replication;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use messages::{
    events, ChannelData, ErrorCode, EventKind, PresenceData, PusherMessage, SigninData,
    SubscribeData, UnsubscribeData,
};
pub use replication::{AggregateAnswer, AggregateQuery, BroadcastEnvelope, ReplicationFrame, Topics};
pub use version::{Version, PROTOCOL_VERSION};
