//! # herald-core
//!
//! Connection, channel and presence management for the Herald broadcasting
//! server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **App** - Tenant credentials and limits
//! - **Auth** - HMAC signatures for private channels, sign-in and the REST API
//! - **Channel** - Named fan-out groups of connections
//! - **Presence** - Refcounted member rosters of presence channels
//! - **Manager** - Local and Redis-replicated channel managers
//! - **Dispatcher** - The Pusher protocol state machine
//! - **Statistics** - Per-app usage counters and their store
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌────────────────┐
//! │  Connection │────▶│ Dispatcher  │────▶│ ChannelManager │
//! └─────────────┘     └─────────────┘     └────────────────┘
//!                            │                │         │
//!                            ▼                ▼         ▼
//!                     ┌─────────────┐   ┌─────────┐ ┌─────────┐
//!                     │ Statistics  │   │ Channel │ │   Bus   │
//!                     └─────────────┘   └─────────┘ └─────────┘
//! ```

pub mod app;
pub mod auth;
pub mod channel;
pub mod connection;
pub mod dispatcher;
pub mod hooks;
pub mod manager;
pub mod presence;
pub mod statistics;

pub use app::{App, AppProvider, ConfigAppProvider};
pub use auth::AuthError;
pub use channel::{Channel, ChannelId, ChannelKind};
pub use connection::{ConnectionHandle, ConnectionRegistry, Outbound, SocketId};
pub use dispatcher::{
    ConnectionError, DispatchError, Dispatcher, DispatcherConfig, OpenRequest, TriggerError,
    TriggerEvent,
};
pub use hooks::{ConnectionHook, LoggingHook};
pub use manager::{
    ChannelManager, LocalChannelManager, ManagerConfig, ManagerError, ReplicatedChannelManager,
    ReplicationConfig,
};
pub use presence::{Presence, PresenceMember};
pub use statistics::{MemoryStatisticsStore, StatisticsCollector, StatisticsStore};
