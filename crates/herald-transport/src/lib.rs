//! # herald-transport
//!
//! Replication bus layer for the Herald broadcasting server.
//!
//! Server processes exchange broadcasts and aggregate queries over a shared
//! publish/subscribe bus:
//!
//! - **Redis** - Production bus spanning hosts
//! - **Memory** - In-process bus for single-host setups and tests
//!
//! ## Bus Abstraction
//!
//! All buses implement the `Bus` trait, allowing the channel manager to be
//! bus-agnostic.
//!
//! ```rust,ignore
//! use tenvis_herald_transport::{Bus, MemoryBus};
//!
//! async fn relay(bus: MemoryBus) {
//!     let mut rx = bus.listen("herald:").await?;
//!     while let Some(message) = rx.recv().await {
//!         // Process message
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "redis-bus")]
pub mod redis_bus;

pub use memory::MemoryBus;
pub use traits::{Bus, BusMessage, BusReceiver, TransportError};

#[cfg(feature = "redis-bus")]
pub use redis_bus::{RedisBus, RedisConfig};
