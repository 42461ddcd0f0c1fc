//! Protocol versioning for Herald.
//!
//! Pusher clients announce their protocol revision with the `protocol` query
//! parameter of the WebSocket URL.

use serde::{Deserialize, Serialize};

/// Protocol revision spoken by the server.
pub const PROTOCOL_VERSION: Version = Version(7);

/// Oldest revision still accepted.
pub const MIN_PROTOCOL_VERSION: Version = Version(5);

/// A Pusher protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(pub u8);

impl Version {
    /// Parse the `protocol` query parameter.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse().ok().map(Version)
    }

    /// Check whether the server can talk to a client using this revision.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(self)
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}
