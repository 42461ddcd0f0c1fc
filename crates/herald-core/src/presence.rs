//! Presence tracking for Herald.
//!
//! A presence roster maps users to their info. One user may be connected
//! through several sockets (tabs, devices); the user stays in the roster until
//! the last of them leaves.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::connection::SocketId;

/// A user in a presence channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceMember {
    pub user_id: String,
    pub user_info: Value,
}

impl PresenceMember {
    #[must_use]
    pub fn new(user_id: impl Into<String>, user_info: Value) -> Self {
        Self {
            user_id: user_id.into(),
            user_info,
        }
    }
}

/// Result of adding a socket to the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The user was not present before.
    Added,
    /// The user was already present through another socket.
    AlreadyPresent,
}

#[derive(Debug)]
struct MemberEntry {
    info: Value,
    sockets: HashSet<SocketId>,
}

/// Refcounted presence roster for a channel.
#[derive(Debug, Default)]
pub struct Presence {
    /// Members by user id.
    members: HashMap<String, MemberEntry>,
    /// The user each socket joined as.
    sockets: HashMap<SocketId, String>,
}

impl Presence {
    /// Create a new presence tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of distinct users present.
    #[must_use]
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Add a socket to the roster.
    ///
    /// The latest user info wins when the user is already present. A socket
    /// that joins again under a different user first leaves its old identity.
    pub fn join(&mut self, socket_id: &SocketId, member: PresenceMember) -> JoinOutcome {
        if let Some(current) = self.sockets.get(socket_id) {
            if *current == member.user_id {
                if let Some(entry) = self.members.get_mut(&member.user_id) {
                    entry.info = member.user_info;
                }
                return JoinOutcome::AlreadyPresent;
            }
            self.leave(socket_id);
        }

        self.sockets.insert(socket_id.clone(), member.user_id.clone());
        match self.members.get_mut(&member.user_id) {
            Some(entry) => {
                entry.info = member.user_info;
                entry.sockets.insert(socket_id.clone());
                JoinOutcome::AlreadyPresent
            }
            None => {
                debug!(user_id = %member.user_id, "Presence: member joined");
                self.members.insert(
                    member.user_id,
                    MemberEntry {
                        info: member.user_info,
                        sockets: HashSet::from([socket_id.clone()]),
                    },
                );
                JoinOutcome::Added
            }
        }
    }

    /// Remove a socket from the roster.
    ///
    /// Returns the member only when this was their last socket.
    pub fn leave(&mut self, socket_id: &SocketId) -> Option<PresenceMember> {
        let user_id = self.sockets.remove(socket_id)?;
        let entry = self.members.get_mut(&user_id)?;
        entry.sockets.remove(socket_id);
        if !entry.sockets.is_empty() {
            return None;
        }

        let entry = self.members.remove(&user_id)?;
        debug!(user_id = %user_id, "Presence: member left");
        Some(PresenceMember::new(user_id, entry.info))
    }

    /// Get the roster as `user_id -> user_info`.
    #[must_use]
    pub fn roster(&self) -> BTreeMap<String, Value> {
        self.members
            .iter()
            .map(|(id, entry)| (id.clone(), entry.info.clone()))
            .collect()
    }

    /// Check if presence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rick() -> PresenceMember {
        PresenceMember::new("1", json!({"name": "Rick"}))
    }

    fn is_present(presence: &Presence, user_id: &str) -> bool {
        presence.members.contains_key(user_id)
    }

    fn sockets_of(presence: &Presence, user_id: &str) -> usize {
        presence.members.get(user_id).map_or(0, |m| m.sockets.len())
    }

    #[test]
    fn test_presence_join_leave() {
        let mut presence = Presence::new();
        let socket = SocketId::from("1.1");

        assert_eq!(presence.join(&socket, rick()), JoinOutcome::Added);
        assert_eq!(presence.join(&socket, rick()), JoinOutcome::AlreadyPresent);

        assert_eq!(presence.count(), 1);
        assert!(is_present(&presence, "1"));
        assert_eq!(sockets_of(&presence, "1"), 1);

        assert_eq!(presence.leave(&socket), Some(rick()));
        assert!(!is_present(&presence, "1"));
        assert!(presence.leave(&socket).is_none());
    }

    #[test]
    fn test_same_user_two_sockets() {
        let mut presence = Presence::new();
        let tab1 = SocketId::from("1.1");
        let tab2 = SocketId::from("2.2");

        assert_eq!(presence.join(&tab1, rick()), JoinOutcome::Added);
        assert_eq!(presence.join(&tab2, rick()), JoinOutcome::AlreadyPresent);
        assert_eq!(presence.count(), 1);
        assert_eq!(sockets_of(&presence, "1"), 2);

        // First socket leaving keeps the user present.
        assert!(presence.leave(&tab1).is_none());
        assert!(is_present(&presence, "1"));

        assert_eq!(presence.leave(&tab2).map(|m| m.user_id), Some("1".to_string()));
        assert!(presence.is_empty());
    }

    #[test]
    fn test_latest_info_wins() {
        let mut presence = Presence::new();
        presence.join(&SocketId::from("1.1"), rick());
        presence.join(
            &SocketId::from("2.2"),
            PresenceMember::new("1", json!({"name": "Pickle Rick"})),
        );

        assert_eq!(presence.roster()["1"], json!({"name": "Pickle Rick"}));
    }

    #[test]
    fn test_socket_rejoins_as_other_user() {
        let mut presence = Presence::new();
        let socket = SocketId::from("1.1");
        presence.join(&socket, rick());

        let morty = PresenceMember::new("2", json!({"name": "Morty"}));
        assert_eq!(presence.join(&socket, morty), JoinOutcome::Added);
        assert!(!is_present(&presence, "1"));
        assert!(is_present(&presence, "2"));
        assert_eq!(sockets_of(&presence, "2"), 1);
    }

    #[test]
    fn test_roster() {
        let mut presence = Presence::new();
        presence.join(&SocketId::from("1.1"), rick());
        presence.join(
            &SocketId::from("2.2"),
            PresenceMember::new("2", json!({"name": "Morty"})),
        );

        let roster = presence.roster();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.keys().collect::<Vec<_>>(), vec!["1", "2"]);
    }
}
