use super::protocol::UserStatus;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug)]
struct PeerState {
    own_status: UserStatus,
    statuses: HashMap<String, UserStatus>,
    addresses: HashMap<String, IpAddr>,
    watched: HashSet<String>,
}

/// Session knowledge about other users: their last reported status and
/// address, and whether we already asked the server to watch them.
///
/// Shared by both queues and the coordinator. Everything in here is
/// ephemeral and dropped on server disconnect.
#[derive(Debug)]
pub struct PeerTracker {
    state: RwLock<PeerState>,
}

impl Default for PeerTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PeerState {
                own_status: UserStatus::Offline,
                statuses: HashMap::new(),
                addresses: HashMap::new(),
                watched: HashSet::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PeerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PeerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn own_status(&self) -> UserStatus {
        self.read().own_status
    }

    pub fn set_own_status(&self, status: UserStatus) {
        self.write().own_status = status;
    }

    pub fn user_status(&self, user: &str) -> Option<UserStatus> {
        self.read().statuses.get(user).copied()
    }

    pub fn set_user_status(&self, user: &str, status: UserStatus) {
        self.write().statuses.insert(user.to_string(), status);
    }

    /// The user is known to be offline.
    pub fn is_user_offline(&self, user: &str) -> bool {
        self.user_status(user) == Some(UserStatus::Offline)
    }

    /// Either we or the user are offline, so nothing can be exchanged.
    pub fn is_unreachable(&self, user: &str) -> bool {
        self.own_status() == UserStatus::Offline || self.is_user_offline(user)
    }

    pub fn user_address(&self, user: &str) -> Option<IpAddr> {
        self.read().addresses.get(user).copied()
    }

    pub fn set_user_address(&self, user: &str, addr: IpAddr) {
        self.write().addresses.insert(user.to_string(), addr);
    }

    /// Mark `user` as watched. Returns true the first time, when the server
    /// still has to be asked for status updates.
    pub fn watch(&self, user: &str) -> bool {
        self.write().watched.insert(user.to_string())
    }

    pub fn clear_session(&self) {
        let mut state = self.write();
        state.own_status = UserStatus::Offline;
        state.statuses.clear();
        state.addresses.clear();
        state.watched.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_when_either_side_offline() {
        let peers = PeerTracker::new();
        assert!(peers.is_unreachable("alice"));

        peers.set_own_status(UserStatus::Online);
        assert!(!peers.is_unreachable("alice"));

        peers.set_user_status("alice", UserStatus::Offline);
        assert!(peers.is_unreachable("alice"));
        assert!(peers.is_user_offline("alice"));
    }

    #[test]
    fn test_watch_only_once_per_session() {
        let peers = PeerTracker::new();
        assert!(peers.watch("bob"));
        assert!(!peers.watch("bob"));

        peers.clear_session();
        assert!(peers.watch("bob"));
    }
}
