use super::collaborators::{AllowAll, NetworkFilter, NoBuddies, NoShares, Notifier, Shares, UserList};
use super::notifications::SystemNotifier;
use crate::config::Settings;
use crate::network::{Outbox, PeerTracker, ServerMessage, Token};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shared, read-mostly state handed to both queues.
pub struct EngineContext {
    pub settings: Arc<Settings>,
    pub outbox: Outbox,
    pub peers: Arc<PeerTracker>,
    pub shares: Arc<dyn Shares>,
    pub network_filter: Arc<dyn NetworkFilter>,
    pub user_list: Arc<dyn UserList>,
    pub notifier: Arc<dyn Notifier>,
    token: AtomicU32,
}

impl EngineContext {
    /// Context with inert collaborators and the notifier the settings ask
    /// for; swap them in with the `with_*` builders.
    pub fn new(settings: Settings, outbox: Outbox) -> Self {
        let notifier = SystemNotifier::from_settings(&settings.notifications);
        Self {
            settings: Arc::new(settings),
            outbox,
            peers: Arc::new(PeerTracker::new()),
            shares: Arc::new(NoShares),
            network_filter: Arc::new(AllowAll),
            user_list: Arc::new(NoBuddies),
            notifier: Arc::new(notifier),
            token: AtomicU32::new(0),
        }
    }

    pub fn with_peers(mut self, peers: Arc<PeerTracker>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_shares(mut self, shares: Arc<dyn Shares>) -> Self {
        self.shares = shares;
        self
    }

    pub fn with_network_filter(mut self, network_filter: Arc<dyn NetworkFilter>) -> Self {
        self.network_filter = network_filter;
        self
    }

    pub fn with_user_list(mut self, user_list: Arc<dyn UserList>) -> Self {
        self.user_list = user_list;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Next token for a negotiation we start ourselves.
    pub fn next_token(&self) -> Token {
        self.token.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn reset_tokens(&self) {
        self.token.store(0, Ordering::Relaxed);
    }

    /// Ask the server for status updates about `user`, once per session.
    pub fn watch_user(&self, user: &str) {
        if self.peers.watch(user) {
            debug!("Watching user {}", user);
            self.outbox.send_to_server(ServerMessage::WatchUser {
                user: user.to_string(),
            });
        }
    }

    /// Show a notification; failures are only logged.
    pub fn notify(&self, title: &str, message: &str, high_priority: bool) {
        if let Err(e) = self.notifier.notify(title, message, high_priority) {
            warn!("Failed to show notification: {}", e);
        }
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("settings", &self.settings)
            .field("peers", &self.peers)
            .finish_non_exhaustive()
    }
}
