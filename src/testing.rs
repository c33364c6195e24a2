//! Fakes and a harness shared by the unit tests, and by the integration
//! tests through the `test-utils` feature.

use crate::config::Settings;
use crate::network::{OutboundMessage, Outbox, PeerMessage, ServerMessage, UserStatus};
use crate::service::{EngineContext, NetworkFilter, Notifier, Shares, UserList};
use crate::transfer::TransferEvent;
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

#[derive(Default)]
pub struct FakeShares {
    files: Mutex<HashMap<String, PathBuf>>,
    rescanning: AtomicBool,
}

impl FakeShares {
    pub fn share(&self, virtual_path: &str, real_path: &Path) {
        self.files
            .lock()
            .unwrap()
            .insert(virtual_path.to_string(), real_path.to_path_buf());
    }

    pub fn set_rescanning(&self, rescanning: bool) {
        self.rescanning.store(rescanning, Ordering::SeqCst);
    }
}

impl Shares for FakeShares {
    fn virtual_to_real(&self, virtual_path: &str) -> Option<PathBuf> {
        self.files.lock().unwrap().get(virtual_path).cloned()
    }

    fn is_file_shared(&self, _user: &str, virtual_path: &str, real_path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(virtual_path) && real_path.is_file()
    }

    fn is_rescanning(&self) -> bool {
        self.rescanning.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeNetworkFilter {
    pub banned: Mutex<HashSet<String>>,
}

impl NetworkFilter for FakeNetworkFilter {
    fn check_user(&self, user: &str, _addr: Option<IpAddr>) -> (bool, Option<String>) {
        if self.banned.lock().unwrap().contains(user) {
            (false, Some("Banned".to_string()))
        } else {
            (true, None)
        }
    }

    fn ban_user(&self, user: &str) {
        self.banned.lock().unwrap().insert(user.to_string());
    }
}

#[derive(Default)]
pub struct FakeUserList {
    buddies: Mutex<HashMap<String, (bool, bool)>>,
}

impl FakeUserList {
    pub fn add_buddy(&self, user: &str, prioritized: bool, trusted: bool) {
        self.buddies
            .lock()
            .unwrap()
            .insert(user.to_string(), (prioritized, trusted));
    }
}

impl UserList for FakeUserList {
    fn is_buddy(&self, user: &str) -> bool {
        self.buddies.lock().unwrap().contains_key(user)
    }

    fn is_prioritized(&self, user: &str) -> bool {
        matches!(self.buddies.lock().unwrap().get(user), Some((true, _)))
    }

    fn is_trusted(&self, user: &str) -> bool {
        matches!(self.buddies.lock().unwrap().get(user), Some((_, true)))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub shown: Mutex<Vec<(String, String, bool)>>,
}

impl RecordingNotifier {
    pub fn titles(&self) -> Vec<String> {
        self.shown
            .lock()
            .unwrap()
            .iter()
            .map(|(title, _, _)| title.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, message: &str, high_priority: bool) -> Result<()> {
        self.shown
            .lock()
            .unwrap()
            .push((title.to_string(), message.to_string(), high_priority));
        Ok(())
    }
}

/// Engine context wired to fakes, with all folders inside a temp dir and
/// ourselves logged in.
pub struct Harness {
    pub dir: TempDir,
    pub ctx: Arc<EngineContext>,
    pub messages: mpsc::UnboundedReceiver<OutboundMessage>,
    pub events: broadcast::Receiver<TransferEvent>,
    pub shares: Arc<FakeShares>,
    pub network_filter: Arc<FakeNetworkFilter>,
    pub users: Arc<FakeUserList>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(configure: impl FnOnce(&mut Settings)) -> Self {
        let dir = tempfile::tempdir().unwrap();

        let mut settings = Settings::default();
        settings.transfers.download_dir = dir.path().join("downloads");
        settings.transfers.incomplete_dir = dir.path().join("incomplete");
        settings.transfers.upload_dir = dir.path().join("received");
        settings.data_dir = Some(dir.path().join("data"));
        configure(&mut settings);

        let (outbox, messages) = Outbox::channel();
        let events = outbox.subscribe();

        let shares = Arc::new(FakeShares::default());
        let network_filter = Arc::new(FakeNetworkFilter::default());
        let users = Arc::new(FakeUserList::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let ctx = EngineContext::new(settings, outbox)
            .with_shares(shares.clone())
            .with_network_filter(network_filter.clone())
            .with_user_list(users.clone())
            .with_notifier(notifier.clone());
        ctx.peers.set_own_status(UserStatus::Online);

        Self {
            dir,
            ctx: Arc::new(ctx),
            messages,
            events,
            shares,
            network_filter,
            users,
            notifier,
        }
    }

    /// Write `contents` to a real file and share it under `virtual_path`.
    pub fn share_file(&self, virtual_path: &str, contents: &[u8]) -> PathBuf {
        let shared_dir = self.dir.path().join("shared");
        std::fs::create_dir_all(&shared_dir).unwrap();

        let name = virtual_path.rsplit('\\').next().unwrap();
        let path = shared_dir.join(name);
        std::fs::write(&path, contents).unwrap();
        self.shares.share(virtual_path, &path);
        path
    }

    pub fn drain_messages(&mut self) -> Vec<OutboundMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.messages.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Drain, keeping only messages for `user`.
    pub fn peer_messages(&mut self, user: &str) -> Vec<PeerMessage> {
        self.drain_messages()
            .into_iter()
            .filter_map(|message| match message {
                OutboundMessage::Peer { user: to, message } if to == user => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn server_messages(&mut self) -> Vec<ServerMessage> {
        self.drain_messages()
            .into_iter()
            .filter_map(|message| match message {
                OutboundMessage::Server(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn drain_events(&mut self) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
