use std::collections::{HashMap, HashSet};

use super::record::TransferId;

/// What the scheduler needs to know about one upload record.
#[derive(Debug, Clone, Copy)]
pub struct QueueEntry<'a> {
    pub id: TransferId,
    pub user: &'a str,
    /// Waiting in the queue.
    pub queued: bool,
    /// Negotiating or sending data.
    pub active: bool,
    pub privileged: bool,
}

/// Upload fairness bookkeeping.
///
/// Every time something happens to a user's uploads the shared counter is
/// bumped and stored as that user's "last served" value. Round-robin
/// selection picks the waiting user with the lowest value, i.e. the one
/// that has gone longest without attention.
#[derive(Debug, Default)]
pub struct Scheduler {
    counter: u64,
    last_served: HashMap<String, u64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&mut self, user: &str) {
        self.counter += 1;
        self.last_served.insert(user.to_string(), self.counter);
    }

    pub fn contains(&self, user: &str) -> bool {
        self.last_served.contains_key(user)
    }

    /// Number of users currently tracked, used to estimate queue places.
    pub fn num_users(&self) -> usize {
        self.last_served.len()
    }

    pub fn last_served(&self, user: &str) -> Option<u64> {
        self.last_served.get(user).copied()
    }

    pub fn clear(&mut self) {
        self.counter = 0;
        self.last_served.clear();
    }

    /// Pick the next upload to start from `entries` (oldest first).
    ///
    /// Users that already have an active upload are never picked. While any
    /// privileged user without an active upload is waiting, non-privileged
    /// users are skipped. Users with nothing queued are forgotten.
    pub fn select<'a>(
        &mut self,
        entries: impl IntoIterator<Item = QueueEntry<'a>>,
        fifo: bool,
    ) -> Option<TransferId> {
        let mut first_queued: Vec<(&str, TransferId)> = Vec::new();
        let mut queued_users: HashMap<&str, bool> = HashMap::new();
        let mut uploading: HashSet<&str> = HashSet::new();

        for entry in entries {
            if entry.queued {
                if !uploading.contains(entry.user)
                    && !first_queued.iter().any(|(user, _)| *user == entry.user)
                {
                    first_queued.push((entry.user, entry.id));
                }
                queued_users.entry(entry.user).or_insert(entry.privileged);
            } else if entry.active && uploading.insert(entry.user) {
                first_queued.retain(|(user, _)| *user != entry.user);
            }
        }

        let privileged_queue = queued_users
            .iter()
            .any(|(user, privileged)| *privileged && !uploading.contains(user));

        let eligible = |user: &str| !privileged_queue || queued_users.get(user) == Some(&true);

        self.last_served
            .retain(|user, _| queued_users.contains_key(user.as_str()));

        let target = if fifo {
            first_queued.iter().find(|(user, _)| eligible(*user))
        } else {
            first_queued
                .iter()
                .filter(|(user, _)| eligible(*user))
                .min_by_key(|(user, _)| self.last_served.get(*user).copied().unwrap_or(0))
        };

        target.map(|(_, id)| *id)
    }
}
