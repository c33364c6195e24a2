//! Interfaces of the components the transfer engine consults but does not own.

use crate::Result;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// The shares index.
pub trait Shares: Send + Sync {
    /// Local path behind a protocol path, `None` if it cannot be mapped.
    fn virtual_to_real(&self, virtual_path: &str) -> Option<PathBuf>;

    /// Whether `user` may download `virtual_path`.
    fn is_file_shared(&self, user: &str, virtual_path: &str, real_path: &Path) -> bool;

    /// A rescan is running and the index must not be trusted.
    fn is_rescanning(&self) -> bool;
}

/// Ban and ignore lists.
pub trait NetworkFilter: Send + Sync {
    /// `(allowed, reason)`. A reason is only sent back to the peer when one
    /// is given.
    fn check_user(&self, user: &str, addr: Option<IpAddr>) -> (bool, Option<String>);

    fn ban_user(&self, user: &str);
}

/// Buddy list.
pub trait UserList: Send + Sync {
    fn is_buddy(&self, user: &str) -> bool;

    /// Buddy explicitly marked as prioritized.
    fn is_prioritized(&self, user: &str) -> bool;

    /// Buddy trusted to send us files unasked.
    fn is_trusted(&self, user: &str) -> bool;
}

/// Desktop notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str, high_priority: bool) -> Result<()>;
}

/// Shares index that exposes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoShares;

impl Shares for NoShares {
    fn virtual_to_real(&self, _virtual_path: &str) -> Option<PathBuf> {
        None
    }

    fn is_file_shared(&self, _user: &str, _virtual_path: &str, _real_path: &Path) -> bool {
        false
    }

    fn is_rescanning(&self) -> bool {
        false
    }
}

/// Filter that lets everyone through and forgets bans.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl NetworkFilter for AllowAll {
    fn check_user(&self, _user: &str, _addr: Option<IpAddr>) -> (bool, Option<String>) {
        (true, None)
    }

    fn ban_user(&self, _user: &str) {}
}

/// Empty buddy list.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBuddies;

impl UserList for NoBuddies {
    fn is_buddy(&self, _user: &str) -> bool {
        false
    }

    fn is_prioritized(&self, _user: &str) -> bool {
        false
    }

    fn is_trusted(&self, _user: &str) -> bool {
        false
    }
}
