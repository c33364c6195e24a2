//! Write-to-temp-then-rename for persisted transfer lists.
//!
//! The previous file is kept next to the target with an `.old` suffix so a
//! truncated write never loses the last good snapshot.

use crate::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::error;

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

pub fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, ".old")
}

/// Atomically replace `path` with `content`, keeping the previous version as
/// a backup.
pub fn write_file_and_backup(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = with_suffix(path, ".tmp");

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!("Failed to write temp file {}: {}", tmp_path.display(), e);
        e
    })?;

    if path.exists() {
        if let Err(e) = std::fs::copy(path, backup_path(path)) {
            error!("Failed to back up {}: {}", path.display(), e);
        }
    }

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            "Failed to rename {} to {}: {}",
            tmp_path.display(),
            path.display(),
            e
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_creates_parent_and_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("downloads.json");

        write_file_and_backup(&path, b"[]").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
        assert!(!with_suffix(&path, ".tmp").exists());
    }

    #[test]
    fn test_overwrite_keeps_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("uploads.json");

        write_file_and_backup(&path, b"first").unwrap();
        write_file_and_backup(&path, b"second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert_eq!(std::fs::read_to_string(backup_path(&path)).unwrap(), "first");
    }
}
