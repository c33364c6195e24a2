use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;

/// Lifecycle state of a transfer.
///
/// `Queued → GettingStatus → Transferring → Finished`, with every
/// non-finished state able to drop into one of the failure states. The
/// human readable label (what peers send as denial reasons and what is
/// persisted) is derived with [`TransferStatus::label`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Queued,
    GettingStatus,
    Transferring,
    Finished,

    // Terminal, cleared or retried by the user only
    Paused,
    Filtered,
    Cancelled,
    UserLoggedOff,
    DownloadFolderError,
    FileNotShared,

    // Retried by the periodic sweeps
    ConnectionTimeout,
    LocalFileError,
    RemoteFileError,
    TooManyFiles,
    TooManyMegabytes,
    /// Dynamic limit reported by the remote, e.g. "User limit of 5 files".
    UserLimit(String),

    PendingShutdown,
    /// Any other reason a peer gave for refusing a transfer.
    Denied(String),
}

impl TransferStatus {
    pub fn label(&self) -> Cow<'_, str> {
        let label = match self {
            TransferStatus::Queued => "Queued",
            TransferStatus::GettingStatus => "Getting status",
            TransferStatus::Transferring => "Transferring",
            TransferStatus::Finished => "Finished",
            TransferStatus::Paused => "Paused",
            TransferStatus::Filtered => "Filtered",
            TransferStatus::Cancelled => "Cancelled",
            TransferStatus::UserLoggedOff => "User logged off",
            TransferStatus::DownloadFolderError => "Download folder error",
            TransferStatus::FileNotShared => "File not shared.",
            TransferStatus::ConnectionTimeout => "Connection timeout",
            TransferStatus::LocalFileError => "Local file error",
            TransferStatus::RemoteFileError => "Remote file error",
            TransferStatus::TooManyFiles => "Too many files",
            TransferStatus::TooManyMegabytes => "Too many megabytes",
            TransferStatus::PendingShutdown => "Pending shutdown.",
            TransferStatus::UserLimit(text) | TransferStatus::Denied(text) => {
                return Cow::Borrowed(text.as_str())
            }
        };
        Cow::Borrowed(label)
    }

    pub fn from_label(label: &str) -> Self {
        match label {
            "Queued" => TransferStatus::Queued,
            "Getting status" => TransferStatus::GettingStatus,
            "Transferring" => TransferStatus::Transferring,
            "Finished" => TransferStatus::Finished,
            "Paused" | "Aborted" => TransferStatus::Paused,
            "Filtered" => TransferStatus::Filtered,
            "Cancelled" => TransferStatus::Cancelled,
            "User logged off" => TransferStatus::UserLoggedOff,
            "Download folder error" => TransferStatus::DownloadFolderError,
            "File not shared." | "File not shared" => TransferStatus::FileNotShared,
            "Connection timeout" => TransferStatus::ConnectionTimeout,
            "Local file error" => TransferStatus::LocalFileError,
            "Remote file error" => TransferStatus::RemoteFileError,
            "Too many files" => TransferStatus::TooManyFiles,
            "Too many megabytes" => TransferStatus::TooManyMegabytes,
            "Pending shutdown." => TransferStatus::PendingShutdown,
            text if text.starts_with("User limit of") => TransferStatus::UserLimit(text.to_string()),
            text => TransferStatus::Denied(text.to_string()),
        }
    }

    /// Parse a reason string received from a peer. Reasons naming one of our
    /// own `internal` states are never attributed to the peer and become
    /// `Cancelled`.
    pub fn from_remote_reason(reason: &str, internal: &[TransferStatus]) -> Self {
        let status = Self::from_label(reason);
        if internal.contains(&status) {
            TransferStatus::Cancelled
        } else {
            status
        }
    }

    /// Negotiating or sending data.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TransferStatus::GettingStatus | TransferStatus::Transferring
        )
    }

    /// Waiting, negotiating or sending data.
    pub fn is_pending(&self) -> bool {
        matches!(self, TransferStatus::Queued) || self.is_active()
    }

    /// Failures the three minute sweep retries on its own.
    pub fn is_retryable_failure(&self) -> bool {
        matches!(
            self,
            TransferStatus::ConnectionTimeout
                | TransferStatus::LocalFileError
                | TransferStatus::RemoteFileError
        )
    }

    /// Queue limits imposed by the remote, retried by the twelve minute sweep.
    pub fn is_limited(&self) -> bool {
        matches!(
            self,
            TransferStatus::TooManyFiles
                | TransferStatus::TooManyMegabytes
                | TransferStatus::UserLimit(_)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for TransferStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

impl<'de> Deserialize<'de> for TransferStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Ok(Self::from_label(&label))
    }
}

/// Whether a transfer is bumped ahead of others in the upload queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    /// The peer holds network-wide privileges.
    Privileged,
    /// The peer is a buddy we chose to prioritize.
    Prioritized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Download,
    Upload,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Download => write!(f, "Download"),
            TransferKind::Upload => write!(f, "Upload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_round_trip_for_known_states() {
        for status in [
            TransferStatus::Queued,
            TransferStatus::GettingStatus,
            TransferStatus::Transferring,
            TransferStatus::Finished,
            TransferStatus::UserLoggedOff,
            TransferStatus::FileNotShared,
            TransferStatus::TooManyMegabytes,
        ] {
            assert_eq!(TransferStatus::from_label(&status.label()), status);
        }
    }

    #[test]
    fn test_dynamic_and_unknown_labels() {
        let limit = TransferStatus::from_label("User limit of 5 files");
        assert_eq!(limit, TransferStatus::UserLimit("User limit of 5 files".into()));
        assert!(limit.is_limited());
        assert_eq!(limit.label(), "User limit of 5 files");

        let banned = TransferStatus::from_label("Banned (go away)");
        assert_eq!(banned, TransferStatus::Denied("Banned (go away)".into()));
        assert!(!banned.is_limited());

        assert_eq!(TransferStatus::from_label("Aborted"), TransferStatus::Paused);
        assert_eq!(
            TransferStatus::from_label("File not shared"),
            TransferStatus::FileNotShared
        );
    }

    #[test]
    fn test_internal_remote_reasons_become_cancelled() {
        let internal = [TransferStatus::Transferring, TransferStatus::Finished];

        assert_eq!(
            TransferStatus::from_remote_reason("Transferring", &internal),
            TransferStatus::Cancelled
        );
        assert_eq!(
            TransferStatus::from_remote_reason("Too many files", &internal),
            TransferStatus::TooManyFiles
        );
    }

    #[test]
    fn test_status_serializes_as_label() {
        let json = serde_json::to_string(&TransferStatus::GettingStatus).unwrap();
        assert_eq!(json, "\"Getting status\"");

        let status: TransferStatus = serde_json::from_str("\"Connection timeout\"").unwrap();
        assert_eq!(status, TransferStatus::ConnectionTimeout);
    }
}
