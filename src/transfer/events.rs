use super::record::{TransferId, TransferSnapshot};
use super::state::{TransferKind, TransferStatus};
use std::path::PathBuf;

/// State changes broadcast to whoever is listening (UI, plugins, tests).
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Update {
        kind: TransferKind,
        transfer: TransferSnapshot,
        update_parent: bool,
    },
    /// Many records changed, subscribers should refresh the whole list.
    BatchUpdate {
        kind: TransferKind,
    },
    Abort {
        kind: TransferKind,
        transfer: TransferSnapshot,
        status: Option<TransferStatus>,
        update_parent: bool,
    },
    BatchAbort {
        kind: TransferKind,
        ids: Vec<TransferId>,
        status: TransferStatus,
    },
    Clear {
        kind: TransferKind,
        transfer: TransferSnapshot,
        update_parent: bool,
    },
    BatchClear {
        kind: TransferKind,
        ids: Vec<TransferId>,
    },

    /// Pulse for the downloads tab, `finished` when a file completed.
    DownloadNotification {
        finished: bool,
    },
    UploadNotification,

    /// A folder listing holds more files than we enqueue without asking.
    LargeFolder {
        user: String,
        folder: String,
        num_files: usize,
    },

    DownloadStarted {
        user: String,
        virtual_path: String,
        path: PathBuf,
    },
    DownloadFinished {
        user: String,
        virtual_path: String,
        path: PathBuf,
    },
    UploadQueued {
        user: String,
        virtual_path: String,
        path: PathBuf,
    },
    UploadStarted {
        user: String,
        virtual_path: String,
        path: PathBuf,
    },
    UploadFinished {
        user: String,
        virtual_path: String,
        path: Option<PathBuf>,
    },
}

impl TransferEvent {
    pub fn kind(&self) -> TransferKind {
        match self {
            TransferEvent::Update { kind, .. }
            | TransferEvent::BatchUpdate { kind }
            | TransferEvent::Abort { kind, .. }
            | TransferEvent::BatchAbort { kind, .. }
            | TransferEvent::Clear { kind, .. }
            | TransferEvent::BatchClear { kind, .. } => *kind,
            TransferEvent::DownloadNotification { .. }
            | TransferEvent::LargeFolder { .. }
            | TransferEvent::DownloadStarted { .. }
            | TransferEvent::DownloadFinished { .. } => TransferKind::Download,
            TransferEvent::UploadNotification
            | TransferEvent::UploadQueued { .. }
            | TransferEvent::UploadStarted { .. }
            | TransferEvent::UploadFinished { .. } => TransferKind::Upload,
        }
    }
}
