pub mod download;
pub mod events;
pub mod filter;
pub mod list;
pub mod persistence;
pub mod progress;
pub mod record;
pub mod scheduler;
pub mod state;
pub mod upload;

pub use download::DownloadQueue;
pub use events::TransferEvent;
pub use filter::DownloadFilterEngine;
pub use list::TransferList;
pub use persistence::{StoredTransfer, TransferListFormat};
pub use progress::Progress;
pub use record::{
    FileAttributes, TransferId, TransferRecord, TransferSnapshot, ATTRIBUTE_BITRATE,
    ATTRIBUTE_BIT_DEPTH, ATTRIBUTE_DURATION, ATTRIBUTE_ENCODER, ATTRIBUTE_SAMPLE_RATE,
    ATTRIBUTE_VBR,
};
pub use scheduler::Scheduler;
pub use state::{Modifier, TransferKind, TransferStatus};
pub use upload::UploadQueue;
