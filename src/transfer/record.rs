use super::progress::Progress;
use super::state::{Modifier, TransferStatus};
use crate::network::protocol::{SocketHandle, Token};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub type TransferId = Uuid;

/// Codec metadata keyed by attribute id, passed through unchanged.
pub type FileAttributes = BTreeMap<u32, u32>;

pub const ATTRIBUTE_BITRATE: u32 = 0;
pub const ATTRIBUTE_DURATION: u32 = 1;
pub const ATTRIBUTE_VBR: u32 = 2;
pub const ATTRIBUTE_ENCODER: u32 = 3;
pub const ATTRIBUTE_SAMPLE_RATE: u32 = 4;
pub const ATTRIBUTE_BIT_DEPTH: u32 = 5;

/// One file transfer, owned by the queue that created it.
///
/// The data connection and the open file are private: they can only be
/// attached through the methods below and are released together by
/// [`TransferRecord::release_handles`], which both the abort and the finish
/// paths go through.
#[derive(Debug)]
pub struct TransferRecord {
    id: TransferId,
    user: String,
    virtual_path: String,
    /// Downloads: destination folder. Uploads: folder of the shared file.
    pub folder_path: PathBuf,
    size: u64,
    pub size_changed: bool,
    status: TransferStatus,
    token: Option<Token>,
    socket: Option<SocketHandle>,
    file: Option<File>,
    pub progress: Progress,
    pub queue_position: u32,
    pub legacy_attempt: bool,
    pub file_attributes: FileAttributes,
    pub modifier: Option<Modifier>,
    /// When the current negotiation started, for the timeout scan.
    request_time: Option<Instant>,
}

impl TransferRecord {
    pub fn new(
        user: impl Into<String>,
        virtual_path: impl Into<String>,
        folder_path: impl Into<PathBuf>,
        status: TransferStatus,
        size: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user: user.into(),
            virtual_path: virtual_path.into(),
            folder_path: folder_path.into(),
            size,
            size_changed: false,
            status,
            token: None,
            socket: None,
            file: None,
            progress: Progress::default(),
            queue_position: 0,
            legacy_attempt: false,
            file_attributes: FileAttributes::new(),
            modifier: None,
            request_time: None,
        }
    }

    pub fn with_attributes(mut self, file_attributes: FileAttributes) -> Self {
        self.file_attributes = file_attributes;
        self
    }

    pub fn with_offset(mut self, offset: Option<u64>) -> Self {
        self.progress.current_offset = offset.map(|offset| self.clamp(offset));
        self
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn virtual_path(&self) -> &str {
        &self.virtual_path
    }

    pub fn matches(&self, user: &str, virtual_path: &str) -> bool {
        self.virtual_path == virtual_path && self.user == user
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Correct the expected size, pulling the offset back if it now exceeds it.
    pub fn set_size(&mut self, size: u64) {
        self.size = size;
        if let Some(offset) = self.progress.current_offset {
            self.progress.current_offset = Some(self.clamp(offset));
        }
    }

    pub fn current_offset(&self) -> Option<u64> {
        self.progress.current_offset
    }

    /// True once the whole file has been transferred.
    pub fn is_complete(&self) -> bool {
        matches!(self.progress.current_offset, Some(offset) if offset >= self.size)
    }

    pub fn status(&self) -> &TransferStatus {
        &self.status
    }

    /// Move to a new state. Leaving the negotiating states drops the token
    /// and the negotiation timestamp. A record without an open file is never
    /// put into `Transferring`; such requests are ignored and `false` is
    /// returned.
    pub fn set_status(&mut self, status: TransferStatus) -> bool {
        if status == TransferStatus::Transferring && self.file.is_none() {
            return false;
        }

        if !status.is_active() {
            self.token = None;
            self.request_time = None;
        }

        self.status = status;
        true
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn has_token(&self, user: &str, token: Token) -> bool {
        self.token == Some(token) && self.user == user
    }

    /// Start a negotiation under `token`.
    pub fn negotiate(&mut self, token: Token, now: Instant) {
        self.status = TransferStatus::GettingStatus;
        self.token = Some(token);
        self.request_time = Some(now);
    }

    pub fn request_time(&self) -> Option<Instant> {
        self.request_time
    }

    /// The peer answered the negotiation, stop tracking it for timeouts.
    pub fn clear_request_time(&mut self) {
        self.request_time = None;
    }

    pub fn negotiation_expired(&self, now: Instant, threshold: Duration) -> bool {
        matches!(self.request_time, Some(started) if now.saturating_duration_since(started) >= threshold)
    }

    pub fn socket(&self) -> Option<SocketHandle> {
        self.socket
    }

    /// Attach the data connection. Returns `false` (leaving the existing one
    /// in place) if the record already has a connection.
    pub fn attach_socket(&mut self, socket: SocketHandle) -> bool {
        if self.socket.is_some() {
            return false;
        }
        self.socket = Some(socket);
        true
    }

    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }

    pub fn attach_file(&mut self, file: File) {
        self.file = Some(file);
    }

    pub fn file_mut(&mut self) -> Option<&mut File> {
        self.file.as_mut()
    }

    /// Close the file and hand back the data connection so the caller can ask
    /// the networking layer to close it. Safe to call any number of times.
    pub fn release_handles(&mut self) -> Option<SocketHandle> {
        // Dropping the handle closes it and releases any advisory lock.
        self.file = None;
        if self.status == TransferStatus::Transferring {
            self.status = TransferStatus::Cancelled;
        }
        self.socket.take()
    }

    /// Reset to a clean, handle-free state with `status`, returning the
    /// connection to close.
    pub fn abort(&mut self, status: Option<TransferStatus>) -> Option<SocketHandle> {
        self.token = None;
        self.request_time = None;
        self.queue_position = 0;

        let socket = self.release_handles();

        if let Some(status) = status {
            self.set_status(status);
        }
        socket
    }

    /// Record progress towards `current_offset`, returning the byte delta.
    pub fn update_progress(&mut self, current_offset: u64, now: Instant) -> u64 {
        self.request_time = None;
        self.progress.update(current_offset, self.size, now)
    }

    /// Mark finished, returning the connection to close.
    pub fn complete(&mut self) -> Option<SocketHandle> {
        let socket = self.release_handles();
        self.token = None;
        self.request_time = None;
        self.progress.complete(self.size);
        self.status = TransferStatus::Finished;
        socket
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id,
            user: self.user.clone(),
            virtual_path: self.virtual_path.clone(),
            folder_path: self.folder_path.clone(),
            size: self.size,
            status: self.status.clone(),
            current_offset: self.progress.current_offset,
            speed: self.progress.speed,
            time_elapsed: self.progress.time_elapsed.as_secs(),
            time_left: self.progress.time_left,
            queue_position: self.queue_position,
            file_attributes: self.file_attributes.clone(),
            modifier: self.modifier,
        }
    }

    fn clamp(&self, offset: u64) -> u64 {
        if self.size > 0 {
            offset.min(self.size)
        } else {
            offset
        }
    }
}

/// Handle-free copy of a record handed to event subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub id: TransferId,
    pub user: String,
    pub virtual_path: String,
    pub folder_path: PathBuf,
    pub size: u64,
    pub status: TransferStatus,
    pub current_offset: Option<u64>,
    pub speed: Option<u64>,
    pub time_elapsed: u64,
    pub time_left: Option<u64>,
    pub queue_position: u32,
    pub file_attributes: FileAttributes,
    pub modifier: Option<Modifier>,
}
