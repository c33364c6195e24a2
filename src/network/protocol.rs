//! Already-decoded peer and server messages consumed and produced by the
//! transfer engine. Framing and byte encoding belong to the networking layer.

use crate::transfer::FileAttributes;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub type Token = u32;

/// Opaque id of a file connection owned by the networking layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketHandle(pub u64);

/// Direction field of a transfer negotiation, seen from the peer that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Code 0: the peer wants to download a file from us.
    Download,
    /// Code 1: the peer wants to upload a file to us.
    Upload,
    Unknown(u32),
}

impl TransferDirection {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => TransferDirection::Download,
            1 => TransferDirection::Upload,
            other => TransferDirection::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    Offline,
    Away,
    Online,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedFileEntry {
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub attributes: FileAttributes,
}

/// Request that could not be delivered because no peer connection could be
/// established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndeliveredRequest {
    TransferRequest { token: Token },
    FileUploadInit { token: Token },
    QueueUpload { virtual_path: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    ServerLogin {
        success: bool,
    },
    ServerDisconnect,
    TransferRequest {
        user: String,
        addr: Option<IpAddr>,
        direction: TransferDirection,
        token: Token,
        virtual_path: String,
        size: u64,
    },
    TransferResponse {
        user: String,
        token: Token,
        allowed: bool,
        reason: Option<String>,
        size: Option<u64>,
    },
    QueueUpload {
        user: String,
        addr: Option<IpAddr>,
        virtual_path: String,
    },
    PlaceInQueueRequest {
        user: String,
        virtual_path: String,
    },
    PlaceInQueueResponse {
        user: String,
        virtual_path: String,
        place: u32,
    },
    UploadDenied {
        user: String,
        virtual_path: String,
        reason: String,
    },
    UploadFailed {
        user: String,
        virtual_path: String,
    },
    FolderContentsResponse {
        user: String,
        folder: String,
        directories: Vec<(String, Vec<SharedFileEntry>)>,
    },
    /// A peer opened a file connection to send us a file.
    FileDownloadInit {
        user: String,
        token: Token,
        socket: SocketHandle,
    },
    /// Our file connection to a peer we are uploading to is ready.
    FileUploadInit {
        user: String,
        token: Token,
        socket: SocketHandle,
    },
    DownloadProgress {
        user: String,
        token: Token,
        bytes_left: u64,
    },
    UploadProgress {
        user: String,
        token: Token,
        offset: u64,
        bytes_sent: u64,
    },
    /// Bytes received on a download connection, to be appended to the file.
    DownloadData {
        user: String,
        token: Token,
        data: Vec<u8>,
    },
    /// The upload connection is ready for `length` more bytes from `offset`.
    UploadDataRequest {
        user: String,
        token: Token,
        offset: u64,
        length: usize,
    },
    DownloadConnectionClosed {
        user: String,
        token: Token,
    },
    UploadConnectionClosed {
        user: String,
        token: Token,
        timed_out: bool,
    },
    DownloadFileError {
        user: String,
        token: Token,
        error: String,
    },
    UploadFileError {
        user: String,
        token: Token,
        error: String,
    },
    PeerConnectionError {
        user: String,
        requests: Vec<UndeliveredRequest>,
        is_offline: bool,
    },
    UserStatus {
        user: String,
        status: UserStatus,
        privileged: Option<bool>,
    },
    UserStats {
        user: String,
        avg_speed: u64,
    },
    SharesRescanned,
}

impl InboundMessage {
    pub fn user(&self) -> Option<&str> {
        match self {
            InboundMessage::ServerLogin { .. }
            | InboundMessage::ServerDisconnect
            | InboundMessage::SharesRescanned => None,
            InboundMessage::TransferRequest { user, .. }
            | InboundMessage::TransferResponse { user, .. }
            | InboundMessage::QueueUpload { user, .. }
            | InboundMessage::PlaceInQueueRequest { user, .. }
            | InboundMessage::PlaceInQueueResponse { user, .. }
            | InboundMessage::UploadDenied { user, .. }
            | InboundMessage::UploadFailed { user, .. }
            | InboundMessage::FolderContentsResponse { user, .. }
            | InboundMessage::FileDownloadInit { user, .. }
            | InboundMessage::FileUploadInit { user, .. }
            | InboundMessage::DownloadProgress { user, .. }
            | InboundMessage::UploadProgress { user, .. }
            | InboundMessage::DownloadData { user, .. }
            | InboundMessage::UploadDataRequest { user, .. }
            | InboundMessage::DownloadConnectionClosed { user, .. }
            | InboundMessage::UploadConnectionClosed { user, .. }
            | InboundMessage::DownloadFileError { user, .. }
            | InboundMessage::UploadFileError { user, .. }
            | InboundMessage::PeerConnectionError { user, .. }
            | InboundMessage::UserStatus { user, .. }
            | InboundMessage::UserStats { user, .. } => Some(user),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    TransferRequest {
        direction: TransferDirection,
        token: Token,
        virtual_path: String,
        size: u64,
    },
    TransferResponse {
        allowed: bool,
        reason: Option<String>,
        token: Token,
        size: Option<u64>,
    },
    QueueUpload {
        virtual_path: String,
        legacy_client: bool,
    },
    PlaceInQueueRequest {
        virtual_path: String,
        legacy_client: bool,
    },
    PlaceInQueueResponse {
        virtual_path: String,
        place: u32,
    },
    UploadDenied {
        virtual_path: String,
        reason: String,
    },
    UploadFailed {
        virtual_path: String,
    },
    FileUploadInit {
        token: Token,
    },
    FolderContentsRequest {
        directory: String,
        token: Token,
    },
}

impl PeerMessage {
    pub fn allow(token: Token, size: Option<u64>) -> Self {
        PeerMessage::TransferResponse {
            allowed: true,
            reason: None,
            token,
            size,
        }
    }

    pub fn deny(token: Token, reason: impl Into<String>) -> Self {
        PeerMessage::TransferResponse {
            allowed: false,
            reason: Some(reason.into()),
            token,
            size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    WatchUser { user: String },
    SendUploadSpeed { speed: u64 },
    SetUploadLimit { limit: u32, per_transfer: bool },
    SetDownloadLimit { limit: u32 },
}

/// Everything the engine asks the networking layer to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Peer { user: String, message: PeerMessage },
    Server(ServerMessage),
    CloseConnection { socket: SocketHandle },
    /// Receive `bytes_left` bytes on `socket` for the download with `token`.
    DownloadFile {
        socket: SocketHandle,
        token: Token,
        bytes_left: u64,
    },
    /// Ask the uploading peer to start sending at `offset`.
    FileOffset { socket: SocketHandle, offset: u64 },
    UploadFile {
        socket: SocketHandle,
        token: Token,
        size: u64,
    },
    /// File contents read for an upload in response to `UploadDataRequest`.
    UploadData {
        socket: SocketHandle,
        token: Token,
        data: Vec<u8>,
    },
}
