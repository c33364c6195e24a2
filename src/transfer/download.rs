//! Transfers where we are the receiving side.

use super::events::TransferEvent;
use super::filter::DownloadFilterEngine;
use super::list::TransferList;
use super::persistence::StoredTransfer;
use super::record::{FileAttributes, TransferId, TransferRecord};
use super::state::{TransferKind, TransferStatus};
use crate::config::{DownloadFilter, UploadPermission};
use crate::network::{
    OutboundMessage, PeerMessage, ServerMessage, SharedFileEntry, SocketHandle, Token, UserStatus,
};
use crate::service::EngineContext;
use crate::utils::{
    execute_command, limited_basename, sanitize_filename, split_extension, virtual_parent_name,
    MAX_BASENAME_BYTES,
};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Folder listings with more files than this are not enqueued without
/// asking the user first.
pub const LARGE_FOLDER_FILES: usize = 100;

/// Statuses a peer may never report back to us as its own reason.
const INTERNAL_DENIAL_REASONS: &[TransferStatus] = &[
    TransferStatus::GettingStatus,
    TransferStatus::Transferring,
    TransferStatus::Paused,
    TransferStatus::Filtered,
    TransferStatus::UserLoggedOff,
    TransferStatus::Finished,
];

/// A request to download one file.
#[derive(Debug, Clone, Default)]
pub struct FileRequest {
    pub user: String,
    pub virtual_path: String,
    /// Destination folder; resolved from remembered folder requests or the
    /// download folder when unset.
    pub folder_path: Option<PathBuf>,
    pub size: u64,
    pub file_attributes: FileAttributes,
    pub bypass_filter: bool,
}

impl FileRequest {
    pub fn new(user: impl Into<String>, virtual_path: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            virtual_path: virtual_path.into(),
            ..Self::default()
        }
    }

    pub fn folder(mut self, folder_path: impl Into<PathBuf>) -> Self {
        self.folder_path = Some(folder_path.into());
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn attributes(mut self, file_attributes: FileAttributes) -> Self {
        self.file_attributes = file_attributes;
        self
    }

    pub fn bypass_filter(mut self) -> Self {
        self.bypass_filter = true;
        self
    }
}

pub struct DownloadQueue {
    ctx: Arc<EngineContext>,
    transfers: TransferList,
    filters: DownloadFilterEngine,
    filters_enabled: bool,
    /// user → remote folder → local destination chosen for it.
    requested_folders: HashMap<String, HashMap<String, PathBuf>>,
}

impl DownloadQueue {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let transfer_settings = &ctx.settings.transfers;
        let filters = DownloadFilterEngine::compile(&transfer_settings.download_filters);
        let filters_enabled = transfer_settings.enable_filters;

        Self {
            ctx,
            transfers: TransferList::new(),
            filters,
            filters_enabled,
            requested_folders: HashMap::new(),
        }
    }

    pub fn transfers(&self) -> &TransferList {
        &self.transfers
    }

    pub fn get(&self, id: TransferId) -> Option<&TransferRecord> {
        self.transfers.get(id)
    }

    pub fn find(&self, user: &str, virtual_path: &str) -> Option<&TransferRecord> {
        self.transfers
            .find(user, virtual_path)
            .and_then(|id| self.transfers.get(id))
    }

    /// Replace the download filters.
    pub fn update_filters(&mut self, enabled: bool, filters: &[DownloadFilter]) {
        self.filters_enabled = enabled;
        self.filters = DownloadFilterEngine::compile(filters);
    }

    /// Whether the active filters would reject `virtual_path`.
    pub fn is_filtered(&self, virtual_path: &str) -> bool {
        self.filters_enabled && self.filters.is_filtered(virtual_path)
    }

    pub fn on_server_login(&mut self) {
        self.requested_folders.clear();
        self.update_download_limits();

        let mut users: Vec<&str> = self
            .transfers
            .iter()
            .filter(|record| {
                !matches!(
                    record.status(),
                    TransferStatus::Filtered | TransferStatus::Finished
                )
            })
            .map(TransferRecord::user)
            .collect();
        users.sort_unstable();
        users.dedup();

        for user in users {
            self.ctx.watch_user(user);
        }
    }

    pub fn on_server_disconnect(&mut self) {
        let ids = self.transfers.ids_where(|record| {
            !matches!(
                record.status(),
                TransferStatus::Finished | TransferStatus::Filtered | TransferStatus::Paused
            )
        });

        for id in &ids {
            self.abort(*id, Some(TransferStatus::UserLoggedOff), false);
        }

        if !ids.is_empty() {
            self.emit_batch_update();
        }
        self.requested_folders.clear();
    }

    pub fn update_download_limits(&self) {
        if self.ctx.peers.own_status() == UserStatus::Offline {
            return;
        }

        let limit = self.ctx.settings.transfers.download_speed_limit();
        self.ctx
            .outbox
            .send_to_server(ServerMessage::SetDownloadLimit { limit });
    }

    /// Enqueue a download. Asking again for a file that is already pending
    /// does nothing; a finished one is checked against the disk again.
    pub fn request_file(&mut self, request: FileRequest) -> Option<TransferId> {
        let folder_path = match request.folder_path {
            Some(ref folder_path) if !folder_path.as_os_str().is_empty() => folder_path.clone(),
            _ => self.remembered_destination(&request.user, &request.virtual_path),
        };

        let id = match self.transfers.find(&request.user, &request.virtual_path) {
            Some(id) => {
                let record = self.transfers.get_mut(id)?;
                if record.status() != &TransferStatus::Finished {
                    debug!(
                        "Download of {} from {} is already in the list",
                        request.virtual_path, request.user
                    );
                    return Some(id);
                }

                record.folder_path = folder_path;
                if request.size > 0 {
                    record.set_size(request.size);
                }
                id
            }
            None => {
                let record = TransferRecord::new(
                    request.user.as_str(),
                    request.virtual_path.as_str(),
                    folder_path,
                    TransferStatus::Queued,
                    request.size,
                )
                .with_attributes(request.file_attributes);
                self.transfers.push(record)
            }
        };

        self.queue_file(id, request.bypass_filter, true)
    }

    /// Put an existing record back in the remote queue. Returns `None` if the
    /// record was filtered and auto-cleared.
    fn queue_file(&mut self, id: TransferId, bypass_filter: bool, update: bool) -> Option<TransferId> {
        let filtered = {
            let record = self.transfers.get_mut(id)?;
            record.set_status(TransferStatus::Queued);
            self.ctx.watch_user(record.user());

            !bypass_filter && self.filters_enabled && self.filters.is_filtered(record.virtual_path())
        };

        if filtered {
            if self.auto_clear(id) {
                return None;
            }
            self.abort(id, Some(TransferStatus::Filtered), true);
        }

        let (user, virtual_path, folder_path, size, status, legacy_attempt) = {
            let record = self.transfers.get(id)?;
            (
                record.user().to_string(),
                record.virtual_path().to_string(),
                record.folder_path.clone(),
                record.size(),
                record.status().clone(),
                record.legacy_attempt,
            )
        };

        if self.ctx.peers.is_unreachable(&user) {
            if let Some(record) = self.transfers.get_mut(id) {
                record.set_status(TransferStatus::UserLoggedOff);
            }
        } else if status != TransferStatus::Filtered {
            match self.complete_download_path(&user, &virtual_path, &folder_path, size) {
                Some(path) => {
                    debug!("File {} is already downloaded", path.display());
                    if let Some(record) = self.transfers.get_mut(id) {
                        record.complete();
                    }
                }
                None => {
                    debug!("Adding file {} from user {} to download queue", virtual_path, user);
                    self.ctx.outbox.send_to_peer(
                        &user,
                        PeerMessage::QueueUpload {
                            virtual_path,
                            legacy_client: legacy_attempt,
                        },
                    );
                }
            }
        }

        if update {
            self.emit_update(id, true);
        }
        Some(id)
    }

    /// Ask `user` for the contents of `folder`, optionally remembering where
    /// the files should go.
    pub fn get_folder(&mut self, user: &str, folder: &str, destination: Option<PathBuf>) {
        if let Some(destination) = destination {
            self.requested_folders
                .entry(user.to_string())
                .or_default()
                .insert(folder.to_string(), destination);
        }

        self.ctx.outbox.send_to_peer(
            user,
            PeerMessage::FolderContentsRequest {
                directory: folder.to_string(),
                token: self.ctx.next_token(),
            },
        );
    }

    /// Enqueue the files of a requested folder (not its subfolders).
    pub fn on_folder_contents(
        &mut self,
        user: &str,
        folder: &str,
        directories: &[(String, Vec<SharedFileEntry>)],
        check_num_files: bool,
    ) {
        debug!("Received response for folder content request from user {}", user);

        for (directory, files) in directories {
            if !folder.starts_with(directory.as_str()) {
                continue;
            }

            if check_num_files && files.len() > LARGE_FOLDER_FILES {
                self.ctx.outbox.emit(TransferEvent::LargeFolder {
                    user: user.to_string(),
                    folder: directory.clone(),
                    num_files: files.len(),
                });
                return;
            }

            let destination = self.get_folder_destination(user, directory, "", true);

            let mut files: Vec<&SharedFileEntry> = files.iter().collect();
            files.sort_by(|a, b| a.name.cmp(&b.name));

            debug!(
                "Attempting to download files in folder {} for user {}. Destination path: {}",
                directory,
                user,
                destination.display()
            );

            for file in files {
                let virtual_path = format!("{}\\{}", directory.trim_end_matches('\\'), file.name);
                self.request_file(
                    FileRequest::new(user, virtual_path)
                        .folder(destination.clone())
                        .size(file.size)
                        .attributes(file.attributes.clone()),
                );
            }
        }
    }

    /// Local folder for the remote `folder`: the remembered destination (or
    /// the download folder) plus the folder names below `remove_prefix`.
    pub fn get_folder_destination(
        &mut self,
        user: &str,
        folder: &str,
        remove_prefix: &str,
        remove_destination: bool,
    ) -> PathBuf {
        let remove_prefix = match remove_prefix {
            "" => folder.rsplit_once('\\').map(|(parent, _)| parent).unwrap_or(""),
            prefix => prefix,
        };

        let target_folders: PathBuf = folder
            .replacen(remove_prefix, "", 1)
            .split('\\')
            .filter(|part| !part.is_empty())
            .map(sanitize_filename)
            .collect();

        let remembered = self
            .requested_folders
            .get_mut(user)
            .and_then(|folders| {
                if remove_destination {
                    folders.remove(folder)
                } else {
                    folders.get(folder).cloned()
                }
            })
            .filter(|location| !location.as_os_str().is_empty());

        let location = remembered.unwrap_or_else(|| self.default_download_folder(user));
        location.join(target_folders)
    }

    fn remembered_destination(&self, user: &str, virtual_path: &str) -> PathBuf {
        let remembered = virtual_path.rsplit_once('\\').and_then(|(folder, _)| {
            let location = self.requested_folders.get(user)?.get(folder)?;
            let name = virtual_parent_name(virtual_path)?;
            Some(location.join(sanitize_filename(name)))
        });

        remembered.unwrap_or_else(|| self.default_download_folder(user))
    }

    fn default_download_folder(&self, user: &str) -> PathBuf {
        let transfer_settings = &self.ctx.settings.transfers;
        let download_dir = transfer_settings.download_dir.clone();

        if !transfer_settings.username_subfolders {
            return download_dir;
        }

        let user_dir = download_dir.join(sanitize_filename(user));
        match fs::create_dir_all(&user_dir) {
            Ok(()) => user_dir,
            Err(e) => {
                warn!(
                    "Unable to save download to username subfolder, falling back to default download folder: {}",
                    e
                );
                download_dir
            }
        }
    }

    fn download_basename(virtual_path: &str) -> String {
        limited_basename(virtual_path, "", MAX_BASENAME_BYTES)
    }

    /// Basename in `folder_path` that does not clash with an existing file.
    fn available_basename(virtual_path: &str, folder_path: &Path) -> String {
        let basename = Self::download_basename(virtual_path);
        let (stem, extension) = split_extension(&basename);

        let mut candidate = basename.clone();
        let mut counter = 1;

        while folder_path.join(&candidate).exists() {
            candidate = format!("{} ({}){}", stem, counter, extension);
            counter += 1;
        }
        candidate
    }

    /// An earlier download of the same file with matching size, looking at
    /// `name.ext`, `name (1).ext` and so on.
    pub fn complete_download_path(
        &self,
        user: &str,
        virtual_path: &str,
        folder_path: &Path,
        size: u64,
    ) -> Option<PathBuf> {
        let folder_path = if folder_path.as_os_str().is_empty() {
            self.default_download_folder(user)
        } else {
            folder_path.to_path_buf()
        };

        let basename = Self::download_basename(virtual_path);
        let (stem, extension) = split_extension(&basename);
        let mut path = folder_path.join(&basename);
        let mut counter = 1;

        while path.is_file() {
            if fs::metadata(&path).map(|meta| meta.len()).ok() == Some(size) {
                return Some(path);
            }

            path = folder_path.join(format!("{} ({}){}", stem, counter, extension));
            counter += 1;
        }
        None
    }

    /// Staging file for a download in progress. The name is derived from a
    /// hash of the remote path and user so that different sources never
    /// collide and long remote paths stay within file name limits.
    pub fn incomplete_download_path(&self, user: &str, virtual_path: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(virtual_path.as_bytes());
        hasher.update(user.as_bytes());
        let digest: String = hasher
            .finalize()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect();

        let prefix = format!("INCOMPLETE{}", digest);
        self.ctx
            .settings
            .transfers
            .incomplete_dir
            .join(limited_basename(virtual_path, &prefix, MAX_BASENAME_BYTES))
    }

    /// Where the file of a download currently lives on disk.
    pub fn current_download_file_path(
        &self,
        user: &str,
        virtual_path: &str,
        folder_path: &Path,
        size: u64,
    ) -> PathBuf {
        self.complete_download_path(user, virtual_path, folder_path, size)
            .unwrap_or_else(|| self.incomplete_download_path(user, virtual_path))
    }

    fn can_receive_uploads(&self, user: &str) -> bool {
        let transfer_settings = &self.ctx.settings.transfers;
        if !transfer_settings.remote_downloads {
            return false;
        }

        match transfer_settings.upload_allowed {
            UploadPermission::Nobody => false,
            UploadPermission::Everyone => true,
            UploadPermission::Buddies => self.ctx.user_list.is_buddy(user),
            UploadPermission::TrustedBuddies => self.ctx.user_list.is_trusted(user),
        }
    }

    /// The peer is ready to send us `virtual_path`. Returns the response to
    /// send back.
    pub fn accept_transfer_request(
        &mut self,
        user: &str,
        token: Token,
        virtual_path: &str,
        size: u64,
    ) -> PeerMessage {
        debug!(
            "Received download request with token {} for file {} from user {}",
            token, virtual_path, user
        );

        if let Some(id) = self.transfers.find(user, virtual_path) {
            let Some(record) = self.transfers.get_mut(id) else {
                return PeerMessage::deny(token, TransferStatus::Cancelled.label());
            };

            match record.status() {
                TransferStatus::Finished => return PeerMessage::deny(token, "Complete"),
                TransferStatus::Paused | TransferStatus::Filtered => {
                    return PeerMessage::deny(token, TransferStatus::Cancelled.label())
                }
                _ => {}
            }

            // Some clients report 0 for files over 2 GiB, keep the cached size then
            if size > 0 {
                if record.size() != size {
                    record.size_changed = true;
                }
                record.set_size(size);
            }

            record.negotiate(token, Instant::now());
            self.emit_update(id, true);
            return PeerMessage::allow(token, None);
        }

        let default_folder = self.default_download_folder(user);
        if self
            .complete_download_path(user, virtual_path, &default_folder, size)
            .is_some()
        {
            debug!("Denied file request from {}: {} is complete", user, virtual_path);
            return PeerMessage::deny(token, "Complete");
        }

        // Not in our queue, so the peer is pushing a file to us unasked
        if !self.can_receive_uploads(user) {
            debug!("Denied file request: User {}, {}", user, virtual_path);
            return PeerMessage::deny(token, TransferStatus::Cancelled.label());
        }

        let transfer_settings = &self.ctx.settings.transfers;
        let folder_path = match virtual_parent_name(virtual_path) {
            Some(parent) if transfer_settings.uploads_in_subdirs => transfer_settings
                .upload_dir
                .join(sanitize_filename(user))
                .join(sanitize_filename(parent)),
            _ if transfer_settings.uploads_in_subdirs => {
                transfer_settings.upload_dir.join(sanitize_filename(user))
            }
            _ => default_folder,
        };

        let mut record =
            TransferRecord::new(user, virtual_path, folder_path, TransferStatus::Queued, size);
        record.negotiate(token, Instant::now());
        let id = self.transfers.push(record);

        self.emit_update(id, true);
        self.ctx.watch_user(user);

        PeerMessage::allow(token, None)
    }

    /// The peer opened the file connection. Returns `false` if no download
    /// has `token`, in which case the peer may be a legacy client asking us
    /// to upload instead.
    pub fn begin_receiving(&mut self, user: &str, token: Token, socket: SocketHandle) -> bool {
        let Some(id) = self.transfers.find_by_token(user, token) else {
            debug!(
                "Received unknown file download init message with token {}, checking if peer requested us to upload a file instead",
                token
            );
            return false;
        };

        let incomplete_path = {
            let Some(record) = self.transfers.get(id) else {
                return false;
            };
            debug!(
                "Received file download init with token {} for file {} from user {}",
                token,
                record.virtual_path(),
                user
            );
            self.incomplete_download_path(user, record.virtual_path())
        };

        let Some(record) = self.transfers.get_mut(id) else {
            return false;
        };

        if !record.attach_socket(socket) {
            debug!("Download already has an existing file connection, ignoring init message");
            self.ctx.outbox.close_connection(socket);
            return true;
        }

        match open_incomplete_file(&incomplete_path, record.size_changed) {
            Ok((file, offset)) => {
                let now = Instant::now();
                let size = record.size();

                record.attach_file(file);
                record.queue_position = 0;
                record.progress.begin(Some(offset), now);
                record.progress.current_offset = Some(offset);

                info!(
                    "Download started: user {}, file {}",
                    user,
                    incomplete_path.display()
                );
                self.ctx.outbox.emit(TransferEvent::DownloadStarted {
                    user: user.to_string(),
                    virtual_path: record.virtual_path().to_string(),
                    path: incomplete_path,
                });

                if size > offset {
                    record.set_status(TransferStatus::Transferring);
                    self.ctx.outbox.send(OutboundMessage::DownloadFile {
                        socket,
                        token,
                        bytes_left: size - offset,
                    });
                    self.ctx
                        .outbox
                        .send(OutboundMessage::FileOffset { socket, offset });
                    self.emit_update(id, true);
                } else {
                    self.finish(id);
                }
            }
            Err(e) => {
                warn!(
                    "Cannot save file in {}: {}",
                    self.ctx.settings.transfers.incomplete_dir.display(),
                    e
                );
                self.abort(id, Some(TransferStatus::DownloadFolderError), true);
                self.ctx.notify("Download Folder Error", &e.to_string(), true);
            }
        }

        self.ctx
            .outbox
            .emit(TransferEvent::DownloadNotification { finished: false });
        true
    }

    /// Append received bytes to the staging file.
    pub fn write_data(&mut self, user: &str, token: Token, data: &[u8]) -> bool {
        let Some(id) = self.transfers.find_by_token(user, token) else {
            return false;
        };

        let result = match self.transfers.get_mut(id).and_then(TransferRecord::file_mut) {
            Some(file) => file.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "download file is not open")),
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                self.on_file_error(user, token, &e.to_string());
                false
            }
        }
    }

    pub fn on_progress(&mut self, user: &str, token: Token, bytes_left: u64) {
        let Some(id) = self.transfers.find_by_token(user, token) else {
            return;
        };

        if let Some(record) = self.transfers.get_mut(id) {
            let current_offset = record.size().saturating_sub(bytes_left);
            record.update_progress(current_offset, Instant::now());
            record.set_status(TransferStatus::Transferring);
        }
        self.emit_update(id, true);
    }

    pub fn on_connection_closed(&mut self, user: &str, token: Token) {
        let Some(id) = self.transfers.find_by_token(user, token) else {
            return;
        };

        let Some(record) = self.transfers.get(id) else {
            return;
        };

        if record.is_complete() {
            self.finish(id);
            return;
        }

        let status = if record.status() == &TransferStatus::Finished {
            None
        } else if self.ctx.peers.is_user_offline(user) {
            Some(TransferStatus::UserLoggedOff)
        } else {
            Some(TransferStatus::Cancelled)
        };

        self.abort(id, status, true);
    }

    /// Move the staging file into place and run the completion actions.
    pub fn finish(&mut self, id: TransferId) {
        let (user, virtual_path, folder_path) = {
            let Some(record) = self.transfers.get_mut(id) else {
                return;
            };
            // Close the staging file before moving it
            if let Some(socket) = record.release_handles() {
                self.ctx.outbox.close_connection(socket);
            }
            record.clear_request_time();
            (
                record.user().to_string(),
                record.virtual_path().to_string(),
                record.folder_path.clone(),
            )
        };

        let folder_path = if folder_path.as_os_str().is_empty() {
            self.default_download_folder(&user)
        } else {
            folder_path
        };

        let incomplete_path = self.incomplete_download_path(&user, &virtual_path);
        let destination = folder_path.join(Self::available_basename(&virtual_path, &folder_path));

        let moved = fs::create_dir_all(&folder_path)
            .and_then(|()| move_file(&incomplete_path, &destination));

        if let Err(e) = moved {
            warn!(
                "Couldn't move '{}' to '{}': {}",
                incomplete_path.display(),
                destination.display(),
                e
            );
            self.abort(id, Some(TransferStatus::DownloadFolderError), true);
            self.ctx.notify("Download Folder Error", &e.to_string(), true);
            return;
        }

        if let Some(record) = self.transfers.get_mut(id) {
            record.complete();
        }

        self.file_downloaded_actions(&user, &destination);
        self.folder_downloaded_actions(&user, &folder_path);

        self.ctx
            .outbox
            .emit(TransferEvent::DownloadNotification { finished: true });

        if !self.auto_clear(id) {
            self.emit_update(id, true);
        }

        self.ctx.outbox.emit(TransferEvent::DownloadFinished {
            user: user.clone(),
            virtual_path: virtual_path.clone(),
            path: destination,
        });

        info!("✅ Download finished: user {}, file {}", user, virtual_path);
    }

    fn file_downloaded_actions(&self, user: &str, path: &Path) {
        if self.ctx.settings.notifications.popup_file {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.ctx.notify(
                "File Downloaded",
                &format!("{} downloaded from {}", name, user),
                false,
            );
        }

        if let Some(ref command) = self.ctx.settings.transfers.after_finish {
            match execute_command(command, path) {
                Ok(()) => info!("Executed: {}", command),
                Err(e) => warn!("Trouble executing '{}': {}", command, e),
            }
        }
    }

    fn folder_downloaded_actions(&self, user: &str, folder_path: &Path) {
        if folder_path.as_os_str().is_empty() {
            return;
        }

        let pending = self.transfers.iter().any(|record| {
            record.folder_path == folder_path
                && !matches!(
                    record.status(),
                    TransferStatus::Finished | TransferStatus::Paused | TransferStatus::Filtered
                )
        });
        if pending {
            return;
        }

        if self.ctx.settings.notifications.popup_folder {
            self.ctx.notify(
                "Folder Downloaded",
                &format!("{} downloaded from {}", folder_path.display(), user),
                false,
            );
        }

        if let Some(ref command) = self.ctx.settings.transfers.after_folder {
            match execute_command(command, folder_path) {
                Ok(()) => info!("Executed on folder: {}", command),
                Err(e) => warn!("Trouble executing on folder '{}': {}", command, e),
            }
        }
    }

    pub fn on_upload_denied(&mut self, user: &str, virtual_path: &str, reason: &str) {
        let status = TransferStatus::from_remote_reason(reason, INTERNAL_DENIAL_REASONS);

        let Some(id) = self.transfers.find(user, virtual_path) else {
            return;
        };
        let Some(record) = self.transfers.get(id) else {
            return;
        };

        if matches!(record.status(), TransferStatus::Finished | TransferStatus::Paused) {
            // Also sent for finished downloads when the peer unshares files
            return;
        }

        let legacy_retry = matches!(
            status,
            TransferStatus::FileNotShared | TransferStatus::RemoteFileError
        ) && !record.legacy_attempt;

        if legacy_retry {
            debug!(
                "User {} responded with reason '{}' for download request {}. Attempting to request file as latin-1.",
                user, reason, virtual_path
            );
            self.retry_legacy(id);
            return;
        }

        if record.status() == &TransferStatus::Transferring {
            self.abort(id, None, true);
        }

        if let Some(record) = self.transfers.get_mut(id) {
            record.set_status(status);
        }
        self.emit_update(id, true);

        debug!(
            "Download request denied by user {} for file {}. Reason: {}",
            user, virtual_path, reason
        );
    }

    pub fn on_upload_failed(&mut self, user: &str, virtual_path: &str) {
        let Some(id) = self.transfers.find(user, virtual_path) else {
            return;
        };
        let Some(record) = self.transfers.get(id) else {
            return;
        };

        if matches!(
            record.status(),
            TransferStatus::Finished
                | TransferStatus::Paused
                | TransferStatus::DownloadFolderError
                | TransferStatus::LocalFileError
                | TransferStatus::UserLoggedOff
        ) {
            return;
        }

        if !record.legacy_attempt {
            self.retry_legacy(id);
            return;
        }

        self.abort(id, Some(TransferStatus::RemoteFileError), true);
        debug!(
            "Upload attempt by user {} for file {} failed. Reason: {}",
            user,
            virtual_path,
            TransferStatus::RemoteFileError
        );
    }

    /// Ask again once with the path in the legacy text encoding.
    fn retry_legacy(&mut self, id: TransferId) {
        self.abort(id, None, true);
        if let Some(record) = self.transfers.get_mut(id) {
            record.legacy_attempt = true;
        }
        self.queue_file(id, false, true);
    }

    pub fn on_place_in_queue_response(&mut self, user: &str, virtual_path: &str, place: u32) {
        let Some(id) = self.transfers.find(user, virtual_path) else {
            return;
        };

        if let Some(record) = self.transfers.get_mut(id) {
            if record.status() != &TransferStatus::Queued {
                return;
            }
            record.queue_position = place;
        }
        self.emit_update(id, false);
    }

    pub fn on_file_error(&mut self, user: &str, token: Token, error: &str) {
        let Some(id) = self.transfers.find_by_token(user, token) else {
            return;
        };

        self.abort(id, Some(TransferStatus::LocalFileError), true);
        warn!("Download I/O error: {}", error);
    }

    /// The queue request for `virtual_path` could not be delivered.
    pub fn cant_connect_queue_file(&mut self, user: &str, virtual_path: &str, is_offline: bool) {
        let Some(id) = self.transfers.find(user, virtual_path) else {
            return;
        };

        debug!(
            "Download attempt for file {} from user {} timed out",
            virtual_path, user
        );

        let status = if is_offline {
            TransferStatus::UserLoggedOff
        } else {
            TransferStatus::ConnectionTimeout
        };
        self.abort(id, Some(status), true);
        self.ctx.watch_user(user);
    }

    pub fn on_user_status(&mut self, user: &str, status: UserStatus) {
        let user_offline = status == UserStatus::Offline;
        let mut update = false;

        let ids: Vec<TransferId> = self.transfers.ids().into_iter().rev().collect();

        for id in ids {
            let Some(record) = self.transfers.get(id) else {
                continue;
            };
            if record.user() != user {
                continue;
            }

            let waiting = matches!(
                record.status(),
                TransferStatus::Queued
                    | TransferStatus::GettingStatus
                    | TransferStatus::TooManyFiles
                    | TransferStatus::TooManyMegabytes
                    | TransferStatus::PendingShutdown
                    | TransferStatus::UserLoggedOff
                    | TransferStatus::ConnectionTimeout
                    | TransferStatus::RemoteFileError
                    | TransferStatus::Cancelled
                    | TransferStatus::UserLimit(_)
            );
            if !waiting {
                continue;
            }

            if user_offline {
                self.abort(id, Some(TransferStatus::UserLoggedOff), false);
                update = true;
            } else if record.status() == &TransferStatus::UserLoggedOff {
                self.queue_file(id, false, false);
                update = true;
            }
        }

        if update {
            self.emit_batch_update();
        }
    }

    /// Time out negotiations the peer never followed up with a connection.
    pub fn check_timeouts_at(&mut self, now: Instant, threshold: Duration) {
        let expired = self
            .transfers
            .ids_where(|record| record.negotiation_expired(now, threshold));

        for id in &expired {
            if let Some(record) = self.transfers.get(*id) {
                debug!(
                    "Transfer {} with token {:?} for user {} timed out",
                    record.virtual_path(),
                    record.token(),
                    record.user()
                );
                let user = record.user().to_string();
                self.ctx.watch_user(&user);
            }
            self.abort(*id, Some(TransferStatus::ConnectionTimeout), false);
        }

        if !expired.is_empty() {
            self.emit_batch_update();
        }
    }

    /// Ask for queue positions and retry failed downloads.
    pub fn periodic_queue_check(&mut self) {
        let ids: Vec<TransferId> = self.transfers.ids().into_iter().rev().collect();

        for id in ids {
            let retry = match self.transfers.get(id) {
                Some(record) => record.status().is_retryable_failure(),
                None => continue,
            };

            if retry {
                self.abort(id, None, true);
                self.queue_file(id, false, true);
            }

            if let Some(record) = self.transfers.get(id) {
                if record.status() == &TransferStatus::Queued {
                    self.ctx.outbox.send_to_peer(
                        record.user(),
                        PeerMessage::PlaceInQueueRequest {
                            virtual_path: record.virtual_path().to_string(),
                            legacy_client: record.legacy_attempt,
                        },
                    );
                }
            }
        }
    }

    /// Re-queue downloads the remote refused because of its queue limits.
    pub fn periodic_limit_retry(&mut self) {
        let ids: Vec<TransferId> = self
            .transfers
            .ids_where(|record| record.status().is_limited())
            .into_iter()
            .rev()
            .collect();

        for id in &ids {
            if let Some(record) = self.transfers.get(*id) {
                debug!(
                    "Re-queuing file {} from user {} in download queue",
                    record.virtual_path(),
                    record.user()
                );
            }
            self.abort(*id, None, false);
            self.queue_file(*id, false, false);
        }

        if !ids.is_empty() {
            self.emit_batch_update();
        }
    }

    pub fn retry(&mut self, id: TransferId, bypass_filter: bool) {
        match self.transfers.get(id).map(TransferRecord::status) {
            None | Some(TransferStatus::Transferring) | Some(TransferStatus::Finished) => return,
            Some(_) => {}
        }

        self.abort(id, None, false);
        self.queue_file(id, bypass_filter, true);
    }

    pub fn retry_downloads(&mut self, ids: &[TransferId]) {
        for id in ids {
            // Filters are only bypassed for a single, explicitly chosen file
            let bypass_filter = ids.len() == 1
                && self.transfers.get(*id).map(TransferRecord::status)
                    == Some(&TransferStatus::Filtered);
            self.retry(*id, bypass_filter);
        }
        self.emit_batch_update();
    }

    /// Close handles, forget the negotiation and optionally set `status`.
    /// Safe to call in any state.
    pub fn abort(&mut self, id: TransferId, status: Option<TransferStatus>, update_parent: bool) {
        let Some(record) = self.transfers.get_mut(id) else {
            return;
        };

        debug!(
            "Aborting download, user \"{}\", filename \"{}\", token \"{:?}\", status \"{}\"",
            record.user(),
            record.virtual_path(),
            record.token(),
            record.status()
        );

        let had_file = record.has_file();
        record.legacy_attempt = false;
        record.size_changed = false;

        if let Some(socket) = record.abort(status.clone()) {
            self.ctx.outbox.close_connection(socket);
        }

        if had_file {
            info!(
                "Download aborted, user {} file {}",
                record.user(),
                record.virtual_path()
            );
        }

        let transfer = record.snapshot();
        self.ctx.outbox.emit(TransferEvent::Abort {
            kind: TransferKind::Download,
            transfer,
            status,
            update_parent,
        });
    }

    pub fn abort_downloads(&mut self, ids: &[TransferId], status: TransferStatus) {
        for id in ids {
            let skip = match self.transfers.get(*id) {
                Some(record) => {
                    record.status() == &status || record.status() == &TransferStatus::Finished
                }
                None => true,
            };
            if !skip {
                self.abort(*id, Some(status.clone()), false);
            }
        }

        self.ctx.outbox.emit(TransferEvent::BatchAbort {
            kind: TransferKind::Download,
            ids: ids.to_vec(),
            status,
        });
    }

    pub fn clear(&mut self, id: TransferId, update_parent: bool) {
        self.abort(id, None, update_parent);

        if let Some((_, record)) = self.transfers.remove(id) {
            self.ctx.outbox.emit(TransferEvent::Clear {
                kind: TransferKind::Download,
                transfer: record.snapshot(),
                update_parent,
            });
        }
    }

    /// Clear `ids` (everything when `None`) whose status is in `statuses`
    /// (any when `None`). With `clear_deleted` only finished downloads whose
    /// file is gone from disk are cleared.
    pub fn clear_downloads(
        &mut self,
        ids: Option<&[TransferId]>,
        statuses: Option<&[TransferStatus]>,
        clear_deleted: bool,
    ) {
        let ids = match ids {
            Some(ids) => ids.to_vec(),
            None => self.transfers.ids(),
        };

        let mut cleared = Vec::new();

        for id in ids {
            let Some(record) = self.transfers.get(id) else {
                continue;
            };

            if let Some(statuses) = statuses {
                if !statuses.contains(record.status()) {
                    continue;
                }
            }

            if clear_deleted {
                if record.status() != &TransferStatus::Finished {
                    continue;
                }
                let still_on_disk = self
                    .complete_download_path(
                        record.user(),
                        record.virtual_path(),
                        &record.folder_path,
                        record.size(),
                    )
                    .is_some();
                if still_on_disk {
                    continue;
                }
            }

            self.clear(id, false);
            cleared.push(id);
        }

        self.ctx.outbox.emit(TransferEvent::BatchClear {
            kind: TransferKind::Download,
            ids: cleared,
        });
    }

    fn auto_clear(&mut self, id: TransferId) -> bool {
        if self.ctx.settings.transfers.autoclear_downloads {
            self.clear(id, true);
            return true;
        }
        false
    }

    pub fn load_stored(&mut self, stored: Vec<StoredTransfer>) {
        for row in stored {
            if self.transfers.find(&row.user, &row.virtual_path).is_some() {
                continue;
            }
            if let Some(record) = row.into_record(TransferKind::Download) {
                self.transfers.push(record);
            }
        }
    }

    pub fn stored_transfers(&self) -> Vec<StoredTransfer> {
        self.transfers.iter().map(StoredTransfer::from_record).collect()
    }

    /// Close every handle and forget all downloads.
    pub fn shutdown(&mut self) {
        for mut record in self.transfers.drain() {
            if let Some(socket) = record.release_handles() {
                self.ctx.outbox.close_connection(socket);
            }
        }
    }

    fn emit_update(&self, id: TransferId, update_parent: bool) {
        if let Some(record) = self.transfers.get(id) {
            self.ctx.outbox.emit(TransferEvent::Update {
                kind: TransferKind::Download,
                transfer: record.snapshot(),
                update_parent,
            });
        }
    }

    fn emit_batch_update(&self) {
        self.ctx.outbox.emit(TransferEvent::BatchUpdate {
            kind: TransferKind::Download,
        });
    }
}

/// Open (creating if needed) the staging file for appending and return it
/// with the offset to resume from. With `discard` existing data is dropped.
fn open_incomplete_file(path: &Path, discard: bool) -> io::Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    if let Err(e) = file.try_lock_exclusive() {
        warn!("Can't get an exclusive lock on file - I/O error: {}", e);
    }

    if discard {
        // The remote file changed since we queued it
        file.set_len(0)?;
    }

    let offset = file.seek(SeekFrom::End(0))?;
    Ok((file, offset))
}

/// Rename, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }

    fs::copy(from, to)?;
    fs::remove_file(from)
}
