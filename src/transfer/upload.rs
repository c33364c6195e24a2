//! Transfers where we are the sending side: admission, fair scheduling and
//! the data path of each upload.

use super::events::TransferEvent;
use super::list::TransferList;
use super::persistence::StoredTransfer;
use super::record::{TransferId, TransferRecord};
use super::scheduler::{QueueEntry, Scheduler};
use super::state::{Modifier, TransferKind, TransferStatus};
use crate::network::{
    InboundMessage, OutboundMessage, PeerMessage, ServerMessage, SocketHandle, Token,
    TransferDirection, UserStatus,
};
use crate::service::EngineContext;
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Reasons a peer may not give us for refusing an upload; they are ours.
const INTERNAL_RESPONSE_REASONS: &[TransferStatus] = &[
    TransferStatus::Queued,
    TransferStatus::GettingStatus,
    TransferStatus::Transferring,
    TransferStatus::Paused,
    TransferStatus::Filtered,
    TransferStatus::UserLoggedOff,
];

/// Outcome of the admission checks for a remote download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The file may be queued; carries its local path.
    Allowed(PathBuf),
    /// Shares are being rescanned, ask again afterwards.
    Deferred,
    /// The file is already waiting or in progress for this user.
    AlreadyQueued,
    /// Refused, with the reason to send back if there is one.
    Denied(Option<String>),
}

pub struct UploadQueue {
    ctx: Arc<EngineContext>,
    transfers: TransferList,
    scheduler: Scheduler,
    privileged_users: HashSet<String>,
    /// Requests received during a shares rescan.
    pending_requests: Vec<InboundMessage>,
}

impl UploadQueue {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            transfers: TransferList::new(),
            scheduler: Scheduler::new(),
            privileged_users: HashSet::new(),
            pending_requests: Vec::new(),
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

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Requests deferred during a rescan, to be dispatched again.
    pub fn take_pending_requests(&mut self) -> Vec<InboundMessage> {
        std::mem::take(&mut self.pending_requests)
    }

    pub fn set_privileged(&mut self, user: &str, privileged: bool) {
        if privileged {
            self.privileged_users.insert(user.to_string());
        } else {
            self.privileged_users.remove(user);
        }
    }

    /// Network-wide privileges, or a buddy we chose to put first.
    pub fn is_privileged(&self, user: &str) -> bool {
        if user.is_empty() {
            return false;
        }

        if self.privileged_users.contains(user) {
            return true;
        }

        self.is_buddy_prioritized(user)
    }

    fn is_buddy_prioritized(&self, user: &str) -> bool {
        let user_list = &self.ctx.user_list;
        if !user_list.is_buddy(user) {
            return false;
        }

        self.ctx.settings.transfers.prefer_friends || user_list.is_prioritized(user)
    }

    pub fn on_server_login(&mut self) {
        self.update_upload_limits();
    }

    pub fn on_server_disconnect(&mut self) {
        let ids = self
            .transfers
            .ids_where(|record| record.status() != &TransferStatus::Finished);

        for id in &ids {
            self.clear(*id, None, false);
        }

        if !ids.is_empty() {
            self.emit_batch_update();
        }

        self.privileged_users.clear();
        self.scheduler.clear();
    }

    pub fn update_upload_limits(&self) {
        if self.ctx.peers.own_status() == UserStatus::Offline {
            return;
        }

        let transfer_settings = &self.ctx.settings.transfers;
        self.ctx.outbox.send_to_server(ServerMessage::SetUploadLimit {
            limit: transfer_settings.upload_speed_limit(),
            per_transfer: transfer_settings.limit_by_transfer,
        });
    }

    fn queue_limit_reached(&self, user: &str) -> Option<TransferStatus> {
        let transfer_settings = &self.ctx.settings.transfers;
        let file_limit = transfer_settings.file_limit as usize;
        let size_limit = transfer_settings.queue_size_limit();

        if file_limit == 0 && size_limit.is_none() {
            return None;
        }

        let mut num_files = 0;
        let mut queue_size = 0;

        for record in self.transfers.for_user(user) {
            if record.status() != &TransferStatus::Queued {
                continue;
            }

            if file_limit > 0 {
                num_files += 1;
                if num_files >= file_limit {
                    return Some(TransferStatus::TooManyFiles);
                }
            }

            if let Some(size_limit) = size_limit {
                queue_size += record.size();
                if queue_size >= size_limit {
                    return Some(TransferStatus::TooManyMegabytes);
                }
            }
        }
        None
    }

    fn slot_limit_reached(&self) -> bool {
        let slot_limit = self.ctx.settings.transfers.upload_slot_limit();
        let in_progress = self
            .transfers
            .iter()
            .filter(|record| record.status().is_active())
            .count();

        in_progress >= slot_limit
    }

    fn bandwidth_limit_reached(&self) -> bool {
        let Some(bandwidth_limit) = self.ctx.settings.transfers.upload_bandwidth_limit() else {
            return false;
        };

        let bandwidth: u64 = self
            .transfers
            .iter()
            .filter(|record| record.socket().is_some())
            .filter_map(|record| record.progress.speed)
            .sum();

        bandwidth >= bandwidth_limit
    }

    /// Whether another upload may start now.
    pub fn allow_new_uploads(&self) -> bool {
        if self.ctx.shares.is_rescanning() {
            return false;
        }

        if self.ctx.settings.transfers.use_upload_slots {
            !self.slot_limit_reached()
        } else {
            !self.bandwidth_limit_reached()
        }
    }

    pub fn get_total_uploads_allowed(&self) -> usize {
        if self.ctx.settings.transfers.use_upload_slots {
            return self.ctx.settings.transfers.upload_slot_limit();
        }

        let connected = self
            .transfers
            .iter()
            .filter(|record| record.socket().is_some())
            .count();

        if self.allow_new_uploads() {
            connected + 1
        } else {
            connected.max(1)
        }
    }

    /// Number of queued uploads ahead of a new request from `user`.
    /// Privileged users only wait behind other privileged users.
    pub fn get_upload_queue_size(&self, user: Option<&str>) -> usize {
        let queued = self
            .transfers
            .iter()
            .filter(|record| record.status() == &TransferStatus::Queued);

        match user {
            Some(user) if self.is_privileged(user) => queued
                .filter(|record| self.is_privileged(record.user()))
                .count(),
            _ => queued.count(),
        }
    }

    /// Users with an upload waiting or in progress.
    pub fn get_downloading_users(&self) -> BTreeSet<String> {
        self.transfers
            .iter()
            .filter(|record| record.status().is_pending())
            .map(|record| record.user().to_string())
            .collect()
    }

    fn is_upload_queued(&self, user: &str, virtual_path: &str) -> bool {
        self.transfers
            .for_user(user)
            .any(|record| record.virtual_path() == virtual_path && record.status().is_pending())
    }

    /// Run the checks a remote download request must pass, in order: the
    /// network filter, an ongoing rescan, duplicates, per-user queue limits
    /// and finally whether the file is shared and readable.
    pub fn check_queue_upload_allowed(
        &self,
        user: &str,
        addr: Option<IpAddr>,
        virtual_path: &str,
    ) -> Admission {
        let (allowed, reason) = self.ctx.network_filter.check_user(user, addr);
        if !allowed {
            return Admission::Denied(reason);
        }

        if self.ctx.shares.is_rescanning() {
            return Admission::Deferred;
        }

        if self.is_upload_queued(user, virtual_path) {
            return Admission::AlreadyQueued;
        }

        let enable_limits =
            !(self.ctx.settings.transfers.friends_no_limits && self.ctx.user_list.is_buddy(user));

        if enable_limits {
            if let Some(status) = self.queue_limit_reached(user) {
                return Admission::Denied(Some(status.label().into_owned()));
            }
        }

        match self.ctx.shares.virtual_to_real(virtual_path) {
            Some(real_path)
                if self.ctx.shares.is_file_shared(user, virtual_path, &real_path)
                    && file_is_readable(virtual_path, &real_path) =>
            {
                Admission::Allowed(real_path)
            }
            _ => Admission::Denied(Some(TransferStatus::FileNotShared.label().into_owned())),
        }
    }

    /// A peer queued one of our files for download.
    pub fn on_queue_upload(
        &mut self,
        user: &str,
        addr: Option<IpAddr>,
        virtual_path: &str,
    ) -> Option<TransferId> {
        debug!(
            "Received upload request for file {} from user {}",
            virtual_path, user
        );

        let admission = self.check_queue_upload_allowed(user, addr, virtual_path);

        debug!(
            "Upload request for file {} from user: {}, result: {:?}",
            virtual_path, user, admission
        );

        let real_path = match admission {
            Admission::Allowed(real_path) => real_path,
            Admission::Deferred => {
                self.pending_requests.push(InboundMessage::QueueUpload {
                    user: user.to_string(),
                    addr,
                    virtual_path: virtual_path.to_string(),
                });
                return None;
            }
            Admission::AlreadyQueued | Admission::Denied(None) => return None,
            Admission::Denied(Some(reason)) => {
                self.ctx.outbox.send_to_peer(
                    user,
                    PeerMessage::UploadDenied {
                        virtual_path: virtual_path.to_string(),
                        reason,
                    },
                );
                return None;
            }
        };

        let record = TransferRecord::new(
            user,
            virtual_path,
            parent_folder(&real_path),
            TransferStatus::Queued,
            file_size(&real_path),
        );
        let id = self.append_upload(record);
        self.emit_update(id, true);

        self.ctx.outbox.emit(TransferEvent::UploadQueued {
            user: user.to_string(),
            virtual_path: virtual_path.to_string(),
            path: real_path,
        });

        self.check_upload_queue();
        Some(id)
    }

    /// Older clients ask for a file with a transfer request instead of
    /// queueing it. Returns the response to send, if any.
    pub fn on_transfer_request(
        &mut self,
        user: &str,
        addr: Option<IpAddr>,
        token: Token,
        virtual_path: &str,
    ) -> Option<PeerMessage> {
        debug!(
            "Received legacy upload request {} for file {} from user {}",
            token, virtual_path, user
        );

        let real_path = match self.check_queue_upload_allowed(user, addr, virtual_path) {
            Admission::Allowed(real_path) => real_path,
            Admission::Deferred => {
                self.pending_requests.push(InboundMessage::TransferRequest {
                    user: user.to_string(),
                    addr,
                    direction: TransferDirection::Download,
                    token,
                    virtual_path: virtual_path.to_string(),
                    size: 0,
                });
                return None;
            }
            Admission::AlreadyQueued => {
                return Some(PeerMessage::deny(token, TransferStatus::Queued.label()))
            }
            Admission::Denied(reason) => return reason.map(|reason| PeerMessage::deny(token, reason)),
        };

        self.ctx.outbox.emit(TransferEvent::UploadQueued {
            user: user.to_string(),
            virtual_path: virtual_path.to_string(),
            path: real_path.clone(),
        });

        let already_uploading = self
            .transfers
            .for_user(user)
            .any(|record| record.status().is_active());

        let size = file_size(&real_path);
        let mut record = TransferRecord::new(
            user,
            virtual_path,
            parent_folder(&real_path),
            TransferStatus::Queued,
            size,
        );

        if !self.allow_new_uploads() || already_uploading {
            let id = self.append_upload(record);
            self.emit_update(id, true);
            return Some(PeerMessage::deny(token, TransferStatus::Queued.label()));
        }

        record.negotiate(token, Instant::now());
        let id = self.append_upload(record);
        self.emit_update(id, true);

        Some(PeerMessage::allow(token, Some(size)))
    }

    /// Add `record`, replacing an older record of the same file. A file
    /// that was already queued keeps its place, and unfinished progress is
    /// carried over.
    fn append_upload(&mut self, mut record: TransferRecord) -> TransferId {
        if self.is_privileged(record.user()) {
            record.modifier = Some(if self.privileged_users.contains(record.user()) {
                Modifier::Privileged
            } else {
                Modifier::Prioritized
            });
        }

        let mut previous_index = None;

        if let Some(old_id) = self.transfers.find(record.user(), record.virtual_path()) {
            if let Some(old) = self.transfers.get(old_id) {
                if old.status() == &TransferStatus::Queued {
                    record.queue_position = old.queue_position;
                    previous_index = self.transfers.position(old_id);
                }

                if old.status() != &TransferStatus::Finished {
                    record.progress.inherit(&old.progress);
                }
            }

            self.clear(old_id, None, true);
        }

        match previous_index {
            Some(index) => self.transfers.insert(index, record),
            None => self.transfers.push(record),
        }
    }

    /// Offer `virtual_path` to `user`. With `locally_queued` the file only
    /// enters our queue and waits for a free slot.
    pub fn push_file(
        &mut self,
        user: &str,
        virtual_path: &str,
        size: u64,
        folder_path: Option<PathBuf>,
        locally_queued: bool,
    ) -> TransferId {
        let real_path = self.ctx.shares.virtual_to_real(virtual_path);
        let size = real_path
            .as_deref()
            .map(file_size)
            .filter(|size| *size > 0)
            .unwrap_or(size);

        let folder_path = folder_path
            .filter(|path| !path.as_os_str().is_empty())
            .or_else(|| real_path.as_deref().map(parent_folder))
            .unwrap_or_default();

        let record =
            TransferRecord::new(user, virtual_path, folder_path, TransferStatus::Queued, size);
        let id = self.append_upload(record);

        self.push_record(id, locally_queued);
        id
    }

    /// (Re)start negotiating an upload we already track.
    fn push_record(&mut self, id: TransferId, locally_queued: bool) {
        let Some(record) = self.transfers.get_mut(id) else {
            return;
        };

        if let Some(real_path) = self.ctx.shares.virtual_to_real(record.virtual_path()) {
            let size = file_size(&real_path);
            if size > 0 {
                record.set_size(size);
            }
        }
        record.set_status(TransferStatus::Queued);

        let user = record.user().to_string();
        debug!(
            "Initializing upload request for file {} to user {}",
            record.virtual_path(),
            user
        );

        self.ctx.watch_user(&user);

        if self.ctx.peers.is_unreachable(&user) {
            record.set_status(TransferStatus::UserLoggedOff);
            if !self.auto_clear(id) {
                self.emit_update(id, true);
            }
            return;
        }

        if !locally_queued {
            let token = self.ctx.next_token();
            record.negotiate(token, Instant::now());

            debug!(
                "Requesting to upload file {} with token {} to user {}",
                record.virtual_path(),
                token,
                user
            );

            self.ctx.outbox.send_to_peer(
                &user,
                PeerMessage::TransferRequest {
                    direction: TransferDirection::Upload,
                    token,
                    virtual_path: record.virtual_path().to_string(),
                    size: record.size(),
                },
            );
        }

        self.emit_update(id, true);
    }

    /// The peer answered our transfer request.
    pub fn on_transfer_response(
        &mut self,
        user: &str,
        token: Token,
        allowed: bool,
        reason: Option<&str>,
    ) {
        debug!(
            "Received response for upload with token: {}, allowed: {}, reason: {:?}",
            token, allowed, reason
        );

        let Some(id) = self.transfers.find_by_token(user, token) else {
            debug!("Received unknown upload response with token {}", token);
            return;
        };

        if self.transfers.get(id).and_then(TransferRecord::socket).is_some() {
            debug!("Upload with token {} already has an existing file connection", token);
            return;
        }

        let reason = match (reason, allowed) {
            (Some(reason), _) => Some(reason),
            (None, false) => Some("Cancelled"),
            (None, true) => None,
        };

        let Some(reason) = reason else {
            self.ctx
                .outbox
                .send_to_peer(user, PeerMessage::FileUploadInit { token });
            self.check_upload_queue();
            return;
        };

        let status = TransferStatus::from_remote_reason(reason, INTERNAL_RESPONSE_REASONS);
        self.abort(id, None, Some(status.clone()), true);

        match status {
            // The peer already has the whole file
            TransferStatus::Finished => self.finish(id),
            TransferStatus::Denied(ref text) if text == "Complete" => self.finish(id),
            TransferStatus::Cancelled => {
                self.auto_clear(id);
            }
            TransferStatus::Denied(ref text) if text == "Disallowed extension" => {
                self.auto_clear(id);
            }
            _ => {}
        }

        self.check_upload_queue();
    }

    /// Our file connection to the peer is open. Unknown tokens get the
    /// connection closed and `false` back.
    pub fn begin_sending(&mut self, user: &str, token: Token, socket: SocketHandle) -> bool {
        let Some(id) = self.transfers.find_by_token(user, token) else {
            debug!("Unknown file upload init message with token {}", token);
            self.ctx.outbox.close_connection(socket);
            return false;
        };

        let Some(record) = self.transfers.get_mut(id) else {
            return false;
        };

        debug!(
            "Initializing upload with token {} for file {} to user {}",
            token,
            record.virtual_path(),
            user
        );

        if !record.attach_socket(socket) {
            debug!("Upload already has an existing file connection, ignoring init message");
            self.ctx.outbox.close_connection(socket);
            return true;
        }

        let virtual_path = record.virtual_path().to_string();
        let real_path = self
            .ctx
            .shares
            .virtual_to_real(&virtual_path)
            .filter(|real_path| self.ctx.shares.is_file_shared(user, &virtual_path, real_path));

        let Some(real_path) = real_path else {
            self.abort(id, None, Some(TransferStatus::FileNotShared), true);
            self.check_upload_queue();
            return true;
        };

        let file = match File::open(&real_path) {
            Ok(file) => file,
            Err(e) => {
                warn!("Upload I/O error: {}", e);
                self.abort(id, None, Some(TransferStatus::LocalFileError), true);
                self.check_upload_queue();
                return true;
            }
        };

        let Some(record) = self.transfers.get_mut(id) else {
            return true;
        };

        record.attach_file(file);
        record.queue_position = 0;
        record.progress.begin(None, Instant::now());
        let size = record.size();

        self.ctx.outbox.emit(TransferEvent::UploadStarted {
            user: user.to_string(),
            virtual_path: virtual_path.clone(),
            path: real_path,
        });

        info!(
            "Upload started: user {}, IP address {:?}, file {}",
            user,
            self.ctx.peers.user_address(user),
            virtual_path
        );

        self.ctx.outbox.emit(TransferEvent::UploadNotification);

        if size > 0 {
            record.set_status(TransferStatus::Transferring);
            self.ctx
                .outbox
                .send(OutboundMessage::UploadFile { socket, token, size });
            self.emit_update(id, true);
        } else {
            self.finish(id);
        }
        true
    }

    /// Read the next chunk the connection asked for.
    pub fn read_data(&mut self, user: &str, token: Token, offset: u64, length: usize) {
        let Some(id) = self.transfers.find_by_token(user, token) else {
            return;
        };
        let Some(record) = self.transfers.get_mut(id) else {
            return;
        };
        let Some(socket) = record.socket() else {
            return;
        };

        let result = match record.file_mut() {
            Some(file) => read_chunk(file, offset, length),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "upload file is not open")),
        };

        match result {
            Ok(data) => self
                .ctx
                .outbox
                .send(OutboundMessage::UploadData { socket, token, data }),
            Err(e) => self.on_file_error(user, token, &e.to_string()),
        }
    }

    pub fn on_progress(&mut self, user: &str, token: Token, offset: u64, bytes_sent: u64) {
        let Some(id) = self.transfers.find_by_token(user, token) else {
            return;
        };

        if let Some(record) = self.transfers.get_mut(id) {
            if record.progress.last_offset.is_none() {
                record.progress.last_offset = Some(offset);
            }
            record.set_status(TransferStatus::Transferring);
            record.update_progress(offset + bytes_sent, Instant::now());
        }
        self.emit_update(id, true);
    }

    pub fn on_connection_closed(&mut self, user: &str, token: Token, timed_out: bool) {
        let Some(id) = self.transfers.find_by_token(user, token) else {
            return;
        };
        let Some(record) = self.transfers.get(id) else {
            return;
        };

        // The downloading peer may still be reading, we are done either way
        if !timed_out && record.current_offset().is_some() && record.is_complete() {
            if let Some(speed) = record.progress.speed {
                debug!(
                    "Sending upload speed {} to the server",
                    crate::utils::human_speed(speed)
                );
                self.ctx
                    .outbox
                    .send_to_server(ServerMessage::SendUploadSpeed { speed });
            }
            self.finish(id);
            return;
        }

        if record.status() == &TransferStatus::Finished {
            return;
        }

        let status = if self.ctx.peers.is_user_offline(user) {
            TransferStatus::UserLoggedOff
        } else {
            // Ended abruptly, the peer should queue the file again
            self.ctx.outbox.send_to_peer(
                user,
                PeerMessage::UploadFailed {
                    virtual_path: record.virtual_path().to_string(),
                },
            );
            TransferStatus::Cancelled
        };

        if !self.auto_clear(id) {
            self.abort(id, None, Some(status), true);
        }
        self.check_upload_queue();
    }

    fn finish(&mut self, id: TransferId) {
        let Some(record) = self.transfers.get_mut(id) else {
            return;
        };

        if let Some(socket) = record.complete() {
            self.ctx.outbox.close_connection(socket);
        }
        let user = record.user().to_string();
        let virtual_path = record.virtual_path().to_string();

        info!(
            "Upload finished: user {}, IP address {:?}, file {}",
            user,
            self.ctx.peers.user_address(&user),
            virtual_path
        );

        if !self.auto_clear(id) {
            self.emit_update(id, true);
        }

        let path = self.ctx.shares.virtual_to_real(&virtual_path);
        self.ctx.outbox.emit(TransferEvent::UploadFinished {
            user,
            virtual_path,
            path,
        });

        self.check_upload_queue();
    }

    pub fn on_place_in_queue_request(&mut self, user: &str, virtual_path: &str) {
        let mut place: u32 = 0;
        let mut target = None;

        if self.ctx.settings.transfers.fifo_queue {
            let privileged_user = self.is_privileged(user);

            for record in self.transfers.iter() {
                if record.status() != &TransferStatus::Queued {
                    continue;
                }

                if !privileged_user || self.is_privileged(record.user()) {
                    place += 1;
                }

                if record.matches(user, virtual_path) {
                    target = Some(record.id());
                    break;
                }
            }
        } else {
            let num_users = u32::try_from(self.scheduler.num_users()).unwrap_or(u32::MAX);

            for record in self.transfers.for_user(user) {
                if record.status() != &TransferStatus::Queued {
                    continue;
                }

                place = place.saturating_add(num_users);

                if record.virtual_path() == virtual_path {
                    target = Some(record.id());
                    break;
                }
            }
        }

        if place > 0 {
            self.ctx.outbox.send_to_peer(
                user,
                PeerMessage::PlaceInQueueResponse {
                    virtual_path: virtual_path.to_string(),
                    place,
                },
            );
        }

        if let Some(id) = target {
            if let Some(record) = self.transfers.get_mut(id) {
                record.queue_position = place;
            }
            self.emit_update(id, false);
        }
    }

    /// Pick the next upload to start, if a slot is free.
    pub fn select_next_candidate(&mut self) -> Option<TransferId> {
        if self.transfers.is_empty() || !self.allow_new_uploads() {
            return None;
        }

        let fifo = self.ctx.settings.transfers.fifo_queue;
        let entries: Vec<QueueEntry<'_>> = self
            .transfers
            .iter()
            .map(|record| QueueEntry {
                id: record.id(),
                user: record.user(),
                queued: record.status() == &TransferStatus::Queued,
                active: record.status().is_active(),
                privileged: self.privileged_users.contains(record.user())
                    || self.is_buddy_prioritized(record.user()),
            })
            .collect();

        self.scheduler.select(entries, fifo)
    }

    /// Start negotiating the next upload in line.
    pub fn check_upload_queue(&mut self) {
        let Some(id) = self.select_next_candidate() else {
            return;
        };

        if let Some(record) = self.transfers.get(id) {
            debug!(
                "Attempting to upload file {} to user {}",
                record.virtual_path(),
                record.user()
            );
        }
        self.push_record(id, false);
    }

    /// Put timed out uploads back in the queue.
    pub fn periodic_timeout_retry(&mut self) {
        let ids = self
            .transfers
            .ids_where(|record| record.status() == &TransferStatus::ConnectionTimeout);

        for id in ids {
            if let Some(record) = self.transfers.get_mut(id) {
                record.set_status(TransferStatus::Queued);
            }
            self.emit_update(id, true);
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
            self.abort(*id, None, Some(TransferStatus::ConnectionTimeout), false);
        }

        if !expired.is_empty() {
            self.emit_batch_update();
        }
    }

    pub fn on_user_status(&mut self, user: &str, status: UserStatus, privileged: Option<bool>) {
        if let Some(privileged) = privileged {
            self.set_privileged(user, privileged);
        }

        let user_offline = status == UserStatus::Offline;
        let mut update = false;

        let ids: Vec<TransferId> = self
            .transfers
            .ids_where(|record| {
                record.user() == user
                    && matches!(
                        record.status(),
                        TransferStatus::GettingStatus
                            | TransferStatus::UserLoggedOff
                            | TransferStatus::ConnectionTimeout
                    )
            })
            .into_iter()
            .rev()
            .collect();

        for id in ids {
            let was_logged_off =
                self.transfers.get(id).map(TransferRecord::status) == Some(&TransferStatus::UserLoggedOff);

            if user_offline {
                if !self.auto_clear(id) {
                    self.abort(id, None, Some(TransferStatus::UserLoggedOff), true);
                }
                update = true;
            } else if was_logged_off {
                if !self.auto_clear(id) {
                    if let Some(record) = self.transfers.get_mut(id) {
                        record.set_status(TransferStatus::Cancelled);
                    }
                }
                update = true;
            }
        }

        if update {
            self.emit_batch_update();
        }
    }

    /// Neither our transfer request nor our file connection reached the peer.
    pub fn cant_connect_upload(&mut self, user: &str, token: Token, is_offline: bool) {
        let Some(id) = self.transfers.find_by_token(user, token) else {
            return;
        };

        if let Some(record) = self.transfers.get(id) {
            debug!(
                "Upload attempt for file {} with token {} to user {} timed out",
                record.virtual_path(),
                token,
                user
            );

            if record.socket().is_some() {
                debug!("Existing file connection for upload with token {} already exists?", token);
                return;
            }
        }

        let cleared = is_offline && self.auto_clear(id);
        if !cleared {
            let status = if is_offline {
                TransferStatus::UserLoggedOff
            } else {
                TransferStatus::ConnectionTimeout
            };
            self.abort(id, None, Some(status), true);
        }

        self.ctx.watch_user(user);
        self.check_upload_queue();
    }

    pub fn on_file_error(&mut self, user: &str, token: Token, error: &str) {
        let Some(id) = self.transfers.find_by_token(user, token) else {
            return;
        };

        self.abort(id, None, Some(TransferStatus::LocalFileError), true);
        warn!("Upload I/O error: {}", error);
        self.check_upload_queue();
    }

    /// Cancel everything queued for `users`, tell them why and ban them.
    pub fn ban_users(&mut self, users: &[String], ban_message: Option<&str>) {
        let transfer_settings = &self.ctx.settings.transfers;
        let ban_message = ban_message
            .filter(|message| !message.is_empty())
            .map(str::to_string)
            .or_else(|| {
                (transfer_settings.use_custom_ban && !transfer_settings.custom_ban.is_empty())
                    .then(|| transfer_settings.custom_ban.clone())
            });

        let denied_message = match ban_message {
            Some(message) => format!("Banned ({})", message),
            None => "Banned".to_string(),
        };

        let ids = self
            .transfers
            .ids_where(|record| users.iter().any(|user| user == record.user()));

        for id in ids {
            self.clear(id, Some(&denied_message), true);
        }

        for user in users {
            self.ctx.network_filter.ban_user(user);
        }

        self.check_upload_queue();
    }

    pub fn retry(&mut self, id: TransferId) {
        let Some(record) = self.transfers.get(id) else {
            return;
        };

        if record.status().is_active() || record.status() == &TransferStatus::Finished {
            return;
        }

        let busy = self
            .transfers
            .for_user(record.user())
            .any(|other| other.status().is_active());

        if busy {
            // One upload per user at a time, wait in the queue instead
            if record.status() != &TransferStatus::Queued {
                if let Some(record) = self.transfers.get_mut(id) {
                    record.set_status(TransferStatus::Queued);
                }
                self.emit_update(id, true);
            }
            return;
        }

        self.push_record(id, false);
    }

    pub fn retry_uploads(&mut self, ids: &[TransferId]) {
        for id in ids {
            self.retry(*id);
        }
    }

    /// Close handles and forget the negotiation. Peers still waiting in the
    /// queue are sent `denied_message` when one is given.
    pub fn abort(
        &mut self,
        id: TransferId,
        denied_message: Option<&str>,
        status: Option<TransferStatus>,
        update_parent: bool,
    ) {
        let Some(record) = self.transfers.get_mut(id) else {
            return;
        };

        debug!(
            "Aborting upload, user \"{}\", filename \"{}\", token \"{:?}\", status \"{}\"",
            record.user(),
            record.virtual_path(),
            record.token(),
            record.status()
        );

        let had_file = record.has_file();
        let was_queued = record.status() == &TransferStatus::Queued;

        if let Some(socket) = record.abort(status.clone()) {
            self.ctx.outbox.close_connection(socket);
        }

        if had_file {
            info!(
                "Upload aborted, user {} file {}",
                record.user(),
                record.virtual_path()
            );
        } else if let Some(reason) = denied_message.filter(|_| was_queued) {
            self.ctx.outbox.send_to_peer(
                record.user(),
                PeerMessage::UploadDenied {
                    virtual_path: record.virtual_path().to_string(),
                    reason: reason.to_string(),
                },
            );
        }

        let transfer = record.snapshot();
        self.ctx.outbox.emit(TransferEvent::Abort {
            kind: TransferKind::Upload,
            transfer,
            status,
            update_parent,
        });
    }

    pub fn abort_uploads(
        &mut self,
        ids: &[TransferId],
        denied_message: Option<&str>,
        status: TransferStatus,
    ) {
        for id in ids {
            let skip = match self.transfers.get(*id) {
                Some(record) => {
                    record.status() == &status || record.status() == &TransferStatus::Finished
                }
                None => true,
            };
            if !skip {
                self.abort(*id, denied_message, Some(status.clone()), false);
            }
        }

        self.ctx.outbox.emit(TransferEvent::BatchAbort {
            kind: TransferKind::Upload,
            ids: ids.to_vec(),
            status,
        });
    }

    pub fn clear(&mut self, id: TransferId, denied_message: Option<&str>, update_parent: bool) {
        self.abort(id, denied_message, None, update_parent);

        if let Some((_, record)) = self.transfers.remove(id) {
            self.ctx.outbox.emit(TransferEvent::Clear {
                kind: TransferKind::Upload,
                transfer: record.snapshot(),
                update_parent,
            });
        }
    }

    pub fn clear_uploads(&mut self, ids: Option<&[TransferId]>, statuses: Option<&[TransferStatus]>) {
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

            self.clear(id, None, false);
            cleared.push(id);
        }

        self.ctx.outbox.emit(TransferEvent::BatchClear {
            kind: TransferKind::Upload,
            ids: cleared,
        });
    }

    fn auto_clear(&mut self, id: TransferId) -> bool {
        if !self.ctx.settings.transfers.autoclear_uploads {
            return false;
        }

        if let Some(record) = self.transfers.get(id) {
            self.scheduler.touch(record.user());
        }
        self.clear(id, None, true);
        true
    }

    pub fn load_stored(&mut self, stored: Vec<StoredTransfer>) {
        for row in stored {
            if self.transfers.find(&row.user, &row.virtual_path).is_some() {
                continue;
            }
            if let Some(record) = row.into_record(TransferKind::Upload) {
                self.transfers.push(record);
            }
        }
    }

    /// Only finished uploads are kept across restarts.
    pub fn stored_transfers(&self) -> Vec<StoredTransfer> {
        self.transfers
            .iter()
            .filter(|record| record.status() == &TransferStatus::Finished)
            .map(StoredTransfer::from_record)
            .collect()
    }

    pub fn shutdown(&mut self) {
        for mut record in self.transfers.drain() {
            if let Some(socket) = record.release_handles() {
                self.ctx.outbox.close_connection(socket);
            }
        }
    }

    /// Publish a change and let the scheduler know the user was attended
    /// to. Queueing more files does not push a user back, and progress
    /// updates are not counted.
    fn emit_update(&mut self, id: TransferId, update_parent: bool) {
        let Some(record) = self.transfers.get(id) else {
            return;
        };

        self.ctx.outbox.emit(TransferEvent::Update {
            kind: TransferKind::Upload,
            transfer: record.snapshot(),
            update_parent,
        });

        match record.status() {
            TransferStatus::Queued if self.scheduler.contains(record.user()) => {}
            TransferStatus::Transferring => {}
            _ => self.scheduler.touch(record.user()),
        }
    }

    fn emit_batch_update(&self) {
        self.ctx.outbox.emit(TransferEvent::BatchUpdate {
            kind: TransferKind::Upload,
        });
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

fn parent_folder(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

fn file_is_readable(virtual_path: &str, real_path: &Path) -> bool {
    match File::open(real_path) {
        Ok(_) => true,
        Err(e) => {
            debug!(
                "Cannot access file, not sharing: {} with real path {}: {}",
                virtual_path,
                real_path.display(),
                e
            );
            false
        }
    }
}

fn read_chunk(file: &mut File, offset: u64, length: usize) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;

    let mut data = Vec::with_capacity(length);
    file.take(length as u64).read_to_end(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use crate::service::NetworkFilter;

    fn harness_with_slots(slots: u32) -> Harness {
        Harness::with_settings(|settings| {
            settings.transfers.use_upload_slots = true;
            settings.transfers.upload_slots = slots;
        })
    }

    fn status_of(uploads: &UploadQueue, user: &str, virtual_path: &str) -> TransferStatus {
        uploads.find(user, virtual_path).unwrap().status().clone()
    }

    /// Users we sent a transfer request to, in order.
    fn offered_users(harness: &mut Harness) -> Vec<String> {
        harness
            .drain_messages()
            .into_iter()
            .filter_map(|message| match message {
                OutboundMessage::Peer {
                    user,
                    message: PeerMessage::TransferRequest { .. },
                } => Some(user),
                _ => None,
            })
            .collect()
    }

    /// Pretend the peer already had the file so the upload finishes at once.
    fn complete(uploads: &mut UploadQueue, user: &str, virtual_path: &str) {
        let token = uploads.find(user, virtual_path).unwrap().token().unwrap();
        uploads.on_transfer_response(user, token, false, Some("Complete"));
    }

    #[test]
    fn test_queue_limit_rejects_third_file() {
        let mut harness = Harness::with_settings(|settings| {
            settings.transfers.upload_slots = 1;
            settings.transfers.file_limit = 2;
        });
        for path in ["d\\busy.mp3", "b\\1.mp3", "b\\2.mp3", "b\\3.mp3", "c\\1.mp3"] {
            harness.share_file(path, b"data");
        }
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        // dave takes the only slot, everyone else waits
        uploads.on_queue_upload("dave", None, "d\\busy.mp3");
        assert_eq!(status_of(&uploads, "dave", "d\\busy.mp3"), TransferStatus::GettingStatus);

        uploads.on_queue_upload("bob", None, "b\\1.mp3");
        uploads.on_queue_upload("bob", None, "b\\2.mp3");
        harness.drain_messages();

        assert_eq!(uploads.on_queue_upload("bob", None, "b\\3.mp3"), None);
        assert_eq!(
            harness.peer_messages("bob"),
            vec![PeerMessage::UploadDenied {
                virtual_path: "b\\3.mp3".into(),
                reason: "Too many files".into(),
            }]
        );

        assert!(uploads.on_queue_upload("carol", None, "c\\1.mp3").is_some());
        assert_eq!(status_of(&uploads, "carol", "c\\1.mp3"), TransferStatus::Queued);
    }

    #[test]
    fn test_buddies_bypass_limits_when_configured() {
        let harness = Harness::with_settings(|settings| {
            settings.transfers.upload_slots = 1;
            settings.transfers.file_limit = 1;
            settings.transfers.friends_no_limits = true;
        });
        harness.share_file("d\\busy.mp3", b"x");
        harness.share_file("b\\1.mp3", b"x");
        harness.share_file("b\\2.mp3", b"x");
        harness.users.add_buddy("bob", false, false);
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("dave", None, "d\\busy.mp3");
        uploads.on_queue_upload("bob", None, "b\\1.mp3");
        assert!(uploads.on_queue_upload("bob", None, "b\\2.mp3").is_some());
    }

    #[test]
    fn test_admission_order() {
        let mut harness = Harness::new();
        harness.share_file("a\\song.mp3", b"abc");
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        assert_eq!(
            uploads.check_queue_upload_allowed("alice", None, "a\\missing.mp3"),
            Admission::Denied(Some("File not shared.".into()))
        );

        harness.network_filter.ban_user("eve");
        assert_eq!(
            uploads.check_queue_upload_allowed("eve", None, "a\\song.mp3"),
            Admission::Denied(Some("Banned".into()))
        );

        harness.shares.set_rescanning(true);
        assert_eq!(uploads.on_queue_upload("alice", None, "a\\song.mp3"), None);
        assert_eq!(uploads.take_pending_requests().len(), 1);
        harness.shares.set_rescanning(false);

        uploads.on_queue_upload("alice", None, "a\\song.mp3");
        harness.drain_messages();
        assert_eq!(
            uploads.check_queue_upload_allowed("alice", None, "a\\song.mp3"),
            Admission::AlreadyQueued
        );

        // Already queued is not worth a reply
        uploads.on_queue_upload("alice", None, "a\\song.mp3");
        assert!(harness.peer_messages("alice").is_empty());
    }

    #[test]
    fn test_round_robin_serves_each_user_in_turn() {
        let mut harness = harness_with_slots(1);
        for path in ["a\\1.mp3", "b\\1.mp3", "c\\1.mp3"] {
            harness.share_file(path, b"data");
        }
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("alice", None, "a\\1.mp3");
        uploads.on_queue_upload("bob", None, "b\\1.mp3");
        uploads.on_queue_upload("carol", None, "c\\1.mp3");
        let mut served = offered_users(&mut harness);

        complete(&mut uploads, "alice", "a\\1.mp3");
        served.extend(offered_users(&mut harness));
        complete(&mut uploads, "bob", "b\\1.mp3");
        served.extend(offered_users(&mut harness));

        assert_eq!(served, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_privileged_users_jump_the_queue() {
        let mut harness = harness_with_slots(1);
        for path in ["d\\1.mp3", "b\\1.mp3", "c\\1.mp3"] {
            harness.share_file(path, b"data");
        }
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("dave", None, "d\\1.mp3");
        uploads.on_queue_upload("bob", None, "b\\1.mp3");
        uploads.on_queue_upload("carol", None, "c\\1.mp3");
        uploads.on_user_status("carol", UserStatus::Online, Some(true));
        harness.drain_messages();

        complete(&mut uploads, "dave", "d\\1.mp3");
        assert_eq!(offered_users(&mut harness), vec!["carol"]);
        assert_eq!(status_of(&uploads, "bob", "b\\1.mp3"), TransferStatus::Queued);
    }

    #[test]
    fn test_prioritized_buddy_gets_modifier() {
        let harness = harness_with_slots(1);
        harness.share_file("b\\1.mp3", b"data");
        harness.users.add_buddy("bob", true, false);
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("bob", None, "b\\1.mp3");
        assert_eq!(
            uploads.find("bob", "b\\1.mp3").unwrap().modifier,
            Some(Modifier::Prioritized)
        );
    }

    #[test]
    fn test_legacy_transfer_request() {
        let harness = harness_with_slots(1);
        harness.share_file("a\\1.mp3", b"12345");
        harness.share_file("b\\1.mp3", b"12345");
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        assert_eq!(
            uploads.on_transfer_request("alice", None, 10, "a\\1.mp3"),
            Some(PeerMessage::allow(10, Some(5)))
        );
        assert_eq!(status_of(&uploads, "alice", "a\\1.mp3"), TransferStatus::GettingStatus);

        assert_eq!(
            uploads.on_transfer_request("bob", None, 11, "b\\1.mp3"),
            Some(PeerMessage::deny(11, "Queued"))
        );
        assert_eq!(status_of(&uploads, "bob", "b\\1.mp3"), TransferStatus::Queued);

        assert_eq!(
            uploads.on_transfer_request("alice", None, 12, "a\\1.mp3"),
            Some(PeerMessage::deny(12, "Queued"))
        );
    }

    #[test]
    fn test_upload_data_path() {
        let mut harness = harness_with_slots(2);
        harness.share_file("a\\1.mp3", b"hello world");
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("alice", None, "a\\1.mp3");
        let token = uploads.find("alice", "a\\1.mp3").unwrap().token().unwrap();

        uploads.on_transfer_response("alice", token, true, None);
        assert!(harness
            .peer_messages("alice")
            .contains(&PeerMessage::FileUploadInit { token }));

        assert!(uploads.begin_sending("alice", token, SocketHandle(5)));
        assert_eq!(status_of(&uploads, "alice", "a\\1.mp3"), TransferStatus::Transferring);
        assert!(harness.drain_messages().contains(&OutboundMessage::UploadFile {
            socket: SocketHandle(5),
            token,
            size: 11,
        }));

        uploads.read_data("alice", token, 6, 64);
        assert_eq!(
            harness.drain_messages(),
            vec![OutboundMessage::UploadData {
                socket: SocketHandle(5),
                token,
                data: b"world".to_vec(),
            }]
        );

        uploads.on_progress("alice", token, 0, 11);
        uploads.on_connection_closed("alice", token, false);

        let record = uploads.find("alice", "a\\1.mp3").unwrap();
        assert_eq!(record.status(), &TransferStatus::Finished);
        assert_eq!(record.current_offset(), Some(11));
        assert!(!record.has_file());
    }

    #[test]
    fn test_empty_file_finishes_and_closes_connection() {
        let mut harness = harness_with_slots(2);
        harness.share_file("e\\empty.txt", b"");
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("bob", None, "e\\empty.txt");
        let token = uploads.find("bob", "e\\empty.txt").unwrap().token().unwrap();
        uploads.on_transfer_response("bob", token, true, None);
        harness.drain_messages();

        assert!(uploads.begin_sending("bob", token, SocketHandle(77)));

        let record = uploads.find("bob", "e\\empty.txt").unwrap();
        assert_eq!(record.status(), &TransferStatus::Finished);
        assert_eq!(record.socket(), None);
        assert!(!record.has_file());

        let closed: Vec<OutboundMessage> = harness
            .drain_messages()
            .into_iter()
            .filter(|message| matches!(message, OutboundMessage::CloseConnection { .. }))
            .collect();
        assert_eq!(
            closed,
            vec![OutboundMessage::CloseConnection {
                socket: SocketHandle(77)
            }]
        );
    }

    #[test]
    fn test_unshared_file_at_init_is_aborted() {
        let harness = harness_with_slots(2);
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        let id = uploads.push_file("alice", "gone\\1.mp3", 10, None, false);
        let token = uploads.get(id).unwrap().token().unwrap();

        assert!(uploads.begin_sending("alice", token, SocketHandle(1)));
        assert_eq!(uploads.get(id).unwrap().status(), &TransferStatus::FileNotShared);
        assert_eq!(uploads.get(id).unwrap().socket(), None);
    }

    #[test]
    fn test_interrupted_upload_asks_peer_to_requeue() {
        let mut harness = harness_with_slots(2);
        harness.share_file("a\\1.mp3", b"hello world");
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("alice", None, "a\\1.mp3");
        let token = uploads.find("alice", "a\\1.mp3").unwrap().token().unwrap();
        uploads.begin_sending("alice", token, SocketHandle(5));
        uploads.on_progress("alice", token, 0, 4);
        harness.drain_messages();

        uploads.on_connection_closed("alice", token, false);

        assert_eq!(status_of(&uploads, "alice", "a\\1.mp3"), TransferStatus::Cancelled);
        assert!(harness
            .peer_messages("alice")
            .contains(&PeerMessage::UploadFailed {
                virtual_path: "a\\1.mp3".into()
            }));
    }

    #[test]
    fn test_place_in_queue_fifo() {
        let mut harness = Harness::with_settings(|settings| {
            settings.transfers.upload_slots = 1;
            settings.transfers.fifo_queue = true;
        });
        for path in ["d\\1.mp3", "b\\1.mp3", "b\\2.mp3", "c\\1.mp3"] {
            harness.share_file(path, b"data");
        }
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("dave", None, "d\\1.mp3");
        uploads.on_queue_upload("bob", None, "b\\1.mp3");
        uploads.on_queue_upload("bob", None, "b\\2.mp3");
        uploads.on_queue_upload("carol", None, "c\\1.mp3");
        harness.drain_messages();

        uploads.on_place_in_queue_request("carol", "c\\1.mp3");
        assert_eq!(
            harness.peer_messages("carol"),
            vec![PeerMessage::PlaceInQueueResponse {
                virtual_path: "c\\1.mp3".into(),
                place: 3,
            }]
        );
        assert_eq!(uploads.find("carol", "c\\1.mp3").unwrap().queue_position, 3);
    }

    #[test]
    fn test_requeue_keeps_previous_place() {
        let harness = harness_with_slots(1);
        for path in ["d\\1.mp3", "b\\1.mp3", "c\\1.mp3"] {
            harness.share_file(path, b"data");
        }
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("dave", None, "d\\1.mp3");
        uploads.on_queue_upload("bob", None, "b\\1.mp3");
        uploads.on_queue_upload("carol", None, "c\\1.mp3");

        uploads.push_file("bob", "b\\1.mp3", 4, None, true);

        let order: Vec<&str> = uploads.transfers().iter().map(TransferRecord::user).collect();
        assert_eq!(order, vec!["dave", "bob", "carol"]);
        assert_eq!(uploads.transfers().len(), 3);
    }

    #[test]
    fn test_ban_denies_queued_files() {
        let mut harness = Harness::with_settings(|settings| {
            settings.transfers.upload_slots = 1;
            settings.transfers.use_custom_ban = true;
            settings.transfers.custom_ban = "go away".into();
        });
        harness.share_file("d\\1.mp3", b"data");
        harness.share_file("b\\1.mp3", b"data");
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("dave", None, "d\\1.mp3");
        uploads.on_queue_upload("bob", None, "b\\1.mp3");
        harness.drain_messages();

        uploads.ban_users(&["bob".to_string()], None);

        assert!(uploads.find("bob", "b\\1.mp3").is_none());
        assert_eq!(
            harness.peer_messages("bob"),
            vec![PeerMessage::UploadDenied {
                virtual_path: "b\\1.mp3".into(),
                reason: "Banned (go away)".into(),
            }]
        );
        assert!(harness.network_filter.banned.lock().unwrap().contains("bob"));
    }

    #[test]
    fn test_timeouts_and_retry() {
        let harness = harness_with_slots(1);
        harness.share_file("a\\1.mp3", b"data");
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("alice", None, "a\\1.mp3");
        let now = Instant::now();
        uploads.check_timeouts_at(now + Duration::from_secs(45), Duration::from_secs(45));
        assert_eq!(status_of(&uploads, "alice", "a\\1.mp3"), TransferStatus::ConnectionTimeout);

        uploads.periodic_timeout_retry();
        assert_eq!(status_of(&uploads, "alice", "a\\1.mp3"), TransferStatus::Queued);

        uploads.check_upload_queue();
        assert_eq!(status_of(&uploads, "alice", "a\\1.mp3"), TransferStatus::GettingStatus);
    }

    #[test]
    fn test_offline_user_is_logged_off() {
        let harness = harness_with_slots(1);
        harness.share_file("a\\1.mp3", b"data");
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("alice", None, "a\\1.mp3");
        uploads.on_user_status("alice", UserStatus::Offline, None);
        assert_eq!(status_of(&uploads, "alice", "a\\1.mp3"), TransferStatus::UserLoggedOff);

        uploads.on_user_status("alice", UserStatus::Online, None);
        assert_eq!(status_of(&uploads, "alice", "a\\1.mp3"), TransferStatus::Cancelled);
    }

    #[test]
    fn test_disconnect_keeps_only_finished() {
        let harness = harness_with_slots(1);
        harness.share_file("a\\1.mp3", b"data");
        harness.share_file("b\\1.mp3", b"data");
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("alice", None, "a\\1.mp3");
        uploads.on_queue_upload("bob", None, "b\\1.mp3");
        complete(&mut uploads, "alice", "a\\1.mp3");

        uploads.on_server_disconnect();

        assert_eq!(uploads.transfers().len(), 1);
        assert_eq!(status_of(&uploads, "alice", "a\\1.mp3"), TransferStatus::Finished);
        assert_eq!(uploads.stored_transfers().len(), 1);
        assert_eq!(uploads.scheduler().num_users(), 0);
    }

    #[test]
    fn test_queue_statistics() {
        let harness = harness_with_slots(1);
        for path in ["d\\1.mp3", "b\\1.mp3", "c\\1.mp3"] {
            harness.share_file(path, b"data");
        }
        let mut uploads = UploadQueue::new(harness.ctx.clone());

        uploads.on_queue_upload("dave", None, "d\\1.mp3");
        uploads.on_queue_upload("bob", None, "b\\1.mp3");
        uploads.on_queue_upload("carol", None, "c\\1.mp3");
        uploads.set_privileged("carol", true);

        assert_eq!(uploads.get_total_uploads_allowed(), 1);
        assert_eq!(uploads.get_upload_queue_size(None), 2);
        assert_eq!(uploads.get_upload_queue_size(Some("carol")), 1);
        assert_eq!(
            uploads.get_downloading_users().into_iter().collect::<Vec<_>>(),
            vec!["bob", "carol", "dave"]
        );
    }
}
