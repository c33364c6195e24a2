//! Top-level owner of both queues: routes decoded protocol messages, runs
//! the periodic sweeps and keeps the persisted transfer lists up to date.

use super::context::EngineContext;
use crate::network::{InboundMessage, TransferDirection, UndeliveredRequest, UserStatus};
use crate::transfer::persistence::{self, DOWNLOADS_FILE};
use crate::transfer::{DownloadQueue, UploadQueue};
use crate::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// How long a peer may take to open the file connection after agreeing to
/// a transfer.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(45);

const TIMEOUT_SCAN_INTERVAL: Duration = Duration::from_secs(1);
const UPLOAD_QUEUE_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const UPLOAD_RETRY_INTERVAL: Duration = Duration::from_secs(180);
const DOWNLOAD_QUEUE_CHECK_INTERVAL: Duration = Duration::from_secs(180);
const DOWNLOAD_LIMIT_RETRY_INTERVAL: Duration = Duration::from_secs(720);
const SAVE_INTERVAL: Duration = Duration::from_secs(60);

pub struct TransferCoordinator {
    ctx: Arc<EngineContext>,
    downloads: DownloadQueue,
    uploads: UploadQueue,
    username: Option<String>,
    logged_in: bool,
    upload_speed: u64,
}

impl TransferCoordinator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            downloads: DownloadQueue::new(ctx.clone()),
            uploads: UploadQueue::new(ctx.clone()),
            ctx,
            username: None,
            logged_in: false,
            upload_speed: 0,
        }
    }

    /// Our own user name, used to pick our stats out of user stats updates.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn downloads(&self) -> &DownloadQueue {
        &self.downloads
    }

    pub fn downloads_mut(&mut self) -> &mut DownloadQueue {
        &mut self.downloads
    }

    pub fn uploads(&self) -> &UploadQueue {
        &self.uploads
    }

    pub fn uploads_mut(&mut self) -> &mut UploadQueue {
        &mut self.uploads
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    /// Our average upload speed as last reported by the server.
    pub fn upload_speed(&self) -> u64 {
        self.upload_speed
    }

    pub fn on_server_login(&mut self) {
        info!("Logged in, starting transfer sweeps");

        self.logged_in = true;
        self.ctx.peers.set_own_status(UserStatus::Online);
        self.downloads.on_server_login();
        self.uploads.on_server_login();
    }

    pub fn on_server_disconnect(&mut self) {
        info!("Disconnected from server, stopping transfer sweeps");

        self.logged_in = false;
        self.ctx.peers.set_own_status(UserStatus::Offline);
        self.downloads.on_server_disconnect();
        self.uploads.on_server_disconnect();

        self.ctx.peers.clear_session();
        self.ctx.reset_tokens();
    }

    pub fn on_user_stats(&mut self, user: &str, avg_speed: u64) {
        if self.username.as_deref() == Some(user) {
            self.upload_speed = avg_speed;
        }
    }

    /// Time out negotiations that never got a file connection.
    pub fn check_timeouts(&mut self, threshold: Duration) {
        let now = Instant::now();
        self.downloads.check_timeouts_at(now, threshold);
        self.uploads.check_timeouts_at(now, threshold);
    }

    pub fn dispatch(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::ServerLogin { success } => {
                if success {
                    self.on_server_login();
                }
            }
            InboundMessage::ServerDisconnect => self.on_server_disconnect(),
            InboundMessage::TransferRequest {
                user,
                addr,
                direction,
                token,
                virtual_path,
                size,
            } => {
                if let Some(addr) = addr {
                    self.ctx.peers.set_user_address(&user, addr);
                }

                match direction {
                    // The peer wants to send us a file
                    TransferDirection::Upload => {
                        let response = self
                            .downloads
                            .accept_transfer_request(&user, token, &virtual_path, size);
                        self.ctx.outbox.send_to_peer(&user, response);
                    }
                    // The peer wants us to send them a file
                    TransferDirection::Download => {
                        if let Some(response) =
                            self.uploads
                                .on_transfer_request(&user, addr, token, &virtual_path)
                        {
                            self.ctx.outbox.send_to_peer(&user, response);
                        }
                    }
                    TransferDirection::Unknown(code) => {
                        debug!(
                            "Ignoring transfer request with unknown direction {} from user {}",
                            code, user
                        );
                    }
                }
            }
            InboundMessage::TransferResponse {
                user,
                token,
                allowed,
                reason,
                ..
            } => {
                self.uploads
                    .on_transfer_response(&user, token, allowed, reason.as_deref());
            }
            InboundMessage::QueueUpload {
                user,
                addr,
                virtual_path,
            } => {
                self.uploads.on_queue_upload(&user, addr, &virtual_path);
            }
            InboundMessage::PlaceInQueueRequest { user, virtual_path } => {
                self.uploads.on_place_in_queue_request(&user, &virtual_path);
            }
            InboundMessage::PlaceInQueueResponse {
                user,
                virtual_path,
                place,
            } => {
                self.downloads
                    .on_place_in_queue_response(&user, &virtual_path, place);
            }
            InboundMessage::UploadDenied {
                user,
                virtual_path,
                reason,
            } => {
                self.downloads.on_upload_denied(&user, &virtual_path, &reason);
            }
            InboundMessage::UploadFailed { user, virtual_path } => {
                self.downloads.on_upload_failed(&user, &virtual_path);
            }
            InboundMessage::FolderContentsResponse {
                user,
                folder,
                directories,
            } => {
                self.downloads
                    .on_folder_contents(&user, &folder, &directories, true);
            }
            InboundMessage::FileDownloadInit {
                user,
                token,
                socket,
            } => {
                // Legacy clients open a download connection for our uploads
                if !self.downloads.begin_receiving(&user, token, socket) {
                    self.uploads.begin_sending(&user, token, socket);
                }
            }
            InboundMessage::FileUploadInit {
                user,
                token,
                socket,
            } => {
                self.uploads.begin_sending(&user, token, socket);
            }
            InboundMessage::DownloadProgress {
                user,
                token,
                bytes_left,
            } => self.downloads.on_progress(&user, token, bytes_left),
            InboundMessage::UploadProgress {
                user,
                token,
                offset,
                bytes_sent,
            } => self.uploads.on_progress(&user, token, offset, bytes_sent),
            InboundMessage::DownloadData { user, token, data } => {
                self.downloads.write_data(&user, token, &data);
            }
            InboundMessage::UploadDataRequest {
                user,
                token,
                offset,
                length,
            } => self.uploads.read_data(&user, token, offset, length),
            InboundMessage::DownloadConnectionClosed { user, token } => {
                self.downloads.on_connection_closed(&user, token);
            }
            InboundMessage::UploadConnectionClosed {
                user,
                token,
                timed_out,
            } => self.uploads.on_connection_closed(&user, token, timed_out),
            InboundMessage::DownloadFileError { user, token, error } => {
                self.downloads.on_file_error(&user, token, &error);
            }
            InboundMessage::UploadFileError { user, token, error } => {
                self.uploads.on_file_error(&user, token, &error);
            }
            InboundMessage::PeerConnectionError {
                user,
                requests,
                is_offline,
            } => self.on_peer_connection_error(&user, &requests, is_offline),
            InboundMessage::UserStatus {
                user,
                status,
                privileged,
            } => {
                self.ctx.peers.set_user_status(&user, status);
                self.downloads.on_user_status(&user, status);
                self.uploads.on_user_status(&user, status, privileged);
            }
            InboundMessage::UserStats { user, avg_speed } => self.on_user_stats(&user, avg_speed),
            InboundMessage::SharesRescanned => {
                let pending = self.uploads.take_pending_requests();
                if !pending.is_empty() {
                    debug!("Processing {} requests received during rescan", pending.len());
                }
                for message in pending {
                    self.dispatch(message);
                }
            }
        }
    }

    /// Messages that never reached `user`.
    pub fn on_peer_connection_error(
        &mut self,
        user: &str,
        requests: &[UndeliveredRequest],
        is_offline: bool,
    ) {
        for request in requests {
            match request {
                UndeliveredRequest::TransferRequest { token }
                | UndeliveredRequest::FileUploadInit { token } => {
                    self.uploads.cant_connect_upload(user, *token, is_offline);
                }
                UndeliveredRequest::QueueUpload { virtual_path } => {
                    self.downloads
                        .cant_connect_queue_file(user, virtual_path, is_offline);
                }
            }
        }
    }

    /// Restore both lists from the data folder, migrating legacy download
    /// lists on the way.
    pub fn load_transfers(&mut self) -> Result<()> {
        let data_dir = self.ctx.settings.data_dir()?;
        self.load_transfers_from(&data_dir)
    }

    pub fn load_transfers_from(&mut self, data_dir: &Path) -> Result<()> {
        let downloads = persistence::load_transfers(&persistence::download_list_path(data_dir))?;
        self.downloads.load_stored(downloads);

        let uploads = persistence::load_transfers(&persistence::upload_list_path(data_dir))?;
        self.uploads.load_stored(uploads);
        Ok(())
    }

    pub fn save_transfers(&self) -> Result<()> {
        let data_dir = self.ctx.settings.data_dir()?;
        self.save_transfers_to(&data_dir)
    }

    pub fn save_transfers_to(&self, data_dir: &Path) -> Result<()> {
        persistence::save_transfers(
            &data_dir.join(DOWNLOADS_FILE),
            &self.downloads.stored_transfers(),
        )?;
        persistence::save_transfers(
            &persistence::upload_list_path(data_dir),
            &self.uploads.stored_transfers(),
        )
    }

    fn save_or_log(&self) {
        if let Err(e) = self.save_transfers() {
            error!("Failed to save transfers: {}", e);
        }
    }

    /// Save a final snapshot and close every handle.
    pub fn shutdown(&mut self) {
        self.save_or_log();
        self.downloads.shutdown();
        self.uploads.shutdown();
        info!("Transfers stopped");
    }

    /// Process inbound messages and timer ticks until `shutdown` fires or
    /// the inbound channel closes. Sweeps only run while logged in and are
    /// restarted on every login.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        info!("Starting transfer coordinator");

        let mut sweeps = Sweeps::new();
        let mut save = interval(SAVE_INTERVAL);
        save.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = inbound.recv() => {
                    let Some(message) = message else {
                        info!("Inbound message channel closed");
                        break;
                    };

                    let was_logged_in = self.logged_in;
                    self.dispatch(message);
                    if self.logged_in && !was_logged_in {
                        sweeps.restart();
                    }
                }
                _ = sweeps.timeout_scan.tick() => {
                    if self.logged_in {
                        self.check_timeouts(NEGOTIATION_TIMEOUT);
                    }
                }
                _ = sweeps.upload_check.tick() => {
                    if self.logged_in {
                        self.uploads.check_upload_queue();
                    }
                }
                _ = sweeps.upload_retry.tick() => {
                    if self.logged_in {
                        self.uploads.periodic_timeout_retry();
                    }
                }
                _ = sweeps.download_check.tick() => {
                    if self.logged_in {
                        self.downloads.periodic_queue_check();
                    }
                }
                _ = sweeps.download_limit_retry.tick() => {
                    if self.logged_in {
                        self.downloads.periodic_limit_retry();
                    }
                }
                _ = save.tick() => {
                    self.save_or_log();
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }
}

/// Timers of the periodic sweeps. Each one first fires a full period after
/// the last login.
struct Sweeps {
    timeout_scan: Interval,
    upload_check: Interval,
    upload_retry: Interval,
    download_check: Interval,
    download_limit_retry: Interval,
}

impl Sweeps {
    fn new() -> Self {
        let mut sweeps = Self {
            timeout_scan: interval(TIMEOUT_SCAN_INTERVAL),
            upload_check: interval(UPLOAD_QUEUE_CHECK_INTERVAL),
            upload_retry: interval(UPLOAD_RETRY_INTERVAL),
            download_check: interval(DOWNLOAD_QUEUE_CHECK_INTERVAL),
            download_limit_retry: interval(DOWNLOAD_LIMIT_RETRY_INTERVAL),
        };
        for timer in sweeps.timers() {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        sweeps
    }

    fn timers(&mut self) -> [&mut Interval; 5] {
        [
            &mut self.timeout_scan,
            &mut self.upload_check,
            &mut self.upload_retry,
            &mut self.download_check,
            &mut self.download_limit_retry,
        ]
    }

    fn restart(&mut self) {
        for timer in self.timers() {
            timer.reset();
        }
    }
}
