use crate::{Result, TransferEngineError};
use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub transfers: TransferSettings,
    pub notifications: NotificationSettings,
    /// Where `downloads.json` and `uploads.json` live. Falls back to the
    /// platform data directory.
    pub data_dir: Option<PathBuf>,
}

/// Who may push files to us without us asking for them first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPermission {
    Nobody,
    Everyone,
    Buddies,
    TrustedBuddies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedLimitMode {
    Unlimited,
    Primary,
    Alternative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadFilter {
    pub pattern: String,
    /// Escaped filters are plain globs where `*` is the only wildcard.
    #[serde(default)]
    pub escaped: bool,
}

impl DownloadFilter {
    pub fn new(pattern: impl Into<String>, escaped: bool) -> Self {
        Self {
            pattern: pattern.into(),
            escaped,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub download_dir: PathBuf,
    pub incomplete_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub username_subfolders: bool,
    pub uploads_in_subdirs: bool,

    pub remote_downloads: bool,
    pub upload_allowed: UploadPermission,

    pub enable_filters: bool,
    pub download_filters: Vec<DownloadFilter>,

    pub autoclear_downloads: bool,
    pub autoclear_uploads: bool,

    /// Command run for each finished file, `$` is replaced by the file path.
    pub after_finish: Option<String>,
    /// Command run once a whole folder is finished.
    pub after_folder: Option<String>,

    pub use_upload_slots: bool,
    pub upload_slots: u32,
    /// Total upload bandwidth ceiling in KiB/s, 0 means unlimited.
    pub upload_bandwidth: u64,

    /// Maximum queued files per user, 0 means unlimited.
    pub file_limit: u32,
    /// Maximum queued MiB per user, 0 means unlimited.
    pub queue_limit: u64,
    pub friends_no_limits: bool,
    pub prefer_friends: bool,
    pub fifo_queue: bool,

    pub use_custom_ban: bool,
    pub custom_ban: String,

    pub use_upload_speed_limit: SpeedLimitMode,
    pub upload_limit: u32,
    pub upload_limit_alt: u32,
    /// Apply the upload speed limit per transfer instead of in total.
    pub limit_by_transfer: bool,
    pub use_download_speed_limit: SpeedLimitMode,
    pub download_limit: u32,
    pub download_limit_alt: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Show popups through the desktop notification service instead of
    /// only logging them.
    pub desktop: bool,
    pub popup_file: bool,
    pub popup_folder: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        let download_dir = UserDirs::new()
            .and_then(|dirs| dirs.download_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("downloads"));

        Self {
            incomplete_dir: download_dir.join("incomplete"),
            upload_dir: download_dir.join("received"),
            download_dir,
            username_subfolders: false,
            uploads_in_subdirs: true,
            remote_downloads: true,
            upload_allowed: UploadPermission::Buddies,
            enable_filters: false,
            download_filters: vec![
                DownloadFilter::new("desktop.ini", true),
                DownloadFilter::new("folder.jpg", true),
                DownloadFilter::new("*.url", true),
                DownloadFilter::new("thumbs.db", true),
            ],
            autoclear_downloads: false,
            autoclear_uploads: false,
            after_finish: None,
            after_folder: None,
            use_upload_slots: true,
            upload_slots: 2,
            upload_bandwidth: 50,
            file_limit: 100,
            queue_limit: 10_000,
            friends_no_limits: false,
            prefer_friends: false,
            fifo_queue: false,
            use_custom_ban: false,
            custom_ban: String::new(),
            use_upload_speed_limit: SpeedLimitMode::Unlimited,
            upload_limit: 1000,
            upload_limit_alt: 100,
            limit_by_transfer: false,
            use_download_speed_limit: SpeedLimitMode::Unlimited,
            download_limit: 1000,
            download_limit_alt: 100,
        }
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            desktop: true,
            popup_file: true,
            popup_folder: true,
        }
    }
}

impl TransferSettings {
    /// Effective slot count; a configured value of zero still allows one upload.
    pub fn upload_slot_limit(&self) -> usize {
        self.upload_slots.max(1) as usize
    }

    /// Bandwidth ceiling in bytes per second, `None` when unlimited.
    pub fn upload_bandwidth_limit(&self) -> Option<u64> {
        match self.upload_bandwidth {
            0 => None,
            kib => Some(kib * 1024),
        }
    }

    /// Per-user queue size ceiling in bytes, `None` when unlimited.
    pub fn queue_size_limit(&self) -> Option<u64> {
        match self.queue_limit {
            0 => None,
            mib => Some(mib * 1024 * 1024),
        }
    }

    pub fn upload_speed_limit(&self) -> u32 {
        match self.use_upload_speed_limit {
            SpeedLimitMode::Primary => self.upload_limit,
            SpeedLimitMode::Alternative => self.upload_limit_alt,
            SpeedLimitMode::Unlimited => 0,
        }
    }

    pub fn download_speed_limit(&self) -> u32 {
        match self.use_download_speed_limit {
            SpeedLimitMode::Primary => self.download_limit,
            SpeedLimitMode::Alternative => self.download_limit_alt,
            SpeedLimitMode::Unlimited => 0,
        }
    }
}

impl Settings {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = match config_path {
            Some(path) => PathBuf::from(path),
            None => Self::default_config_path()?,
        };

        if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| {
                TransferEngineError::Config(format!("Failed to read config: {}", e))
            })?;

            let settings: Settings = toml::from_str(&content).map_err(|e| {
                TransferEngineError::Config(format!("Failed to parse config: {}", e))
            })?;

            Ok(settings)
        } else {
            let settings = Self::default();
            settings.save(Some(&path))?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let path = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                TransferEngineError::Config(format!("Failed to create config dir: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            TransferEngineError::Config(format!("Failed to serialize config: {}", e))
        })?;

        fs::write(&path, content)
            .map_err(|e| TransferEngineError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }

        Ok(Self::project_dirs()?.data_dir().to_path_buf())
    }

    fn default_config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("org", "slsk", "transfers").ok_or_else(|| {
            TransferEngineError::Config("Failed to get project directories".to_string())
        })
    }
}
