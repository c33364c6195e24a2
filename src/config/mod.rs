pub mod settings;

pub use settings::{
    DownloadFilter, NotificationSettings, Settings, SpeedLimitMode, TransferSettings,
    UploadPermission,
};
