use super::collaborators::Notifier;
use crate::config::NotificationSettings;
use crate::{Result, TransferEngineError};
use notify_rust::{Notification, Timeout};
use tracing::debug;

/// Notifier backed by the desktop notification service.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DesktopNotifier;

impl Notifier for DesktopNotifier {
    fn notify(&self, title: &str, message: &str, high_priority: bool) -> Result<()> {
        debug!("Showing notification '{}': {}", title, message);

        let mut notification = Notification::new();
        notification
            .summary(title)
            .body(message)
            .timeout(Timeout::Milliseconds(5000));

        #[cfg(all(unix, not(target_os = "macos")))]
        if high_priority {
            notification.urgency(notify_rust::Urgency::Critical);
        }
        #[cfg(not(all(unix, not(target_os = "macos"))))]
        let _ = high_priority;

        notification
            .show()
            .map_err(|e| TransferEngineError::Notification(e.to_string()))?;

        Ok(())
    }
}

/// Notifier that only logs, for headless use.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str, _high_priority: bool) -> Result<()> {
        tracing::info!("{}: {}", title, message);
        Ok(())
    }
}

/// The notifier an engine starts with, chosen from the settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemNotifier {
    Desktop(DesktopNotifier),
    Log(LogNotifier),
}

impl SystemNotifier {
    pub fn from_settings(settings: &NotificationSettings) -> Self {
        if settings.desktop {
            SystemNotifier::Desktop(DesktopNotifier)
        } else {
            SystemNotifier::Log(LogNotifier)
        }
    }
}

impl Notifier for SystemNotifier {
    fn notify(&self, title: &str, message: &str, high_priority: bool) -> Result<()> {
        match self {
            SystemNotifier::Desktop(notifier) => notifier.notify(title, message, high_priority),
            SystemNotifier::Log(notifier) => notifier.notify(title, message, high_priority),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desktop_notifications_by_default() {
        let settings = NotificationSettings::default();
        assert_eq!(
            SystemNotifier::from_settings(&settings),
            SystemNotifier::Desktop(DesktopNotifier)
        );
    }

    #[test]
    fn test_headless_notifier_only_logs() {
        let settings = NotificationSettings {
            desktop: false,
            ..NotificationSettings::default()
        };
        let notifier = SystemNotifier::from_settings(&settings);

        assert_eq!(notifier, SystemNotifier::Log(LogNotifier));
        assert!(notifier.notify("File Downloaded", "track.mp3", false).is_ok());
    }
}
