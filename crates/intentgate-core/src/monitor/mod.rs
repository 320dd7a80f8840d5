use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

mod command;
mod events;

pub use command::CommandDetector;
pub use events::spawn_event_command;

/// The application currently in the foreground
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundApp {
    pub app_id: String,
    pub observed_at: DateTime<Utc>,
}

impl ForegroundApp {
    #[must_use]
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            observed_at: Utc::now(),
        }
    }
}

/// Change notification from an event-driven foreground source, such as
/// [`spawn_event_command`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForegroundEvent {
    /// An application came to the foreground
    Focused(ForegroundApp),
    /// Nothing identifiable is in the foreground (lock screen, desktop)
    Cleared,
}

/// Polled foreground detector for platform-specific implementations
#[async_trait]
pub trait ForegroundDetector: Send + Sync {
    /// Get the application currently in the foreground, if any
    async fn current_app(&self) -> Result<Option<ForegroundApp>>;
}

/// Create the foreground detector for this platform
///
/// An explicit `command` (argv) overrides the platform default.
///
/// # Errors
///
/// Returns an error if no command is given and the platform has no default
pub fn create_detector(command: Option<&[String]>) -> Result<Box<dyn ForegroundDetector>> {
    if let Some(argv) = command {
        return Ok(Box::new(CommandDetector::from_argv(argv)?));
    }

    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(CommandDetector::new(
            "osascript",
            &[
                "-e",
                "tell application \"System Events\" to get bundle identifier of first application process whose frontmost is true",
            ],
        )))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(CommandDetector::new(
            "xdotool",
            &["getactivewindow", "getwindowclassname"],
        )))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        anyhow::bail!("No foreground detector for this platform; set detector_command in config.toml")
    }
}
