use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the data directory (tests, multiple profiles)
pub const DATA_DIR_ENV: &str = "INTENTGATE_DATA_DIR";

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the local data directory for intentgate.
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn get_data_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let mut path =
        dirs::data_local_dir().ok_or_else(|| anyhow::anyhow!("Failed to get local data dir"))?;
    path.push("intentgate");
    Ok(path)
}

/// Path of the settings database inside `data_dir`
#[must_use]
pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("intentgate.db")
}

#[must_use]
pub fn socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("intentgate.sock")
}

/// Host configuration read from `config.toml`.
///
/// User settings (blocked apps, sentence, duration) live in the database;
/// this file only describes how the daemon talks to the desktop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// How often the foreground application is sampled
    pub poll_interval_ms: u64,
    /// How often settings edited by other processes are picked up
    pub settings_refresh_ms: u64,
    /// Identifier of this tool; never blocked
    pub own_app_id: String,
    /// Argv printing the foreground app id; platform default when unset
    pub detector_command: Option<Vec<String>>,
    /// Long-running argv printing one app id per focus change; replaces
    /// polling while it runs
    pub event_command: Option<Vec<String>>,
    /// Argv relaunching an app after a passed challenge, `{app}` is replaced
    pub launch_command: Option<Vec<String>>,
    /// Argv run when a new challenge is raised (e.g. a desktop notification)
    pub interpose_command: Option<Vec<String>>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            settings_refresh_ms: 2000,
            own_app_id: "intentgate".to_string(),
            detector_command: None,
            event_command: None,
            launch_command: None,
            interpose_command: None,
        }
    }
}

impl DaemonConfig {
    /// Parse a `config.toml` document
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid TOML for this structure
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Invalid config.toml")?;
        Ok(config)
    }

    /// Load the config file at `path`.
    ///
    /// A missing file yields defaults. An unreadable or invalid file yields
    /// defaults and a warning, so a typo never keeps the daemon down.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                log::warn!("Failed to read {}: {e}; using defaults", path.display());
                return Self::default();
            }
        };

        match Self::parse(&content) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("{e:#} ({}); using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Load `config.toml` from `data_dir`
    #[must_use]
    pub fn load_from_dir(data_dir: &Path) -> Self {
        Self::load(&data_dir.join(CONFIG_FILE_NAME))
    }

    /// Polling period, never below 50 ms
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(50))
    }

    #[must_use]
    pub fn settings_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.settings_refresh_ms.max(100))
    }
}
