//! Helper utility functions for CLI commands

use anyhow::{Context, Result};
use intentgate_core::{
    config::{database_path, socket_path},
    ipc::{IpcClient, IpcRequest, IpcResponse},
};
use intentgate_storage::{ConfigStore, Database};
use std::{path::Path, sync::Arc};

/// Safely truncate a string to a maximum number of characters (not bytes).
/// This avoids panics when slicing multi-byte UTF-8 characters.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    let char_count = s.chars().count();
    if char_count > max_chars {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{truncated}...")
    } else {
        s.to_string()
    }
}

/// Render milliseconds as `1h 02m 03s`, `2m 05s` or `45s`
pub fn format_duration_ms(ms: u64) -> String {
    let total = ms.div_ceil(1000);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

/// Parse `60000`, `90s`, `5m` or `1h` into milliseconds
pub fn parse_duration_ms(value: &str) -> Result<i64> {
    let value = value.trim();
    let (digits, factor) = match value.char_indices().last() {
        Some((i, 's')) => (&value[..i], 1000),
        Some((i, 'm')) => (&value[..i], 60 * 1000),
        Some((i, 'h')) => (&value[..i], 60 * 60 * 1000),
        _ => (value, 1),
    };
    let amount: i64 = digits
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration '{value}' (try 60000, 90s, 5m or 1h)"))?;
    amount
        .checked_mul(factor)
        .ok_or_else(|| anyhow::anyhow!("Duration '{value}' is too large"))
}

/// Remove the line terminator `read_line` leaves behind, nothing else.
///
/// The challenge comparison is exact, so surrounding spaces typed by the
/// user must survive.
pub fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

pub fn open_store(data_dir: &Path) -> Result<ConfigStore> {
    let database = Database::new(Some(database_path(data_dir)))
        .with_context(|| format!("Failed to open database in {}", data_dir.display()))?;
    Ok(ConfigStore::open(Arc::new(database)))
}

/// Client for a daemon that appears to be running
pub fn daemon_client(data_dir: &Path) -> Option<IpcClient> {
    let sock_path = socket_path(data_dir);
    sock_path.exists().then(|| IpcClient::new(&sock_path))
}

/// Ask a running daemon to pick up settings written by this process
pub async fn notify_daemon(data_dir: &Path) {
    let Some(client) = daemon_client(data_dir) else {
        return;
    };
    match client.send_command(IpcRequest::ReloadSettings).await {
        Ok(IpcResponse::SettingsReloaded) => log::debug!("Daemon reloaded settings"),
        Ok(resp) => log::warn!("Unexpected response to reload: {resp:?}"),
        Err(e) => log::debug!("Daemon not reachable ({e}); it will pick up changes on refresh"),
    }
}
