/// Daemon lifecycle management commands
use anyhow::{Context, Result};
use chrono::Utc;
use intentgate_core::{
    config::{socket_path, DaemonConfig},
    ipc::{IpcClient, IpcRequest, IpcResponse},
    Daemon,
};
use std::{
    env, fs, io,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};
use sysinfo::{Pid, System};
use tabled::{Table, Tabled};

use super::helpers::{format_duration_ms, truncate_str};

#[derive(Tabled)]
struct ExemptionRow {
    #[tabled(rename = "Application")]
    app_id: String,
    #[tabled(rename = "Remaining")]
    remaining: String,
}

fn pid_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join("intentgate.pid")
}

fn read_pid(pid_file_path: &Path) -> Option<usize> {
    fs::read_to_string(pid_file_path).ok()?.trim().parse().ok()
}

fn is_process_alive(pid: usize) -> bool {
    let mut sys = System::new();
    sys.refresh_process(Pid::from(pid))
}

pub fn start_daemon(data_dir: &Path) -> Result<()> {
    let pid_file_path = pid_file_path(data_dir);
    let sock_path = socket_path(data_dir);

    // 1. Check if daemon is already running
    if pid_file_path.exists() {
        if let Some(pid) = read_pid(&pid_file_path) {
            if is_process_alive(pid) {
                log::info!("Daemon is already running (PID: {pid}).");
                return Ok(());
            }
        }
        // If pid file is stale, remove it
        log::warn!("Removing stale PID file.");
        let _ = fs::remove_file(&pid_file_path);
    }

    // 2. Clean up old socket if it exists
    if sock_path.exists() {
        log::warn!("Removing stale socket file.");
        fs::remove_file(&sock_path)?;
    }

    log::info!("Starting intentgate daemon...");
    fs::create_dir_all(data_dir)?;

    // 3. Spawn a new process for the daemon
    let current_exe = env::current_exe()?;
    let current_dir = env::current_dir()?;
    let child = Command::new(current_exe)
        .arg("daemon-internal-start")
        .current_dir(current_dir)
        .spawn()?;

    // 4. In parent process, write PID and exit
    log::info!("Daemon process started with PID: {}", child.id());
    fs::write(&pid_file_path, child.id().to_string())?;

    Ok(())
}

pub async fn run_daemon_process(data_dir: &Path) -> Result<()> {
    // This is the detached daemon process
    // We must set up logging here, as this is a new process.
    setup_daemon_logging(data_dir).context("Failed to set up daemon logging")?;
    log::info!("Daemon process started internally.");

    let result = daemon_main_logic(data_dir).await;
    if let Err(e) = &result {
        log::error!("Daemon main logic exited with a fatal error: {e:#}");
    }

    let pid_file_path = pid_file_path(data_dir);
    if read_pid(&pid_file_path) == Some(std::process::id() as usize) {
        let _ = fs::remove_file(&pid_file_path);
    }
    result
}

/// Run the daemon attached to this terminal, logging to stderr
pub async fn run_daemon_foreground(data_dir: &Path) -> Result<()> {
    if socket_path(data_dir).exists() {
        if let Ok(IpcResponse::Status(_)) = IpcClient::new(&socket_path(data_dir))
            .send_command(IpcRequest::Status)
            .await
        {
            anyhow::bail!("A daemon is already running; stop it with `intentgate stop`");
        }
    }
    daemon_main_logic(data_dir).await
}

async fn daemon_main_logic(data_dir: &Path) -> Result<()> {
    let config = DaemonConfig::load_from_dir(data_dir);
    log::debug!("Daemon config: {config:?}");
    let daemon = Daemon::new(data_dir, config)?;
    daemon.run_with_signals().await
}

pub async fn stop_daemon(data_dir: &Path) -> Result<()> {
    let pid_file_path = pid_file_path(data_dir);
    let sock_path = socket_path(data_dir);

    if !pid_file_path.exists() {
        log::info!("Daemon is not running (no PID file).");
        // A foreground daemon has no PID file but still answers on the socket
        if sock_path.exists() {
            let client = IpcClient::new(&sock_path);
            match client.send_command(IpcRequest::Shutdown).await {
                Ok(IpcResponse::Shutdown) => log::info!("Shutdown signal sent over IPC."),
                _ => fs::remove_file(&sock_path)?,
            }
        }
        return Ok(());
    }

    let pid_str = fs::read_to_string(&pid_file_path)?;
    let pid = pid_str
        .trim()
        .parse::<usize>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    log::info!("Stopping intentgate daemon (PID: {pid})...");
    let client = IpcClient::new(&sock_path);

    match client.send_command(IpcRequest::Shutdown).await {
        Ok(IpcResponse::Shutdown) => {
            log::info!("Daemon shutdown signal sent. Waiting for process to exit...");
            tokio::time::sleep(Duration::from_secs(2)).await;

            let mut sys = System::new();
            if sys.refresh_process(Pid::from(pid)) {
                log::warn!("Daemon did not stop gracefully. Force killing...");
                if let Some(process) = sys.process(Pid::from(pid)) {
                    process.kill();
                }
            } else {
                log::info!("Daemon stopped successfully.");
            }
        }
        Ok(resp) => log::error!("Received unexpected response from daemon: {resp:?}"),
        Err(e) => {
            log::error!("Failed to send shutdown command: {e}. Forcing cleanup.");
            let mut sys = System::new();
            if sys.refresh_process(Pid::from(pid)) {
                if let Some(process) = sys.process(Pid::from(pid)) {
                    process.kill();
                    log::info!("Process killed.");
                }
            }
        }
    }

    // Cleanup
    if pid_file_path.exists() {
        fs::remove_file(&pid_file_path)?;
    }
    if sock_path.exists() {
        fs::remove_file(&sock_path)?;
    }

    Ok(())
}

pub async fn show_status(data_dir: &Path) -> Result<()> {
    let sock_path = socket_path(data_dir);

    if !sock_path.exists() {
        println!("Daemon Status: Not running");
        return Ok(());
    }

    let client = IpcClient::new(&sock_path);
    match client.send_command(IpcRequest::Status).await {
        Ok(IpcResponse::Status(status)) => {
            println!(
                "Daemon Status: {}",
                if status.running { "Running" } else { "Stopped" }
            );
            println!(
                "Interposition: {}",
                if status.service_enabled {
                    "ENABLED"
                } else {
                    "DISABLED"
                }
            );
            println!("Blocked apps: {}", status.blocked_count);

            match status.pending {
                Some(pending) => {
                    let waiting = Utc::now()
                        .signed_duration_since(pending.raised_at)
                        .num_milliseconds();
                    println!(
                        "Pending challenge: {} (raised {} ago, answer with `intentgate unlock`)",
                        pending.app_id,
                        format_duration_ms(u64::try_from(waiting).unwrap_or(0))
                    );
                }
                None => println!("Pending challenge: None"),
            }

            if status.exemptions.is_empty() {
                println!("\nNo running exemptions");
            } else {
                let rows: Vec<ExemptionRow> = status
                    .exemptions
                    .into_iter()
                    .map(|e| ExemptionRow {
                        app_id: truncate_str(&e.app_id, 40),
                        remaining: format_duration_ms(e.remaining_ms),
                    })
                    .collect();
                println!("\n{}", Table::new(rows));
            }

            println!("\nUptime: {}", format_duration_ms(status.uptime_secs * 1000));
        }
        Ok(_) => anyhow::bail!("Unexpected response from daemon"),
        Err(e) => {
            log::error!("Failed to get status: {e}");
            println!("Daemon Status: Not running (or not responding)");
        }
    }
    Ok(())
}

fn setup_daemon_logging(data_dir: &Path) -> Result<()> {
    use std::fs::{create_dir_all, OpenOptions};

    let log_path = data_dir.join("intentgate.log");

    if let Some(parent) = log_path.parent() {
        create_dir_all(parent)?;
    }

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .filter_level(log::LevelFilter::Debug)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = pid_file_path(dir.path());
        assert_eq!(read_pid(&path), None);

        fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid(&path), Some(4242));

        fs::write(&path, "not a pid").unwrap();
        assert_eq!(read_pid(&path), None);
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id() as usize));
    }

    #[tokio::test]
    async fn test_status_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        show_status(dir.path()).await.unwrap();
    }

    #[tokio::test]
    async fn test_daemon_process_reports_logging_failure() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("occupied");
        fs::write(&not_a_dir, "").unwrap();

        let err = run_daemon_process(&not_a_dir).await.unwrap_err();
        assert!(err.to_string().contains("daemon logging"));
    }

    #[tokio::test]
    async fn test_stop_without_daemon_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        stop_daemon(dir.path()).await.unwrap();
        assert!(!pid_file_path(dir.path()).exists());
    }
}
