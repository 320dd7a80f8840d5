use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{ForegroundApp, ForegroundEvent};

const EVENT_BUFFER: usize = 32;

/// Start a long-running command that prints the foreground app id on every
/// focus change, one per line. A blank line means nothing is focused.
///
/// The receiver closes when the command exits. Dropping the receiver kills
/// the command.
///
/// # Errors
///
/// Returns an error if `argv` is empty or the command cannot be spawned
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
pub fn spawn_event_command(argv: &[String]) -> Result<mpsc::Receiver<ForegroundEvent>> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("Event command is empty"))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to run '{program}'"))?;
    let stdout = child
        .stdout
        .take()
        .with_context(|| format!("'{program}' has no stdout"))?;

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let program = program.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if tx.send(parse_event(&line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Reading from '{program}' failed: {e}");
                        break;
                    }
                },
                () = tx.closed() => break,
            }
        }
        log::debug!("Foreground event stream from '{program}' ended");
        drop(child);
    });

    Ok(rx)
}

fn parse_event(line: &str) -> ForegroundEvent {
    match line.trim() {
        "" => ForegroundEvent::Cleared,
        app_id => ForegroundEvent::Focused(ForegroundApp::new(app_id)),
    }
}
