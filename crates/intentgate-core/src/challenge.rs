//! The friction screen: the user types the configured sentence to open a
//! blocked application.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use intentgate_storage::ConfigStore;
use serde::{Deserialize, Serialize};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::exemption::ExemptionEngine;
use crate::watch_loop::Interposer;

/// Placeholder replaced by the application identifier in command templates
pub const APP_PLACEHOLDER: &str = "{app}";

/// Brings an application back to the foreground after a passed challenge
pub trait AppLauncher: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the launch request could not be issued
    fn launch(&self, app_id: &str) -> Result<()>;
}

/// Runs an argv template with `{app}` replaced by the identifier.
///
/// The child is not awaited by the caller; a helper thread reaps it.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    argv: Vec<String>,
}

impl CommandLauncher {
    /// # Errors
    ///
    /// Returns an error if `argv` is empty
    pub fn new(argv: &[String]) -> Result<Self> {
        if argv.first().map_or(true, |program| program.trim().is_empty()) {
            anyhow::bail!("Command is empty");
        }
        Ok(Self {
            argv: argv.to_vec(),
        })
    }

    fn expand(&self, app_id: &str) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| arg.replace(APP_PLACEHOLDER, app_id))
            .collect()
    }
}

impl AppLauncher for CommandLauncher {
    fn launch(&self, app_id: &str) -> Result<()> {
        let argv = self.expand(app_id);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Command is empty"))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to run {program}"))?;

        std::thread::spawn(move || match child.wait() {
            Ok(status) if !status.success() => log::warn!("Launch command exited with {status}"),
            Ok(_) => {}
            Err(e) => log::warn!("Failed to wait for launch command: {e}"),
        });
        Ok(())
    }
}

/// Build the relaunch helper.
///
/// An explicit `command` wins; macOS falls back to `open -b {app}`. Other
/// platforms have no default and relaunching is skipped.
///
/// # Errors
///
/// Returns an error if the configured command is empty
pub fn create_launcher(command: Option<&[String]>) -> Result<Option<Arc<dyn AppLauncher>>> {
    if let Some(argv) = command {
        return Ok(Some(Arc::new(CommandLauncher::new(argv)?)));
    }

    if cfg!(target_os = "macos") {
        let argv = ["open", "-b", APP_PLACEHOLDER].map(String::from);
        return Ok(Some(Arc::new(CommandLauncher::new(&argv)?)));
    }

    Ok(None)
}

/// A challenge raised by the watch loop and not yet answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChallenge {
    pub app_id: String,
    pub raised_at: DateTime<Utc>,
}

/// Interposer used by the daemon.
///
/// Remembers the most recent interposed target so a client can answer it,
/// and announces each new target once through an optional notifier.
#[derive(Default)]
pub struct PendingChallenges {
    current: Mutex<Option<PendingChallenge>>,
    notifier: Option<Arc<dyn AppLauncher>>,
}

impl PendingChallenges {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `notifier` for every newly raised challenge
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn AppLauncher>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Option<PendingChallenge>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn current(&self) -> Option<PendingChallenge> {
        self.lock().clone()
    }

    /// Forget the pending challenge if it is for `app_id`
    pub fn resolve(&self, app_id: &str) {
        let mut current = self.lock();
        if current.as_ref().is_some_and(|p| p.app_id == app_id) {
            *current = None;
        }
    }
}

impl Interposer for PendingChallenges {
    fn interpose(&self, app_id: &str) {
        {
            let mut current = self.lock();
            if current.as_ref().is_some_and(|p| p.app_id == app_id) {
                return;
            }
            *current = Some(PendingChallenge {
                app_id: app_id.to_string(),
                raised_at: Utc::now(),
            });
        }

        log::info!("Challenge raised for {app_id}");
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.launch(app_id) {
                log::warn!("Failed to announce challenge for {app_id}: {e:#}");
            }
        }
    }
}

/// What the user must type, and what passing buys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengePrompt {
    pub app_id: String,
    pub sentence: String,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeOutcome {
    Granted { app_id: String, duration_ms: i64 },
    Mismatch,
    Cancelled,
}

pub struct ChallengeFlow {
    engine: Arc<ExemptionEngine>,
    sentence: watch::Receiver<String>,
    duration_ms: watch::Receiver<i64>,
    launcher: Option<Arc<dyn AppLauncher>>,
    pending: Arc<PendingChallenges>,
}

impl ChallengeFlow {
    #[must_use]
    pub fn new(
        engine: Arc<ExemptionEngine>,
        store: &ConfigStore,
        pending: Arc<PendingChallenges>,
    ) -> Self {
        Self {
            engine,
            sentence: store.subscribe_challenge_sentence(),
            duration_ms: store.subscribe_exemption_duration(),
            launcher: None,
            pending,
        }
    }

    #[must_use]
    pub fn with_launcher(mut self, launcher: Option<Arc<dyn AppLauncher>>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Prompt for `target`, or for the pending challenge when none is given
    #[must_use]
    pub fn prompt(&self, target: Option<&str>) -> Option<ChallengePrompt> {
        let app_id = match target {
            Some(target) => target.to_string(),
            None => self.pending.current()?.app_id,
        };
        Some(ChallengePrompt {
            app_id,
            sentence: self.sentence.borrow().clone(),
            duration_ms: *self.duration_ms.borrow(),
        })
    }

    /// Check `input` against the sentence.
    ///
    /// The comparison is exact: case, whitespace and punctuation all count.
    /// On success the exemption is granted before the relaunch is requested;
    /// a failed relaunch is logged and leaves the grant in place.
    pub fn submit(&self, app_id: &str, input: &str) -> ChallengeOutcome {
        if input != self.sentence.borrow().as_str() {
            log::info!("Challenge for {app_id} failed: sentence mismatch");
            return ChallengeOutcome::Mismatch;
        }

        let duration_ms = *self.duration_ms.borrow();
        self.engine.grant(app_id, duration_ms);
        self.pending.resolve(app_id);

        if let Some(launcher) = &self.launcher {
            if let Err(e) = launcher.launch(app_id) {
                log::error!("Failed to relaunch {app_id}: {e:#}");
            }
        } else {
            log::debug!("No launcher configured; {app_id} not relaunched");
        }

        ChallengeOutcome::Granted {
            app_id: app_id.to_string(),
            duration_ms,
        }
    }

    /// Dismiss the challenge for `app_id` without granting anything
    pub fn cancel(&self, app_id: &str) -> ChallengeOutcome {
        self.pending.resolve(app_id);
        log::info!("Challenge for {app_id} cancelled");
        ChallengeOutcome::Cancelled
    }
}
