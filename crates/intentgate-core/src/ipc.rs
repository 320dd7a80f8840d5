use anyhow::{Context, Result};
use intentgate_storage::ConfigStore;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
    sync::watch,
};

use crate::challenge::{
    ChallengeFlow, ChallengeOutcome, ChallengePrompt, PendingChallenge, PendingChallenges,
};
use crate::exemption::ExemptionEngine;

/// Requests are tiny; anything larger is not ours
const MAX_MESSAGE_BYTES: u64 = 64 * 1024;

/// IPC request from CLI to daemon
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum IpcRequest {
    Status,
    /// Prompt for `target`, or for the pending challenge
    ChallengePrompt {
        target: Option<String>,
    },
    SubmitChallenge {
        target: String,
        input: String,
    },
    CancelChallenge {
        target: String,
    },
    /// Re-read settings written by another process
    ReloadSettings,
    Shutdown,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExemptionStatus {
    pub app_id: String,
    pub remaining_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub running: bool,
    pub service_enabled: bool,
    pub blocked_count: usize,
    pub pending: Option<PendingChallenge>,
    pub exemptions: Vec<ExemptionStatus>,
    pub uptime_secs: u64,
}

/// IPC response from daemon to CLI
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum IpcResponse {
    Status(DaemonStatus),
    Prompt(Option<ChallengePrompt>),
    ChallengeResult(ChallengeOutcome),
    SettingsReloaded,
    Shutdown,
    Error(String),
}

#[derive(Debug)]
pub struct IpcClient {
    sock_path: PathBuf,
}

impl IpcClient {
    #[must_use]
    pub fn new(sock_path: &Path) -> Self {
        Self {
            sock_path: sock_path.to_path_buf(),
        }
    }

    /// Send one request and wait for its response
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or replies with garbage
    pub async fn send_command(&self, request: IpcRequest) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.sock_path)
            .await
            .with_context(|| format!("Failed to connect to {}", self.sock_path.display()))?;

        let encoded = bincode::serialize(&request)?;
        stream.write_all(&encoded).await?;
        stream.shutdown().await?;

        let mut buffer = Vec::new();
        (&mut stream)
            .take(MAX_MESSAGE_BYTES)
            .read_to_end(&mut buffer)
            .await?;
        let response: IpcResponse = bincode::deserialize(&buffer)?;

        Ok(response)
    }
}

pub struct DaemonIpcHandler {
    engine: Arc<ExemptionEngine>,
    store: Arc<ConfigStore>,
    challenge: Arc<ChallengeFlow>,
    pending: Arc<PendingChallenges>,
    started_at: Instant,
    shutdown: Arc<watch::Sender<bool>>,
}

impl DaemonIpcHandler {
    #[must_use]
    pub fn new(
        engine: Arc<ExemptionEngine>,
        store: Arc<ConfigStore>,
        challenge: Arc<ChallengeFlow>,
        pending: Arc<PendingChallenges>,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            engine,
            store,
            challenge,
            pending,
            started_at: Instant::now(),
            shutdown,
        }
    }

    #[must_use]
    pub fn status(&self) -> DaemonStatus {
        let settings = self.store.settings();
        DaemonStatus {
            running: true,
            service_enabled: settings.service_enabled,
            blocked_count: settings.blocked_apps.len(),
            pending: self.pending.current(),
            exemptions: self
                .engine
                .active()
                .into_iter()
                .map(|e| ExemptionStatus {
                    app_id: e.app_id,
                    remaining_ms: u64::try_from(e.remaining.as_millis()).unwrap_or(u64::MAX),
                })
                .collect(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Status => IpcResponse::Status(self.status()),
            IpcRequest::ChallengePrompt { target } => {
                IpcResponse::Prompt(self.challenge.prompt(target.as_deref()))
            }
            IpcRequest::SubmitChallenge { target, input } => {
                IpcResponse::ChallengeResult(self.challenge.submit(&target, &input))
            }
            IpcRequest::CancelChallenge { target } => {
                IpcResponse::ChallengeResult(self.challenge.cancel(&target))
            }
            IpcRequest::ReloadSettings => match self.store.refresh() {
                Ok(()) => IpcResponse::SettingsReloaded,
                Err(e) => {
                    log::error!("Settings reload failed: {e}");
                    IpcResponse::Error(format!("Settings reload failed: {e}"))
                }
            },
            IpcRequest::Shutdown => {
                log::info!("Shutdown requested over IPC");
                self.shutdown.send_replace(true);
                IpcResponse::Shutdown
            }
        }
    }

    async fn serve(&self, stream: &mut UnixStream) -> Result<()> {
        let mut buf = Vec::new();
        (&mut *stream)
            .take(MAX_MESSAGE_BYTES)
            .read_to_end(&mut buf)
            .await?;
        if buf.is_empty() {
            // Connection closed (liveness probe)
            return Ok(());
        }

        let response = match bincode::deserialize::<IpcRequest>(&buf) {
            Ok(request) => self.handle(request),
            Err(e) => {
                log::error!("IPC deserialize error: {e}");
                IpcResponse::Error(format!("Malformed request: {e}"))
            }
        };

        let encoded = bincode::serialize(&response)?;
        stream.write_all(&encoded).await?;
        Ok(())
    }
}

/// Accept connections on `sock_path` until `shutdown` turns true.
///
/// A stale socket file left by a crashed daemon is replaced. The socket file
/// is removed on exit.
///
/// # Errors
///
/// Returns an error if the socket cannot be bound
pub async fn listen(
    handler: Arc<DaemonIpcHandler>,
    sock_path: &Path,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    if sock_path.exists() {
        fs::remove_file(sock_path)?;
    }
    let listener = UnixListener::bind(sock_path)?;
    log::info!("IPC listening on {}", sock_path.display());

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((mut stream, _)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.serve(&mut stream).await {
                            log::error!("IPC handle error: {e}");
                        }
                    });
                }
                Err(e) => {
                    log::error!("IPC accept error: {e}");
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    if let Err(e) = fs::remove_file(sock_path) {
        log::warn!("Failed to remove {}: {e}", sock_path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::watch_loop::Interposer;
    use intentgate_storage::{Database, ExemptionSnapshot, DEFAULT_CHALLENGE_SENTENCE};

    const TARGET: &str = "com.example.target";

    struct Fixture {
        store: Arc<ConfigStore>,
        engine: Arc<ExemptionEngine>,
        pending: Arc<PendingChallenges>,
        handler: Arc<DaemonIpcHandler>,
        shutdown: watch::Receiver<bool>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(ConfigStore::open(Arc::new(
            Database::open_in_memory().unwrap(),
        )));
        let engine = Arc::new(ExemptionEngine::new(Arc::new(ManualClock::new(0))));
        engine.restore(ExemptionSnapshot::default());
        let pending = Arc::new(PendingChallenges::new());
        let challenge = Arc::new(ChallengeFlow::new(engine.clone(), &store, pending.clone()));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let handler = Arc::new(DaemonIpcHandler::new(
            engine.clone(),
            store.clone(),
            challenge,
            pending.clone(),
            Arc::new(shutdown_tx),
        ));
        Fixture {
            store,
            engine,
            pending,
            handler,
            shutdown,
        }
    }

    #[test]
    fn test_status_reports_exemptions_and_pending() {
        let f = fixture();
        f.store.add_blocked_app(TARGET).unwrap();
        f.store.add_blocked_app("org.chat").unwrap();
        f.engine.grant("org.chat", 30_000);
        f.pending.interpose(TARGET);

        let IpcResponse::Status(status) = f.handler.handle(IpcRequest::Status) else {
            panic!("expected status");
        };
        assert!(status.running);
        assert!(status.service_enabled);
        assert_eq!(status.blocked_count, 2);
        assert_eq!(status.pending.unwrap().app_id, TARGET);
        assert_eq!(
            status.exemptions,
            vec![ExemptionStatus {
                app_id: "org.chat".to_string(),
                remaining_ms: 30_000,
            }]
        );
    }

    #[test]
    fn test_challenge_round_trip() {
        let f = fixture();
        f.pending.interpose(TARGET);

        let IpcResponse::Prompt(Some(prompt)) =
            f.handler.handle(IpcRequest::ChallengePrompt { target: None })
        else {
            panic!("expected prompt");
        };
        assert_eq!(prompt.app_id, TARGET);

        let response = f.handler.handle(IpcRequest::SubmitChallenge {
            target: TARGET.to_string(),
            input: "wrong".to_string(),
        });
        assert_eq!(
            response,
            IpcResponse::ChallengeResult(ChallengeOutcome::Mismatch)
        );

        let response = f.handler.handle(IpcRequest::SubmitChallenge {
            target: TARGET.to_string(),
            input: prompt.sentence,
        });
        assert!(matches!(
            response,
            IpcResponse::ChallengeResult(ChallengeOutcome::Granted { .. })
        ));
        assert!(f.engine.is_allowed(TARGET));
    }

    #[test]
    fn test_reload_picks_up_external_edits() {
        let f = fixture();
        f.store
            .database()
            .set_value(
                intentgate_storage::keys::CHALLENGE_SENTENCE,
                "\"Edited elsewhere\"",
            )
            .unwrap();

        assert_eq!(
            f.handler.handle(IpcRequest::ReloadSettings),
            IpcResponse::SettingsReloaded
        );
        let IpcResponse::Prompt(Some(prompt)) = f.handler.handle(IpcRequest::ChallengePrompt {
            target: Some(TARGET.to_string()),
        }) else {
            panic!("expected prompt");
        };
        assert_eq!(prompt.sentence, "Edited elsewhere");
        assert_ne!(prompt.sentence, DEFAULT_CHALLENGE_SENTENCE);
    }

    #[test]
    fn test_shutdown_request_signals() {
        let f = fixture();
        assert_eq!(f.handler.handle(IpcRequest::Shutdown), IpcResponse::Shutdown);
        assert!(*f.shutdown.borrow());
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("intentgate.sock");

        let listener = tokio::spawn({
            let handler = f.handler.clone();
            let sock_path = sock_path.clone();
            let shutdown = f.shutdown.clone();
            async move { listen(handler, &sock_path, shutdown).await }
        });

        let client = IpcClient::new(&sock_path);
        let mut status = None;
        for _ in 0..50 {
            if let Ok(response) = client.send_command(IpcRequest::Status).await {
                status = Some(response);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(matches!(status, Some(IpcResponse::Status(_))));

        let response = client.send_command(IpcRequest::Shutdown).await.unwrap();
        assert_eq!(response, IpcResponse::Shutdown);

        listener.await.unwrap().unwrap();
        assert!(!sock_path.exists());
    }
}
