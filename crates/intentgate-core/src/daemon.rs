use crate::{
    challenge::{create_launcher, AppLauncher, ChallengeFlow, CommandLauncher, PendingChallenges},
    clock::{MonotonicClock, SystemClock},
    config::{database_path, socket_path, DaemonConfig},
    exemption::{ExemptionEngine, ExemptionWriter},
    ipc::{listen, DaemonIpcHandler},
    monitor::{create_detector, spawn_event_command, ForegroundApp, ForegroundDetector},
    watch_loop::WatchLoop,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use intentgate_storage::{ConfigStore, Database};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};

/// How long shutdown waits for queued exemption writes
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Composition root: owns the store, the engine and every task feeding it.
pub struct Daemon {
    data_dir: PathBuf,
    config: DaemonConfig,
    store: Arc<ConfigStore>,
    engine: Arc<ExemptionEngine>,
    writer_handle: JoinHandle<()>,
    pending: Arc<PendingChallenges>,
    detector: Box<dyn ForegroundDetector>,
    launcher: Option<Arc<dyn AppLauncher>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Daemon {
    /// Open the database in `data_dir` and assemble the production daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or a configured
    /// command is invalid
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(data_dir: &Path, config: DaemonConfig) -> Result<Self> {
        let database = Database::new(Some(database_path(data_dir)))
            .with_context(|| format!("Failed to open database in {}", data_dir.display()))?;
        let detector = create_detector(config.detector_command.as_deref())?;
        let launcher = create_launcher(config.launch_command.as_deref())?;

        Self::from_parts(
            data_dir,
            config,
            Arc::new(database),
            Arc::new(SystemClock::new()),
        )
        .map(|daemon| daemon.with_detector(detector).with_launcher(launcher))
    }

    /// Assemble a daemon over an open database and an explicit clock.
    ///
    /// The exemption table is restored before this returns, so the watch
    /// loop never decides on an unrestored table. The default detector
    /// reports nothing in the foreground; replace it with
    /// [`with_detector`](Self::with_detector).
    ///
    /// # Errors
    ///
    /// Returns an error if the configured interpose command is invalid
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn from_parts(
        data_dir: &Path,
        config: DaemonConfig,
        database: Arc<Database>,
        clock: Arc<dyn MonotonicClock>,
    ) -> Result<Self> {
        let store = Arc::new(ConfigStore::open(database));
        let (writer, writer_handle) = ExemptionWriter::spawn(store.clone());

        let engine = Arc::new(ExemptionEngine::new(clock).with_writer(writer));
        let restored = engine.restore(store.load_exemptions());
        log::debug!("Restored {restored} exemptions");

        let mut pending = PendingChallenges::new();
        if let Some(argv) = &config.interpose_command {
            pending = pending.with_notifier(Arc::new(CommandLauncher::new(argv)?));
        }

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            config,
            store,
            engine,
            writer_handle,
            pending: Arc::new(pending),
            detector: Box::new(NoForeground),
            launcher: None,
            shutdown: Arc::new(shutdown),
        })
    }

    #[must_use]
    pub fn with_detector(mut self, detector: Box<dyn ForegroundDetector>) -> Self {
        self.detector = detector;
        self
    }

    #[must_use]
    pub fn with_launcher(mut self, launcher: Option<Arc<dyn AppLauncher>>) -> Self {
        self.launcher = launcher;
        self
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<ExemptionEngine> {
        &self.engine
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Sending `true` stops [`run`](Self::run)
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<watch::Sender<bool>> {
        self.shutdown.clone()
    }

    /// Run until Ctrl-C, SIGTERM or an IPC shutdown request
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon fails to run
    pub async fn run_with_signals(self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.send_replace(true);
        });
        self.run().await
    }

    /// Run the IPC listener, the settings refresher and the watch loop until
    /// shutdown is requested, then drain pending exemption writes.
    ///
    /// With an `event_command` configured the watch loop follows its events
    /// and falls back to polling the detector once the stream ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be created
    pub async fn run(self) -> Result<()> {
        let Self {
            data_dir,
            config,
            store,
            engine,
            writer_handle,
            pending,
            detector,
            launcher,
            shutdown,
        } = self;

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;

        let challenge = Arc::new(
            ChallengeFlow::new(engine.clone(), &store, pending.clone()).with_launcher(launcher),
        );
        let handler = Arc::new(DaemonIpcHandler::new(
            engine.clone(),
            store.clone(),
            challenge,
            pending.clone(),
            shutdown.clone(),
        ));

        let sock_path = socket_path(&data_dir);
        let ipc_task = tokio::spawn({
            let shutdown = shutdown.subscribe();
            async move {
                if let Err(e) = listen(handler, &sock_path, shutdown).await {
                    log::error!("IPC listener failed: {e}");
                }
            }
        });

        let refresh_task = tokio::spawn(refresh_settings(
            store.clone(),
            config.settings_refresh_interval(),
            shutdown.subscribe(),
        ));

        let watch_loop = WatchLoop::new(engine.clone(), &store, config.own_app_id.clone(), pending);
        log::info!("Daemon started with IPC and settings refresh");

        if let Some(argv) = &config.event_command {
            match spawn_event_command(argv) {
                Ok(events) => {
                    watch_loop.run_events(events, shutdown.subscribe()).await;
                    if !*shutdown.borrow() {
                        log::warn!("Foreground event source ended; polling instead");
                    }
                }
                Err(e) => log::warn!("{e:#}; polling instead"),
            }
        }
        if !*shutdown.borrow() {
            watch_loop
                .run_polling(detector.as_ref(), config.poll_interval(), shutdown.subscribe())
                .await;
        }

        shutdown.send_replace(true);
        for (name, task) in [("IPC listener", ipc_task), ("settings refresh", refresh_task)] {
            if let Err(e) = task.await {
                log::error!("{name} task failed: {e}");
            }
        }

        // Dropping the last engine handle closes the writer queue
        let live = engine.len();
        drop(watch_loop);
        drop(engine);
        match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_handle).await {
            Ok(Ok(())) => log::debug!("Exemption writer drained ({live} entries live)"),
            Ok(Err(e)) => log::error!("Exemption writer failed: {e}"),
            Err(_) => log::warn!("Timed out waiting for exemption writes to finish"),
        }

        log::info!("Daemon shut down gracefully.");
        Ok(())
    }
}

/// Detector used until a real one is installed
struct NoForeground;

#[async_trait]
impl ForegroundDetector for NoForeground {
    async fn current_app(&self) -> Result<Option<ForegroundApp>> {
        Ok(None)
    }
}

/// Periodically re-read settings so edits made by the CLI are picked up even
/// without a reload request.
async fn refresh_settings(
    store: Arc<ConfigStore>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = store.refresh() {
                    log::warn!("Settings refresh failed: {e}");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Resolve on Ctrl-C or SIGTERM. Never resolves if no handler can be installed.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };
    let sigterm = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => log::info!("Received Ctrl-C, shutting down..."),
        () = sigterm => log::info!("Received SIGTERM, shutting down..."),
    }
}
