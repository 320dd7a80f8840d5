use intentgate_storage::{ConfigStore, ExemptionSnapshot};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sending half of the background persistence queue.
///
/// Submitting never blocks; the writer task does the database work.
#[derive(Debug, Clone)]
pub struct ExemptionWriter {
    tx: mpsc::UnboundedSender<ExemptionSnapshot>,
}

impl ExemptionWriter {
    /// Create a writer and the receiver to hand to [`run_writer`].
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExemptionSnapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Create a writer whose task runs on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    #[must_use]
    pub fn spawn(store: Arc<ConfigStore>) -> (Self, tokio::task::JoinHandle<()>) {
        let (writer, rx) = Self::channel();
        let handle = tokio::spawn(run_writer(store, rx));
        (writer, handle)
    }

    pub(crate) fn submit(&self, snapshot: ExemptionSnapshot) {
        if self.tx.send(snapshot).is_err() {
            log::error!("Exemption writer has stopped; grant kept in memory only");
        }
    }
}

/// Drain snapshots into the store until every [`ExemptionWriter`] is dropped.
///
/// Snapshots queued while a write is in flight are coalesced, only the newest
/// is written. Failures are logged and not retried; the next grant writes the
/// full table again.
pub async fn run_writer(
    store: Arc<ConfigStore>,
    mut rx: mpsc::UnboundedReceiver<ExemptionSnapshot>,
) {
    while let Some(mut snapshot) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            snapshot = newer;
        }

        let entries = snapshot.entries.len();
        let store = store.clone();
        match tokio::task::spawn_blocking(move || store.save_exemptions(&snapshot)).await {
            Ok(Ok(())) => log::debug!("Persisted exemption table ({entries} entries)"),
            Ok(Err(e)) => log::error!("Failed to persist exemption table: {e}"),
            Err(e) => log::error!("Exemption persistence task failed: {e}"),
        }
    }
    log::debug!("Exemption writer stopped");
}
