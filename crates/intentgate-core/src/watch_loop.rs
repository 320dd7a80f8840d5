//! Turns foreground observations into interposition decisions.

use intentgate_storage::ConfigStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::exemption::ExemptionEngine;
use crate::monitor::{ForegroundDetector, ForegroundEvent};

/// Outcome of one foreground check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Service switched off by the user
    Disabled,
    /// Nothing in the foreground
    NoForeground,
    /// The foreground app is this tool itself
    OwnApp,
    NotBlocked,
    /// Blocked, but inside an allow window
    Exempt,
    /// Blocked and not exempt: the challenge must be shown
    Interpose,
}

/// Receives the target whenever the watch loop decides to interpose.
///
/// Called on every interposing tick; implementations decide how to present
/// (and de-duplicate) the challenge.
pub trait Interposer: Send + Sync {
    fn interpose(&self, app_id: &str);
}

pub struct WatchLoop {
    engine: Arc<ExemptionEngine>,
    blocked_apps: watch::Receiver<BTreeSet<String>>,
    service_enabled: watch::Receiver<bool>,
    own_app_id: String,
    interposer: Arc<dyn Interposer>,
}

impl WatchLoop {
    #[must_use]
    pub fn new(
        engine: Arc<ExemptionEngine>,
        store: &ConfigStore,
        own_app_id: impl Into<String>,
        interposer: Arc<dyn Interposer>,
    ) -> Self {
        Self {
            engine,
            blocked_apps: store.subscribe_blocked_apps(),
            service_enabled: store.subscribe_service_enabled(),
            own_app_id: own_app_id.into(),
            interposer,
        }
    }

    /// Decide what to do about `app_id` being in the foreground.
    #[must_use]
    pub fn evaluate(&self, app_id: Option<&str>) -> Decision {
        if !*self.service_enabled.borrow() {
            return Decision::Disabled;
        }
        let Some(app_id) = app_id else {
            return Decision::NoForeground;
        };
        if app_id == self.own_app_id {
            return Decision::OwnApp;
        }
        if !self.blocked_apps.borrow().contains(app_id) {
            return Decision::NotBlocked;
        }
        if self.engine.is_allowed(app_id) {
            return Decision::Exempt;
        }
        Decision::Interpose
    }

    /// Evaluate one observation and interpose when required.
    pub fn on_foreground(&self, app_id: Option<&str>) -> Decision {
        let decision = self.evaluate(app_id);
        if let (Decision::Interpose, Some(app_id)) = (decision, app_id) {
            self.interposer.interpose(app_id);
        } else {
            log::trace!("Foreground {app_id:?}: {decision:?}");
        }
        decision
    }

    /// Poll `detector` every `period` until `shutdown` turns true.
    pub async fn run_polling(
        &self,
        detector: &dyn ForegroundDetector,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::info!("Watch loop polling every {} ms", period.as_millis());

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    match detector.current_app().await {
                        Ok(app) => {
                            self.on_foreground(app.as_ref().map(|a| a.app_id.as_str()));
                        }
                        Err(e) => log::warn!("Foreground detection failed: {e:#}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Watch loop stopped");
    }

    /// Consume foreground change events until the source closes or
    /// `shutdown` turns true.
    pub async fn run_events(
        &self,
        mut events: mpsc::Receiver<ForegroundEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("Watch loop following foreground events");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                event = events.recv() => match event {
                    Some(ForegroundEvent::Focused(app)) => {
                        self.on_foreground(Some(&app.app_id));
                    }
                    Some(ForegroundEvent::Cleared) => {
                        self.on_foreground(None);
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Watch loop stopped");
    }
}
