//! Exemption engine: decides whether a blocked application is currently
//! exempt and grants time-bounded exemptions.
//!
//! Every grant stores an absolute expiry on the monotonic clock, computed at
//! grant time. Changing the default duration later does not touch exemptions
//! already granted. Expired entries are removed by the check that finds them.

mod writer;


pub use writer::{run_writer, ExemptionWriter};

use intentgate_storage::{ExemptionSnapshot, MAX_EXEMPTION_MS};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::MonotonicClock;

/// An exemption that is still running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveExemption {
    pub app_id: String,
    pub remaining: Duration,
}

#[derive(Debug, Default)]
struct EngineState {
    /// False until the persisted table has been restored. Checks fail closed.
    ready: bool,
    /// Application identifier -> expiry in clock milliseconds
    entries: HashMap<String, u64>,
}

pub struct ExemptionEngine {
    clock: Arc<dyn MonotonicClock>,
    state: Mutex<EngineState>,
    writer: Option<ExemptionWriter>,
}

impl ExemptionEngine {
    /// Create an engine that treats every application as non-exempt until
    /// [`restore`](Self::restore) is called.
    #[must_use]
    pub fn new(clock: Arc<dyn MonotonicClock>) -> Self {
        Self {
            clock,
            state: Mutex::new(EngineState::default()),
            writer: None,
        }
    }

    /// Persist the table through `writer` after every grant.
    #[must_use]
    pub fn with_writer(mut self, writer: ExemptionWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Is `app_id` exempt right now?
    ///
    /// Never waits on I/O. An expired entry is evicted by this call.
    #[must_use]
    pub fn is_allowed(&self, app_id: &str) -> bool {
        self.remaining(app_id).is_some()
    }

    /// Time left on the exemption of `app_id`, evicting it if expired.
    #[must_use]
    pub fn remaining(&self, app_id: &str) -> Option<Duration> {
        let mut state = self.lock();
        if !state.ready {
            return None;
        }
        let expires_at = *state.entries.get(app_id)?;
        let now = self.clock.now_ms();
        if now >= expires_at {
            state.entries.remove(app_id);
            log::debug!("Exemption for {app_id} expired, evicted");
            return None;
        }
        Some(Duration::from_millis(expires_at - now))
    }

    /// Exempt `app_id` for `duration_ms` starting now.
    ///
    /// Replaces any earlier exemption for the same application, so a re-grant
    /// restarts the window instead of extending it. A non-positive duration
    /// records an already-expired exemption; durations above
    /// [`MAX_EXEMPTION_MS`] are clamped.
    ///
    /// The in-memory table is updated before this returns. Persistence is
    /// handed to the background writer and may complete later.
    pub fn grant(&self, app_id: &str, duration_ms: i64) {
        let lifetime_ms = clamp_duration(duration_ms);
        let mut state = self.lock();
        let now = self.clock.now_ms();
        let expires_at = now.saturating_add(lifetime_ms);
        state.entries.insert(app_id.to_string(), expires_at);
        log::info!("Granted exemption for {app_id} ({lifetime_ms} ms)");

        // Submit under the lock so snapshots reach the writer in grant order
        if let Some(writer) = &self.writer {
            writer.submit(snapshot_of(&state.entries, now, self.clock.timeline_id()));
        }
    }

    /// Load a persisted table and start answering checks.
    ///
    /// Entries recorded on another clock timeline, already expired, or with
    /// an implausibly long remaining lifetime are dropped. Grants made in this
    /// process before the restore win over persisted ones.
    ///
    /// Returns the number of restored exemptions.
    pub fn restore(&self, snapshot: ExemptionSnapshot) -> usize {
        let mut state = self.lock();
        let now = self.clock.now_ms();
        let timeline = self.clock.timeline_id();
        let max_lifetime = MAX_EXEMPTION_MS.unsigned_abs();
        let mut restored = 0;

        if snapshot.clock_id.as_deref() == Some(timeline) {
            for (app_id, expires_at) in snapshot.entries {
                if expires_at <= now {
                    continue;
                }
                if expires_at - now > max_lifetime {
                    log::warn!("Dropping persisted exemption for {app_id}: expiry out of range");
                    continue;
                }
                if let Entry::Vacant(slot) = state.entries.entry(app_id) {
                    slot.insert(expires_at);
                    restored += 1;
                }
            }
        } else if !snapshot.entries.is_empty() {
            log::info!(
                "Discarding {} persisted exemptions from another clock timeline ({})",
                snapshot.entries.len(),
                snapshot.clock_id.as_deref().unwrap_or("unknown")
            );
        }

        state.ready = true;
        log::info!("Exemption table ready ({restored} restored)");
        restored
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Running exemptions, soonest expiry first. Expired entries met on the
    /// way are evicted.
    #[must_use]
    pub fn active(&self) -> Vec<ActiveExemption> {
        let mut state = self.lock();
        if !state.ready {
            return Vec::new();
        }
        let now = self.clock.now_ms();
        state.entries.retain(|_, expires_at| *expires_at > now);

        let mut active: Vec<ActiveExemption> = state
            .entries
            .iter()
            .map(|(app_id, expires_at)| ActiveExemption {
                app_id: app_id.clone(),
                remaining: Duration::from_millis(expires_at - now),
            })
            .collect();
        active.sort_by(|a, b| a.remaining.cmp(&b.remaining).then(a.app_id.cmp(&b.app_id)));
        active
    }

    /// Persistable copy of the live entries
    #[must_use]
    pub fn snapshot(&self) -> ExemptionSnapshot {
        let state = self.lock();
        snapshot_of(&state.entries, self.clock.now_ms(), self.clock.timeline_id())
    }

    /// Number of stored entries, including expired ones not yet checked
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn clamp_duration(duration_ms: i64) -> u64 {
    if duration_ms <= 0 {
        return 0;
    }
    if duration_ms > MAX_EXEMPTION_MS {
        log::warn!("Exemption of {duration_ms} ms clamped to {MAX_EXEMPTION_MS} ms");
        return MAX_EXEMPTION_MS.unsigned_abs();
    }
    duration_ms.unsigned_abs()
}

fn snapshot_of(entries: &HashMap<String, u64>, now: u64, timeline: &str) -> ExemptionSnapshot {
    ExemptionSnapshot {
        clock_id: Some(timeline.to_string()),
        entries: entries
            .iter()
            .filter(|(_, expires_at)| **expires_at > now)
            .map(|(app_id, expires_at)| (app_id.clone(), *expires_at))
            .collect(),
    }
}
