//! Subscribable settings store on top of [`Database`].
//!
//! Every setting is mirrored into a `tokio::sync::watch` channel, so readers
//! only ever see the latest value and never touch the database on their hot
//! path. Writes go through atomic read-modify-write transactions and then
//! publish the stored value. The commit and the publish happen under one
//! store lock, so a channel never holds a value older than the database row
//! this process last wrote or read.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::db::Database;
use crate::error::{Result, StoreError};
use crate::models::{decode_or_default, keys, ExemptionSnapshot, Settings, MAX_EXEMPTION_MS};

pub struct ConfigStore {
    database: Arc<Database>,
    publish_lock: Mutex<()>,
    blocked_apps: watch::Sender<BTreeSet<String>>,
    challenge_sentence: watch::Sender<String>,
    exemption_duration_ms: watch::Sender<i64>,
    service_enabled: watch::Sender<bool>,
}

impl ConfigStore {
    /// Load current settings and start publishing them.
    ///
    /// A failing read is logged and treated as "nothing stored yet".
    #[must_use]
    pub fn open(database: Arc<Database>) -> Self {
        let settings = read_settings(&database).unwrap_or_else(|e| {
            log::warn!("Failed to read settings, using defaults: {e}");
            Settings::default()
        });

        Self {
            database,
            publish_lock: Mutex::new(()),
            blocked_apps: watch::channel(settings.blocked_apps).0,
            challenge_sentence: watch::channel(settings.challenge_sentence).0,
            exemption_duration_ms: watch::channel(settings.exemption_duration_ms).0,
            service_enabled: watch::channel(settings.service_enabled).0,
        }
    }

    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    fn publishing(&self) -> MutexGuard<'_, ()> {
        self.publish_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest published settings
    #[must_use]
    pub fn settings(&self) -> Settings {
        Settings {
            blocked_apps: self.blocked_apps.borrow().clone(),
            challenge_sentence: self.challenge_sentence.borrow().clone(),
            exemption_duration_ms: *self.exemption_duration_ms.borrow(),
            service_enabled: *self.service_enabled.borrow(),
        }
    }

    #[must_use]
    pub fn subscribe_blocked_apps(&self) -> watch::Receiver<BTreeSet<String>> {
        self.blocked_apps.subscribe()
    }

    #[must_use]
    pub fn subscribe_challenge_sentence(&self) -> watch::Receiver<String> {
        self.challenge_sentence.subscribe()
    }

    #[must_use]
    pub fn subscribe_exemption_duration(&self) -> watch::Receiver<i64> {
        self.exemption_duration_ms.subscribe()
    }

    #[must_use]
    pub fn subscribe_service_enabled(&self) -> watch::Receiver<bool> {
        self.service_enabled.subscribe()
    }

    // ==================== Blocked apps ====================

    /// Add an application to the blocked set.
    ///
    /// Returns `true` if it was not blocked before.
    ///
    /// # Errors
    ///
    /// Returns an error if the database transaction fails
    pub fn add_blocked_app(&self, app_id: &str) -> Result<bool> {
        self.update_blocked_apps(|apps| apps.insert(app_id.to_string()))
    }

    /// Remove an application from the blocked set.
    ///
    /// Returns `true` if it was blocked before.
    ///
    /// # Errors
    ///
    /// Returns an error if the database transaction fails
    pub fn remove_blocked_app(&self, app_id: &str) -> Result<bool> {
        self.update_blocked_apps(|apps| apps.remove(app_id))
    }

    /// Flip the blocked state the caller last observed for `app_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database transaction fails
    pub fn toggle_blocked_app(&self, app_id: &str, currently_blocked: bool) -> Result<bool> {
        if currently_blocked {
            self.remove_blocked_app(app_id)
        } else {
            self.add_blocked_app(app_id)
        }
    }

    fn update_blocked_apps<F>(&self, f: F) -> Result<bool>
    where
        F: FnOnce(&mut BTreeSet<String>) -> bool,
    {
        let _publishing = self.publishing();
        let mut latest = None;
        let changed = self.database.update_value(keys::BLOCKED_APPS, |raw| {
            let mut apps: BTreeSet<String> =
                decode_or_default(keys::BLOCKED_APPS, raw, BTreeSet::new);
            let changed = f(&mut apps);
            let encoded = if changed {
                Some(serde_json::to_string(&apps)?)
            } else {
                None
            };
            latest = Some(apps);
            Ok(encoded)
        })?;

        if let Some(apps) = latest {
            publish(&self.blocked_apps, apps);
        }
        Ok(changed)
    }

    // ==================== Challenge settings ====================

    /// Replace the challenge sentence. It is stored verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EmptySentence`] for a blank sentence, or a
    /// database error
    pub fn set_challenge_sentence(&self, sentence: &str) -> Result<()> {
        if sentence.trim().is_empty() {
            return Err(StoreError::EmptySentence);
        }
        let encoded = serde_json::to_string(sentence)?;
        let _publishing = self.publishing();
        self.database.set_value(keys::CHALLENGE_SENTENCE, &encoded)?;
        publish(&self.challenge_sentence, sentence.to_string());
        Ok(())
    }

    /// Replace the default exemption duration.
    ///
    /// Exemptions already granted keep their own expiry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidDuration`] when `duration_ms` is not in
    /// `1..=MAX_EXEMPTION_MS`, or a database error
    pub fn set_exemption_duration(&self, duration_ms: i64) -> Result<()> {
        if duration_ms <= 0 || duration_ms > MAX_EXEMPTION_MS {
            return Err(StoreError::InvalidDuration {
                value: duration_ms,
                max: MAX_EXEMPTION_MS,
            });
        }
        let _publishing = self.publishing();
        self.database
            .set_value(keys::EXEMPTION_DURATION_MS, &duration_ms.to_string())?;
        publish(&self.exemption_duration_ms, duration_ms);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the database write fails
    pub fn set_service_enabled(&self, enabled: bool) -> Result<()> {
        let _publishing = self.publishing();
        self.database
            .set_value(keys::SERVICE_ENABLED, if enabled { "true" } else { "false" })?;
        publish(&self.service_enabled, enabled);
        Ok(())
    }

    /// Re-read every setting and publish the ones that changed.
    ///
    /// Picks up edits made by other processes sharing the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database read fails; published values are
    /// left as they were
    pub fn refresh(&self) -> Result<()> {
        let _publishing = self.publishing();
        let settings = read_settings(&self.database)?;
        publish(&self.blocked_apps, settings.blocked_apps);
        publish(&self.challenge_sentence, settings.challenge_sentence);
        publish(&self.exemption_duration_ms, settings.exemption_duration_ms);
        publish(&self.service_enabled, settings.service_enabled);
        Ok(())
    }

    // ==================== Exemption table ====================

    /// Load the persisted exemption table.
    ///
    /// Absent, unreadable or corrupt data yields an empty snapshot.
    #[must_use]
    pub fn load_exemptions(&self) -> ExemptionSnapshot {
        let read = || -> Result<ExemptionSnapshot> {
            let entries = self.database.get_value(keys::EXEMPTION_TABLE)?;
            let clock_id = self.database.get_value(keys::EXEMPTION_CLOCK)?;
            Ok(ExemptionSnapshot {
                clock_id: decode_or_default(keys::EXEMPTION_CLOCK, clock_id.as_deref(), || None),
                entries: decode_or_default(
                    keys::EXEMPTION_TABLE,
                    entries.as_deref(),
                    BTreeMap::new,
                ),
            })
        };

        read().unwrap_or_else(|e| {
            log::warn!("Failed to load exemption table, starting empty: {e}");
            ExemptionSnapshot::default()
        })
    }

    /// Persist the exemption table together with its clock identity.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the database write fails
    pub fn save_exemptions(&self, snapshot: &ExemptionSnapshot) -> Result<()> {
        let entries = serde_json::to_string(&snapshot.entries)?;
        let clock_id = serde_json::to_string(&snapshot.clock_id)?;
        self.database.set_values(&[
            (keys::EXEMPTION_TABLE, &entries),
            (keys::EXEMPTION_CLOCK, &clock_id),
        ])
    }
}

fn read_settings(database: &Database) -> Result<Settings> {
    let blocked_apps = database.get_value(keys::BLOCKED_APPS)?;
    let challenge_sentence = database.get_value(keys::CHALLENGE_SENTENCE)?;
    let exemption_duration_ms = database.get_value(keys::EXEMPTION_DURATION_MS)?;
    let service_enabled = database.get_value(keys::SERVICE_ENABLED)?;

    Ok(Settings::from_raw(
        blocked_apps.as_deref(),
        challenge_sentence.as_deref(),
        exemption_duration_ms.as_deref(),
        service_enabled.as_deref(),
    ))
}

/// Publish `value` only if it differs, so receivers are not woken for nothing.
fn publish<T: PartialEq>(sender: &watch::Sender<T>, value: T) {
    sender.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DEFAULT_CHALLENGE_SENTENCE, DEFAULT_EXEMPTION_DURATION_MS};

    fn store() -> ConfigStore {
        ConfigStore::open(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_first_run_defaults() {
        let store = store();
        let settings = store.settings();
        assert!(settings.blocked_apps.is_empty());
        assert_eq!(settings.challenge_sentence, DEFAULT_CHALLENGE_SENTENCE);
        assert_eq!(settings.exemption_duration_ms, DEFAULT_EXEMPTION_DURATION_MS);
        assert!(settings.service_enabled);
        assert!(store.load_exemptions().is_empty());
    }

    #[test]
    fn test_block_unblock_publishes() {
        let store = store();
        let rx = store.subscribe_blocked_apps();

        assert!(store.add_blocked_app("com.example.target").unwrap());
        assert!(!store.add_blocked_app("com.example.target").unwrap());
        assert!(rx.borrow().contains("com.example.target"));

        assert!(store.remove_blocked_app("com.example.target").unwrap());
        assert!(!store.remove_blocked_app("com.example.target").unwrap());
        assert!(rx.borrow().is_empty());
    }

    #[test]
    fn test_toggle_blocked_app() {
        let store = store();
        store.toggle_blocked_app("org.chat", false).unwrap();
        assert!(store.settings().blocked_apps.contains("org.chat"));
        store.toggle_blocked_app("org.chat", true).unwrap();
        assert!(!store.settings().blocked_apps.contains("org.chat"));
    }

    #[test]
    fn test_concurrent_writers_publish_committed_set() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = Arc::new(ConfigStore::open(db.clone()));
        let rx = store.subscribe_blocked_apps();

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..20 {
                        store.add_blocked_app(&format!("app.{t}.{i}")).unwrap();
                        if i % 5 == 0 {
                            store.refresh().unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let committed: BTreeSet<String> =
            serde_json::from_str(&db.get_value(keys::BLOCKED_APPS).unwrap().unwrap()).unwrap();
        assert_eq!(committed.len(), 80);
        assert_eq!(*rx.borrow(), committed);
    }

    #[test]
    fn test_subscriber_sees_latest_value_only() {
        let store = store();
        let mut rx = store.subscribe_exemption_duration();

        store.set_exemption_duration(1_000).unwrap();
        store.set_exemption_duration(2_000).unwrap();
        store.set_exemption_duration(3_000).unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 3_000);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_rejects_invalid_values() {
        let store = store();
        assert!(matches!(
            store.set_exemption_duration(0),
            Err(StoreError::InvalidDuration { value: 0, .. })
        ));
        assert!(matches!(
            store.set_exemption_duration(MAX_EXEMPTION_MS + 1),
            Err(StoreError::InvalidDuration { .. })
        ));
        assert!(matches!(
            store.set_challenge_sentence("  "),
            Err(StoreError::EmptySentence)
        ));
        assert_eq!(
            store.settings().exemption_duration_ms,
            DEFAULT_EXEMPTION_DURATION_MS
        );
    }

    #[test]
    fn test_sentence_and_flag_round_trip_through_database() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = ConfigStore::open(db.clone());
        store.set_challenge_sentence("Is this worth it?").unwrap();
        store.set_service_enabled(false).unwrap();

        let reopened = ConfigStore::open(db);
        let settings = reopened.settings();
        assert_eq!(settings.challenge_sentence, "Is this worth it?");
        assert!(!settings.service_enabled);
    }

    #[test]
    fn test_refresh_picks_up_external_writes() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = ConfigStore::open(db.clone());
        let mut enabled = store.subscribe_service_enabled();

        // Another writer, e.g. the CLI in a different process
        db.set_value(keys::SERVICE_ENABLED, "false").unwrap();
        db.set_value(keys::BLOCKED_APPS, r#"["org.chat"]"#).unwrap();
        assert!(!enabled.has_changed().unwrap());

        store.refresh().unwrap();
        assert!(enabled.has_changed().unwrap());
        assert!(!*enabled.borrow());
        assert!(store.settings().blocked_apps.contains("org.chat"));
    }

    #[test]
    fn test_refresh_does_not_notify_unchanged() {
        let store = store();
        let mut rx = store.subscribe_challenge_sentence();
        store.refresh().unwrap();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_corrupt_blocked_set_is_replaced_on_update() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.set_value(keys::BLOCKED_APPS, "garbage").unwrap();

        let store = ConfigStore::open(db.clone());
        assert!(store.settings().blocked_apps.is_empty());

        store.add_blocked_app("org.chat").unwrap();
        assert_eq!(
            db.get_value(keys::BLOCKED_APPS).unwrap().as_deref(),
            Some(r#"["org.chat"]"#)
        );
    }

    #[test]
    fn test_exemption_snapshot_persists() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = ConfigStore::open(db.clone());

        let mut snapshot = ExemptionSnapshot {
            clock_id: Some("boot-1".to_string()),
            ..ExemptionSnapshot::default()
        };
        snapshot.entries.insert("com.example.target".to_string(), 61_000);
        store.save_exemptions(&snapshot).unwrap();

        assert_eq!(
            db.get_value(keys::EXEMPTION_TABLE).unwrap().as_deref(),
            Some(r#"{"com.example.target":61000}"#)
        );
        assert_eq!(ConfigStore::open(db).load_exemptions(), snapshot);
    }

    #[test]
    fn test_corrupt_exemption_table_loads_empty() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.set_value(keys::EXEMPTION_TABLE, r#"{"a": "soon"}"#).unwrap();
        db.set_value(keys::EXEMPTION_CLOCK, r#""boot-1""#).unwrap();

        let snapshot = ConfigStore::open(db).load_exemptions();
        assert!(snapshot.entries.is_empty());
        assert_eq!(snapshot.clock_id.as_deref(), Some("boot-1"));
    }
}
