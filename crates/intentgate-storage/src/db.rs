use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::migrations;

/// How long a writer waits on a lock held by another process (CLI vs daemon).
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database connection wrapper
///
/// The connection sits behind a mutex so a single `Database` can be shared
/// across threads through an `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the settings database
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation, connection opening, or schema initialization fails
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = db_path.unwrap_or_else(Self::default_db_path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::DataDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        migrations::init_schema(&conn)?;

        log::info!(
            "Database initialized at: {} (journal: {journal_mode})",
            path.display()
        );

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database, used by tests and dry runs
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get default database path
    fn default_db_path() -> PathBuf {
        let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("intentgate");
        path.push("intentgate.db");
        path
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the raw value stored under `key`
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .lock()
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write several values in one transaction
    ///
    /// # Errors
    ///
    /// Returns an error if any write fails; no value is written in that case
    pub fn set_values(&self, entries: &[(&str, &str)]) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for (key, value) in entries {
            upsert(&tx, key, value)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Write a single value
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails
    pub fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.set_values(&[(key, value)])
    }

    /// Atomic read-modify-write of one key
    ///
    /// `f` receives the current raw value and returns the replacement, or
    /// `None` to leave the row untouched. The read and the write happen inside
    /// one immediate transaction, so concurrent writers (including other
    /// processes) are serialized.
    ///
    /// Returns `true` when a new value was written.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails or `f` fails
    pub fn update_value<F>(&self, key: &str, f: F) -> Result<bool>
    where
        F: FnOnce(Option<&str>) -> Result<Option<String>>,
    {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        let written = match f(current.as_deref())? {
            Some(next) => {
                upsert(&tx, key, &next)?;
                true
            }
            None => false,
        };

        tx.commit()?;
        Ok(written)
    }

    /// Remove a key, returning whether it existed
    ///
    /// # Errors
    ///
    /// Returns an error if the database delete fails
    pub fn delete_value(&self, key: &str) -> Result<bool> {
        let removed = self
            .lock()
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(removed > 0)
    }

    /// List every stored key with its raw value, ordered by key
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails
    pub fn list_values(&self) -> Result<Vec<(String, String)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM kv_store ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn upsert(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO kv_store (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_value() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_value("nope").unwrap(), None);
    }

    #[test]
    fn test_set_then_get_overwrites() {
        let db = Database::open_in_memory().unwrap();
        db.set_value("challenge-sentence", "\"first\"").unwrap();
        db.set_value("challenge-sentence", "\"second\"").unwrap();
        assert_eq!(
            db.get_value("challenge-sentence").unwrap().as_deref(),
            Some("\"second\"")
        );
    }

    #[test]
    fn test_update_value_sees_current_and_can_skip() {
        let db = Database::open_in_memory().unwrap();
        db.set_value("counter", "1").unwrap();

        let written = db
            .update_value("counter", |current| {
                assert_eq!(current, Some("1"));
                Ok(None)
            })
            .unwrap();
        assert!(!written);

        let written = db
            .update_value("counter", |current| {
                let n: i64 = current.unwrap_or("0").parse().unwrap();
                Ok(Some((n + 1).to_string()))
            })
            .unwrap();
        assert!(written);
        assert_eq!(db.get_value("counter").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_update_value_error_writes_nothing() {
        let db = Database::open_in_memory().unwrap();
        let result = db.update_value("k", |_| Err(StoreError::EmptySentence));
        assert!(result.is_err());
        assert_eq!(db.get_value("k").unwrap(), None);
    }

    #[test]
    fn test_delete_and_list() {
        let db = Database::open_in_memory().unwrap();
        db.set_values(&[("b", "2"), ("a", "1")]).unwrap();
        assert_eq!(
            db.list_values().unwrap(),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
        assert!(db.delete_value("a").unwrap());
        assert!(!db.delete_value("a").unwrap());
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("intentgate.db");

        {
            let db = Database::new(Some(path.clone())).unwrap();
            db.set_value("service-enabled", "false").unwrap();
        }

        let db = Database::new(Some(path)).unwrap();
        assert_eq!(
            db.get_value("service-enabled").unwrap().as_deref(),
            Some("false")
        );
    }
}
