use rusqlite::Connection;

use crate::error::Result;

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize database schema
///
/// # Errors
///
/// Returns an error if table creation or the version bump fails
pub fn init_schema(conn: &Connection) -> Result<()> {
    // Key-value table - every user setting and the exemption table live here
    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // Add new columns to existing kv_store table if they don't exist
    let columns_to_add = vec![("updated_at", "TEXT NOT NULL DEFAULT ''")];

    for (column_name, column_type) in columns_to_add {
        let column_exists: i32 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM pragma_table_info('kv_store') WHERE name='{column_name}'"
            ),
            [],
            |row| row.get(0),
        )?;

        if column_exists == 0 {
            conn.execute(
                &format!("ALTER TABLE kv_store ADD COLUMN {column_name} {column_type}"),
                [],
            )?;
            log::debug!("Added column kv_store.{column_name}");
        }
    }

    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        log::info!("Database schema migrated from v{version} to v{SCHEMA_VERSION}");
    }

    Ok(())
}
