//! Database schema definitions and migrations.

use rusqlite::Connection;

use super::error::StateError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS pack_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    ordinal INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS items (
    identifier TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    skip_reason TEXT,
    detail TEXT,
    pack_ordinal INTEGER,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_status ON items(status);
CREATE INDEX IF NOT EXISTS idx_items_skip_reason ON items(skip_reason);

CREATE TABLE IF NOT EXISTS sealed_packs (
    ordinal INTEGER PRIMARY KEY,
    size_bytes INTEGER NOT NULL,
    sealed_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    processed INTEGER DEFAULT 0,
    completed INTEGER DEFAULT 0,
    skipped INTEGER DEFAULT 0,
    transient_remaining INTEGER DEFAULT 0,
    interrupted INTEGER DEFAULT 0
);

INSERT OR IGNORE INTO pack_state (id, ordinal, size_bytes, updated_at)
VALUES (1, 1, 0, strftime('%s', 'now'));
"#;

pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StateError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Initialize or migrate the database schema. Idempotent.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StateError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StateError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tracing::debug!("Initialized progress schema at version {}", SCHEMA_VERSION);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_db_migration() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_idempotent_migration_keeps_pack_row() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute("UPDATE pack_state SET ordinal = 7", []).unwrap();
        migrate(&conn).unwrap();

        let ordinal: i64 = conn
            .query_row("SELECT ordinal FROM pack_state WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(ordinal, 7);
    }

    #[test]
    fn test_unsupported_version() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        assert!(matches!(
            migrate(&conn),
            Err(StateError::UnsupportedSchemaVersion { .. })
        ));
    }

    #[test]
    fn test_single_pack_state_row() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        let err = conn.execute(
            "INSERT INTO pack_state (id, ordinal, size_bytes, updated_at) VALUES (2, 1, 0, 0)",
            [],
        );
        assert!(err.is_err());
    }
}
