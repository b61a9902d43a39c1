//! Progress store trait and SQLite implementation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::StateError;
use super::schema;
use super::types::{
    CompletedRecord, OpenPack, ProgressState, ProgressSummary, RunStats, SealedPack,
    SkipReason, SkippedRecord,
};

/// Durable record of per-identifier outcomes and the open pack.
///
/// Every method commits before returning, so once a call resolves the change
/// survives a crash. Object-safe; the pipeline holds it as
/// `Arc<dyn ProgressStore>`.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Load the full state. A fresh store yields pack 1, size 0, no items.
    async fn load(&self) -> Result<ProgressState, StateError>;

    /// Replace the persisted state with `state` in one transaction.
    ///
    /// Items already recorded as completed keep their pack assignment.
    async fn save(&self, state: &ProgressState) -> Result<(), StateError>;

    /// Record `id` as completed in the open pack and add `size_bytes` to the
    /// pack's size, atomically.
    ///
    /// Returns `false` without touching anything when `id` is already
    /// completed.
    async fn mark_completed(
        &self,
        id: &str,
        pack_ordinal: u32,
        size_bytes: u64,
    ) -> Result<bool, StateError>;

    /// Record a skip. Never downgrades a completed item.
    async fn mark_skipped(
        &self,
        id: &str,
        reason: SkipReason,
        detail: &str,
    ) -> Result<(), StateError>;

    /// Seal the open pack `sealed_ordinal` and open the next one with zero
    /// size. Returns the new open pack.
    async fn roll_over(&self, sealed_ordinal: u32) -> Result<OpenPack, StateError>;

    /// Collect every transient-error identifier and clear that classification
    /// (the rows become pending until re-driven).
    async fn take_transient(&self) -> Result<Vec<String>, StateError>;

    /// Move skipped items with any of `reasons` back to pending so the next
    /// run reconsiders them. Returns the number of items reset.
    async fn reset_skipped(&self, reasons: &[SkipReason]) -> Result<u64, StateError>;

    async fn get_summary(&self) -> Result<ProgressSummary, StateError>;

    async fn get_skipped(&self) -> Result<Vec<SkippedRecord>, StateError>;

    async fn get_completed(&self) -> Result<Vec<CompletedRecord>, StateError>;

    /// Start a new run and return its ID.
    async fn start_run(&self) -> Result<i64, StateError>;

    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), StateError>;
}

/// SQLite implementation of the progress store.
pub struct SqliteProgressStore {
    /// rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteProgressStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteProgressStore {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            // A committed item must survive power loss, not just a process crash.
            conn.pragma_update(None, "synchronous", "FULL")
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }
}

fn read_open_pack(conn: &Connection) -> Result<OpenPack, StateError> {
    conn.query_row(
        "SELECT ordinal, size_bytes FROM pack_state WHERE id = 1",
        [],
        |row| {
            Ok(OpenPack {
                ordinal: row.get::<_, i64>(0)? as u32,
                size_bytes: row.get::<_, i64>(1)? as u64,
            })
        },
    )
    .map_err(StateError::query)
}

fn timestamp(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[async_trait]
impl ProgressStore for SqliteProgressStore {
    async fn load(&self) -> Result<ProgressState, StateError> {
        let conn = self.conn()?;
        let pack = read_open_pack(&conn)?;

        let mut stmt = conn
            .prepare_cached("SELECT identifier FROM items WHERE status = 'completed'")
            .map_err(StateError::query)?;
        let completed = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(StateError::query)?
            .collect::<Result<HashSet<_>, _>>()
            .map_err(StateError::query)?;

        let mut stmt = conn
            .prepare_cached("SELECT identifier, skip_reason FROM items WHERE status = 'skipped'")
            .map_err(StateError::query)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        let mut skipped = HashMap::with_capacity(rows.len());
        for (id, reason) in rows {
            let reason = reason
                .as_deref()
                .and_then(SkipReason::from_str)
                .unwrap_or(SkipReason::TransientError);
            skipped.insert(id, reason);
        }

        Ok(ProgressState {
            pack,
            completed,
            skipped,
        })
    }

    async fn save(&self, state: &ProgressState) -> Result<(), StateError> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(StateError::query)?;

        tx.execute(
            "UPDATE pack_state SET ordinal = ?1, size_bytes = ?2, updated_at = ?3 WHERE id = 1",
            rusqlite::params![state.pack.ordinal, state.pack.size_bytes as i64, now],
        )
        .map_err(StateError::query)?;

        let existing: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT identifier FROM items")
                .map_err(StateError::query)?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(StateError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StateError::query)?;
            ids
        };

        {
            let mut delete = tx
                .prepare_cached("DELETE FROM items WHERE identifier = ?1")
                .map_err(StateError::query)?;
            for id in existing
                .iter()
                .filter(|id| !state.completed.contains(*id) && !state.skipped.contains_key(*id))
            {
                delete.execute([id]).map_err(StateError::query)?;
            }

            let mut complete = tx
                .prepare_cached(
                    r#"
                    INSERT INTO items (identifier, status, updated_at)
                    VALUES (?1, 'completed', ?2)
                    ON CONFLICT(identifier) DO UPDATE SET
                        status = 'completed',
                        skip_reason = NULL,
                        detail = NULL,
                        updated_at = excluded.updated_at
                    WHERE items.status != 'completed'
                    "#,
                )
                .map_err(StateError::query)?;
            for id in &state.completed {
                complete
                    .execute(rusqlite::params![id, now])
                    .map_err(StateError::query)?;
            }

            let mut skip = tx
                .prepare_cached(
                    r#"
                    INSERT INTO items (identifier, status, skip_reason, updated_at)
                    VALUES (?1, 'skipped', ?2, ?3)
                    ON CONFLICT(identifier) DO UPDATE SET
                        status = 'skipped',
                        skip_reason = excluded.skip_reason,
                        pack_ordinal = NULL,
                        size_bytes = 0,
                        updated_at = excluded.updated_at
                    "#,
                )
                .map_err(StateError::query)?;
            for (id, reason) in state
                .skipped
                .iter()
                .filter(|(id, _)| !state.completed.contains(*id))
            {
                skip.execute(rusqlite::params![id, reason.as_str(), now])
                    .map_err(StateError::query)?;
            }
        }

        tx.commit().map_err(StateError::query)
    }

    async fn mark_completed(
        &self,
        id: &str,
        pack_ordinal: u32,
        size_bytes: u64,
    ) -> Result<bool, StateError> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(StateError::query)?;

        let open = read_open_pack(&tx)?;
        if open.ordinal != pack_ordinal {
            return Err(StateError::PackMismatch {
                identifier: id.to_string(),
                got: pack_ordinal,
                open: open.ordinal,
            });
        }

        let status: Option<String> = tx
            .query_row("SELECT status FROM items WHERE identifier = ?1", [id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(StateError::query)?;
        if status.as_deref() == Some("completed") {
            return Ok(false);
        }

        tx.execute(
            r#"
            INSERT INTO items (identifier, status, pack_ordinal, size_bytes, attempts, updated_at)
            VALUES (?1, 'completed', ?2, ?3, 1, ?4)
            ON CONFLICT(identifier) DO UPDATE SET
                status = 'completed',
                skip_reason = NULL,
                detail = NULL,
                pack_ordinal = excluded.pack_ordinal,
                size_bytes = excluded.size_bytes,
                attempts = items.attempts + 1,
                updated_at = excluded.updated_at
            "#,
            rusqlite::params![id, pack_ordinal, size_bytes as i64, now],
        )
        .map_err(StateError::query)?;

        tx.execute(
            "UPDATE pack_state SET size_bytes = size_bytes + ?1, updated_at = ?2 WHERE id = 1",
            rusqlite::params![size_bytes as i64, now],
        )
        .map_err(StateError::query)?;

        tx.commit().map_err(StateError::query)?;
        Ok(true)
    }

    async fn mark_skipped(
        &self,
        id: &str,
        reason: SkipReason,
        detail: &str,
    ) -> Result<(), StateError> {
        let now = Utc::now().timestamp();
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO items (identifier, status, skip_reason, detail, attempts, updated_at)
            VALUES (?1, 'skipped', ?2, ?3, 1, ?4)
            ON CONFLICT(identifier) DO UPDATE SET
                status = 'skipped',
                skip_reason = excluded.skip_reason,
                detail = excluded.detail,
                attempts = items.attempts + 1,
                updated_at = excluded.updated_at
            WHERE items.status != 'completed'
            "#,
            rusqlite::params![id, reason.as_str(), detail, now],
        )
        .map_err(StateError::query)?;

        Ok(())
    }

    async fn roll_over(&self, sealed_ordinal: u32) -> Result<OpenPack, StateError> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(StateError::query)?;

        let open = read_open_pack(&tx)?;
        if open.ordinal != sealed_ordinal {
            return Err(StateError::PackMismatch {
                identifier: format!("<pack {}>", sealed_ordinal),
                got: sealed_ordinal,
                open: open.ordinal,
            });
        }

        tx.execute(
            "INSERT OR REPLACE INTO sealed_packs (ordinal, size_bytes, sealed_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![open.ordinal, open.size_bytes as i64, now],
        )
        .map_err(StateError::query)?;

        let next = OpenPack {
            ordinal: open.ordinal + 1,
            size_bytes: 0,
        };
        tx.execute(
            "UPDATE pack_state SET ordinal = ?1, size_bytes = 0, updated_at = ?2 WHERE id = 1",
            rusqlite::params![next.ordinal, now],
        )
        .map_err(StateError::query)?;

        tx.commit().map_err(StateError::query)?;
        Ok(next)
    }

    async fn take_transient(&self) -> Result<Vec<String>, StateError> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(StateError::query)?;

        let ids = {
            let mut stmt = tx
                .prepare_cached(
                    "SELECT identifier FROM items WHERE status = 'skipped' AND skip_reason = 'transient-error' ORDER BY updated_at, identifier",
                )
                .map_err(StateError::query)?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(StateError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StateError::query)?;
            ids
        };

        tx.execute(
            "UPDATE items SET status = 'pending', skip_reason = NULL, updated_at = ?1 WHERE status = 'skipped' AND skip_reason = 'transient-error'",
            [now],
        )
        .map_err(StateError::query)?;

        tx.commit().map_err(StateError::query)?;
        Ok(ids)
    }

    async fn reset_skipped(&self, reasons: &[SkipReason]) -> Result<u64, StateError> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(StateError::query)?;

        let mut total = 0u64;
        {
            let mut stmt = tx
                .prepare_cached(
                    "UPDATE items SET status = 'pending', skip_reason = NULL, updated_at = ?1 WHERE status = 'skipped' AND skip_reason = ?2",
                )
                .map_err(StateError::query)?;
            for reason in reasons {
                total += stmt
                    .execute(rusqlite::params![now, reason.as_str()])
                    .map_err(StateError::query)? as u64;
            }
        }

        tx.commit().map_err(StateError::query)?;
        Ok(total)
    }

    async fn get_summary(&self) -> Result<ProgressSummary, StateError> {
        let conn = self.conn()?;
        let pack = read_open_pack(&conn)?;

        let (completed, completed_bytes): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM items WHERE status = 'completed'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(StateError::query)?;

        let pending: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM items WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )
            .map_err(StateError::query)?;

        let mut stmt = conn
            .prepare_cached(
                "SELECT skip_reason, COUNT(*) FROM items WHERE status = 'skipped' GROUP BY skip_reason",
            )
            .map_err(StateError::query)?;
        let mut skipped_by_reason: Vec<(SkipReason, u64)> = stmt
            .query_map([], |row| {
                Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?
            .into_iter()
            .filter_map(|(reason, count)| {
                reason
                    .as_deref()
                    .and_then(SkipReason::from_str)
                    .map(|r| (r, count as u64))
            })
            .collect();
        skipped_by_reason.sort();

        let mut stmt = conn
            .prepare_cached("SELECT ordinal, size_bytes, sealed_at FROM sealed_packs ORDER BY ordinal")
            .map_err(StateError::query)?;
        let sealed_packs = stmt
            .query_map([], |row| {
                Ok(SealedPack {
                    ordinal: row.get::<_, i64>(0)? as u32,
                    size_bytes: row.get::<_, i64>(1)? as u64,
                    sealed_at: timestamp(row.get(2)?),
                })
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        let last_run: Option<(i64, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StateError::query)?;

        Ok(ProgressSummary {
            pack,
            completed: completed as u64,
            completed_bytes: completed_bytes as u64,
            pending: pending as u64,
            skipped_by_reason,
            sealed_packs,
            last_run_started: last_run.map(|(started, _)| timestamp(started)),
            last_run_completed: last_run.and_then(|(_, completed)| completed.map(timestamp)),
        })
    }

    async fn get_skipped(&self) -> Result<Vec<SkippedRecord>, StateError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT identifier, skip_reason, detail, attempts, updated_at FROM items WHERE status = 'skipped' ORDER BY skip_reason, identifier",
            )
            .map_err(StateError::query)?;

        let records = stmt
            .query_map([], |row| {
                let reason: Option<String> = row.get(1)?;
                Ok(SkippedRecord {
                    identifier: row.get(0)?,
                    reason: reason
                        .as_deref()
                        .and_then(SkipReason::from_str)
                        .unwrap_or(SkipReason::TransientError),
                    detail: row.get(2)?,
                    attempts: row.get::<_, i64>(3)? as u32,
                    updated_at: timestamp(row.get(4)?),
                })
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        Ok(records)
    }

    async fn get_completed(&self) -> Result<Vec<CompletedRecord>, StateError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT identifier, pack_ordinal, size_bytes, updated_at FROM items WHERE status = 'completed' ORDER BY pack_ordinal, identifier",
            )
            .map_err(StateError::query)?;

        let records = stmt
            .query_map([], |row| {
                Ok(CompletedRecord {
                    identifier: row.get(0)?,
                    pack_ordinal: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as u32,
                    size_bytes: row.get::<_, i64>(2)? as u64,
                    updated_at: timestamp(row.get(3)?),
                })
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;

        Ok(records)
    }

    async fn start_run(&self) -> Result<i64, StateError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runs (started_at) VALUES (?1)",
            [Utc::now().timestamp()],
        )
        .map_err(StateError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), StateError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE runs SET completed_at = ?1, processed = ?2, completed = ?3, skipped = ?4, transient_remaining = ?5, interrupted = ?6 WHERE id = ?7",
            rusqlite::params![
                Utc::now().timestamp(),
                stats.processed as i64,
                stats.completed as i64,
                stats.skipped as i64,
                stats.transient_remaining as i64,
                stats.interrupted as i64,
                run_id
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }
}
