//! Error types for the progress store.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    /// Failed to open or create the database file.
    #[error("Failed to open progress database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("Progress database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    #[error("Progress query failed: {0}")]
    Query(String),

    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    #[error("Progress schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    /// Another pipeline instance holds the work directory lock.
    #[error("Another catalog-packer instance is using this work directory (lock: {0})")]
    Locked(PathBuf),

    #[error("Lock file error at {path}: {source}")]
    LockIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A completed item was recorded against a pack that is not open.
    #[error("Item {identifier} recorded for pack {got}, but pack {open} is open")]
    PackMismatch {
        identifier: String,
        got: u32,
        open: u32,
    },
}

impl StateError {
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }
}
