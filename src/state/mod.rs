//! Durable progress tracking.
//!
//! Records which identifiers completed (and in which pack), which were
//! skipped and why, the open pack and its size, and per-run history. Backed
//! by SQLite so every update is a committed transaction.

pub mod db;
pub mod error;
pub mod legacy;
pub mod lock;
pub mod schema;
pub mod types;

pub use db::{ProgressStore, SqliteProgressStore};
pub use error::StateError;
pub use lock::InstanceLock;
pub use types::{OpenPack, ProgressState, RunStats, SkipReason};
