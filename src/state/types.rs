//! Types for the progress store.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

/// Why an identifier was not completed.
///
/// Only `TransientError` is picked up again by the retry sweeper; the other
/// reasons are terminal until cleared with `reset-skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum)]
pub enum SkipReason {
    #[value(name = "no-asset")]
    NoAsset,
    #[value(name = "oversize")]
    Oversize,
    #[value(name = "access-denied")]
    AccessDenied,
    #[value(name = "transient-error")]
    TransientError,
}

impl SkipReason {
    pub const ALL: [SkipReason; 4] = [
        SkipReason::NoAsset,
        SkipReason::Oversize,
        SkipReason::AccessDenied,
        SkipReason::TransientError,
    ];

    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAsset => "no-asset",
            Self::Oversize => "oversize",
            Self::AccessDenied => "access-denied",
            Self::TransientError => "transient-error",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "no-asset" => Some(Self::NoAsset),
            "oversize" => Some(Self::Oversize),
            "access-denied" => Some(Self::AccessDenied),
            "transient-error" => Some(Self::TransientError),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::TransientError)
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The currently open pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenPack {
    pub ordinal: u32,
    pub size_bytes: u64,
}

impl Default for OpenPack {
    fn default() -> Self {
        Self {
            ordinal: 1,
            size_bytes: 0,
        }
    }
}

/// In-memory view of everything the pipeline needs to resume.
///
/// `pack` always describes the pack that is open on disk; the store updates
/// its ordinal and size in the same transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub pack: OpenPack,
    pub completed: HashSet<String>,
    pub skipped: HashMap<String, SkipReason>,
}

impl ProgressState {
    pub fn is_completed(&self, id: &str) -> bool {
        self.completed.contains(id)
    }

    /// Completed or skipped for any reason. The main pass leaves these alone;
    /// transient skips are the sweeper's business.
    pub fn is_processed(&self, id: &str) -> bool {
        self.completed.contains(id) || self.skipped.contains_key(id)
    }

    pub fn transient_count(&self) -> usize {
        self.skipped
            .values()
            .filter(|r| **r == SkipReason::TransientError)
            .count()
    }
}

/// A completed item as recorded in the store.
#[derive(Debug, Clone)]
pub struct CompletedRecord {
    pub identifier: String,
    pub pack_ordinal: u32,
    pub size_bytes: u64,
    pub updated_at: DateTime<Utc>,
}

/// A skipped item as recorded in the store.
#[derive(Debug, Clone)]
pub struct SkippedRecord {
    pub identifier: String,
    pub reason: SkipReason,
    pub detail: Option<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// A pack that has been sealed and published.
#[derive(Debug, Clone)]
pub struct SealedPack {
    pub ordinal: u32,
    pub size_bytes: u64,
    pub sealed_at: DateTime<Utc>,
}

/// Counters for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub processed: u64,
    pub completed: u64,
    pub skipped: u64,
    pub transient_remaining: u64,
    pub interrupted: bool,
}

/// Summary shown by the `status` command.
#[derive(Debug, Clone)]
pub struct ProgressSummary {
    pub pack: OpenPack,
    pub completed: u64,
    pub completed_bytes: u64,
    pub pending: u64,
    pub skipped_by_reason: Vec<(SkipReason, u64)>,
    pub sealed_packs: Vec<SealedPack>,
    pub last_run_started: Option<DateTime<Utc>>,
    pub last_run_completed: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_reason_round_trip() {
        for reason in SkipReason::ALL {
            assert_eq!(SkipReason::from_str(reason.as_str()), Some(reason));
        }
        assert_eq!(SkipReason::from_str("done"), None);
    }

    #[test]
    fn test_only_transient_is_sweepable() {
        assert!(SkipReason::NoAsset.is_terminal());
        assert!(SkipReason::Oversize.is_terminal());
        assert!(SkipReason::AccessDenied.is_terminal());
        assert!(!SkipReason::TransientError.is_terminal());
    }

    #[test]
    fn test_zero_state_opens_pack_one() {
        let state = ProgressState::default();
        assert_eq!(state.pack, OpenPack { ordinal: 1, size_bytes: 0 });
        assert!(state.completed.is_empty());
        assert!(state.skipped.is_empty());
    }

    #[test]
    fn test_is_processed_covers_completed_and_skipped() {
        let mut state = ProgressState::default();
        state.completed.insert("a".into());
        state.skipped.insert("b".into(), SkipReason::Oversize);
        state.skipped.insert("c".into(), SkipReason::TransientError);

        assert!(state.is_completed("a"));
        assert!(!state.is_completed("b"));
        assert!(state.is_processed("b"));
        assert!(state.is_processed("c"));
        assert!(!state.is_processed("d"));
        assert_eq!(state.transient_count(), 1);
    }
}
