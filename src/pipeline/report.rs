//! Run report and human-readable formatting helpers.

use std::collections::BTreeMap;
use std::time::Duration;

use byte_unit::{Byte, UnitType};

use crate::state::{RunStats, SkipReason};

/// What happened to one identifier in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed { pack: u32, bytes: u64 },
    AlreadyDone,
    Skipped { reason: SkipReason, detail: String },
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Identifiers that went through the per-item path (not already done).
    pub processed: u64,
    pub completed: u64,
    pub completed_bytes: u64,
    pub already_done: u64,
    pub skipped: BTreeMap<SkipReason, u64>,
    pub packs_sealed: u32,
    /// Identifiers re-driven by the retry sweeper.
    pub swept: u64,
    /// Swept identifiers that completed.
    pub recovered: u64,
    /// Transient failures still recorded after the sweep.
    pub transient_remaining: u64,
    pub interrupted: bool,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::AlreadyDone => self.already_done += 1,
            ItemOutcome::Completed { bytes, .. } => {
                self.processed += 1;
                self.completed += 1;
                self.completed_bytes += bytes;
            }
            ItemOutcome::Skipped { reason, .. } => {
                self.processed += 1;
                *self.skipped.entry(*reason).or_default() += 1;
            }
        }
    }

    /// Account for a sweeper retry. Skip counts keep describing the main
    /// pass; a recovered item only adds to the completed totals.
    pub fn record_sweep(&mut self, outcome: &ItemOutcome) {
        self.swept += 1;
        if let ItemOutcome::Completed { bytes, .. } = outcome {
            self.recovered += 1;
            self.completed += 1;
            self.completed_bytes += bytes;
        }
    }

    pub fn skipped_total(&self) -> u64 {
        self.skipped.values().sum()
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            processed: self.processed,
            completed: self.completed,
            skipped: self.skipped_total(),
            transient_remaining: self.transient_remaining,
            interrupted: self.interrupted,
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("── Summary ──");
        if self.interrupted {
            tracing::info!("  Interrupted by shutdown signal");
        }
        tracing::info!(
            "  {} processed, {} completed ({}), {} already done",
            self.processed,
            self.completed,
            human_bytes(self.completed_bytes),
            self.already_done
        );
        for (reason, count) in &self.skipped {
            tracing::info!("  skipped {}: {}", reason, count);
        }
        if self.swept > 0 {
            tracing::info!("  retried {}, recovered {}", self.swept, self.recovered);
        }
        tracing::info!("  packs sealed: {}", self.packs_sealed);
        if self.transient_remaining > 0 {
            tracing::warn!(
                "  {} items still failing transiently; they are retried on the next run",
                self.transient_remaining
            );
        }
        tracing::info!("  elapsed: {}", format_duration(self.elapsed));
    }
}

pub fn human_bytes(bytes: u64) -> String {
    let adjusted = Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary);
    format!("{adjusted:.2}")
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
