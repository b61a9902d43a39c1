//! Retry sweeper: re-drive transient failures after the main pass.

use super::{paces, Pipeline, PipelineError};

impl Pipeline {
    /// Run up to `sweep_rounds` rounds over the identifiers recorded as
    /// transient failures, stopping early once none remain.
    ///
    /// Taking an identifier clears its classification in the store before it
    /// is retried; an interrupted sweep leaves the rest pending, and the next
    /// run's main pass treats them as unprocessed.
    pub async fn sweep(&mut self) -> Result<(), PipelineError> {
        let rounds = self.config.sweep_rounds;
        for round in 1..=rounds {
            if self.shutdown.is_cancelled() {
                self.report.interrupted = true;
                return Ok(());
            }

            let taken = self.deps.store.take_transient().await?;
            if taken.is_empty() {
                break;
            }
            for id in &taken {
                self.state.skipped.remove(id);
            }
            self.progress.suspend(|| {
                tracing::info!(
                    "── Retry sweep {}/{}: {} transient failures ──",
                    round,
                    rounds,
                    taken.len()
                )
            });

            for id in &taken {
                if self.shutdown.is_cancelled() {
                    self.report.interrupted = true;
                    return Ok(());
                }
                self.progress.set_message(id.clone());
                let outcome = self.process_item(id).await?;
                self.report.record_sweep(&outcome);
                self.progress.inc(1);
                if paces(&outcome) {
                    self.polite_delay().await;
                }
            }
        }

        let remaining = self.state.transient_count();
        if remaining > 0 {
            self.progress.suspend(|| {
                tracing::warn!(
                    "{} transient failures remain after {} sweep rounds",
                    remaining,
                    rounds
                )
            });
        }
        Ok(())
    }
}
