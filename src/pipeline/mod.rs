//! The per-item pipeline.
//!
//! One sequential worker takes identifiers from the enumerator and drives
//! each through resolve → gate → pre-rollover → transfer into staging →
//! post-rollover → move into the pack → record → publish. Per-item failures
//! are recorded as skips and never stop the run; store, disk, enumeration and
//! publish failures do.
//!
//! Crash safety comes from ordering: files land in the pack before the item
//! is recorded, and the item is recorded before the pack is published. On
//! start the open pack is reconciled: unrecorded item directories are pruned
//! and the pack is re-published.

pub mod error;
pub mod report;
pub mod sweep;

use std::io::IsTerminal;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

use crate::catalog::resolve::{self, AssetRule, SelectedAssets};
use crate::catalog::{Catalog, CatalogError};
use crate::pack::{PackAccountant, PackLayout, PackTarget};
use crate::publish::Publisher;
use crate::state::{OpenPack, ProgressState, ProgressStore, SkipReason};
use crate::transfer::{TransferEngine, TransferLimits};

pub use error::PipelineError;
pub use report::{human_bytes, ItemOutcome, RunReport};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub rule: AssetRule,
    pub pack_ceiling: u64,
    pub redirect_limit: u32,
    /// Pause after each completed item.
    pub delay: Duration,
    pub sweep_rounds: u32,
    pub no_progress_bar: bool,
}

/// Shared collaborators of a pipeline.
#[derive(Clone)]
pub struct PipelineDeps {
    pub catalog: Arc<dyn Catalog>,
    pub transfer: TransferEngine,
    pub store: Arc<dyn ProgressStore>,
    pub publisher: Arc<dyn Publisher>,
    pub layout: PackLayout,
}

/// Result of staging an item's files.
enum Staged {
    Ready(u64),
    Rejected(SkipReason, String),
}

pub struct Pipeline {
    deps: PipelineDeps,
    config: PipelineConfig,
    state: ProgressState,
    accountant: PackAccountant,
    target: PackTarget,
    report: RunReport,
    shutdown: CancellationToken,
    progress: ProgressBar,
}

/// Spinner for the main pass. Hidden when disabled or when stdout is not a
/// TTY so piped output stays clean.
fn create_progress_bar(no_progress_bar: bool) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] {spinner} {pos} items {msg}")
            .expect("valid template"),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Only items that were downloaded and packed are followed by a pause.
fn paces(outcome: &ItemOutcome) -> bool {
    matches!(outcome, ItemOutcome::Completed { .. })
}

impl Pipeline {
    /// Load progress, reconcile the open pack, and get ready to run.
    pub async fn start(
        deps: PipelineDeps,
        config: PipelineConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, PipelineError> {
        let state = deps.store.load().await?;
        let accountant = PackAccountant::new(config.pack_ceiling, state.pack);
        let target = deps.layout.target(state.pack.ordinal);
        let progress = create_progress_bar(config.no_progress_bar);

        tracing::info!(
            pack = %target.name,
            size = %human_bytes(state.pack.size_bytes),
            completed = state.completed.len(),
            skipped = state.skipped.len(),
            "Loaded progress"
        );

        let mut pipeline = Self {
            deps,
            config,
            state,
            accountant,
            target,
            report: RunReport::default(),
            shutdown,
            progress,
        };
        pipeline.reconcile().await?;
        Ok(pipeline)
    }

    pub fn open_pack(&self) -> OpenPack {
        self.accountant.open()
    }

    pub fn target(&self) -> &PackTarget {
        &self.target
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Bring the open pack's workspace back in line with recorded progress.
    async fn reconcile(&mut self) -> Result<(), PipelineError> {
        let layout = &self.deps.layout;
        layout
            .clear_staging()
            .await
            .map_err(PipelineError::disk(layout.staging_root()))?;

        let removed = layout
            .prune_orphans(&self.target, &self.state.completed)
            .await
            .map_err(PipelineError::disk(layout.items_root(&self.target)))?;
        if !removed.is_empty() {
            tracing::warn!(
                pack = %self.target.name,
                "Removed {} unrecorded item directories: {}",
                removed.len(),
                removed.join(", ")
            );
        }

        self.deps.publisher.prepare(&self.target).await?;
        let outcome = self
            .deps
            .publisher
            .publish(&self.target, &format!("Resume {}", self.target.name))
            .await?;
        if outcome.committed {
            tracing::info!(pack = %self.target.name, "Published changes left over from an earlier run");
        }
        Ok(())
    }

    /// Process every identifier from `identifiers`, then sweep transient
    /// failures. The run is recorded in the store even when it fails.
    pub async fn run<S>(&mut self, identifiers: S) -> Result<RunReport, PipelineError>
    where
        S: Stream<Item = Result<String, CatalogError>> + Unpin,
    {
        let started = Instant::now();
        let run_id = self.deps.store.start_run().await?;

        let result = self.run_passes(identifiers).await;

        self.progress.finish_and_clear();
        self.report.elapsed = started.elapsed();
        self.report.transient_remaining = self.state.transient_count() as u64;

        let recorded = self
            .deps
            .store
            .complete_run(run_id, &self.report.stats())
            .await;
        result?;
        recorded?;
        Ok(self.report.clone())
    }

    async fn run_passes<S>(&mut self, mut identifiers: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<String, CatalogError>> + Unpin,
    {
        loop {
            if self.shutdown.is_cancelled() {
                self.progress
                    .suspend(|| tracing::info!("Shutdown requested, not starting new items"));
                self.report.interrupted = true;
                return Ok(());
            }
            let Some(next) = identifiers.next().await else {
                break;
            };
            let id = next?;
            if self.state.is_processed(&id) {
                self.report.record(&ItemOutcome::AlreadyDone);
                continue;
            }
            self.drive(&id).await?;
        }

        self.sweep().await
    }

    /// Process one identifier, account for it and pause after a completion.
    async fn drive(&mut self, id: &str) -> Result<ItemOutcome, PipelineError> {
        self.progress.set_message(id.to_string());
        let outcome = self.process_item(id).await?;
        self.report.record(&outcome);
        self.progress.inc(1);
        if paces(&outcome) {
            self.polite_delay().await;
        }
        Ok(outcome)
    }

    async fn polite_delay(&self) {
        if self.config.delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.config.delay) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// The full per-item path.
    pub async fn process_item(&mut self, id: &str) -> Result<ItemOutcome, PipelineError> {
        if self.state.is_completed(id) {
            return Ok(ItemOutcome::AlreadyDone);
        }

        let rule = &self.config.rule;
        let resolved = match resolve::resolve(self.deps.catalog.as_ref(), id, rule).await {
            Ok(resolved) => resolved,
            Err(e) => {
                return self
                    .skip(id, SkipReason::TransientError, format!("metadata: {}", e))
                    .await
            }
        };

        let declared_primary = resolved.primary.as_ref().and_then(|a| a.size);
        let has_primary = resolved.primary.is_some();
        let selected = match resolve::gate(resolved, rule) {
            Ok(selected) => selected,
            Err(reason) => {
                let detail = match reason {
                    SkipReason::NoAsset if has_primary => "no cover asset".to_string(),
                    SkipReason::NoAsset => format!("no .{} asset", rule.primary_ext),
                    SkipReason::Oversize => format!(
                        "declared {} exceeds the item ceiling of {}",
                        human_bytes(declared_primary.unwrap_or(0)),
                        human_bytes(rule.max_item_bytes)
                    ),
                    _ => reason.to_string(),
                };
                return self.skip(id, reason, detail).await;
            }
        };

        let declared = selected.declared_bytes();
        if self.accountant.exceeds_ceiling(declared) {
            let detail = format!(
                "declared {} exceeds the pack ceiling",
                human_bytes(declared)
            );
            return self.skip(id, SkipReason::Oversize, detail).await;
        }
        if self.accountant.should_rollover(declared) {
            self.roll_over().await?;
        }

        let staged = self.stage(&selected).await;
        let bytes = match staged {
            Ok(Staged::Ready(bytes)) => bytes,
            Ok(Staged::Rejected(reason, detail)) => {
                self.discard_staged(id).await?;
                return self.skip(id, reason, detail).await;
            }
            Err(e) => {
                self.discard_staged(id).await?;
                return Err(e);
            }
        };

        if self.accountant.exceeds_ceiling(bytes) {
            self.discard_staged(id).await?;
            let detail = format!("transferred {} exceeds the pack ceiling", human_bytes(bytes));
            return self.skip(id, SkipReason::Oversize, detail).await;
        }
        if self.accountant.should_rollover(bytes) {
            self.roll_over().await?;
        }

        let layout = &self.deps.layout;
        layout
            .move_into_pack(&self.target, id)
            .await
            .map_err(PipelineError::disk(layout.item_dir(&self.target, id)))?;

        let pack = self.target.ordinal;
        if self.deps.store.mark_completed(id, pack, bytes).await? {
            self.accountant.record(bytes);
            self.state.pack = self.accountant.open();
        }
        self.state.completed.insert(id.to_string());
        self.state.skipped.remove(id);

        self.deps
            .publisher
            .publish(&self.target, &format!("Add {}", id))
            .await?;

        self.progress.suspend(|| {
            tracing::info!(
                id,
                pack,
                bytes,
                "Packed into {} ({} used)",
                self.target.name,
                human_bytes(self.accountant.open().size_bytes)
            )
        });
        Ok(ItemOutcome::Completed { pack, bytes })
    }

    /// Download the primary and cover into the item's staging directory.
    async fn stage(&self, selected: &SelectedAssets) -> Result<Staged, PipelineError> {
        let id = selected.identifier.as_str();
        let dir = self.deps.layout.staging_dir(id);
        self.discard_staged(id).await?;

        let limits = TransferLimits {
            max_bytes: self.config.rule.max_item_bytes,
            redirect_limit: self.config.redirect_limit,
        };

        let primary = &selected.primary;
        let primary_path = dir.join(PackLayout::primary_file_name(id, &primary.ext));
        let mut total = match self
            .deps
            .transfer
            .fetch(&primary.url, &primary_path, limits, primary.sha1.as_deref())
            .await
        {
            Ok(bytes) => bytes,
            Err(e) if e.is_fatal() => return Err(PipelineError::Transfer(e)),
            Err(e) => {
                let reason = e.skip_reason().unwrap_or(SkipReason::TransientError);
                return Ok(Staged::Rejected(reason, e.to_string()));
            }
        };

        if let Some(cover) = &selected.cover {
            let cover_path = dir.join(PackLayout::cover_file_name(&cover.ext));
            match self
                .deps
                .transfer
                .fetch(&cover.url, &cover_path, limits, cover.sha1.as_deref())
                .await
            {
                Ok(bytes) => total += bytes,
                Err(e) if e.is_fatal() => return Err(PipelineError::Transfer(e)),
                Err(e) => match e.skip_reason() {
                    Some(SkipReason::TransientError) => {
                        return Ok(Staged::Rejected(
                            SkipReason::TransientError,
                            format!("cover: {}", e),
                        ))
                    }
                    Some(_) if self.config.rule.require_cover => {
                        return Ok(Staged::Rejected(SkipReason::NoAsset, format!("cover: {}", e)))
                    }
                    _ => {
                        self.progress
                            .suspend(|| tracing::warn!(id, "Dropping cover: {}", e));
                    }
                },
            }
        }

        Ok(Staged::Ready(total))
    }

    async fn discard_staged(&self, id: &str) -> Result<(), PipelineError> {
        let layout = &self.deps.layout;
        layout
            .discard_staged(id)
            .await
            .map_err(PipelineError::disk(layout.staging_dir(id)))
    }

    async fn skip(
        &mut self,
        id: &str,
        reason: SkipReason,
        detail: String,
    ) -> Result<ItemOutcome, PipelineError> {
        self.deps.store.mark_skipped(id, reason, &detail).await?;
        self.state.skipped.insert(id.to_string(), reason);
        self.progress.suspend(|| {
            if reason.is_terminal() {
                tracing::info!(id, reason = %reason, "Skipped: {}", detail)
            } else {
                tracing::warn!(id, reason = %reason, "Failed, will retry: {}", detail)
            }
        });
        Ok(ItemOutcome::Skipped { reason, detail })
    }

    /// Seal the open pack and open the next one.
    ///
    /// The sealed pack is published before the rollover is recorded, so a
    /// recorded seal always refers to a published pack.
    async fn roll_over(&mut self) -> Result<(), PipelineError> {
        let sealed = self.target.clone();
        let sealed_size = self.accountant.open().size_bytes;

        self.deps
            .publisher
            .publish(&sealed, &format!("Seal {}", sealed.name))
            .await?;
        let next = self.deps.store.roll_over(sealed.ordinal).await?;
        self.accountant.advance();
        self.state.pack = next;
        self.target = self.deps.layout.target(next.ordinal);
        self.deps.publisher.prepare(&self.target).await?;
        self.report.packs_sealed += 1;

        self.progress.suspend(|| {
            tracing::info!(
                pack = sealed.ordinal,
                "Sealed {} at {}, opened {}",
                sealed.name,
                human_bytes(sealed_size),
                self.target.name
            )
        });
        Ok(())
    }
}
