//! catalog-packer: mirror a public archive catalog into size-bounded,
//! git-published packs.
//!
//! Identifiers are enumerated from the catalog's search API, each item's
//! primary asset and optional cover are downloaded into the open pack, and
//! the pack is committed and pushed after every item. Progress lives in a
//! SQLite database so an interrupted run resumes where it stopped.

#![warn(clippy::all)]

mod catalog;
mod cli;
mod config;
mod pack;
mod pipeline;
mod publish;
pub mod retry;
mod shutdown;
mod state;
#[cfg(test)]
mod testutil;
mod transfer;
mod types;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use catalog::enumerate;
use catalog::{ArchiveCatalog, Catalog};
use cli::Command;
use config::{expand_tilde, Config};
use pack::layout::dir_size;
use pack::PackLayout;
use pipeline::{human_bytes, Pipeline, PipelineDeps};
use publish::GitPublisher;
use state::{InstanceLock, ProgressStore, SkipReason, SqliteProgressStore};
use transfer::TransferEngine;

/// Run the pipeline end to end.
async fn run_packer(args: cli::RunArgs, work_dir: &str, no_progress_bar: bool) -> anyhow::Result<()> {
    let config = Config::from_run_args(args, work_dir, no_progress_bar)?;
    tracing::debug!(?config, "Configuration");

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.work_dir.display()))?;
    let lock = InstanceLock::acquire(&config.work_dir).await?;
    tracing::debug!("Holding {}", lock.path().display());

    let store = Arc::new(SqliteProgressStore::open(&config.db_path()).await?);
    tracing::debug!("Progress database at {}", store.path().display());

    let client = catalog::build_http_client(config.timeout)?;
    let catalog: Arc<dyn Catalog> = Arc::new(ArchiveCatalog::new(client.clone(), &config.catalog_url));
    let publisher = GitPublisher::new(
        config.remote_config(client.clone()),
        config.identity.clone(),
        config.publish_retry,
    );
    let deps = PipelineDeps {
        catalog: catalog.clone(),
        transfer: TransferEngine::new(client),
        store,
        publisher: Arc::new(publisher),
        layout: PackLayout::new(&config.work_dir, &config.template, &config.items_dir),
    };

    let shutdown_token = shutdown::install_signal_handler();
    let mut pipeline = Pipeline::start(deps, config.pipeline_config(), shutdown_token).await?;
    tracing::info!(
        pack = %pipeline.target().name,
        completed = pipeline.state().completed.len(),
        query = %config.query,
        "Starting run"
    );

    let identifiers = enumerate::identifiers(catalog, config.enumerate_config());
    let report = pipeline.run(identifiers).await?;
    report.log_summary();
    tracing::info!(
        pack = pipeline.open_pack().ordinal,
        "Open pack holds {}",
        human_bytes(pipeline.open_pack().size_bytes)
    );
    Ok(())
}

/// Open the progress database if one exists.
async fn open_existing(work_dir: &Path) -> anyhow::Result<Option<SqliteProgressStore>> {
    let db_path = config::db_path(work_dir);
    if !db_path.exists() {
        println!("No progress database found at {}", db_path.display());
        println!("Run `catalog-packer run` first to create it.");
        return Ok(None);
    }
    Ok(Some(SqliteProgressStore::open(&db_path).await?))
}

/// Run the status command.
async fn run_status(args: cli::StatusArgs, work_dir: &Path) -> anyhow::Result<()> {
    let Some(store) = open_existing(work_dir).await? else {
        return Ok(());
    };
    let summary = store.get_summary().await?;

    println!("Progress Database: {}", store.path().display());
    println!();
    println!(
        "Open pack: #{} ({})",
        summary.pack.ordinal,
        human_bytes(summary.pack.size_bytes)
    );
    println!();
    println!("Items:");
    println!(
        "  Completed: {} ({})",
        summary.completed,
        human_bytes(summary.completed_bytes)
    );
    println!("  Pending:   {}", summary.pending);
    for (reason, count) in &summary.skipped_by_reason {
        println!("  Skipped ({}): {}", reason, count);
    }

    if !summary.sealed_packs.is_empty() {
        println!();
        println!("Sealed packs:");
        for pack in &summary.sealed_packs {
            println!(
                "  #{:03}  {:>12}  {}",
                pack.ordinal,
                human_bytes(pack.size_bytes),
                pack.sealed_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }

    println!();
    if let Some(started) = &summary.last_run_started {
        println!("Last run started:   {}", started.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(completed) = &summary.last_run_completed {
        println!("Last run completed: {}", completed.format("%Y-%m-%d %H:%M:%S UTC"));
    }

    if args.skipped {
        let skipped = store.get_skipped().await?;
        if !skipped.is_empty() {
            println!();
            println!("Skipped items:");
            for item in skipped {
                println!(
                    "  {} [{}] x{} - {}",
                    item.identifier,
                    item.reason,
                    item.attempts,
                    item.detail.as_deref().unwrap_or("no detail")
                );
            }
        }
    }

    Ok(())
}

/// Run the reset-skipped command.
async fn run_reset_skipped(args: cli::ResetSkippedArgs, work_dir: &Path) -> anyhow::Result<()> {
    let Some(store) = open_existing(work_dir).await? else {
        return Ok(());
    };
    let _lock = InstanceLock::acquire(work_dir).await?;

    let reasons = if args.reasons.is_empty() {
        SkipReason::ALL.to_vec()
    } else {
        args.reasons
    };
    let count = store.reset_skipped(&reasons).await?;
    let names: Vec<&str> = reasons.iter().map(SkipReason::as_str).collect();
    println!("Reset {} skipped items ({})", count, names.join(", "));
    Ok(())
}

/// Run the verify command.
async fn run_verify(args: cli::VerifyArgs, work_dir: &Path) -> anyhow::Result<()> {
    let Some(store) = open_existing(work_dir).await? else {
        return Ok(());
    };
    let layout = PackLayout::new(work_dir, &args.remote_template, &args.items_dir);
    let completed = store.get_completed().await?;

    println!("Verifying {} completed items...", completed.len());
    println!();

    let mut missing = 0;
    let mut mismatched = 0;
    let mut untracked = 0;
    let mut verified = 0;

    for item in &completed {
        // Imported from the legacy format: no pack assignment or size.
        if item.pack_ordinal == 0 {
            untracked += 1;
            continue;
        }
        let dir = layout.item_dir(&layout.target(item.pack_ordinal), &item.identifier);
        if !dir.exists() {
            println!("MISSING: {} ({})", dir.display(), item.identifier);
            missing += 1;
            continue;
        }
        match dir_size(&dir).await {
            Ok(size) if size == item.size_bytes => verified += 1,
            Ok(size) => {
                println!(
                    "SIZE MISMATCH: {} - recorded {}, found {}",
                    dir.display(),
                    item.size_bytes,
                    size
                );
                mismatched += 1;
            }
            Err(e) => {
                println!("ERROR: {} - {}", dir.display(), e);
                mismatched += 1;
            }
        }
    }

    println!();
    println!("Results:");
    println!("  Verified:   {}", verified);
    println!("  Missing:    {}", missing);
    println!("  Mismatched: {}", mismatched);
    if untracked > 0 {
        println!("  Untracked:  {} (imported without pack data)", untracked);
    }

    if missing > 0 || mismatched > 0 {
        std::process::exit(1);
    }

    Ok(())
}

/// Run the import-legacy command.
async fn run_import_legacy(args: cli::ImportLegacyArgs, work_dir: &Path) -> anyhow::Result<()> {
    let dir = expand_tilde(&args.dir);
    let imported = state::legacy::read_legacy_dir(&dir).await?;

    tokio::fs::create_dir_all(work_dir)
        .await
        .with_context(|| format!("Failed to create {}", work_dir.display()))?;
    let _lock = InstanceLock::acquire(work_dir).await?;
    let store = SqliteProgressStore::open(&config::db_path(work_dir)).await?;

    let existing = store.load().await?;
    if !args.force && (!existing.completed.is_empty() || !existing.skipped.is_empty()) {
        anyhow::bail!(
            "{} already holds progress ({} completed); pass --force to replace it",
            store.path().display(),
            existing.completed.len()
        );
    }

    store.save(&imported).await?;
    println!(
        "Imported {} completed and {} skipped items; open pack #{} at {}",
        imported.completed.len(),
        imported.skipped.len(),
        imported.pack.ordinal,
        human_bytes(imported.pack.size_bytes)
    );
    Ok(())
}

/// Run the reset-state command.
async fn run_reset_state(args: cli::ResetStateArgs, work_dir: &Path) -> anyhow::Result<()> {
    let db_path = config::db_path(work_dir);

    if !db_path.exists() {
        println!("No progress database found at {}", db_path.display());
        return Ok(());
    }
    let _lock = InstanceLock::acquire(work_dir).await?;

    if !args.yes {
        println!("This will delete the progress database at:");
        println!("  {}", db_path.display());
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    std::fs::remove_file(&db_path)?;
    println!("Progress database deleted.");

    // Also remove WAL and SHM files if they exist
    let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
    let _ = std::fs::remove_file(db_path.with_extension("db-shm"));

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let work_dir = expand_tilde(&cli.work_dir);
    match cli.command {
        Command::Run(args) => run_packer(args, &cli.work_dir, cli.no_progress_bar).await,
        Command::Status(args) => run_status(args, &work_dir).await,
        Command::ResetSkipped(args) => run_reset_skipped(args, &work_dir).await,
        Command::Verify(args) => run_verify(args, &work_dir).await,
        Command::ImportLegacy(args) => run_import_legacy(args, &work_dir).await,
        Command::ResetState(args) => run_reset_state(args, &work_dir).await,
    }
}
