use clap::{Args, Parser, Subcommand};

use crate::catalog::DEFAULT_BASE_URL;
use crate::pack::layout::{DEFAULT_ITEMS_DIR, DEFAULT_TEMPLATE};
use crate::publish::github::DEFAULT_API_BASE;
use crate::state::SkipReason;
use crate::types::*;

#[derive(Parser, Debug)]
#[command(
    name = "catalog-packer",
    about = "Mirror a public archive catalog into size-bounded, versioned packs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding the progress database and pack workspaces
    #[arg(short = 'w', long, global = true, default_value = "~/.catalog-packer")]
    pub work_dir: String,

    /// Log level (RUST_LOG overrides)
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Disable progress bar
    #[arg(long, global = true)]
    pub no_progress_bar: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enumerate the catalog, pack every new item and publish
    Run(RunArgs),

    /// Show progress: open pack, counts by outcome, sealed packs, last run
    Status(StatusArgs),

    /// Clear skips so the next run reconsiders those items
    ResetSkipped(ResetSkippedArgs),

    /// Check completed items against the files in their pack workspaces
    Verify(VerifyArgs),

    /// Import a legacy progress.json and skip lists into the progress database
    ImportLegacy(ImportLegacyArgs),

    /// Delete the progress database
    ResetState(ResetStateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Catalog search query
    #[arg(short = 'q', long, default_value = "collection:softwarelibrary_flash_games")]
    pub query: String,

    /// Results requested per search page
    #[arg(long, default_value_t = 1000)]
    pub page_size: u32,

    /// How to split the query past the upstream result cap
    #[arg(long, value_enum, default_value = "auto")]
    pub partition: PartitionMode,

    /// Results the upstream search pages through for one query
    #[arg(long, default_value_t = 10_000)]
    pub search_result_cap: u64,

    /// Extension of the primary asset
    #[arg(long, default_value = "swf")]
    pub primary_ext: String,

    /// Accepted cover extensions (repeatable)
    #[arg(long = "cover-ext", default_values = ["png", "jpg", "jpeg", "gif"])]
    pub cover_exts: Vec<String>,

    /// Skip items that have no downloadable cover
    #[arg(long)]
    pub require_cover: bool,

    /// Largest primary asset accepted (e.g. 100MiB)
    #[arg(long, default_value = "100MiB")]
    pub max_item_size: String,

    /// Pack size ceiling (e.g. 1GiB)
    #[arg(long, default_value = "1GiB")]
    pub pack_size: String,

    /// Pause between items, in milliseconds
    #[arg(long, default_value_t = 1200)]
    pub delay_ms: u64,

    /// Redirects followed per download
    #[arg(long, default_value_t = 5)]
    pub redirect_limit: u32,

    /// Passes over transient failures after the main pass
    #[arg(long, default_value_t = 3)]
    pub sweep_rounds: u32,

    /// Pack name template; must contain {ordinal}
    #[arg(long, default_value = DEFAULT_TEMPLATE)]
    pub remote_template: String,

    /// Directory inside each pack that holds item directories
    #[arg(long, default_value = DEFAULT_ITEMS_DIR)]
    pub items_dir: String,

    /// Where packs are pushed
    #[arg(long, value_enum, default_value = "github")]
    pub remote: RemoteKind,

    /// GitHub account owning the pack repositories
    #[arg(long, env = "PACKER_OWNER")]
    pub owner: Option<String>,

    /// GitHub token.
    /// WARNING: passing via --token is visible in process listings.
    /// Prefer the GH_TOKEN environment variable instead.
    #[arg(long, env = "GH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Git host for GitHub remotes
    #[arg(long, default_value = "github.com")]
    pub github_host: String,

    /// Root directory for bare repositories with --remote local
    #[arg(long)]
    pub local_remote_root: Option<String>,

    /// Push and API retries before a publish failure stops the run
    #[arg(long, default_value_t = 3)]
    pub publish_retries: u32,

    /// Retries per search page before enumeration fails
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Base delay between retries, in seconds
    #[arg(long, default_value_t = 2)]
    pub retry_delay: u64,

    /// Catalog base URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub catalog_url: String,

    /// GitHub API base URL
    #[arg(long, default_value = DEFAULT_API_BASE)]
    pub github_api_url: String,

    /// HTTP connect and read timeout, in seconds
    #[arg(long, default_value_t = 60)]
    pub timeout: u64,

    /// Committer name written into each pack repository
    #[arg(long, default_value = "github-actions[bot]")]
    pub git_name: String,

    /// Committer email written into each pack repository
    #[arg(
        long,
        default_value = "41898282+github-actions[bot]@users.noreply.github.com"
    )]
    pub git_email: String,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// List skipped items with their reasons
    #[arg(long)]
    pub skipped: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResetSkippedArgs {
    /// Reasons to reset (repeatable); all reasons when omitted
    #[arg(long = "reason", value_enum)]
    pub reasons: Vec<SkipReason>,
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    /// Pack name template used by the runs being verified
    #[arg(long, default_value = DEFAULT_TEMPLATE)]
    pub remote_template: String,

    /// Directory inside each pack that holds item directories
    #[arg(long, default_value = DEFAULT_ITEMS_DIR)]
    pub items_dir: String,
}

#[derive(Args, Debug, Clone)]
pub struct ImportLegacyArgs {
    /// Directory containing progress.json and optional skip lists
    #[arg(default_value = ".")]
    pub dir: String,

    /// Replace existing progress instead of refusing
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResetStateArgs {
    /// Skip confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_defaults() {
        let cli = Cli::try_parse_from(["catalog-packer", "run"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.page_size, 1000);
        assert_eq!(args.partition, PartitionMode::Auto);
        assert_eq!(args.max_item_size, "100MiB");
        assert_eq!(args.pack_size, "1GiB");
        assert_eq!(args.delay_ms, 1200);
        assert_eq!(args.redirect_limit, 5);
        assert_eq!(args.remote, RemoteKind::GitHub);
        assert_eq!(args.cover_exts, vec!["png", "jpg", "jpeg", "gif"]);
        assert_eq!(cli.log_level, LogLevel::Info);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "catalog-packer",
            "status",
            "--skipped",
            "--work-dir",
            "/tmp/w",
            "--log-level",
            "warn",
        ])
        .unwrap();
        assert_eq!(cli.work_dir, "/tmp/w");
        assert_eq!(cli.log_level, LogLevel::Warn);
        assert!(matches!(cli.command, Command::Status(StatusArgs { skipped: true })));
    }

    #[test]
    fn test_reset_skipped_reasons() {
        let cli = Cli::try_parse_from([
            "catalog-packer",
            "reset-skipped",
            "--reason",
            "oversize",
            "--reason",
            "no-asset",
        ])
        .unwrap();
        let Command::ResetSkipped(args) = cli.command else {
            panic!("expected reset-skipped");
        };
        assert_eq!(args.reasons, vec![SkipReason::Oversize, SkipReason::NoAsset]);
    }

    #[test]
    fn test_remote_and_partition_values() {
        let cli = Cli::try_parse_from([
            "catalog-packer",
            "run",
            "--remote",
            "local",
            "--partition",
            "prefix",
            "--cover-ext",
            "webp",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.remote, RemoteKind::Local);
        assert_eq!(args.partition, PartitionMode::Prefix);
        assert_eq!(args.cover_exts, vec!["webp"]);
    }
}
