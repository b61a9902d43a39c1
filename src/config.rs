use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use byte_unit::Byte;
use reqwest::Client;

use crate::catalog::enumerate::EnumerateConfig;
use crate::catalog::resolve::AssetRule;
use crate::pack::layout::ORDINAL_PLACEHOLDER;
use crate::pipeline::PipelineConfig;
use crate::publish::github::GitHubApi;
use crate::publish::{GitIdentity, RemoteConfig};
use crate::retry::RetryConfig;
use crate::types::{PartitionMode, RemoteKind};

/// File name of the progress database inside the work directory.
pub const DB_FILE_NAME: &str = "progress.db";

/// Validated configuration for the `run` command.
pub struct Config {
    pub work_dir: PathBuf,
    pub query: String,
    pub catalog_url: String,
    pub github_api_url: String,
    pub github_host: String,
    pub template: String,
    pub items_dir: String,
    pub primary_ext: String,
    pub cover_exts: Vec<String>,
    pub owner: Option<String>,
    pub token: Option<String>,
    pub local_remote_root: Option<PathBuf>,
    pub identity: GitIdentity,

    pub max_item_bytes: u64,
    pub pack_ceiling: u64,
    pub search_result_cap: u64,
    pub delay: Duration,
    pub timeout: Duration,
    pub retry: RetryConfig,
    pub publish_retry: RetryConfig,

    pub page_size: u32,
    pub redirect_limit: u32,
    pub sweep_rounds: u32,

    pub partition: PartitionMode,
    pub remote: RemoteKind,

    pub require_cover: bool,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("work_dir", &self.work_dir)
            .field("query", &self.query)
            .field("remote", &self.remote)
            .field("owner", &self.owner)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("max_item_bytes", &self.max_item_bytes)
            .field("pack_ceiling", &self.pack_ceiling)
            .finish_non_exhaustive()
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn db_path(work_dir: &Path) -> PathBuf {
    work_dir.join(DB_FILE_NAME)
}

/// Parse a size such as `100MiB`, `1 GB` or `3000000`.
pub fn parse_size(s: &str) -> anyhow::Result<u64> {
    let byte = Byte::parse_str(s, true)
        .map_err(|e| anyhow::anyhow!("Cannot parse '{}' as a size: {}", s, e))?;
    Ok(byte.as_u64())
}

/// Lowercase, without a leading dot.
fn normalize_ext(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

impl Config {
    pub fn from_run_args(
        args: crate::cli::RunArgs,
        work_dir: &str,
        no_progress_bar: bool,
    ) -> anyhow::Result<Self> {
        let max_item_bytes = parse_size(&args.max_item_size).context("--max-item-size")?;
        let pack_ceiling = parse_size(&args.pack_size).context("--pack-size")?;

        if pack_ceiling == 0 {
            anyhow::bail!("--pack-size must be greater than zero");
        }
        if max_item_bytes > pack_ceiling {
            anyhow::bail!(
                "--max-item-size ({}) must not exceed --pack-size ({})",
                args.max_item_size,
                args.pack_size
            );
        }
        if args.page_size == 0 {
            anyhow::bail!("--page-size must be greater than zero");
        }
        if !args.remote_template.contains(ORDINAL_PLACEHOLDER) {
            anyhow::bail!(
                "--remote-template '{}' must contain {}",
                args.remote_template,
                ORDINAL_PLACEHOLDER
            );
        }

        let primary_ext = normalize_ext(&args.primary_ext);
        if primary_ext.is_empty() {
            anyhow::bail!("--primary-ext must not be empty");
        }
        let cover_exts: Vec<String> = args
            .cover_exts
            .iter()
            .map(|e| normalize_ext(e))
            .filter(|e| !e.is_empty() && *e != primary_ext)
            .collect();

        let local_remote_root = args.local_remote_root.as_deref().map(expand_tilde);
        match args.remote {
            RemoteKind::GitHub => {
                if args.owner.as_deref().unwrap_or("").is_empty() {
                    anyhow::bail!("--remote github requires --owner (or PACKER_OWNER)");
                }
                if args.token.as_deref().unwrap_or("").is_empty() {
                    anyhow::bail!("--remote github requires --token (or GH_TOKEN)");
                }
            }
            RemoteKind::Local if local_remote_root.is_none() => {
                anyhow::bail!("--remote local requires --local-remote-root");
            }
            RemoteKind::Local | RemoteKind::None => {}
        }

        let retry_delay = Duration::from_secs(args.retry_delay);
        Ok(Self {
            work_dir: expand_tilde(work_dir),
            query: args.query,
            catalog_url: args.catalog_url,
            github_api_url: args.github_api_url,
            github_host: args.github_host,
            template: args.remote_template,
            items_dir: args.items_dir,
            primary_ext,
            cover_exts,
            owner: args.owner,
            token: args.token,
            local_remote_root,
            identity: GitIdentity {
                name: args.git_name,
                email: args.git_email,
            },
            max_item_bytes,
            pack_ceiling,
            search_result_cap: args.search_result_cap,
            delay: Duration::from_millis(args.delay_ms),
            timeout: Duration::from_secs(args.timeout),
            retry: RetryConfig {
                max_retries: args.max_retries,
                base_delay: retry_delay,
                ..RetryConfig::default()
            },
            publish_retry: RetryConfig {
                max_retries: args.publish_retries,
                base_delay: retry_delay,
                ..RetryConfig::default()
            },
            page_size: args.page_size,
            redirect_limit: args.redirect_limit,
            sweep_rounds: args.sweep_rounds,
            partition: args.partition,
            remote: args.remote,
            require_cover: args.require_cover,
            no_progress_bar,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        db_path(&self.work_dir)
    }

    pub fn asset_rule(&self) -> AssetRule {
        AssetRule {
            primary_ext: self.primary_ext.clone(),
            cover_exts: self.cover_exts.clone(),
            require_cover: self.require_cover,
            max_item_bytes: self.max_item_bytes,
        }
    }

    pub fn enumerate_config(&self) -> EnumerateConfig {
        EnumerateConfig {
            query: self.query.clone(),
            page_size: self.page_size,
            partition: self.partition,
            result_cap: self.search_result_cap,
            retry: self.retry,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            rule: self.asset_rule(),
            pack_ceiling: self.pack_ceiling,
            redirect_limit: self.redirect_limit,
            delay: self.delay,
            sweep_rounds: self.sweep_rounds,
            no_progress_bar: self.no_progress_bar,
        }
    }

    /// Remote settings for the publisher. Validation already guaranteed the
    /// pieces each kind needs.
    pub fn remote_config(&self, client: Client) -> RemoteConfig {
        match self.remote {
            RemoteKind::GitHub => {
                let token = self.token.clone().unwrap_or_default();
                RemoteConfig::GitHub {
                    owner: self.owner.clone().unwrap_or_default(),
                    api: GitHubApi::new(client, &self.github_api_url, &token),
                    token,
                    host: self.github_host.clone(),
                }
            }
            RemoteKind::Local => RemoteConfig::Local {
                root: self.local_remote_root.clone().unwrap_or_default(),
            },
            RemoteKind::None => RemoteConfig::None,
        }
    }
}
