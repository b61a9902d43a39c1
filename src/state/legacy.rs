//! Import of the legacy JSON progress file and its plain-text skip lists.
//!
//! The legacy format is `{"pack": N, "sizeMB": F, "completed": [...]}` (some
//! copies spell the list `done`), plus `skipped_auth.txt` and
//! `skipped_large.txt` holding one identifier per line.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use super::types::{OpenPack, ProgressState, SkipReason};

pub const LEGACY_PROGRESS_FILE: &str = "progress.json";
pub const LEGACY_SKIP_AUTH_FILE: &str = "skipped_auth.txt";
pub const LEGACY_SKIP_LARGE_FILE: &str = "skipped_large.txt";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Error, Debug)]
pub enum LegacyError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed legacy progress file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Legacy progress has invalid pack ordinal {0}")]
    InvalidPack(u32),
}

#[derive(Debug, Deserialize)]
struct LegacyProgress {
    #[serde(default = "default_pack")]
    pack: u32,
    #[serde(rename = "sizeMB", default)]
    size_mb: f64,
    #[serde(alias = "done", default)]
    completed: Vec<String>,
}

fn default_pack() -> u32 {
    1
}

/// Parse a legacy progress document plus optional skip-list contents.
///
/// Identifiers that appear both completed and in a skip list stay completed.
pub fn parse_legacy(
    progress_json: &str,
    skipped_auth: Option<&str>,
    skipped_large: Option<&str>,
) -> Result<ProgressState, LegacyError> {
    let legacy: LegacyProgress = serde_json::from_str(progress_json)?;
    if legacy.pack == 0 {
        return Err(LegacyError::InvalidPack(0));
    }

    let mut state = ProgressState {
        pack: OpenPack {
            ordinal: legacy.pack,
            size_bytes: (legacy.size_mb.max(0.0) * BYTES_PER_MB).round() as u64,
        },
        ..Default::default()
    };
    state.completed.extend(legacy.completed);

    let lists = [
        (skipped_auth, SkipReason::AccessDenied),
        (skipped_large, SkipReason::Oversize),
    ];
    for (contents, reason) in lists {
        let Some(contents) = contents else { continue };
        for id in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !state.completed.contains(id) {
                state.skipped.insert(id.to_string(), reason);
            }
        }
    }

    Ok(state)
}

async fn read_optional(path: &Path) -> Result<Option<String>, LegacyError> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LegacyError::Read {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Read the legacy progress file and sibling skip lists from `dir`.
pub async fn read_legacy_dir(dir: &Path) -> Result<ProgressState, LegacyError> {
    let progress_path = dir.join(LEGACY_PROGRESS_FILE);
    let progress = tokio::fs::read_to_string(&progress_path)
        .await
        .map_err(|e| LegacyError::Read {
            path: progress_path.clone(),
            source: e,
        })?;
    let auth = read_optional(&dir.join(LEGACY_SKIP_AUTH_FILE)).await?;
    let large = read_optional(&dir.join(LEGACY_SKIP_LARGE_FILE)).await?;
    parse_legacy(&progress, auth.as_deref(), large.as_deref())
}
