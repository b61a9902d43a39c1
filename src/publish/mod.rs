//! Publishing packs to a versioned remote.
//!
//! [`Publisher`] is the seam the pipeline talks to; [`git::GitPublisher`] is
//! the real implementation. Publishing the same pack twice is harmless: with
//! nothing staged it only re-pushes, which is how a crash between saving
//! progress and publishing is recovered.

pub mod git;
pub mod github;

use thiserror::Error;

use crate::pack::PackTarget;

pub use git::{GitIdentity, GitPublisher, RemoteConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// A new commit was created.
    pub committed: bool,
    /// The branch was pushed to the remote.
    pub pushed: bool,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Failed to run git: {0}")]
    Spawn(std::io::Error),

    #[error("git {args} failed ({status}): {stderr}")]
    Git {
        args: String,
        status: String,
        stderr: String,
    },

    #[error("Push of {name} rejected: remote has diverged")]
    Conflict { name: String },

    #[error("Push of {name} failed: {stderr}")]
    Push { name: String, stderr: String },

    #[error("GitHub API returned {status} for {what}: {message}")]
    Api {
        status: u16,
        what: String,
        message: String,
    },

    #[error("GitHub API request failed: {0}")]
    Http(String),

    #[error("Failed to prepare {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

impl PublishError {
    /// Conflicts and network-level failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. } | Self::Push { .. } | Self::Http(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Spawn(_) | Self::Git { .. } | Self::Io { .. } => false,
        }
    }
}

#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    /// Make the pack's workspace a repository wired to its remote. Idempotent.
    async fn prepare(&self, target: &PackTarget) -> Result<(), PublishError>;

    /// Commit whatever changed in the workspace and push it.
    async fn publish(&self, target: &PackTarget, message: &str) -> Result<PublishOutcome, PublishError>;
}
