//! Publisher that shells out to `git`.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use super::github::GitHubApi;
use super::{PublishError, PublishOutcome, Publisher};
use crate::pack::PackTarget;
use crate::retry::{self, RetryAction, RetryConfig};

const BRANCH: &str = "main";

/// Where packs are pushed.
#[derive(Clone)]
pub enum RemoteConfig {
    /// `https://<host>/<owner>/<name>.git`, created through the API on demand.
    GitHub {
        owner: String,
        token: String,
        host: String,
        api: GitHubApi,
    },
    /// `<root>/<name>.git` bare repositories.
    Local { root: PathBuf },
    /// Commit locally only.
    None,
}

impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GitHub { owner, host, .. } => f
                .debug_struct("GitHub")
                .field("owner", owner)
                .field("host", host)
                .field("token", &"<redacted>")
                .finish_non_exhaustive(),
            Self::Local { root } => f.debug_struct("Local").field("root", root).finish(),
            Self::None => f.write_str("None"),
        }
    }
}

/// Committer identity written into each pack repository's local config.
#[derive(Debug, Clone)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug)]
struct GitOutput {
    success: bool,
    status: String,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Clone)]
pub struct GitPublisher {
    remote: RemoteConfig,
    identity: GitIdentity,
    retry: RetryConfig,
}

/// Push rejections that a fetch and rebase can resolve. Hook declines and
/// other `[remote rejected]` refusals are not among them.
fn is_conflict(stderr: &str) -> bool {
    ["non-fast-forward", "fetch first"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

fn classify(e: &PublishError) -> RetryAction {
    if e.is_retryable() {
        RetryAction::Retry
    } else {
        RetryAction::Abort
    }
}

impl GitPublisher {
    pub fn new(remote: RemoteConfig, identity: GitIdentity, retry: RetryConfig) -> Self {
        Self {
            remote,
            identity,
            retry,
        }
    }

    fn redact(&self, text: &str) -> String {
        match &self.remote {
            RemoteConfig::GitHub { token, .. } if !token.is_empty() => text.replace(token.as_str(), "***"),
            _ => text.to_string(),
        }
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput, PublishError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(PublishError::Spawn)?;
        Ok(GitOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: self.redact(String::from_utf8_lossy(&output.stderr).trim()),
        })
    }

    /// Run git and fail on a non-zero exit.
    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, PublishError> {
        let out = self.run(dir, args).await?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(PublishError::Git {
                args: self.redact(&args.join(" ")),
                status: out.status,
                stderr: out.stderr,
            })
        }
    }

    /// URL of the pack's remote, creating the remote repository if needed.
    async fn ensure_remote(&self, target: &PackTarget) -> Result<Option<String>, PublishError> {
        match &self.remote {
            RemoteConfig::None => Ok(None),
            RemoteConfig::GitHub {
                owner,
                token,
                host,
                api,
            } => {
                api.ensure_repo(owner, &target.name).await?;
                Ok(Some(format!(
                    "https://x-access-token:{}@{}/{}/{}.git",
                    token, host, owner, target.name
                )))
            }
            RemoteConfig::Local { root } => {
                let bare = root.join(format!("{}.git", target.name));
                if !bare.join("HEAD").exists() {
                    tokio::fs::create_dir_all(&bare)
                        .await
                        .map_err(|e| PublishError::Io {
                            path: bare.clone(),
                            source: e,
                        })?;
                    self.git(&bare, &["init", "--bare", "--quiet"]).await?;
                    self.git(&bare, &["symbolic-ref", "HEAD", "refs/heads/main"])
                        .await?;
                    tracing::info!(remote = %bare.display(), "Created local bare remote");
                }
                Ok(Some(bare.to_string_lossy().into_owned()))
            }
        }
    }

    async fn has_commits(&self, dir: &Path) -> Result<bool, PublishError> {
        Ok(self
            .run(dir, &["rev-parse", "--verify", "--quiet", "HEAD"])
            .await?
            .success)
    }

    /// Bring the local branch on top of the remote after a rejected push.
    /// A failed fetch is a network failure like a failed push.
    async fn rebase_onto_remote(&self, target: &PackTarget) -> Result<(), PublishError> {
        let dir = target.workspace.as_path();
        let fetch = self.run(dir, &["fetch", "--quiet", "origin", BRANCH]).await?;
        if !fetch.success {
            return Err(PublishError::Push {
                name: target.name.clone(),
                stderr: fetch.stderr,
            });
        }
        let rebase = self.run(dir, &["rebase", "origin/main"]).await?;
        if !rebase.success {
            let _ = self.run(dir, &["rebase", "--abort"]).await;
            return Err(PublishError::Git {
                args: "rebase origin/main".into(),
                status: rebase.status,
                stderr: rebase.stderr,
            });
        }
        Ok(())
    }

    async fn push_once(&self, target: &PackTarget) -> Result<(), PublishError> {
        let dir = target.workspace.as_path();
        let out = self
            .run(dir, &["push", "--quiet", "-u", "origin", BRANCH])
            .await?;
        if out.success {
            return Ok(());
        }
        if is_conflict(&out.stderr) {
            tracing::warn!(pack = %target.name, "Push rejected, rebasing onto remote");
            self.rebase_onto_remote(target).await?;
            return Err(PublishError::Conflict {
                name: target.name.clone(),
            });
        }
        Err(PublishError::Push {
            name: target.name.clone(),
            stderr: out.stderr,
        })
    }
}

#[async_trait::async_trait]
impl Publisher for GitPublisher {
    async fn prepare(&self, target: &PackTarget) -> Result<(), PublishError> {
        let dir = target.workspace.as_path();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| PublishError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;

        if !dir.join(".git").exists() {
            self.git(dir, &["init", "--quiet"]).await?;
            self.git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"])
                .await?;
            tracing::debug!(pack = %target.name, "Initialized pack repository");
        }
        self.git(dir, &["config", "user.name", &self.identity.name])
            .await?;
        self.git(dir, &["config", "user.email", &self.identity.email])
            .await?;
        self.git(dir, &["config", "commit.gpgsign", "false"]).await?;

        let remote = retry::retry_with_backoff(
            &self.retry,
            &format!("Remote setup for {}", target.name),
            classify,
            || self.ensure_remote(target),
        )
        .await?;
        if let Some(url) = remote {
            let has_origin = self.run(dir, &["remote", "get-url", "origin"]).await?.success;
            let verb = if has_origin { "set-url" } else { "add" };
            self.git(dir, &["remote", verb, "origin", &url]).await?;
        }
        Ok(())
    }

    async fn publish(&self, target: &PackTarget, message: &str) -> Result<PublishOutcome, PublishError> {
        let dir = target.workspace.as_path();
        let mut outcome = PublishOutcome::default();

        self.git(dir, &["add", "-A"]).await?;
        // Exit code 1 means something is staged.
        let staged = !self
            .run(dir, &["diff", "--cached", "--quiet"])
            .await?
            .success;
        if staged {
            self.git(dir, &["commit", "--quiet", "-m", message]).await?;
            outcome.committed = true;
        } else {
            tracing::debug!(pack = %target.name, "Nothing staged, skipping commit");
        }

        if matches!(self.remote, RemoteConfig::None) || !self.has_commits(dir).await? {
            return Ok(outcome);
        }

        retry::retry_with_backoff(
            &self.retry,
            &format!("Push of {}", target.name),
            classify,
            || self.push_once(target),
        )
        .await?;
        outcome.pushed = true;
        Ok(outcome)
    }
}
