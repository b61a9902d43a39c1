//! Single-instance lock on the work directory.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use super::error::StateError;

pub const LOCK_FILE_NAME: &str = "progress.lock";

/// Exclusive advisory lock held for as long as this value lives.
///
/// Two pipelines sharing one work directory would both append to the same
/// open pack, so every command that mutates progress takes this first.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock in `work_dir`, failing fast if another instance holds it.
    pub async fn acquire(work_dir: &Path) -> Result<Self, StateError> {
        let path = work_dir.join(LOCK_FILE_NAME);
        tokio::task::spawn_blocking(move || {
            let file = File::create(&path).map_err(|e| StateError::LockIo {
                path: path.clone(),
                source: e,
            })?;
            file.try_lock_exclusive()
                .map_err(|_| StateError::Locked(path.clone()))?;
            Ok(Self { file, path })
        })
        .await?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::debug!("Failed to release {}: {}", self.path.display(), e);
        }
    }
}
