use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::publish::PublishError;
use crate::state::StateError;
use crate::transfer::TransferError;

/// Errors that stop the run. Per-item failures never surface here; they are
/// recorded as skips instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("Catalog enumeration failed: {0}")]
    Enumerate(#[from] CatalogError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Transfer(TransferError),

    #[error("Disk error at {path}: {source}")]
    Disk {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl PipelineError {
    pub fn disk(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Disk { path, source }
    }
}
