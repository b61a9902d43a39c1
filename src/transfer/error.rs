use std::path::PathBuf;

use thiserror::Error;

use crate::state::SkipReason;

/// Typed transfer errors, classified into item outcomes by [`skip_reason`].
///
/// [`skip_reason`]: TransferError::skip_reason
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Invalid download URL {0}")]
    InvalidUrl(String),

    #[error("More than {limit} redirects fetching {url}")]
    TooManyRedirects { limit: u32, url: String },

    #[error("HTTP {status} redirect without a usable Location from {url}")]
    MissingLocation { status: u16, url: String },

    #[error("Network error fetching {url} after {bytes_written} bytes: {source}")]
    Network {
        url: String,
        bytes_written: u64,
        source: reqwest::Error,
    },

    #[error("{url} exceeds the {limit} byte limit")]
    TooLarge { limit: u64, url: String },

    #[error("SHA-1 mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("Disk error at {path}: {source}")]
    Disk {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl TransferError {
    /// The item outcome this error maps to, or `None` when the error is not
    /// about the item at all and the run must stop.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::HttpStatus { status, .. } if matches!(status, 401 | 403 | 404) => {
                Some(SkipReason::AccessDenied)
            }
            Self::TooLarge { .. } => Some(SkipReason::Oversize),
            Self::Disk { .. } => None,
            Self::HttpStatus { .. }
            | Self::InvalidUrl(_)
            | Self::TooManyRedirects { .. }
            | Self::MissingLocation { .. }
            | Self::Network { .. }
            | Self::ChecksumMismatch { .. } => Some(SkipReason::TransientError),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.skip_reason().is_none()
    }
}
