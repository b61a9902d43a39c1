use thiserror::Error;

/// Errors talking to the catalog's search and metadata endpoints.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Request to {url} failed: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Malformed response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl CatalogError {
    /// Whether a repeat of the same request could plausibly succeed.
    ///
    /// Malformed bodies count as transient: the catalog serves HTML error
    /// pages with a 200 when overloaded.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { .. } | Self::Decode { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }
}
