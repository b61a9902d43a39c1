//! Streaming file transfer with manual redirect handling.
//!
//! The body goes to `<destination>.part` and is renamed into place only after
//! the size cap and checksum pass; every failure path removes the partial.

pub mod error;

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::header::LOCATION;
use reqwest::{Client, StatusCode, Url};
use sha1::{Digest, Sha1};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

pub use error::TransferError;

pub const DEFAULT_REDIRECT_LIMIT: u32 = 5;

#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    /// Hard cap on the body; enforced while streaming.
    pub max_bytes: u64,
    /// Consecutive redirects allowed before giving up.
    pub redirect_limit: u32,
}

#[derive(Debug, Clone)]
pub struct TransferEngine {
    /// Must not follow redirects itself.
    client: Client,
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

fn disk_error(path: &Path) -> impl FnOnce(std::io::Error) -> TransferError {
    let path = path.to_path_buf();
    move |source| TransferError::Disk { path, source }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

impl TransferEngine {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Download `url` to `destination`, returning the bytes written.
    ///
    /// `expected_sha1` (hex) is checked against the streamed bytes when given.
    pub async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        limits: TransferLimits,
        expected_sha1: Option<&str>,
    ) -> Result<u64, TransferError> {
        let part = part_path(destination);
        let result = self
            .attempt(url, destination, &part, limits, expected_sha1)
            .await;
        if result.is_err() {
            // The partial may not exist yet.
            let _ = fs::remove_file(&part).await;
        }
        result
    }

    async fn open_response(
        &self,
        url: &str,
        redirect_limit: u32,
    ) -> Result<reqwest::Response, TransferError> {
        let mut current = Url::parse(url).map_err(|_| TransferError::InvalidUrl(url.to_string()))?;
        let mut redirects = 0u32;

        loop {
            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| TransferError::Network {
                    url: current.to_string(),
                    bytes_written: 0,
                    source: e,
                })?;
            let status = response.status();

            if is_redirect(status) {
                redirects += 1;
                if redirects > redirect_limit {
                    return Err(TransferError::TooManyRedirects {
                        limit: redirect_limit,
                        url: url.to_string(),
                    });
                }
                let next = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|loc| current.join(loc).ok())
                    .ok_or_else(|| TransferError::MissingLocation {
                        status: status.as_u16(),
                        url: current.to_string(),
                    })?;
                tracing::debug!(from = %current, to = %next, "Following redirect {}", redirects);
                current = next;
                continue;
            }

            if status != StatusCode::OK {
                return Err(TransferError::HttpStatus {
                    status: status.as_u16(),
                    url: current.to_string(),
                });
            }
            return Ok(response);
        }
    }

    async fn attempt(
        &self,
        url: &str,
        destination: &Path,
        part: &Path,
        limits: TransferLimits,
        expected_sha1: Option<&str>,
    ) -> Result<u64, TransferError> {
        let response = self.open_response(url, limits.redirect_limit).await?;

        if let Some(len) = response.content_length() {
            if len > limits.max_bytes {
                return Err(TransferError::TooLarge {
                    limit: limits.max_bytes,
                    url: url.to_string(),
                });
            }
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await.map_err(disk_error(parent))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(part)
            .await
            .map_err(disk_error(part))?;

        let mut hasher = Sha1::new();
        let mut bytes_written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransferError::Network {
                url: url.to_string(),
                bytes_written,
                source: e,
            })?;
            if bytes_written + chunk.len() as u64 > limits.max_bytes {
                return Err(TransferError::TooLarge {
                    limit: limits.max_bytes,
                    url: url.to_string(),
                });
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(disk_error(part))?;
            bytes_written += chunk.len() as u64;
        }
        file.flush().await.map_err(disk_error(part))?;
        file.sync_all().await.map_err(disk_error(part))?;
        drop(file);

        if let Some(expected) = expected_sha1 {
            let actual = format!("{:x}", hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(TransferError::ChecksumMismatch {
                    url: url.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        fs::rename(part, destination)
            .await
            .map_err(disk_error(destination))?;
        tracing::debug!(url, bytes = bytes_written, "Transfer complete");
        Ok(bytes_written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::build_http_client;
    use crate::state::SkipReason;
    use crate::testutil::FakeArchive;
    use std::time::Duration;

    const LIMITS: TransferLimits = TransferLimits {
        max_bytes: 1_000,
        redirect_limit: DEFAULT_REDIRECT_LIMIT,
    };

    fn engine() -> TransferEngine {
        TransferEngine::new(build_http_client(Duration::from_secs(5)).unwrap())
    }

    fn assert_no_partials(dir: &Path) {
        let leftovers: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty(), "partial files left: {leftovers:?}");
    }

    #[test]
    fn test_part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/a/b/game.swf")),
            PathBuf::from("/a/b/game.swf.part")
        );
    }

    #[tokio::test]
    async fn test_fetch_writes_file() {
        let fake = FakeArchive::new();
        fake.add_item("item", &[("item.swf", Some(300))]);
        let server = fake.serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out/item.swf");

        let n = engine()
            .fetch(&server.download_url("item", "item.swf"), &dest, LIMITS, None)
            .await
            .unwrap();
        assert_eq!(n, 300);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 300);
        assert_no_partials(dest.parent().unwrap());
    }

    #[tokio::test]
    async fn test_five_redirects_succeed() {
        let fake = FakeArchive::new();
        fake.add_item("item", &[("item.swf", Some(10))]);
        fake.redirect("item", "item.swf", 5);
        let server = fake.serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("item.swf");

        let n = engine()
            .fetch(&server.download_url("item", "item.swf"), &dest, LIMITS, None)
            .await
            .unwrap();
        assert_eq!(n, 10);
    }

    #[tokio::test]
    async fn test_six_redirects_are_transient() {
        let fake = FakeArchive::new();
        fake.add_item("item", &[("item.swf", Some(10))]);
        fake.redirect("item", "item.swf", 6);
        let server = fake.serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("item.swf");

        let err = engine()
            .fetch(&server.download_url("item", "item.swf"), &dest, LIMITS, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::TooManyRedirects { limit: 5, .. }));
        assert_eq!(err.skip_reason(), Some(SkipReason::TransientError));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_forbidden_is_access_denied() {
        let fake = FakeArchive::new();
        fake.add_item("item", &[("item.swf", Some(10))]);
        fake.fail_download("item", "item.swf", 403, u32::MAX);
        let server = fake.serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("item.swf");

        let err = engine()
            .fetch(&server.download_url("item", "item.swf"), &dest, LIMITS, None)
            .await
            .unwrap_err();
        assert_eq!(err.skip_reason(), Some(SkipReason::AccessDenied));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let fake = FakeArchive::new();
        fake.add_item("item", &[("item.swf", Some(10))]);
        fake.fail_download("item", "item.swf", 503, 1);
        let server = fake.serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("item.swf");
        let url = server.download_url("item", "item.swf");

        let err = engine().fetch(&url, &dest, LIMITS, None).await.unwrap_err();
        assert_eq!(err.skip_reason(), Some(SkipReason::TransientError));

        // The injected failure was one-shot.
        assert_eq!(engine().fetch(&url, &dest, LIMITS, None).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_body_over_cap_is_oversize_and_cleaned_up() {
        let fake = FakeArchive::new();
        // Declared size lies; the body is larger than the cap.
        fake.add_file_with_body("item", "item.swf", Some(10), vec![7u8; 2_000]);
        fake.hide_content_length("item", "item.swf");
        let server = fake.serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("item.swf");

        let err = engine()
            .fetch(&server.download_url("item", "item.swf"), &dest, LIMITS, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::TooLarge { limit: 1_000, .. }));
        assert!(!dest.exists());
        assert_no_partials(dir.path());
    }

    #[tokio::test]
    async fn test_content_length_over_cap_rejected_before_streaming() {
        let fake = FakeArchive::new();
        fake.add_file_with_body("item", "item.swf", None, vec![1u8; 1_001]);
        let server = fake.serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("item.swf");

        let err = engine()
            .fetch(&server.download_url("item", "item.swf"), &dest, LIMITS, None)
            .await
            .unwrap_err();
        assert_eq!(err.skip_reason(), Some(SkipReason::Oversize));
    }

    #[tokio::test]
    async fn test_sha1_verified() {
        let fake = FakeArchive::new();
        fake.add_file_with_body("item", "item.swf", Some(3), b"abc".to_vec());
        let server = fake.serve().await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("item.swf");
        let url = server.download_url("item", "item.swf");

        // sha1("abc")
        let good = "A9993E364706816ABA3E25717850C26C9CD0D89D";
        assert_eq!(
            engine().fetch(&url, &dest, LIMITS, Some(good)).await.unwrap(),
            3
        );

        let bad = "0000000000000000000000000000000000000000";
        let err = engine()
            .fetch(&url, &dest, LIMITS, Some(bad))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
        assert_eq!(err.skip_reason(), Some(SkipReason::TransientError));
        assert_no_partials(dir.path());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x.swf");
        // Port 9 on localhost is not served by anything in the test env.
        let err = engine()
            .fetch("http://127.0.0.1:9/x.swf", &dest, LIMITS, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Network { .. }));
        assert_eq!(err.skip_reason(), Some(SkipReason::TransientError));
    }
}
