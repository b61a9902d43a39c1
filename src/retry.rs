use std::future::Future;
use std::time::Duration;

use rand::Rng as _;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Exponential backoff with jitter, used for catalog search pages and for
/// preparing and pushing packs. Per-item transfers are never retried here; those go through
/// the retry sweeper instead.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts; handy for tests.
    #[cfg(test)]
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-indexed):
    /// `min(base * 2^retry, max) + jitter(0..base)`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
        let capped = exp_ms.min(self.max_delay.as_millis() as u64);
        let jitter = if base_ms > 0 {
            rand::thread_rng().gen_range(0..base_ms)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Run `operation` until it succeeds, the classifier aborts, or
/// `max_retries` retries have been spent. `what` names the operation in logs.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    what: &str,
    classifier: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        let err = match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => e,
        };
        attempt += 1;
        if classifier(&err) == RetryAction::Abort || attempt >= total_attempts {
            return Err(err);
        }
        let delay = config.delay_for_retry(attempt - 1);
        tracing::warn!(
            "{} failed (attempt {}/{}), retrying in {}ms: {}",
            what,
            attempt,
            total_attempts,
            delay.as_millis(),
            err
        );
        tokio::time::sleep(delay).await;
    }
}
