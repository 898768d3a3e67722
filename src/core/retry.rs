use crate::core::error::{DownloadError, DownloadResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    /// Delay before the retry following failed attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.interval.as_millis().max(1) as u64;
        let mul = 1u64 << attempt.min(16);
        Duration::from_millis(base.saturating_mul(mul)).min(MAX_BACKOFF)
    }
}

/// Run `attempt_fn` until it succeeds, fails with a non-retryable error, or
/// `policy.max_tries` attempts are used up. The last error is returned as is.
///
/// `on_retry` sees the error and the number of the attempt about to start.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut attempt_fn: F,
    mut on_retry: impl FnMut(&DownloadError, u32),
) -> DownloadResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = DownloadResult<T>>,
{
    let max_tries = policy.max_tries.max(1);
    let mut attempt = 0u32;
    loop {
        let err = match attempt_fn(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if !err.is_retryable() || attempt + 1 >= max_tries {
            return Err(err);
        }

        let delay = policy.backoff(attempt);
        warn!(attempt = attempt + 1, max_tries, error = %err, ?delay, "attempt failed, retrying");
        on_retry(&err, attempt + 1);

        tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
