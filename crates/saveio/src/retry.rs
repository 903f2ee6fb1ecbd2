// Shared retry-with-backoff logic for playlist and segment fetching.
//
// Implements a linear ramp with a delay cap and cancellable sleeps. The
// upstream transcoder produces segments just-in-time; a 404 or an empty body
// frequently means "not ready yet", so the ramp favours patience over speed.

use crate::error::DownloadError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, counting the initial one.
    pub max_attempts: u32,
    /// Ramp step. Delay after attempt `n` (0-indexed) is `(n + 1) * step`.
    pub delay_step: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Compute the delay to sleep after a failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ramp = self
            .delay_step
            .checked_mul(attempt.saturating_add(1))
            .unwrap_or(self.max_delay);
        ramp.min(self.max_delay)
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed with a retryable error (network, non-2xx, short body).
    Retry(DownloadError),
    /// Operation failed with a non-retryable error (401, I/O).
    Fail(DownloadError),
}

/// Execute an async operation with retry-and-backoff.
///
/// The `operation` closure receives the current attempt number (0-indexed)
/// and returns a [`RetryAction`]. All retryable errors inside the budget are
/// swallowed; exhaustion returns the last cause. The inter-attempt sleep is
/// cancellable through `token`.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, DownloadError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let attempts = policy.max_attempts.max(1);
    for attempt in 0..attempts {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt + 1 >= attempts {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(DownloadError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    // Unreachable: the loop covers every attempt and the last one returns.
    Err(DownloadError::internal("retry loop exited without result"))
}
