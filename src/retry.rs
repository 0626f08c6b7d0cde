//! Exponential backoff for remote catalog calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng as _;
use tokio_util::sync::CancellationToken;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Backoff settings. Jitter spreads out concurrent uploads that hit the same
/// rate limit.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_secs: 5,
            max_delay_secs: 60,
        }
    }
}

impl RetryConfig {
    /// No retries at all; a failing call fails immediately.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay_secs: 0,
            max_delay_secs: 0,
        }
    }

    /// Delay before retry number `retry` (0-indexed):
    /// `min(base * 2^retry, max) + jitter(0..base)`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exp_delay = self
            .base_delay_secs
            .saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
        let capped = exp_delay.min(self.max_delay_secs);
        let jitter_ms = if self.base_delay_secs > 0 {
            rand::thread_rng().gen_range(0..self.base_delay_secs * 1000)
        } else {
            0
        };
        Duration::from_secs(capped) + Duration::from_millis(jitter_ms)
    }
}

/// Outcome of [`retry_with_backoff`] when it gives up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The last attempt failed (retries exhausted or error not retryable).
    Failed { attempts: u32, last: E },
    /// `cancel` fired while waiting between attempts.
    Cancelled { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Failed { last, .. } | Self::Cancelled { last, .. } => last,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Failed { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Run `operation` until it succeeds, the classifier aborts, retries run out,
/// or `cancel` fires during a backoff sleep.
///
/// The operation itself is never interrupted mid-flight; cancellation only
/// cuts the wait between attempts.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    classifier: C,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => e,
        };

        if classifier(&err) == RetryAction::Abort || attempt >= total_attempts {
            return Err(RetryError::Failed {
                attempts: attempt,
                last: err,
            });
        }

        let delay = config.delay_for_retry(attempt - 1);
        tracing::warn!(
            "Retryable error (attempt {}/{}), retrying in {:.1}s: {}",
            attempt,
            total_attempts,
            delay.as_secs_f64(),
            err
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    last: err,
                });
            }
        }
    }
}
