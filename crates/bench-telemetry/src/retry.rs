//! Bounded retry with linear backoff for sink I/O.
//!
//! File writes compete with other processes (log shippers, antivirus
//! scanners, tail readers) for the same files. Those failures clear up on
//! their own, so sinks wrap their I/O in [`RetryPolicy::run`].

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

/// Errors that can be retried.
pub trait RetryableError {
    /// Whether this error is transient and worth another attempt.
    fn is_retryable(&self) -> bool;
}

/// Retry policy for sink I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff unit. The wait before retry `n` is `n * backoff`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given retry count and backoff unit.
    #[must_use]
    pub const fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before the given retry (1-based).
    #[must_use]
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        self.backoff.saturating_mul(retry.max(1))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// retries are exhausted. The last error is returned on exhaustion.
    pub async fn run<F, Fut, T, E>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && retry < self.max_retries => {
                    retry += 1;
                    let delay = self.backoff_delay(retry);
                    debug!(
                        operation,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying after backoff"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    warn!(operation, retries = retry, error = %err, "giving up");
                    return Err(err);
                }
            }
        }
    }
}
