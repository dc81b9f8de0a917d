//! Rate-limited reporting of sink failures.
//!
//! A sink that fails on every event (disk full, endpoint down) would
//! otherwise flood the agent's own log. [`FailureReporter`] emits at most one
//! `tracing` warning per interval and carries the count of suppressed
//! failures on the next one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default minimum interval between two reports from the same channel.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Reports sink failures, at most once per interval.
#[derive(Debug)]
pub struct FailureReporter {
    min_interval: Duration,
    last_report: Mutex<Option<Instant>>,
    pending: AtomicU64,
    total: AtomicU64,
}

impl Default for FailureReporter {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_INTERVAL)
    }
}

impl FailureReporter {
    /// Creates a reporter with the given interval.
    #[must_use]
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_report: Mutex::new(None),
            pending: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    /// Records a failure and logs it unless another was logged recently.
    ///
    /// Returns true if the failure was logged.
    pub fn report(&self, sink: &str, operation: &str, error: &dyn std::fmt::Display) -> bool {
        self.pending.fetch_add(1, Ordering::Relaxed);
        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;

        let due = {
            let mut last = self.last_report.lock();
            let now = Instant::now();
            match *last {
                Some(at) if now.duration_since(at) < self.min_interval => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };
        if !due {
            return false;
        }

        let count = self.pending.swap(0, Ordering::Relaxed);
        if count > 1 {
            tracing::warn!(
                sink,
                operation,
                error = %error,
                suppressed = count - 1,
                total_failures = total,
                "telemetry sink failure (rate-limited)"
            );
        } else {
            tracing::warn!(
                sink,
                operation,
                error = %error,
                total_failures = total,
                "telemetry sink failure"
            );
        }
        true
    }

    /// Total failures recorded since creation.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}
