//! Counters reported by the subprocess step.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for a [`SubprocessStep`](crate::SubprocessStep).
///
/// Shared behind an `Arc` so a pipeline can read them while batches run.
#[derive(Debug, Default)]
pub struct StepMetrics {
    count: AtomicU64,
    error: AtomicU64,
    sent: AtomicU64,
    batch_sent: AtomicU64,
}

/// Point-in-time copy of [`StepMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Parts seen by the step.
    pub count: u64,
    /// Failed exchanges.
    pub error: u64,
    /// Successful exchanges.
    pub sent: u64,
    /// Batches completed.
    pub batch_sent: u64,
}

impl StepMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr_count(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr_error(&self) {
        self.error.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn incr_batch_sent(&self) {
        self.batch_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            count: self.count.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            batch_sent: self.batch_sent.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = StepMetrics::new();
        metrics.incr_count(3);
        metrics.incr_sent();
        metrics.incr_sent();
        metrics.incr_error();
        metrics.incr_batch_sent();
        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                count: 3,
                error: 1,
                sent: 2,
                batch_sent: 1,
            }
        );
    }
}
