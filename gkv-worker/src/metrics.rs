//! # Worker Metrics
//!
//! Lightweight atomic counters for the worker's request handling and data
//! plane. Relaxed ordering throughout: the counters are independent and
//! only read as point-in-time snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of all worker counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub kernels: u64,
    pub flushed_entries: u64,
    pub iterator_batches: u64,
}

/// Thread-safe counter set for one worker.
#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    errors: AtomicU64,
    kernels: AtomicU64,
    flushed_entries: AtomicU64,
    iterator_batches: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    /// Records one accepted request frame.
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one error response frame.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one kernel invocation, failed or not.
    pub fn record_kernel(&self) {
        self.kernels.fetch_add(1, Ordering::Relaxed);
    }

    /// Records entries shipped by a flush.
    pub fn record_flushed(&self, entries: u64) {
        self.flushed_entries.fetch_add(entries, Ordering::Relaxed);
    }

    /// Records one served iterator batch.
    pub fn record_iterator_batch(&self) {
        self.iterator_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            kernels: self.kernels.load(Ordering::Relaxed),
            flushed_entries: self.flushed_entries.load(Ordering::Relaxed),
            iterator_batches: self.iterator_batches.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_error();
        metrics.record_kernel();
        metrics.record_flushed(42);
        metrics.record_iterator_batch();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.kernels, 1);
        assert_eq!(snapshot.flushed_entries, 42);
        assert_eq!(snapshot.iterator_batches, 1);
    }
}
