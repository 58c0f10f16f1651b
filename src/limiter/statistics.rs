//! Atomic windowed statistics for admitted traffic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use crate::gates::Dimension;

use super::call::{CallContext, FailureKind, OriginalCall};

/// Per-limiter counters, created with the limiter and living for its
/// lifetime.
///
/// Everything is a lock-free atomic. Windowed counters are drained by
/// [`snapshot_and_reset`](Self::snapshot_and_reset); the `concurrent` gauge
/// is live and only ever read.
#[derive(Debug, Default)]
pub struct LimiterStatistics {
    request: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    concurrent: AtomicI64,
    max_concurrent: AtomicI64,
    total_elapsed_us: AtomicU64,
    max_elapsed_us: AtomicU64,
    timeout_failure: AtomicU64,
    rejected_failure: AtomicU64,
    concurrency_exceed: AtomicU64,
    rate_exceed: AtomicU64,
    counter_exceed: AtomicU64,
}

/// Decrements the live gauge on drop so an early return or cancelled future
/// cannot skip it.
struct GaugeGuard<'a> {
    gauge: &'a AtomicI64,
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::Relaxed);
    }
}

impl LimiterStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Perform the real call while recording timing and outcome.
    ///
    /// The call's own result or error passes through untouched; bookkeeping
    /// is plain atomic arithmetic and cannot fail or mask it.
    pub async fn wrap_call<C: OriginalCall>(
        &self,
        context: &CallContext,
        call: &C,
    ) -> Result<C::Output, C::Error> {
        self.request.fetch_add(1, Ordering::Relaxed);
        let live = self.concurrent.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_concurrent.fetch_max(live, Ordering::Relaxed);
        let _gauge = GaugeGuard {
            gauge: &self.concurrent,
        };

        let start = Instant::now();
        let result = call.call(context).await;
        let elapsed_us = start.elapsed().as_micros() as u64;

        match &result {
            Ok(_) => {
                self.success.fetch_add(1, Ordering::Relaxed);
                self.total_elapsed_us.fetch_add(elapsed_us, Ordering::Relaxed);
                self.max_elapsed_us.fetch_max(elapsed_us, Ordering::Relaxed);
            }
            Err(error) => {
                self.failure.fetch_add(1, Ordering::Relaxed);
                match call.classify(error) {
                    FailureKind::Timeout => {
                        self.timeout_failure.fetch_add(1, Ordering::Relaxed);
                    }
                    FailureKind::Rejected => {
                        self.rejected_failure.fetch_add(1, Ordering::Relaxed);
                    }
                    FailureKind::Other => {}
                }
            }
        }

        result
    }

    /// Record that `dimension` reported exceeded.
    pub fn record_exceed(&self, dimension: Dimension) {
        let counter = match dimension {
            Dimension::Concurrency => &self.concurrency_exceed,
            Dimension::Rate => &self.rate_exceed,
            Dimension::Counter => &self.counter_exceed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Calls currently in flight.
    pub fn live_concurrent(&self) -> i64 {
        self.concurrent.load(Ordering::Relaxed)
    }

    /// Atomically drain the statistics window.
    ///
    /// Every windowed counter is read and zeroed in one step; the live
    /// `concurrent` gauge is read but not reset. Draining twice with no
    /// traffic in between yields all zeroes.
    pub fn snapshot_and_reset(&self) -> HashMap<&'static str, u64> {
        let mut snapshot = HashMap::new();
        snapshot.insert("request", self.request.swap(0, Ordering::Relaxed));
        snapshot.insert("success", self.success.swap(0, Ordering::Relaxed));
        snapshot.insert("failure", self.failure.swap(0, Ordering::Relaxed));
        snapshot.insert(
            "concurrent",
            self.concurrent.load(Ordering::Relaxed).max(0) as u64,
        );
        snapshot.insert(
            "max_concurrent",
            self.max_concurrent.swap(0, Ordering::Relaxed).max(0) as u64,
        );
        snapshot.insert(
            "total_elapsed_us",
            self.total_elapsed_us.swap(0, Ordering::Relaxed),
        );
        snapshot.insert(
            "max_elapsed_us",
            self.max_elapsed_us.swap(0, Ordering::Relaxed),
        );
        snapshot.insert(
            "timeout_failure",
            self.timeout_failure.swap(0, Ordering::Relaxed),
        );
        snapshot.insert(
            "rejected_failure",
            self.rejected_failure.swap(0, Ordering::Relaxed),
        );
        snapshot.insert(
            "concurrency_exceed",
            self.concurrency_exceed.swap(0, Ordering::Relaxed),
        );
        snapshot.insert("rate_exceed", self.rate_exceed.swap(0, Ordering::Relaxed));
        snapshot.insert(
            "counter_exceed",
            self.counter_exceed.swap(0, Ordering::Relaxed),
        );
        snapshot
    }
}
