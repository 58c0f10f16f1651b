//! Local counter gate.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::config::LimiterConfig;

use super::backend::{Acquire, CounterGate};

/// Fixed-window accumulator bounding total calls within one process.
///
/// Window rollover is an atomic single-owner reset: when the interval has
/// elapsed, exactly one caller wins the compare-exchange on the window start
/// and seeds the accumulator with its own increment; every other caller
/// adds to the current window. No lock serializes the hot path and the gate
/// never blocks.
pub struct LocalCounterGate {
    count: AtomicU64,
    window_start_ms: AtomicU64,
    epoch: Instant,
}

impl LocalCounterGate {
    /// Create a gate whose first window starts now.
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            window_start_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Accumulated count in the current window.
    pub fn current_count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for LocalCounterGate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterGate for LocalCounterGate {
    async fn try_acquire(&self, config: &LimiterConfig) -> Acquire {
        let unit = config.counter.count_unit as u64;
        let interval = config.counter.interval_ms;

        let now = self.now_ms();
        let window_start = self.window_start_ms.load(Ordering::SeqCst);

        let total = if now.saturating_sub(window_start) > interval
            && self
                .window_start_ms
                .compare_exchange(window_start, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            // Rollover winner: the new window holds just this call.
            self.count.store(unit, Ordering::SeqCst);
            unit
        } else {
            self.count.fetch_add(unit, Ordering::SeqCst) + unit
        };

        if total > config.counter.max_count {
            Acquire::Exceeded
        } else {
            Acquire::Granted
        }
    }

    fn apply(&self, _config: &LimiterConfig) {
        // A new counter configuration starts a fresh window.
        self.window_start_ms.store(self.now_ms(), Ordering::SeqCst);
        self.count.store(0, Ordering::SeqCst);
    }
}
