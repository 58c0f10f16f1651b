//! Local concurrency gate.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::trace;

use crate::config::LimiterConfig;

use super::backend::{Acquire, ConcurrencyGate};

/// Capacity bookkeeping guarded by a mutex.
///
/// `debt` counts permits that should have been removed by a shrink but were
/// checked out at the time; releases pay the debt before returning permits
/// to the semaphore.
struct CapacityState {
    capacity: u32,
    debt: u32,
}

/// Counting-semaphore gate bounding in-flight calls within one process.
///
/// The semaphore starts empty; `apply` grows it to `max_permit` on the first
/// refresh and adjusts it on later refreshes without losing permits already
/// checked out.
pub struct LocalConcurrencyGate {
    semaphore: Semaphore,
    state: Mutex<CapacityState>,
}

impl LocalConcurrencyGate {
    /// Create a gate with zero capacity.
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(0),
            state: Mutex::new(CapacityState {
                capacity: 0,
                debt: 0,
            }),
        }
    }

    /// Permits currently available.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for LocalConcurrencyGate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConcurrencyGate for LocalConcurrencyGate {
    async fn try_acquire(&self, config: &LimiterConfig) -> Acquire {
        let units = config.concurrency.permit_unit;
        let timeout = config.concurrency.timeout();

        if timeout.is_zero() {
            return match self.semaphore.try_acquire_many(units) {
                Ok(permit) => {
                    // Release is explicit via `release`, not permit drop.
                    permit.forget();
                    Acquire::Granted
                }
                Err(TryAcquireError::NoPermits) => Acquire::Exceeded,
                Err(TryAcquireError::Closed) => Acquire::Faulted,
            };
        }

        match tokio::time::timeout(timeout, self.semaphore.acquire_many(units)).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Acquire::Granted
            }
            Ok(Err(_)) => Acquire::Faulted,
            Err(_) => Acquire::Exceeded,
        }
    }

    fn release(&self, config: &LimiterConfig) {
        let mut units = config.concurrency.permit_unit;
        let mut state = self.state.lock();
        if state.debt > 0 {
            let paid = state.debt.min(units);
            state.debt -= paid;
            units -= paid;
        }
        if units > 0 {
            self.semaphore.add_permits(units as usize);
        }
    }

    fn apply(&self, config: &LimiterConfig) {
        let target = config.concurrency.max_permit;
        let mut state = self.state.lock();

        if target > state.capacity {
            // Cancel outstanding debt before adding fresh permits.
            let mut grow = target - state.capacity;
            let paid = state.debt.min(grow);
            state.debt -= paid;
            grow -= paid;
            if grow > 0 {
                self.semaphore.add_permits(grow as usize);
            }
        } else if target < state.capacity {
            let shrink = state.capacity - target;
            let forgotten = self.semaphore.forget_permits(shrink as usize) as u32;
            // Permits currently checked out become debt, reclaimed on release.
            state.debt += shrink - forgotten;
        }

        trace!(
            capacity = target,
            debt = state.debt,
            "Applied concurrency capacity"
        );
        state.capacity = target;
    }
}
