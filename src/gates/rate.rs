//! Local rate gate.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::config::LimiterConfig;

use super::backend::{Acquire, RateGate};

/// Token-bucket state. The mutex is never held across an await.
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

enum Decision {
    Ready,
    Wait(Duration),
    Exhausted,
}

/// Token-bucket gate bounding throughput within one process.
///
/// Capacity is one second of `max_rate`; tokens replenish continuously from
/// elapsed time. A caller short on tokens fails immediately with a zero
/// timeout, fails when the required wait exceeds the timeout, or reserves
/// the tokens and sleeps out the deficit.
pub struct LocalRateGate {
    bucket: Mutex<Bucket>,
}

impl LocalRateGate {
    /// Create a gate with an empty bucket; `apply` fills it on refresh.
    pub fn new() -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: 0.0,
                last_refill: Instant::now(),
            }),
        }
    }
}

impl Default for LocalRateGate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateGate for LocalRateGate {
    async fn try_acquire(&self, config: &LimiterConfig) -> Acquire {
        // A zero rate admits nothing and would make the deficit wait
        // unbounded; refuse outright.
        if config.rate.max_rate == 0 {
            return Acquire::Exceeded;
        }

        let need = config.rate.rate_unit as f64;
        let rate = config.rate.max_rate as f64;
        let capacity = config.rate.max_rate as f64;
        let timeout = config.rate.timeout();

        let decision = {
            let mut bucket = self.bucket.lock();
            let elapsed = bucket.last_refill.elapsed().as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
            bucket.last_refill = Instant::now();

            if bucket.tokens >= need {
                bucket.tokens -= need;
                Decision::Ready
            } else {
                let deficit = need - bucket.tokens;
                let wait = Duration::from_secs_f64(deficit / rate);
                if timeout.is_zero() || wait > timeout {
                    Decision::Exhausted
                } else {
                    // Reserve now; the balance goes negative until the
                    // deficit is slept out.
                    bucket.tokens -= need;
                    Decision::Wait(wait)
                }
            }
        };

        match decision {
            Decision::Ready => Acquire::Granted,
            Decision::Wait(wait) => {
                trace!(wait_ms = wait.as_millis() as u64, "Waiting for rate tokens");
                tokio::time::sleep(wait).await;
                Acquire::Granted
            }
            Decision::Exhausted => Acquire::Exceeded,
        }
    }

    fn apply(&self, config: &LimiterConfig) {
        // A new rate configuration starts with a full bucket.
        let mut bucket = self.bucket.lock();
        bucket.tokens = config.rate.max_rate as f64;
        bucket.last_refill = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;

    fn config(max_rate: u32, rate_unit: u32, timeout_ms: u64) -> LimiterConfig {
        let yaml = format!(
            "node: n\napplication: a\ngroup: g\ntag: t\nrate:\n  enable: on\n  rate_unit: {rate_unit}\n  max_rate: {max_rate}\n  timeout_ms: {timeout_ms}\n"
        );
        LimiterConfig::from_yaml(&yaml).unwrap()
    }

    #[tokio::test]
    async fn test_burst_up_to_capacity() {
        let gate = LocalRateGate::new();
        let config = config(5, 1, 0);
        gate.apply(&config);

        for _ in 0..5 {
            assert_eq!(gate.try_acquire(&config).await, Acquire::Granted);
        }
        assert_eq!(gate.try_acquire(&config).await, Acquire::Exceeded);
    }

    #[tokio::test]
    async fn test_tokens_replenish_over_time() {
        let gate = LocalRateGate::new();
        let config = config(100, 1, 0);
        gate.apply(&config);

        for _ in 0..100 {
            assert_eq!(gate.try_acquire(&config).await, Acquire::Granted);
        }
        assert_eq!(gate.try_acquire(&config).await, Acquire::Exceeded);

        // 100 tokens/s replenishes ~5 tokens in 50ms.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(gate.try_acquire(&config).await, Acquire::Granted);
    }

    #[tokio::test]
    async fn test_bounded_wait_grants_within_timeout() {
        let gate = LocalRateGate::new();
        let config = config(100, 1, 200);
        gate.apply(&config);

        for _ in 0..100 {
            assert_eq!(gate.try_acquire(&config).await, Acquire::Granted);
        }

        // One token deficit at 100 tokens/s needs ~10ms, inside the 200ms
        // timeout, so the call waits and is granted.
        let start = Instant::now();
        assert_eq!(gate.try_acquire(&config).await, Acquire::Granted);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_wait_longer_than_timeout_is_exceeded() {
        let gate = LocalRateGate::new();
        let config = config(1, 1, 100);
        gate.apply(&config);

        assert_eq!(gate.try_acquire(&config).await, Acquire::Granted);
        // Next token is a full second away, far beyond the 100ms timeout.
        assert_eq!(gate.try_acquire(&config).await, Acquire::Exceeded);
    }

    #[tokio::test]
    async fn test_zero_rate_never_grants() {
        let gate = LocalRateGate::new();
        // Bypasses validation on purpose: the gate must still refuse
        // cleanly rather than divide by zero.
        let config = config(0, 1, 100);
        gate.apply(&config);

        assert_eq!(gate.try_acquire(&config).await, Acquire::Exceeded);
        assert_eq!(gate.try_acquire(&config).await, Acquire::Exceeded);
    }

    #[tokio::test]
    async fn test_apply_refills_bucket() {
        let gate = LocalRateGate::new();
        let config = config(3, 1, 0);
        gate.apply(&config);

        for _ in 0..3 {
            assert_eq!(gate.try_acquire(&config).await, Acquire::Granted);
        }
        assert_eq!(gate.try_acquire(&config).await, Acquire::Exceeded);

        gate.apply(&config);
        assert_eq!(gate.try_acquire(&config).await, Acquire::Granted);
    }
}
