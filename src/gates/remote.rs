//! Store-coordinated gates.
//!
//! Each gate delegates its whole decision to one atomic script executed by
//! the shared store, because local counters cannot be correct across
//! processes. The gates hold no mutable state of their own; every key begins
//! with the limiter's `identity()`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

use crate::config::LimiterConfig;
use crate::store::{scripts, StoreClient, StoreError};

use super::backend::{Acquire, ConcurrencyGate, CounterGate, Dimension, RateGate};

/// Safety TTL on the shared permit counter; a crashed client's permits are
/// reclaimed after this many seconds without a grant.
const PERMIT_TTL_SECS: i64 = 60;

/// Round-trip bound substituted when a dimension's timeout is zero. A gate
/// must never suspend the pipeline on a hung store; expiry is a fault the
/// pipeline fails open past.
const DEFAULT_ROUND_TRIP: Duration = Duration::from_secs(1);

fn round_trip_bound(configured: Duration) -> Duration {
    if configured.is_zero() {
        DEFAULT_ROUND_TRIP
    } else {
        configured
    }
}

/// Run a script with the round trip bounded even if the client never
/// enforces its own timeout.
async fn bounded_eval(
    store: &dyn StoreClient,
    script: &str,
    keys: &[String],
    args: &[i64],
    configured: Duration,
) -> Result<Vec<i64>, StoreError> {
    let bound = round_trip_bound(configured);
    match tokio::time::timeout(bound, store.eval(script, keys, args, bound)).await {
        Ok(reply) => reply,
        Err(_) => Err(StoreError::Timeout(bound)),
    }
}

/// Milliseconds since the Unix epoch.
fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Map a script reply to an [`Acquire`].
///
/// Replies are `[code, value]`: `0` means exceeded, `1` means granted, and
/// anything else (wrong arity, unknown code, store error, round-trip
/// timeout) is a fault the pipeline fails open past.
fn interpret_reply(
    dimension: Dimension,
    key: &str,
    reply: Result<Vec<i64>, StoreError>,
) -> Acquire {
    match reply {
        Ok(values) => {
            if values.len() != 2 {
                let error =
                    StoreError::MalformedReply(format!("expected [code, value], got {values:?}"));
                warn!(
                    dimension = %dimension,
                    key = %key,
                    error = %error,
                    "Malformed store reply, failing open"
                );
                return Acquire::Faulted;
            }
            match values[0] {
                1 => {
                    trace!(
                        dimension = %dimension,
                        key = %key,
                        remaining = values[1],
                        "Store granted"
                    );
                    Acquire::Granted
                }
                0 => {
                    debug!(
                        dimension = %dimension,
                        key = %key,
                        remaining = values[1],
                        "Store reported dimension exceeded"
                    );
                    Acquire::Exceeded
                }
                code => {
                    warn!(
                        dimension = %dimension,
                        key = %key,
                        code = code,
                        "Unknown store reply code, failing open"
                    );
                    Acquire::Faulted
                }
            }
        }
        Err(error) => {
            warn!(
                dimension = %dimension,
                key = %key,
                error = %error,
                "Store call failed, failing open"
            );
            Acquire::Faulted
        }
    }
}

/// Concurrency gate backed by a bounded increment/decrement in the store.
pub struct StoreConcurrencyGate {
    store: Arc<dyn StoreClient>,
}

impl StoreConcurrencyGate {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    fn key(config: &LimiterConfig) -> String {
        format!("{}:concurrency", config.identity())
    }
}

#[async_trait]
impl ConcurrencyGate for StoreConcurrencyGate {
    async fn try_acquire(&self, config: &LimiterConfig) -> Acquire {
        let key = Self::key(config);
        let args = [
            config.concurrency.permit_unit as i64,
            config.concurrency.max_permit as i64,
            PERMIT_TTL_SECS,
        ];
        let reply = bounded_eval(
            self.store.as_ref(),
            scripts::CONCURRENCY_ACQUIRE,
            std::slice::from_ref(&key),
            &args,
            config.concurrency.timeout(),
        )
        .await;
        interpret_reply(Dimension::Concurrency, &key, reply)
    }

    fn release(&self, config: &LimiterConfig) {
        // Runs from a synchronous drop guard, so the store round trip is
        // spawned fire-and-forget; a failed release is covered by the TTL.
        let store = self.store.clone();
        let key = Self::key(config);
        let unit = config.concurrency.permit_unit as i64;
        tokio::spawn(async move {
            if let Err(error) = bounded_eval(
                store.as_ref(),
                scripts::CONCURRENCY_RELEASE,
                std::slice::from_ref(&key),
                &[unit],
                Duration::ZERO,
            )
            .await
            {
                warn!(
                    key = %key,
                    error = %error,
                    "Failed to release shared permit, TTL will reclaim it"
                );
            }
        });
    }
}

/// Rate gate backed by a fixed one-second window in the store.
pub struct StoreRateGate {
    store: Arc<dyn StoreClient>,
}

impl StoreRateGate {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    fn key(config: &LimiterConfig) -> String {
        let epoch_second = epoch_millis() / 1000;
        format!("{}:rate:{}", config.identity(), epoch_second)
    }
}

#[async_trait]
impl RateGate for StoreRateGate {
    async fn try_acquire(&self, config: &LimiterConfig) -> Acquire {
        let key = Self::key(config);
        let args = [config.rate.rate_unit as i64, config.rate.max_rate as i64];
        let reply = bounded_eval(
            self.store.as_ref(),
            scripts::RATE_ACQUIRE,
            std::slice::from_ref(&key),
            &args,
            config.rate.timeout(),
        )
        .await;
        interpret_reply(Dimension::Rate, &key, reply)
    }
}

/// Counter gate backed by a windowed counter with server-side expiry.
pub struct StoreCounterGate {
    store: Arc<dyn StoreClient>,
}

impl StoreCounterGate {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    fn key(config: &LimiterConfig) -> String {
        // Floor to the window boundary so every process lands on the same key.
        let interval = config.counter.interval_ms.max(1);
        let window_start = (epoch_millis() / interval) * interval;
        format!("{}:counter:{}", config.identity(), window_start)
    }
}

#[async_trait]
impl CounterGate for StoreCounterGate {
    async fn try_acquire(&self, config: &LimiterConfig) -> Acquire {
        let key = Self::key(config);
        let args = [
            config.counter.count_unit as i64,
            config.counter.max_count as i64,
            config.counter.interval_ms as i64,
        ];
        let reply = bounded_eval(
            self.store.as_ref(),
            scripts::COUNTER_ACQUIRE,
            std::slice::from_ref(&key),
            &args,
            config.counter.timeout(),
        )
        .await;
        interpret_reply(Dimension::Counter, &key, reply)
    }
}
