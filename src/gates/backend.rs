//! Shared gate contract and backend selection.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::config::LimiterConfig;
use crate::event::EventKind;
use crate::store::StoreClient;

use super::concurrency::LocalConcurrencyGate;
use super::counter::LocalCounterGate;
use super::rate::LocalRateGate;
use super::remote::{StoreConcurrencyGate, StoreCounterGate, StoreRateGate};

/// Outcome of one gate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Capacity granted
    Granted,
    /// The dimension is exhausted; a normal capacity decision resolved by
    /// the overflow strategy
    Exceeded,
    /// The backend could not decide; the pipeline must fail open past it
    Faulted,
}

/// The limiting dimension a gate enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Concurrency,
    Rate,
    Counter,
}

impl Dimension {
    /// Event emitted when this dimension is exceeded.
    pub fn exceed_event(&self) -> EventKind {
        match self {
            Dimension::Concurrency => EventKind::ConcurrencyExceed,
            Dimension::Rate => EventKind::RateExceed,
            Dimension::Counter => EventKind::CounterExceed,
        }
    }

    /// Event emitted when this dimension's backend faults.
    pub fn fault_event(&self) -> EventKind {
        match self {
            Dimension::Concurrency => EventKind::ConcurrencyFault,
            Dimension::Rate => EventKind::RateFault,
            Dimension::Counter => EventKind::CounterFault,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dimension::Concurrency => "concurrency",
            Dimension::Rate => "rate",
            Dimension::Counter => "counter",
        })
    }
}

/// Gate bounding in-flight calls.
///
/// Every method takes the current config snapshot so one call always sees
/// one configuration version. A granted permit must be released exactly once.
#[async_trait]
pub trait ConcurrencyGate: Send + Sync {
    /// Request `permit_unit` permits, waiting up to the configured timeout.
    async fn try_acquire(&self, config: &LimiterConfig) -> Acquire;

    /// Return `permit_unit` permits. Synchronous so it can run from a drop
    /// guard.
    fn release(&self, config: &LimiterConfig);

    /// Adjust capacity at refresh time without losing permits already
    /// checked out.
    fn apply(&self, _config: &LimiterConfig) {}
}

/// Gate bounding steady-state throughput.
#[async_trait]
pub trait RateGate: Send + Sync {
    /// Request `rate_unit` tokens, waiting up to the configured timeout.
    async fn try_acquire(&self, config: &LimiterConfig) -> Acquire;

    /// Adjust capacity and refill rate at refresh time.
    fn apply(&self, _config: &LimiterConfig) {}
}

/// Gate bounding total calls inside a fixed window. Never blocks.
#[async_trait]
pub trait CounterGate: Send + Sync {
    /// Add `count_unit` to the current window and compare to the ceiling.
    async fn try_acquire(&self, config: &LimiterConfig) -> Acquire;

    /// Reset the window at refresh time.
    fn apply(&self, _config: &LimiterConfig) {}
}

/// One gate per dimension, built by a [`LimiterBackend`].
#[derive(Clone)]
pub struct GateSet {
    /// Concurrency gate
    pub concurrency: Arc<dyn ConcurrencyGate>,
    /// Rate gate
    pub rate: Arc<dyn RateGate>,
    /// Counter gate
    pub counter: Arc<dyn CounterGate>,
}

/// Backend selection for gate construction.
///
/// An explicitly constructed, dependency-injected value: the store client is
/// handed in rather than resolved from ambient state, and the same backend
/// is shared by every limiter a registry creates.
#[derive(Clone)]
pub enum LimiterBackend {
    /// In-process primitives; correct within a single process
    Local,
    /// Atomic scripts executed by a shared store; correct across a cluster
    Store(Arc<dyn StoreClient>),
}

impl LimiterBackend {
    /// Build one gate per dimension.
    pub fn build_gates(&self) -> GateSet {
        match self {
            LimiterBackend::Local => GateSet {
                concurrency: Arc::new(LocalConcurrencyGate::new()),
                rate: Arc::new(LocalRateGate::new()),
                counter: Arc::new(LocalCounterGate::new()),
            },
            LimiterBackend::Store(store) => GateSet {
                concurrency: Arc::new(StoreConcurrencyGate::new(store.clone())),
                rate: Arc::new(StoreRateGate::new(store.clone())),
                counter: Arc::new(StoreCounterGate::new(store.clone())),
            },
        }
    }
}

impl fmt::Debug for LimiterBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimiterBackend::Local => f.write_str("LimiterBackend::Local"),
            LimiterBackend::Store(_) => f.write_str("LimiterBackend::Store"),
        }
    }
}
