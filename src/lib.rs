//! Floodgate - Multi-Dimensional Admission Control
//!
//! This crate implements an admission-control engine that wraps an arbitrary
//! unit of work and decides whether to admit, delay, or reject it along three
//! independent dimensions: instantaneous concurrency, steady-state rate, and
//! counted requests per fixed window. When a dimension trips, a configurable
//! overflow strategy decides what happens to the call.
//!
//! Gates come in two interchangeable backends: in-process primitives for a
//! single process, and atomic scripts executed by a shared key-value store
//! when the decision must be correct across a cluster.

pub mod collector;
pub mod config;
pub mod error;
pub mod event;
pub mod gates;
pub mod limiter;
pub mod registry;
pub mod store;

pub use config::{
    ConcurrencyConfig, CounterConfig, LimiterConfig, OverflowStrategy, RateConfig, Switch,
};
pub use error::{FloodgateError, Result};
pub use event::{EventKind, EventSink, TracingEventSink};
pub use gates::{Acquire, Dimension, LimiterBackend};
pub use limiter::{
    CallContext, CallError, FailureKind, FnCall, LimitExceeded, Limiter, LimiterStatistics,
    OriginalCall,
};
pub use registry::LimiterRegistry;
pub use store::{StoreClient, StoreError};
