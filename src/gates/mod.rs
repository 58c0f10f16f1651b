//! Admission gates: one check per limiting dimension.

mod backend;
mod concurrency;
mod counter;
mod rate;
mod remote;

pub use backend::{Acquire, ConcurrencyGate, CounterGate, Dimension, GateSet, LimiterBackend, RateGate};
pub use concurrency::LocalConcurrencyGate;
pub use counter::LocalCounterGate;
pub use rate::LocalRateGate;
pub use remote::{StoreConcurrencyGate, StoreCounterGate, StoreRateGate};
