//! The limiter pipeline: call contract, statistics, and orchestrator.

mod call;
mod core;
mod statistics;

pub use call::{CallContext, CallError, FailureKind, FnCall, LimitExceeded, OriginalCall};
pub use self::core::Limiter;
pub use statistics::LimiterStatistics;
