//! Limiter event contract.
//!
//! Gates and the orchestrator report exceed and fault occurrences through an
//! [`EventSink`], consumed by an external event-distribution collaborator.
//! Sinks are synchronous and must not block the calling task.

use std::fmt;
use tracing::{error, warn};

use crate::config::LimiterConfig;

/// Kinds of events a limiter can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Concurrency dimension exceeded
    ConcurrencyExceed,
    /// Rate dimension exceeded
    RateExceed,
    /// Counter dimension exceeded
    CounterExceed,
    /// Concurrency gate backend fault
    ConcurrencyFault,
    /// Rate gate backend fault
    RateFault,
    /// Counter gate backend fault
    CounterFault,
    /// Configuration refresh rejected or failed
    RefreshFault,
    /// Statistics collection or publication failed
    CollectFault,
}

impl EventKind {
    /// Stable event name, used in error messages and published reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ConcurrencyExceed => "CONCURRENCY_EXCEED",
            EventKind::RateExceed => "RATE_EXCEED",
            EventKind::CounterExceed => "COUNTER_EXCEED",
            EventKind::ConcurrencyFault => "CONCURRENCY_FAULT",
            EventKind::RateFault => "RATE_FAULT",
            EventKind::CounterFault => "COUNTER_FAULT",
            EventKind::RefreshFault => "REFRESH_FAULT",
            EventKind::CollectFault => "COLLECT_FAULT",
        }
    }

    /// Whether this event reports an infrastructure fault rather than a
    /// capacity decision.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            EventKind::ConcurrencyFault
                | EventKind::RateFault
                | EventKind::CounterFault
                | EventKind::RefreshFault
                | EventKind::CollectFault
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listener notified on exceed and fault events.
pub trait EventSink: Send + Sync {
    /// Report one event for the limiter identified by `config`.
    fn on_event(&self, config: &LimiterConfig, event: EventKind, detail: &str);
}

/// Default sink that logs events through `tracing`.
///
/// Exceed events are routine capacity decisions and log at `warn`; fault
/// events indicate infrastructure trouble and log at `error`.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_event(&self, config: &LimiterConfig, event: EventKind, detail: &str) {
        if event.is_fault() {
            error!(
                identity = %config.identity(),
                event = %event,
                detail = %detail,
                "Limiter fault"
            );
        } else {
            warn!(
                identity = %config.identity(),
                event = %event,
                detail = %detail,
                "Limit exceeded"
            );
        }
    }
}
