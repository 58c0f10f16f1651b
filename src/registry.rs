//! Limiter registry.
//!
//! An explicit registration table mapping an identity string to its
//! [`Limiter`]. Replaces runtime discovery: the backend and event sink are
//! injected once at construction and shared by every limiter the registry
//! creates.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::LimiterConfig;
use crate::error::Result;
use crate::event::EventSink;
use crate::gates::LimiterBackend;
use crate::limiter::Limiter;

/// Table of limiters keyed by `identity()`.
pub struct LimiterRegistry {
    limiters: DashMap<String, Arc<Limiter>>,
    backend: LimiterBackend,
    events: Arc<dyn EventSink>,
}

impl LimiterRegistry {
    /// Create an empty registry over the given backend and event sink.
    pub fn new(backend: LimiterBackend, events: Arc<dyn EventSink>) -> Self {
        Self {
            limiters: DashMap::new(),
            backend,
            events,
        }
    }

    /// Create the limiter for `config`'s identity, or refresh it if it
    /// already exists.
    pub fn apply(&self, config: LimiterConfig) -> Result<Arc<Limiter>> {
        config.validate()?;
        let identity = config.identity();

        let limiter = self
            .limiters
            .entry(identity.clone())
            .or_insert_with(|| {
                info!(identity = %identity, "Registering limiter");
                Arc::new(Limiter::new(&self.backend, self.events.clone()))
            })
            .clone();
        limiter.refresh(config);
        Ok(limiter)
    }

    /// Look up the limiter for an identity.
    ///
    /// `None` means no limiter is configured and the caller passes through.
    pub fn get(&self, identity: &str) -> Option<Arc<Limiter>> {
        self.limiters.get(identity).map(|entry| entry.value().clone())
    }

    /// Remove the limiter for an identity.
    pub fn remove(&self, identity: &str) -> Option<Arc<Limiter>> {
        let removed = self.limiters.remove(identity).map(|(_, limiter)| limiter);
        if removed.is_some() {
            debug!(identity = %identity, "Removed limiter");
        }
        removed
    }

    /// Number of registered limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Detached copy of the table, so callers can await between entries
    /// without holding shard locks.
    pub fn snapshot(&self) -> Vec<(String, Arc<Limiter>)> {
        self.limiters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Drain every limiter's statistics window, keyed by identity.
    ///
    /// Idempotent-safe on a fixed cycle; limiters with nothing to report
    /// contribute all-zero maps.
    pub fn collect(&self) -> HashMap<String, HashMap<&'static str, u64>> {
        let mut report = HashMap::new();
        for (identity, limiter) in self.snapshot() {
            report.insert(identity, limiter.collect());
        }
        report
    }
}
