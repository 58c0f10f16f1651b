//! Periodic statistics collection and publication.
//!
//! The limiter itself runs no background work; this optional task drains
//! every registered limiter on a fixed cycle and publishes a JSON report to
//! a store channel for an external aggregator.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::event::{EventKind, EventSink};
use crate::registry::LimiterRegistry;
use crate::store::StoreClient;

/// Options for the collector task.
#[derive(Debug, Clone)]
pub struct CollectorOptions {
    /// Drain cycle length
    pub interval: Duration,
    /// Store channel the reports are published to
    pub channel: String,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            channel: "floodgate:statistics".to_string(),
        }
    }
}

/// Spawn the collector task.
///
/// Each tick drains every limiter and publishes one report per limiter with
/// traffic; all-zero windows are skipped. A publish failure emits a
/// `CollectFault` event for that limiter and the tick continues. Abort the
/// returned handle to stop collecting.
pub fn spawn_collector(
    registry: Arc<LimiterRegistry>,
    store: Arc<dyn StoreClient>,
    events: Arc<dyn EventSink>,
    options: CollectorOptions,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(options.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for (identity, limiter) in registry.snapshot() {
                let statistics = limiter.collect();
                if statistics.is_empty() || statistics.values().all(|v| *v == 0) {
                    continue;
                }

                let payload = serde_json::json!({
                    "identity": identity,
                    "statistics": statistics,
                })
                .to_string();

                debug!(identity = %identity, "Publishing statistics report");
                if let Err(error) = store.publish(&options.channel, &payload).await {
                    warn!(
                        identity = %identity,
                        channel = %options.channel,
                        error = %error,
                        "Failed to publish statistics report"
                    );
                    if let Some(config) = limiter.config() {
                        events.on_event(&config, EventKind::CollectFault, &error.to_string());
                    }
                }
            }
        }
    })
}
