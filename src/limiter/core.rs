//! The limiter orchestrator.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{LimiterConfig, OverflowStrategy};
use crate::event::{EventKind, EventSink};
use crate::gates::{Acquire, ConcurrencyGate, Dimension, GateSet, LimiterBackend};

use super::call::{CallContext, CallError, LimitExceeded, OriginalCall};
use super::statistics::LimiterStatistics;

/// Releases a held concurrency permit exactly once, on every exit path.
///
/// Armed when the concurrency gate grants; dropping it returns the permits
/// whether the call succeeded, failed, or the future was cancelled.
struct PermitGuard {
    gate: Arc<dyn ConcurrencyGate>,
    config: Arc<LimiterConfig>,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        self.gate.release(&self.config);
    }
}

/// One limiter: a config snapshot, its statistics window, and one gate per
/// dimension.
///
/// Gates are evaluated in a fixed order (concurrency, rate, counter) so the
/// most expensive-to-reverse resource, the held permit, is acquired first
/// and released last.
pub struct Limiter {
    config: RwLock<Option<Arc<LimiterConfig>>>,
    statistics: Arc<LimiterStatistics>,
    gates: GateSet,
    events: Arc<dyn EventSink>,
}

impl Limiter {
    /// Create an unconfigured limiter; it passes traffic through until the
    /// first successful [`refresh`](Self::refresh).
    pub fn new(backend: &LimiterBackend, events: Arc<dyn EventSink>) -> Self {
        Self {
            config: RwLock::new(None),
            statistics: Arc::new(LimiterStatistics::new()),
            gates: backend.build_gates(),
            events,
        }
    }

    /// Validate and swap configuration.
    ///
    /// An invalid config is rejected: a `RefreshFault` event fires, the
    /// previous config stays in force, and `false` is returned. A config
    /// semantically equal to the active one is a no-op that leaves live gate
    /// capacities untouched. Safe to call concurrently with in-flight
    /// [`wrap_call`](Self::wrap_call)s; readers see either the old snapshot
    /// or the new one, never a partial update.
    pub fn refresh(&self, config: LimiterConfig) -> bool {
        if let Err(error) = config.validate() {
            warn!(
                identity = %config.identity(),
                error = %error,
                "Rejecting invalid limiter configuration"
            );
            self.events
                .on_event(&config, EventKind::RefreshFault, &error.to_string());
            return false;
        }

        let mut active = self.config.write();
        if let Some(current) = active.as_ref() {
            if **current == config {
                debug!(identity = %config.identity(), "Configuration unchanged");
                return true;
            }
        }

        self.gates.concurrency.apply(&config);
        self.gates.rate.apply(&config);
        self.gates.counter.apply(&config);

        debug!(identity = %config.identity(), "Applied limiter configuration");
        *active = Some(Arc::new(config));
        true
    }

    /// The single entry point: gate the call, then perform and measure it.
    ///
    /// With no config or the global switch off, the call passes straight
    /// through with no gating and no statistics. Otherwise each enabled gate
    /// is evaluated in order; `Exceeded` dispatches the overflow strategy
    /// and `Faulted` fails open to the next stage. The wrapped call's own
    /// error is returned unchanged as [`CallError::Inner`].
    pub async fn wrap_call<C: OriginalCall>(
        &self,
        mut context: CallContext,
        call: &C,
    ) -> Result<C::Output, CallError<C::Error>> {
        let snapshot = self.config.read().clone();
        let Some(config) = snapshot else {
            return call.call(&context).await.map_err(CallError::Inner);
        };
        if !config.enable.is_on() {
            return call.call(&context).await.map_err(CallError::Inner);
        }
        context.set_config(config.clone());

        let mut _permit: Option<PermitGuard> = None;
        if config.concurrency.enable.is_on() {
            match self.gates.concurrency.try_acquire(&config).await {
                Acquire::Granted => {
                    _permit = Some(PermitGuard {
                        gate: self.gates.concurrency.clone(),
                        config: config.clone(),
                    });
                }
                Acquire::Exceeded => {
                    if let Some(outcome) = self
                        .on_exceeded(Dimension::Concurrency, &config, &context, call)
                        .await
                    {
                        return outcome;
                    }
                }
                Acquire::Faulted => self.on_faulted(Dimension::Concurrency, &config),
            }
        }

        if config.rate.enable.is_on() {
            match self.gates.rate.try_acquire(&config).await {
                Acquire::Granted => {}
                Acquire::Exceeded => {
                    if let Some(outcome) = self
                        .on_exceeded(Dimension::Rate, &config, &context, call)
                        .await
                    {
                        return outcome;
                    }
                }
                Acquire::Faulted => self.on_faulted(Dimension::Rate, &config),
            }
        }

        if config.counter.enable.is_on() {
            match self.gates.counter.try_acquire(&config).await {
                Acquire::Granted => {}
                Acquire::Exceeded => {
                    if let Some(outcome) = self
                        .on_exceeded(Dimension::Counter, &config, &context, call)
                        .await
                    {
                        return outcome;
                    }
                }
                Acquire::Faulted => self.on_faulted(Dimension::Counter, &config),
            }
        }

        self.statistics
            .wrap_call(&context, call)
            .await
            .map_err(CallError::Inner)
    }

    /// Resolve an exceeded dimension through the overflow strategy.
    ///
    /// `None` means the pipeline continues to the next stage.
    async fn on_exceeded<C: OriginalCall>(
        &self,
        dimension: Dimension,
        config: &Arc<LimiterConfig>,
        context: &CallContext,
        call: &C,
    ) -> Option<Result<C::Output, CallError<C::Error>>> {
        self.statistics.record_exceed(dimension);
        let event = dimension.exceed_event();
        let detail = format!("{dimension} limit exceeded");
        self.events.on_event(config, event, &detail);

        match config.strategy {
            OverflowStrategy::Ignore => None,
            OverflowStrategy::Fallback => Some(match call.fallback(context).await {
                Some(result) => result.map_err(CallError::Inner),
                None => Err(CallError::Exceeded(LimitExceeded::new(
                    config.identity(),
                    event,
                ))),
            }),
            OverflowStrategy::Reject => Some(Err(CallError::Exceeded(LimitExceeded::new(
                config.identity(),
                event,
            )))),
        }
    }

    /// A gate backend could not decide; report it and fail open.
    fn on_faulted(&self, dimension: Dimension, config: &LimiterConfig) {
        warn!(
            identity = %config.identity(),
            dimension = %dimension,
            "Gate backend fault, failing open"
        );
        self.events
            .on_event(config, dimension.fault_event(), "backend fault, failing open");
    }

    /// Drain the statistics window.
    ///
    /// Returns an empty map for a limiter that was never configured.
    pub fn collect(&self) -> HashMap<&'static str, u64> {
        if self.config.read().is_none() {
            return HashMap::new();
        }
        self.statistics.snapshot_and_reset()
    }

    /// The active config snapshot, if any.
    pub fn config(&self) -> Option<Arc<LimiterConfig>> {
        self.config.read().clone()
    }

    /// The live statistics for this limiter.
    pub fn statistics(&self) -> &Arc<LimiterStatistics> {
        &self.statistics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConcurrencyConfig, CounterConfig, RateConfig, Switch};
    use crate::event::TracingEventSink;
    use crate::limiter::call::FailureKind;
    use crate::store::{StoreClient, StoreError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::sync::Semaphore;
    use tokio_stream::wrappers::ReceiverStream;

    /// Sink that records every event it sees.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<EventKind>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<EventKind> {
            self.events.lock().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn on_event(&self, _config: &LimiterConfig, event: EventKind, _detail: &str) {
            self.events.lock().push(event);
        }
    }

    /// Store whose every round trip fails.
    struct BrokenStore;

    #[async_trait]
    impl StoreClient for BrokenStore {
        async fn eval(
            &self,
            _script: &str,
            _keys: &[String],
            _args: &[i64],
            _timeout: Duration,
        ) -> Result<Vec<i64>, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(1)))
        }

        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(1)))
        }

        async fn pull(
            &self,
            _key: &str,
        ) -> Result<std::collections::HashMap<String, String>, StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(1)))
        }

        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), StoreError> {
            Err(StoreError::Timeout(Duration::from_millis(1)))
        }

        async fn subscribe(&self, _channel: &str) -> Result<ReceiverStream<String>, StoreError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(ReceiverStream::new(rx))
        }
    }

    /// Store that answers every script with a one-element reply.
    struct ShortReplyStore;

    #[async_trait]
    impl StoreClient for ShortReplyStore {
        async fn eval(
            &self,
            _script: &str,
            _keys: &[String],
            _args: &[i64],
            _timeout: Duration,
        ) -> Result<Vec<i64>, StoreError> {
            Ok(vec![1])
        }

        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }

        async fn pull(
            &self,
            _key: &str,
        ) -> Result<std::collections::HashMap<String, String>, StoreError> {
            Ok(std::collections::HashMap::new())
        }

        async fn publish(&self, _channel: &str, _payload: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn subscribe(&self, _channel: &str) -> Result<ReceiverStream<String>, StoreError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(ReceiverStream::new(rx))
        }
    }

    /// Call that answers immediately.
    struct Instant42;

    #[async_trait]
    impl OriginalCall for Instant42 {
        type Output = u32;
        type Error = String;

        async fn call(&self, _context: &CallContext) -> Result<u32, String> {
            Ok(42)
        }

        async fn fallback(&self, _context: &CallContext) -> Option<Result<u32, String>> {
            Some(Ok(0))
        }
    }

    /// Call that blocks until the test-owned semaphore releases it.
    struct HeldCall {
        release: Arc<Semaphore>,
    }

    #[async_trait]
    impl OriginalCall for HeldCall {
        type Output = ();
        type Error = String;

        async fn call(&self, _context: &CallContext) -> Result<(), String> {
            let _permit = self
                .release
                .acquire()
                .await
                .map_err(|e| e.to_string())?;
            Ok(())
        }
    }

    /// Call that always fails, classified as a timeout.
    struct TimingOut;

    #[async_trait]
    impl OriginalCall for TimingOut {
        type Output = ();
        type Error = String;

        async fn call(&self, _context: &CallContext) -> Result<(), String> {
            Err("deadline exceeded".to_string())
        }

        fn classify(&self, _error: &String) -> FailureKind {
            FailureKind::Timeout
        }
    }

    fn base_config(tag: &str) -> LimiterConfig {
        LimiterConfig {
            node: "node-1".to_string(),
            application: "orders".to_string(),
            group: "api".to_string(),
            tag: tag.to_string(),
            enable: Switch::On,
            strategy: OverflowStrategy::Ignore,
            concurrency: ConcurrencyConfig::default(),
            rate: RateConfig::default(),
            counter: CounterConfig::default(),
        }
    }

    fn local_limiter(config: LimiterConfig) -> (Arc<Limiter>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let limiter = Limiter::new(&LimiterBackend::Local, sink.clone());
        assert!(limiter.refresh(config));
        (Arc::new(limiter), sink)
    }

    #[tokio::test]
    async fn test_unconfigured_limiter_passes_through() {
        let limiter = Limiter::new(&LimiterBackend::Local, Arc::new(TracingEventSink));
        let result = limiter.wrap_call(CallContext::new(), &Instant42).await;
        assert_eq!(result.unwrap(), 42);
        assert!(limiter.collect().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_limiter_skips_gates_and_statistics() {
        let mut config = base_config("disabled");
        config.enable = Switch::Off;
        let (limiter, _) = local_limiter(config);

        let result = limiter.wrap_call(CallContext::new(), &Instant42).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(limiter.collect()["request"], 0);
    }

    #[tokio::test]
    async fn test_admitted_call_is_measured() {
        let (limiter, _) = local_limiter(base_config("plain"));
        let result = limiter.wrap_call(CallContext::new(), &Instant42).await;
        assert_eq!(result.unwrap(), 42);

        let snapshot = limiter.collect();
        assert_eq!(snapshot["request"], 1);
        assert_eq!(snapshot["success"], 1);
    }

    #[tokio::test]
    async fn test_reject_strategy_admits_up_to_capacity() {
        let mut config = base_config("reject");
        config.strategy = OverflowStrategy::Reject;
        config.concurrency.enable = Switch::On;
        config.concurrency.max_permit = 2;
        config.concurrency.permit_unit = 1;
        let (limiter, sink) = local_limiter(config);

        let release = Arc::new(Semaphore::new(0));

        // Two long calls hold both permits.
        let mut holders = Vec::new();
        for _ in 0..2 {
            let limiter = limiter.clone();
            let release = release.clone();
            holders.push(tokio::spawn(async move {
                limiter
                    .wrap_call(CallContext::new(), &HeldCall { release })
                    .await
            }));
        }
        while limiter.statistics().live_concurrent() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The third call is rejected immediately with the typed error.
        let third = limiter
            .wrap_call(CallContext::new(), &HeldCall { release: release.clone() })
            .await;
        match third {
            Err(CallError::Exceeded(exceeded)) => {
                assert_eq!(exceeded.event(), EventKind::ConcurrencyExceed);
                assert_eq!(exceeded.identity(), "node-1:orders:api:reject");
            }
            other => panic!("expected exceeded error, got {other:?}"),
        }
        assert_eq!(sink.events(), vec![EventKind::ConcurrencyExceed]);

        // Let the holders finish; both succeed and both permits come back.
        release.add_permits(2);
        for holder in holders {
            assert!(holder.await.unwrap().is_ok());
        }
        assert_eq!(limiter.statistics().live_concurrent(), 0);

        let result = limiter.wrap_call(CallContext::new(), &Instant42).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_ignore_strategy_lets_overflow_proceed() {
        let mut config = base_config("ignore");
        config.counter.enable = Switch::On;
        config.counter.max_count = 5;
        config.counter.count_unit = 1;
        config.counter.interval_ms = 60_000;
        let (limiter, sink) = local_limiter(config);

        for _ in 0..6 {
            let result = limiter.wrap_call(CallContext::new(), &Instant42).await;
            assert_eq!(result.unwrap(), 42);
        }

        let snapshot = limiter.collect();
        assert_eq!(snapshot["request"], 6);
        assert_eq!(snapshot["success"], 6);
        assert_eq!(snapshot["counter_exceed"], 1);
        assert_eq!(sink.events(), vec![EventKind::CounterExceed]);
    }

    #[tokio::test]
    async fn test_fallback_strategy_invokes_fallback() {
        let mut config = base_config("fallback");
        config.strategy = OverflowStrategy::Fallback;
        config.counter.enable = Switch::On;
        config.counter.max_count = 1;
        config.counter.interval_ms = 60_000;
        let (limiter, _) = local_limiter(config);

        assert_eq!(
            limiter
                .wrap_call(CallContext::new(), &Instant42)
                .await
                .unwrap(),
            42
        );
        // Overflow: the fallback answers instead of the real call.
        assert_eq!(
            limiter
                .wrap_call(CallContext::new(), &Instant42)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_fallback_without_fallback_is_typed_error() {
        let mut config = base_config("nofallback");
        config.strategy = OverflowStrategy::Fallback;
        config.counter.enable = Switch::On;
        config.counter.max_count = 1;
        config.counter.interval_ms = 60_000;
        let (limiter, _) = local_limiter(config);

        let call = TimingOut;
        assert!(limiter.wrap_call(CallContext::new(), &call).await.is_err());
        let second = limiter.wrap_call(CallContext::new(), &call).await;
        assert!(matches!(second, Err(CallError::Exceeded(_))));
    }

    #[tokio::test]
    async fn test_inner_error_passes_through() {
        let (limiter, _) = local_limiter(base_config("inner"));
        let error = limiter
            .wrap_call(CallContext::new(), &TimingOut)
            .await
            .unwrap_err();
        assert_eq!(error.into_inner().unwrap(), "deadline exceeded");

        let snapshot = limiter.collect();
        assert_eq!(snapshot["failure"], 1);
        assert_eq!(snapshot["timeout_failure"], 1);
    }

    #[tokio::test]
    async fn test_broken_store_fails_open() {
        let mut config = base_config("failopen");
        config.strategy = OverflowStrategy::Reject;
        config.concurrency.enable = Switch::On;
        config.rate.enable = Switch::On;
        config.rate.max_rate = 100;
        config.counter.enable = Switch::On;
        config.counter.max_count = 100;

        let sink = Arc::new(RecordingSink::default());
        let backend = LimiterBackend::Store(Arc::new(BrokenStore));
        let limiter = Limiter::new(&backend, sink.clone());
        assert!(limiter.refresh(config));

        // Every gate faults; the call still goes through untouched.
        let result = limiter.wrap_call(CallContext::new(), &Instant42).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(
            sink.events(),
            vec![
                EventKind::ConcurrencyFault,
                EventKind::RateFault,
                EventKind::CounterFault
            ]
        );

        let snapshot = limiter.collect();
        assert_eq!(snapshot["success"], 1);
    }

    #[tokio::test]
    async fn test_malformed_reply_fails_open_with_one_event() {
        let mut config = base_config("short");
        config.strategy = OverflowStrategy::Reject;
        config.rate.enable = Switch::On;
        config.rate.max_rate = 100;

        let sink = Arc::new(RecordingSink::default());
        let backend = LimiterBackend::Store(Arc::new(ShortReplyStore));
        let limiter = Limiter::new(&backend, sink.clone());
        assert!(limiter.refresh(config));

        let result = limiter.wrap_call(CallContext::new(), &Instant42).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(sink.events(), vec![EventKind::RateFault]);
    }

    #[tokio::test]
    async fn test_refresh_rejects_invalid_and_keeps_previous() {
        let mut config = base_config("refresh");
        config.strategy = OverflowStrategy::Reject;
        config.concurrency.enable = Switch::On;
        config.concurrency.max_permit = 1;
        let (limiter, sink) = local_limiter(config.clone());

        let mut invalid = config.clone();
        invalid.concurrency.permit_unit = 5;
        invalid.concurrency.max_permit = 2;
        assert!(!limiter.refresh(invalid));
        assert_eq!(sink.events(), vec![EventKind::RefreshFault]);
        assert_eq!(limiter.config().unwrap().concurrency.max_permit, 1);

        // Prior configuration still enforced: capacity is one permit.
        let release = Arc::new(Semaphore::new(0));
        let holder = {
            let limiter = limiter.clone();
            let release = release.clone();
            tokio::spawn(async move {
                limiter
                    .wrap_call(CallContext::new(), &HeldCall { release })
                    .await
            })
        };
        while limiter.statistics().live_concurrent() < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = limiter
            .wrap_call(CallContext::new(), &HeldCall { release: release.clone() })
            .await;
        assert!(matches!(second, Err(CallError::Exceeded(_))));

        release.add_permits(1);
        assert!(holder.await.unwrap().is_ok());
        assert_eq!(limiter.collect()["concurrency_exceed"], 1);
    }

    #[tokio::test]
    async fn test_refresh_with_equal_config_is_noop() {
        let mut config = base_config("noop");
        config.rate.enable = Switch::On;
        config.rate.max_rate = 2;
        let (limiter, _) = local_limiter(config.clone());

        // Drain the bucket.
        for _ in 0..2 {
            assert!(limiter
                .wrap_call(CallContext::new(), &Instant42)
                .await
                .is_ok());
        }

        // An equal config must not refill live gate state.
        assert!(limiter.refresh(config.clone()));
        let snapshot_before = limiter.collect();
        assert_eq!(snapshot_before["rate_exceed"], 0);
        assert!(limiter
            .wrap_call(CallContext::new(), &Instant42)
            .await
            .is_ok());
        assert_eq!(limiter.collect()["rate_exceed"], 1);

        // A materially different config does reapply.
        let mut changed = config.clone();
        changed.rate.max_rate = 5;
        assert!(limiter.refresh(changed));
        assert!(limiter
            .wrap_call(CallContext::new(), &Instant42)
            .await
            .is_ok());
        assert_eq!(limiter.collect()["rate_exceed"], 0);
    }

    #[tokio::test]
    async fn test_permit_released_after_inner_error() {
        let mut config = base_config("release");
        config.concurrency.enable = Switch::On;
        config.concurrency.max_permit = 1;
        let (limiter, _) = local_limiter(config);

        for _ in 0..3 {
            assert!(limiter
                .wrap_call(CallContext::new(), &TimingOut)
                .await
                .is_err());
        }

        // Capacity intact: a success still fits.
        let result = limiter.wrap_call(CallContext::new(), &Instant42).await;
        assert!(result.is_ok());
        assert_eq!(limiter.statistics().live_concurrent(), 0);
    }

    #[tokio::test]
    async fn test_disabled_gate_is_skipped() {
        let mut config = base_config("skip");
        config.strategy = OverflowStrategy::Reject;
        // Counter would trip immediately, but it is disabled.
        config.counter.enable = Switch::Off;
        config.counter.max_count = 1;
        config.rate.enable = Switch::On;
        config.rate.max_rate = 100;
        let (limiter, sink) = local_limiter(config);

        for _ in 0..5 {
            assert!(limiter
                .wrap_call(CallContext::new(), &Instant42)
                .await
                .is_ok());
        }
        assert!(sink.events().is_empty());
    }
}
