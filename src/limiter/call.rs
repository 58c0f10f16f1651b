//! The original-call contract and per-call context.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::LimiterConfig;
use crate::event::EventKind;

/// Per-call, short-lived value carrying arbitrary attachments and the
/// config snapshot the call was admitted under.
///
/// Created by the caller, threaded explicitly through the call chain, and
/// discarded after the call. Never shared across calls and never touched by
/// background machinery.
#[derive(Debug, Clone)]
pub struct CallContext {
    call_id: Uuid,
    attachments: HashMap<String, String>,
    config: Option<Arc<LimiterConfig>>,
}

impl CallContext {
    /// Create a context with a fresh correlation id.
    pub fn new() -> Self {
        Self {
            call_id: Uuid::new_v4(),
            attachments: HashMap::new(),
            config: None,
        }
    }

    /// Attach a key/value pair, builder-style.
    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }

    /// Correlation id for this call.
    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Look up an attachment.
    pub fn attachment(&self, key: &str) -> Option<&str> {
        self.attachments.get(key).map(String::as_str)
    }

    /// The config snapshot the limiter admitted this call under, if any.
    pub fn config(&self) -> Option<&Arc<LimiterConfig>> {
        self.config.as_ref()
    }

    pub(crate) fn set_config(&mut self, config: Arc<LimiterConfig>) {
        self.config = Some(config);
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

/// How a failed call is classified in the statistics window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The call timed out
    Timeout,
    /// The call was rejected by the callee
    Rejected,
    /// Any other failure
    Other,
}

/// The unit of work a limiter wraps.
#[async_trait]
pub trait OriginalCall: Send + Sync {
    type Output: Send;
    type Error: Send;

    /// Perform the real call.
    async fn call(&self, context: &CallContext) -> Result<Self::Output, Self::Error>;

    /// Alternative invoked when the strategy is `Fallback` and a dimension
    /// was exceeded. `None` means no fallback is supplied.
    async fn fallback(
        &self,
        _context: &CallContext,
    ) -> Option<Result<Self::Output, Self::Error>> {
        None
    }

    /// Classify an error for the statistics failure counters.
    fn classify(&self, _error: &Self::Error) -> FailureKind {
        FailureKind::Other
    }
}

/// Adapter turning an async closure into an [`OriginalCall`].
pub struct FnCall<F> {
    function: F,
}

impl<F> FnCall<F> {
    pub fn new<T, E>(function: F) -> Self
    where
        F: for<'a> Fn(&'a CallContext) -> BoxFuture<'a, Result<T, E>>,
    {
        Self { function }
    }
}

#[async_trait]
impl<F, T, E> OriginalCall for FnCall<F>
where
    F: for<'a> Fn(&'a CallContext) -> BoxFuture<'a, Result<T, E>> + Send + Sync,
    T: Send,
    E: Send,
{
    type Output = T;
    type Error = E;

    async fn call(&self, context: &CallContext) -> Result<T, E> {
        (self.function)(context).await
    }
}

/// Typed, caller-visible rejection naming the tripped dimension's event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("limit exceeded for {identity}: {event}")]
pub struct LimitExceeded {
    identity: String,
    event: EventKind,
}

impl LimitExceeded {
    pub(crate) fn new(identity: String, event: EventKind) -> Self {
        Self { identity, event }
    }

    /// Identity of the limiter that rejected the call.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The exceed event for the tripped dimension.
    pub fn event(&self) -> EventKind {
        self.event
    }
}

/// Error surface of a wrapped call.
///
/// The wrapped call's own error passes through unchanged as `Inner`; the
/// limiter never swallows or rewrites it.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// A dimension was exceeded and the strategy rejected the call
    #[error("{0}")]
    Exceeded(LimitExceeded),

    /// The wrapped call's own error
    #[error("wrapped call error")]
    Inner(E),
}

impl<E> CallError<E> {
    /// Whether this is a limiter rejection rather than a call failure.
    pub fn is_exceeded(&self) -> bool {
        matches!(self, CallError::Exceeded(_))
    }

    /// Unwrap the wrapped call's own error, if that is what this is.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CallError::Inner(inner) => Some(inner),
            CallError::Exceeded(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn test_context_attachments() {
        let context = CallContext::new()
            .with_attachment("tenant", "acme")
            .with_attachment("shard", "7");
        assert_eq!(context.attachment("tenant"), Some("acme"));
        assert_eq!(context.attachment("shard"), Some("7"));
        assert_eq!(context.attachment("missing"), None);
        assert!(context.config().is_none());
    }

    #[test]
    fn test_contexts_have_distinct_ids() {
        assert_ne!(CallContext::new().call_id(), CallContext::new().call_id());
    }

    #[tokio::test]
    async fn test_fn_call_adapter() {
        let call = FnCall::new(|context: &CallContext| {
            async move {
                Ok::<_, String>(format!(
                    "tenant={}",
                    context.attachment("tenant").unwrap_or("none")
                ))
            }
            .boxed()
        });

        let context = CallContext::new().with_attachment("tenant", "acme");
        let result = call.call(&context).await.unwrap();
        assert_eq!(result, "tenant=acme");
        assert!(call.fallback(&context).await.is_none());
    }

    #[test]
    fn test_call_error_accessors() {
        let exceeded: CallError<String> = CallError::Exceeded(LimitExceeded::new(
            "n:a:g:t".to_string(),
            EventKind::RateExceed,
        ));
        assert!(exceeded.is_exceeded());
        assert!(exceeded.into_inner().is_none());

        let inner: CallError<String> = CallError::Inner("boom".to_string());
        assert!(!inner.is_exceeded());
        assert_eq!(inner.into_inner(), Some("boom".to_string()));
    }

    #[test]
    fn test_limit_exceeded_display() {
        let error = LimitExceeded::new("n:a:g:t".to_string(), EventKind::CounterExceed);
        assert_eq!(
            error.to_string(),
            "limit exceeded for n:a:g:t: COUNTER_EXCEED"
        );
    }
}
