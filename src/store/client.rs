//! Store client trait for the cluster-coordinated gate backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;

/// Errors surfaced by a store client.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store backend reported an error
    #[error("Store backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// The round trip did not complete within the configured timeout
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store returned a reply the caller could not interpret
    #[error("Malformed store reply: {0}")]
    MalformedReply(String),
}

/// Client for a shared key-value store with atomic server-side scripting.
///
/// The gates never issue separate get+compare+set round trips; every
/// multi-step decision is pushed into `eval` so competing processes observe
/// it atomically. All mutable state lives in the store itself.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Execute `script` atomically against `keys` with numeric `args`.
    ///
    /// A zero `timeout` means no client-side bound on the round trip.
    async fn eval(
        &self,
        script: &str,
        keys: &[String],
        args: &[i64],
        timeout: Duration,
    ) -> Result<Vec<i64>, StoreError>;

    /// Fetch a single value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Fetch all fields of a hash, keyed by field name.
    async fn pull(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Publish `payload` to `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Subscribe to `channel`, receiving each published payload.
    async fn subscribe(&self, channel: &str) -> Result<ReceiverStream<String>, StoreError>;
}
