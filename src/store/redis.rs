//! Redis-backed store client.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::client::{StoreClient, StoreError};

/// Capacity of the channel buffering subscribed messages.
const SUBSCRIBE_BUFFER: usize = 64;

/// [`StoreClient`] implementation backed by Redis.
///
/// Commands and scripts run over a shared [`ConnectionManager`], which
/// reconnects transparently; subscriptions open a dedicated pubsub
/// connection per channel.
pub struct RedisStoreClient {
    client: Client,
    manager: ConnectionManager,
}

impl RedisStoreClient {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        debug!(url = %url, "Connecting store client");
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl StoreClient for RedisStoreClient {
    async fn eval(
        &self,
        script: &str,
        keys: &[String],
        args: &[i64],
        timeout: Duration,
    ) -> Result<Vec<i64>, StoreError> {
        let script = Script::new(script);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            invocation.arg(*arg);
        }

        let mut manager = self.manager.clone();
        let call = async move {
            let reply: Vec<i64> = invocation.invoke_async(&mut manager).await?;
            Ok::<_, StoreError>(reply)
        };

        if timeout.is_zero() {
            call.await
        } else {
            tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| StoreError::Timeout(timeout))?
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut manager = self.manager.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut manager)
            .await?;
        Ok(value)
    }

    async fn pull(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut manager = self.manager.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut manager)
            .await?;
        Ok(fields)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut manager = self.manager.clone();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut manager)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<ReceiverStream<String>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let channel = channel.to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(
                            channel = %channel,
                            error = %error,
                            "Dropping undecodable pubsub message"
                        );
                        continue;
                    }
                };
                // Receiver dropped, stop forwarding.
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx))
    }
}
