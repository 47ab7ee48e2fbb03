//! Redis telemetry sink.
//!
//! Batches go out with `PUBLISH`; latest values are written with `SET`, or
//! `PSETEX` when a TTL is configured. Commands share one multiplexed connection.
//! Each subscription owns a dedicated pub/sub connection driven by a forwarding
//! task that ends on `unsubscribe` or when its receiver is dropped.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{TelemetrySink, SUBSCRIPTION_BUFFER};
use crate::error::SinkError;

/// Telemetry sink backed by a Redis server.
pub struct RedisSink {
    url: String,
    client: Client,
    connection: MultiplexedConnection,
    subscriptions: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for RedisSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSink").field("url", &self.url).finish()
    }
}

fn connection_error(url: &str, err: redis::RedisError) -> SinkError {
    SinkError::Connection {
        message: format!("{url}: {err}"),
    }
}

impl RedisSink {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`) and verify the link.
    pub async fn connect(url: &str) -> Result<Self, SinkError> {
        let client = Client::open(url).map_err(|e| connection_error(url, e))?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| connection_error(url, e))?;

        let _: String = redis::cmd("ECHO")
            .arg("daq_relay")
            .query_async(&mut connection)
            .await
            .map_err(|e| connection_error(url, e))?;
        info!(url, "Connected to Redis");

        Ok(Self {
            url: url.to_string(),
            client,
            connection,
            subscriptions: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl TelemetrySink for RedisSink {
    fn name(&self) -> &str {
        "redis"
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), SinkError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .publish(channel, payload.to_vec())
            .await
            .map_err(|e| SinkError::Publish {
                channel: channel.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn upsert(
        &self,
        key: &str,
        payload: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), SinkError> {
        let mut conn = self.connection.clone();
        let result: redis::RedisResult<()> = match ttl {
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                conn.pset_ex(key, payload.to_vec(), millis).await
            }
            None => conn.set(key, payload.to_vec()).await,
        };
        result.map_err(|e| SinkError::Upsert {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, SinkError> {
        let subscribe_error = |e: redis::RedisError| SinkError::Subscribe {
            channel: channel.to_string(),
            message: e.to_string(),
        };
        let mut pubsub = self.client.get_async_pubsub().await.map_err(subscribe_error)?;
        pubsub.subscribe(channel).await.map_err(subscribe_error)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let name = channel.to_string();
        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                if tx.send(Bytes::copy_from_slice(msg.get_payload_bytes())).await.is_err() {
                    break;
                }
            }
            debug!(channel = %name, "Redis subscription ended");
        });

        let mut subscriptions = self.subscriptions.lock();
        let tasks = subscriptions.entry(channel.to_string()).or_default();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        debug!(channel, "Subscribed to Redis channel");
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SinkError> {
        match self.subscriptions.lock().remove(channel) {
            Some(tasks) => {
                for task in tasks {
                    task.abort();
                }
                debug!(channel, "Unsubscribed from Redis channel");
            }
            None => warn!(channel, "Unsubscribe for a channel with no subscription"),
        }
        Ok(())
    }
}

impl Drop for RedisSink {
    fn drop(&mut self) {
        for task in self.subscriptions.get_mut().drain().flat_map(|(_, tasks)| tasks) {
            task.abort();
        }
    }
}
