//! In-process telemetry sink.
//!
//! Channels fan out to `mpsc` subscribers; keys live in a map with optional
//! expiry. A subscriber that stops reading loses messages once its buffer is full
//! instead of stalling publishers, and closed subscribers are pruned on the next
//! publish to their channel.
//!
//! ```
//! use daq_relay::telemetry::{MemorySink, TelemetrySink};
//!
//! # tokio_test::block_on(async {
//! let sink = MemorySink::new();
//! sink.upsert("Daq:data:Channel0", "1.5".into(), None).await.unwrap();
//! assert_eq!(sink.get("Daq:data:Channel0").as_deref(), Some(&b"1.5"[..]));
//! # });
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{TelemetrySink, SUBSCRIPTION_BUFFER};
use crate::error::SinkError;

#[derive(Debug)]
struct StoredValue {
    payload: Bytes,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory broker plus key-value store.
#[derive(Debug, Default)]
pub struct MemorySink {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Bytes>>>>,
    store: Mutex<HashMap<String, StoredValue>>,
    published: AtomicU64,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value under `key`, unless it expired.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let mut store = self.store.lock();
        if store.get(key).is_some_and(|value| value.is_expired(now)) {
            store.remove(key);
        }
        store.get(key).map(|value| value.payload.clone())
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut store = self.store.lock();
        store.retain(|_, value| !value.is_expired(now));
        let mut keys: Vec<String> = store.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Messages accepted by `publish` so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of open subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers
            .lock()
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|s| !s.is_closed()).count())
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), SinkError> {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock();
        let Some(subs) = subscribers.get_mut(channel) else {
            trace!(channel, "Published with no subscribers");
            return Ok(());
        };
        subs.retain(|tx| match tx.try_send(payload.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(channel, "Subscriber buffer full; message dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    async fn upsert(
        &self,
        key: &str,
        payload: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), SinkError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.store
            .lock()
            .insert(key.to_string(), StoredValue { payload, expires_at });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, SinkError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        debug!(channel, "Subscribed");
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SinkError> {
        if let Some(subs) = self.subscribers.lock().remove(channel) {
            debug!(channel, closed = subs.len(), "Unsubscribed");
        }
        Ok(())
    }
}
