//! Batch publisher.
//!
//! Drains the engine's batch queue on its own task. For every batch it publishes
//! the whole batch as one message on the data channel and upserts the last
//! measurement of each channel under its latest-value key. Both are attempted
//! independently and every sink call is bounded by a timeout.
//!
//! Sink failures are reported as `Sink` error events and otherwise swallowed: the
//! message is not retried and acquisition never hears about it. If the sink is
//! slower than acquisition the queue evicts the oldest batches; the publisher
//! counts what it lost.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{latest_key, Codec, JsonCodec, TelemetrySink, DEFAULT_DATA_CHANNEL, DEFAULT_KEY_PREFIX};
use crate::error::{ErrorKind, SinkError};
use crate::events::ErrorReporter;
use crate::measurement::{Measurement, MeasurementBatch};

/// Where and how batches are relayed.
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherSettings {
    /// Channel receiving full batches
    pub data_channel: String,
    /// Prefix of the per-channel latest-value keys
    pub key_prefix: String,
    /// Expiry of latest values; `None` keeps them forever
    pub latest_ttl: Option<Duration>,
    /// Upper bound for each sink call
    pub call_timeout: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            data_channel: DEFAULT_DATA_CHANNEL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            latest_ttl: None,
            call_timeout: Duration::from_secs(2),
        }
    }
}

/// Snapshot of publisher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Batches taken off the queue
    pub batches_received: u64,
    /// Batches published successfully
    pub batches_published: u64,
    /// Empty batches that were not sent
    pub batches_skipped: u64,
    /// Batches evicted from the queue before the publisher got to them
    pub batches_dropped: u64,
    /// Failed or timed-out publishes
    pub publish_failures: u64,
    /// Latest-value keys written
    pub upserts_written: u64,
    /// Failed or timed-out upserts
    pub upsert_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    published: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
    publish_failures: AtomicU64,
    upserts: AtomicU64,
    upsert_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PublisherStats {
        PublisherStats {
            batches_received: self.received.load(Ordering::Relaxed),
            batches_published: self.published.load(Ordering::Relaxed),
            batches_skipped: self.skipped.load(Ordering::Relaxed),
            batches_dropped: self.dropped.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            upserts_written: self.upserts.load(Ordering::Relaxed),
            upsert_failures: self.upsert_failures.load(Ordering::Relaxed),
        }
    }
}

/// Relays measurement batches into a [`TelemetrySink`].
#[derive(Clone)]
pub struct BatchPublisher {
    sink: Arc<dyn TelemetrySink>,
    codec: Arc<dyn Codec>,
    settings: PublisherSettings,
    errors: ErrorReporter,
    counters: Arc<Counters>,
}

impl BatchPublisher {
    /// Create a publisher encoding with [`JsonCodec`].
    pub fn new(sink: Arc<dyn TelemetrySink>, settings: PublisherSettings, errors: ErrorReporter) -> Self {
        Self {
            sink,
            codec: Arc::new(JsonCodec),
            settings,
            errors,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Replace the payload codec.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Relay settings.
    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> PublisherStats {
        self.counters.snapshot()
    }

    /// Publish one batch and upsert its latest values.
    ///
    /// Never fails: every sink error is reported and counted.
    pub async fn publish_batch(&self, batch: &MeasurementBatch) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if batch.is_empty() {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            trace!(sequence = batch.sequence, "Skipping empty batch");
            return;
        }

        futures::join!(self.publish_full(batch), self.upsert_latest(batch));
    }

    async fn publish_full(&self, batch: &MeasurementBatch) {
        let channel = self.settings.data_channel.as_str();
        let outcome = match self.codec.encode_batch(batch) {
            Ok(payload) => {
                self.bounded("publish", self.sink.publish(channel, payload))
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                trace!(sequence = batch.sequence, measurements = batch.len(), channel, "Batch published");
            }
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                self.errors.report(
                    ErrorKind::Sink,
                    format!("Publishing batch {} failed: {e}", batch.sequence),
                );
            }
        }
    }

    async fn upsert_latest(&self, batch: &MeasurementBatch) {
        let writes = batch
            .latest_per_channel()
            .into_iter()
            .map(|m| self.upsert_one(m));
        for failure in join_all(writes).await.into_iter().filter_map(Result::err) {
            self.counters.upsert_failures.fetch_add(1, Ordering::Relaxed);
            self.errors.report(
                ErrorKind::Sink,
                format!("Latest-value update for batch {} failed: {failure}", batch.sequence),
            );
        }
    }

    async fn upsert_one(&self, measurement: &Measurement) -> Result<(), SinkError> {
        let key = latest_key(&self.settings.key_prefix, &measurement.channel_id);
        let payload = self.codec.encode_measurement(measurement)?;
        self.bounded("upsert", self.sink.upsert(&key, payload, self.settings.latest_ttl))
            .await?;
        self.counters.upserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn bounded<F>(&self, operation: &'static str, call: F) -> Result<(), SinkError>
    where
        F: Future<Output = Result<(), SinkError>>,
    {
        let timeout = self.settings.call_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or(Err(SinkError::Timeout { operation, timeout }))
    }

    /// Drain `batches` on a new task until shutdown or until the queue closes.
    pub fn spawn(self, batches: broadcast::Receiver<Arc<MeasurementBatch>>) -> PublisherHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let counters = Arc::clone(&self.counters);
        info!(
            sink = self.sink.name(),
            channel = %self.settings.data_channel,
            "Starting batch publisher"
        );
        let task = tokio::spawn(self.run(batches, shutdown_rx));
        PublisherHandle {
            shutdown: Some(shutdown_tx),
            task,
            counters,
        }
    }

    async fn run(
        self,
        mut batches: broadcast::Receiver<Arc<MeasurementBatch>>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    self.drain(&mut batches).await;
                    break;
                }
                received = batches.recv() => match received {
                    Ok(batch) => self.publish_batch(&batch).await,
                    Err(RecvError::Lagged(missed)) => self.record_dropped(missed),
                    Err(RecvError::Closed) => {
                        debug!("Batch queue closed");
                        break;
                    }
                },
            }
        }
        let stats = self.stats();
        info!(
            published = stats.batches_published,
            dropped = stats.batches_dropped,
            failures = stats.publish_failures + stats.upsert_failures,
            "Batch publisher stopped"
        );
    }

    async fn drain(&self, batches: &mut broadcast::Receiver<Arc<MeasurementBatch>>) {
        loop {
            match batches.try_recv() {
                Ok(batch) => self.publish_batch(&batch).await,
                Err(TryRecvError::Lagged(missed)) => self.record_dropped(missed),
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    fn record_dropped(&self, missed: u64) {
        self.counters.dropped.fetch_add(missed, Ordering::Relaxed);
        warn!(missed, "Publisher fell behind; oldest batches dropped");
    }
}

/// Handle to a running publisher task.
#[derive(Debug)]
pub struct PublisherHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl PublisherHandle {
    /// Snapshot of the counters.
    pub fn stats(&self) -> PublisherStats {
        self.counters.snapshot()
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Publish whatever is already queued, then stop the task.
    pub async fn shutdown(mut self) -> PublisherStats {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Publisher task ended abnormally");
        }
        self.counters.snapshot()
    }
}
