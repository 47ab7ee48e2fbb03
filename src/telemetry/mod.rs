//! Telemetry sink capability and batch relay.
//!
//! The relay talks to its message broker through [`TelemetrySink`]: publish a
//! payload on a channel, upsert a payload under a key, and subscribe to a channel.
//! Payload bytes come from a [`Codec`]; the core never looks inside them.
//!
//! Sinks:
//! - [`MemorySink`]: in-process broker and key-value store, used by tests and the
//!   default `memory` backend.
//! - `RedisSink` (feature `redis_sink`): Redis `PUBLISH` plus `SET`/`PSETEX`.
//!
//! [`BatchPublisher`] drains the engine's batch queue into a sink on its own task.

pub mod memory;
pub mod publisher;
#[cfg(feature = "redis_sink")]
pub mod redis;

pub use memory::MemorySink;
pub use publisher::{BatchPublisher, PublisherHandle, PublisherSettings, PublisherStats};
#[cfg(feature = "redis_sink")]
pub use self::redis::RedisSink;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::SinkError;
use crate::measurement::{Measurement, MeasurementBatch};

/// Default channel carrying full batches.
pub const DEFAULT_DATA_CHANNEL: &str = "Daq.data.updated";
/// Default prefix of the per-channel latest-value keys.
pub const DEFAULT_KEY_PREFIX: &str = "Daq:data:";

/// Messages buffered per subscription before the sink drops new ones.
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Publish/subscribe plus key-value service receiving calibrated output.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Sink name for logs.
    fn name(&self) -> &str;

    /// Publish one message on `channel`.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), SinkError>;

    /// Overwrite the value stored under `key`, optionally expiring it.
    async fn upsert(&self, key: &str, payload: Bytes, ttl: Option<Duration>)
        -> Result<(), SinkError>;

    /// Receive every future message published on `channel`.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, SinkError>;

    /// Stop delivering messages for `channel` to all of this sink's subscribers.
    async fn unsubscribe(&self, channel: &str) -> Result<(), SinkError>;
}

/// Byte codec for batches and single measurements.
pub trait Codec: Send + Sync {
    /// Encode a full batch.
    fn encode_batch(&self, batch: &MeasurementBatch) -> Result<Bytes, SinkError>;

    /// Decode a full batch.
    fn decode_batch(&self, bytes: &[u8]) -> Result<MeasurementBatch, SinkError>;

    /// Encode one measurement.
    fn encode_measurement(&self, measurement: &Measurement) -> Result<Bytes, SinkError>;

    /// Decode one measurement.
    fn decode_measurement(&self, bytes: &[u8]) -> Result<Measurement, SinkError>;
}

/// JSON codec using the measurement types' serde representation.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_batch(&self, batch: &MeasurementBatch) -> Result<Bytes, SinkError> {
        Ok(serde_json::to_vec(batch)?.into())
    }

    fn decode_batch(&self, bytes: &[u8]) -> Result<MeasurementBatch, SinkError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode_measurement(&self, measurement: &Measurement) -> Result<Bytes, SinkError> {
        Ok(serde_json::to_vec(measurement)?.into())
    }

    fn decode_measurement(&self, bytes: &[u8]) -> Result<Measurement, SinkError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Latest-value key of a channel.
pub fn latest_key(prefix: &str, channel_id: &str) -> String {
    format!("{prefix}{channel_id}")
}
