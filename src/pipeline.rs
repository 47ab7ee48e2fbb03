//! Wiring of engine, publisher and status monitor.
//!
//! [`Pipeline`] owns one engine and the two background tasks that observe it.
//! The publisher subscribes to the batch queue before acquisition can start, so
//! no batch is produced without a consumer.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::info;

use crate::config::{AppConfig, TelemetryConfig};
use crate::engine::AcquisitionEngine;
use crate::error::{AppResult, DaqError};
use crate::events::{ErrorEvent, ErrorReporter};
use crate::hardware::AcquisitionDevice;
use crate::monitor::{DisplayStatus, MonitorHandle, StatusMonitor};
use crate::telemetry::{BatchPublisher, MemorySink, PublisherHandle, PublisherStats, TelemetrySink};

/// Open the sink named by `telemetry.backend`.
pub async fn connect_sink(config: &TelemetryConfig) -> AppResult<Arc<dyn TelemetrySink>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemorySink::new())),
        #[cfg(feature = "redis_sink")]
        "redis" => Ok(Arc::new(crate::telemetry::RedisSink::connect(&config.url).await?)),
        #[cfg(not(feature = "redis_sink"))]
        "redis" => Err(DaqError::Configuration(
            "telemetry backend 'redis' requires the redis_sink feature".to_string(),
        )),
        other => Err(DaqError::Configuration(format!(
            "Unknown telemetry backend '{other}'"
        ))),
    }
}

/// A running relay: engine plus publisher and monitor tasks.
pub struct Pipeline<D: AcquisitionDevice> {
    config: AppConfig,
    engine: Arc<AcquisitionEngine<D>>,
    sink: Arc<dyn TelemetrySink>,
    publisher: PublisherHandle,
    monitor: MonitorHandle,
}

impl<D: AcquisitionDevice> Pipeline<D> {
    /// Wire everything up; must be called from within a tokio runtime.
    pub fn new(config: AppConfig, device: D, sink: Arc<dyn TelemetrySink>) -> Self {
        let errors = ErrorReporter::default();
        let engine = Arc::new(AcquisitionEngine::with_error_reporter(
            device,
            config.engine_settings(),
            errors.clone(),
        ));
        let publisher = BatchPublisher::new(Arc::clone(&sink), config.publisher_settings(), errors)
            .spawn(engine.subscribe_batches());
        let monitor = StatusMonitor::new(Arc::clone(&engine), config.poll_interval()).spawn();

        info!(
            application = %config.application.name,
            sink = sink.name(),
            "Pipeline ready"
        );
        Self {
            config,
            engine,
            sink,
            publisher,
            monitor,
        }
    }

    /// Start acquisition with the configured rate, read size and calibration.
    pub fn start_from_config(&self) -> AppResult<()> {
        let calibration = self.config.calibration()?;
        let acq = &self.config.acquisition;
        self.engine
            .start(acq.sample_rate, acq.samples_per_channel, calibration)
    }

    /// Stop acquisition; the pipeline stays usable.
    pub fn stop(&self) {
        self.engine.stop();
    }

    /// The engine.
    pub fn engine(&self) -> &Arc<AcquisitionEngine<D>> {
        &self.engine
    }

    /// The telemetry sink.
    pub fn sink(&self) -> &Arc<dyn TelemetrySink> {
        &self.sink
    }

    /// Configuration the pipeline was built from.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Last status published by the monitor.
    pub fn status(&self) -> DisplayStatus {
        self.monitor.status()
    }

    /// Receive every future status change.
    pub fn subscribe_status(&self) -> watch::Receiver<DisplayStatus> {
        self.monitor.subscribe()
    }

    /// Receive every future error event.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.engine.subscribe_errors()
    }

    /// Publisher counters.
    pub fn publisher_stats(&self) -> PublisherStats {
        self.publisher.stats()
    }

    /// Stop acquisition, stop the monitor, and publish what is still queued.
    pub async fn shutdown(self) -> PublisherStats {
        self.engine.stop();
        self.monitor.shutdown().await;
        let stats = self.publisher.shutdown().await;
        info!(
            published = stats.batches_published,
            dropped = stats.batches_dropped,
            "Pipeline shut down"
        );
        stats
    }
}
