//! # DAQ Relay Core Library
//!
//! Continuously samples a multi-channel analog input device, converts raw volts into
//! calibrated engineering-unit measurements, and relays them to a telemetry sink
//! (a publish/subscribe channel plus a latest-value store) without ever letting the
//! sink slow down the sampling clock.
//!
//! ## Crate Structure
//!
//! - **`engine`**: The `AcquisitionEngine`: run/stop/error state machine and the
//!   continuous read loop that keeps exactly one device read in flight.
//! - **`calibration`**: Per-channel affine calibration of raw blocks into batches.
//! - **`hardware`**: The `AcquisitionDevice` capability and a simulated device.
//! - **`telemetry`**: The `TelemetrySink` capability, sinks (memory, Redis), the
//!   payload codec and the `BatchPublisher`.
//! - **`monitor`**: The `StatusMonitor`: display status and zombie-state recovery.
//! - **`measurement`**: Raw blocks, measurements and batches.
//! - **`state`**: The acquisition state and its watch channel.
//! - **`events`**: Error events broadcast to subscribers.
//! - **`error`**: `DaqError`, `DeviceError`, `SinkError` and `ErrorKind`.
//! - **`config`**: Figment-based configuration (TOML + environment + legacy JSON).
//! - **`tracing_setup`**: `tracing-subscriber` initialisation.
//! - **`pipeline`**: Wiring of engine, publisher and monitor from configuration.

pub mod calibration;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hardware;
pub mod measurement;
pub mod monitor;
pub mod pipeline;
pub mod state;
pub mod telemetry;
pub mod tracing_setup;

pub use calibration::{calibrate, CalibrationTable, ChannelCalibration};
pub use engine::{AcquisitionEngine, EngineHealth, EngineSettings, EngineStats};
pub use error::{AppResult, DaqError, DeviceError, ErrorKind, SinkError};
pub use events::{ErrorEvent, ErrorReporter};
pub use measurement::{Measurement, MeasurementBatch, MeasurementStatus, RawSampleBlock};
pub use monitor::{DisplayStatus, StatusMonitor};
pub use pipeline::Pipeline;
pub use state::AcquisitionState;
