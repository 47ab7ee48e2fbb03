//! Acquisition device capability.
//!
//! The engine never talks to a driver directly; it drives anything implementing
//! [`AcquisitionDevice`]. The contract mirrors how continuous-sampling DAQ drivers
//! expose asynchronous multi-channel reads:
//!
//! 1. [`configure`](AcquisitionDevice::configure) creates one sampling session for
//!    all channels at a fixed rate and voltage range.
//! 2. [`begin_read`](AcquisitionDevice::begin_read) requests the next
//!    `samples_per_channel` samples and returns immediately.
//! 3. When the samples are in, the device invokes the completion exactly once,
//!    handing over an opaque pending-read token.
//! 4. [`end_read`](AcquisitionDevice::end_read) turns the token into a
//!    [`RawSampleBlock`].
//! 5. [`stop`](AcquisitionDevice::stop) halts sampling and
//!    [`dispose`](AcquisitionDevice::dispose) releases the session.
//!
//! # Contract
//! - The completion must never be invoked from inside the `begin_read` call that
//!   registered it, nor from inside `stop`; drivers complete on their own thread or
//!   task.
//! - A completion may still fire after `stop`; callers discard it.
//! - All failures are [`DeviceError`]s.

pub mod simulated;

pub use simulated::{SimulatedDevice, SimulatedDeviceConfig};

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::measurement::RawSampleBlock;

/// Callback invoked once when a read completes.
pub type ReadCompletion<P> = Box<dyn FnOnce(P) + Send + 'static>;

/// Input voltage range applied to every channel of a session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageRange {
    /// Lower bound in volts
    pub min: f64,
    /// Upper bound in volts
    pub max: f64,
}

impl VoltageRange {
    /// Create a range; callers validate `min < max`.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Span of the range in volts.
    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    /// Clamp a reading into the range, as an ADC would saturate.
    pub fn clamp(&self, volts: f64) -> f64 {
        volts.clamp(self.min, self.max)
    }
}

impl Default for VoltageRange {
    fn default() -> Self {
        Self { min: 0.0, max: 10.0 }
    }
}

/// Everything a device needs to set up one continuous-sampling session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Device name (e.g. `Dev1`)
    pub device: String,
    /// Number of physical input channels to sample
    pub channel_count: usize,
    /// Voltage range for every channel
    pub voltage_range: VoltageRange,
    /// Per-channel sample rate in Hz
    pub sample_rate: u32,
    /// Samples per channel delivered by each read
    pub samples_per_channel: usize,
}

/// Continuous multi-channel analog acquisition device.
pub trait AcquisitionDevice: Send + Sync + 'static {
    /// Live sampling session; owned exclusively by the engine.
    type Session: Send + 'static;
    /// Token handed to the completion callback.
    type PendingRead: Send + 'static;

    /// Human-readable device name for logs.
    fn name(&self) -> String;

    /// Create a continuous-sampling session for all channels.
    fn configure(&self, config: &SessionConfig) -> Result<Self::Session, DeviceError>;

    /// Request the next `samples_per_channel` samples.
    fn begin_read(
        &self,
        session: &Self::Session,
        samples_per_channel: usize,
        on_complete: ReadCompletion<Self::PendingRead>,
    ) -> Result<(), DeviceError>;

    /// Collect a completed read.
    fn end_read(
        &self,
        session: &Self::Session,
        pending: Self::PendingRead,
    ) -> Result<RawSampleBlock, DeviceError>;

    /// Halt sampling on the session.
    fn stop(&self, session: &Self::Session) -> Result<(), DeviceError>;

    /// Release the session and everything attached to it.
    fn dispose(&self, session: Self::Session);
}
