//! Simulated acquisition device.
//!
//! Stands in for a real multi-channel analog input card so the relay can run
//! without hardware. Each channel produces a sine wave with a channel-specific
//! frequency plus uniform noise, clamped to the session's voltage range.
//!
//! Reads complete on the tokio runtime that was current when the session was
//! configured, paced by the sample rate: a read of `n` samples at `r` Hz completes
//! `n / r` seconds after the previous one (or after `begin_read`, if acquisition
//! fell behind). Like a real card, the simulated session refuses a second read
//! while one is pending.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::{AcquisitionDevice, ReadCompletion, SessionConfig, VoltageRange};
use crate::error::DeviceError;
use crate::measurement::RawSampleBlock;

/// Waveform parameters for the simulated device.
#[derive(Debug, Clone)]
pub struct SimulatedDeviceConfig {
    /// Device name sessions must ask for
    pub name: String,
    /// Frequency of channel 0 in Hz; channel `i` runs at `(i + 1)` times this
    pub base_frequency_hz: f64,
    /// Peak-to-peak noise in volts
    pub noise_volts: f64,
}

impl Default for SimulatedDeviceConfig {
    fn default() -> Self {
        Self {
            name: "Dev1".to_string(),
            base_frequency_hz: 1.0,
            noise_volts: 0.01,
        }
    }
}

/// Simulated continuous analog input device.
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    config: SimulatedDeviceConfig,
    next_session: AtomicU64,
}

impl SimulatedDevice {
    /// Create a device answering to `Dev1`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a device with custom waveform parameters.
    pub fn with_config(config: SimulatedDeviceConfig) -> Self {
        Self {
            config,
            next_session: AtomicU64::new(0),
        }
    }
}

/// Live simulated session.
#[derive(Debug)]
pub struct SimulatedSession {
    id: u64,
    channel_count: usize,
    range: VoltageRange,
    sample_rate: u32,
    runtime: Handle,
    shared: Arc<SessionShared>,
}

#[derive(Debug)]
struct SessionShared {
    stopped: AtomicBool,
    pending: AtomicBool,
    next_sample: AtomicU64,
    next_deadline: Mutex<Option<Instant>>,
}

/// Pending-read token of the simulated device.
#[derive(Debug)]
pub struct SimulatedRead {
    session: u64,
    first_sample: u64,
    samples_per_channel: usize,
}

impl AcquisitionDevice for SimulatedDevice {
    type Session = SimulatedSession;
    type PendingRead = SimulatedRead;

    fn name(&self) -> String {
        format!("simulated:{}", self.config.name)
    }

    fn configure(&self, config: &SessionConfig) -> Result<SimulatedSession, DeviceError> {
        if config.device != self.config.name {
            return Err(DeviceError::NotFound {
                device: config.device.clone(),
            });
        }
        if config.channel_count == 0 {
            return Err(DeviceError::Configuration {
                message: "at least one channel is required".to_string(),
            });
        }
        if config.sample_rate == 0 {
            return Err(DeviceError::Configuration {
                message: "sample rate must be positive".to_string(),
            });
        }
        if config.voltage_range.span() <= 0.0 {
            return Err(DeviceError::Configuration {
                message: format!(
                    "empty voltage range {}..{}",
                    config.voltage_range.min, config.voltage_range.max
                ),
            });
        }
        let runtime = Handle::try_current().map_err(|e| DeviceError::Configuration {
            message: format!("simulated device needs a tokio runtime: {e}"),
        })?;

        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        info!(
            session = id,
            channels = config.channel_count,
            sample_rate = config.sample_rate,
            "Configured simulated session on {}/ai0:{}",
            self.config.name,
            config.channel_count - 1
        );

        Ok(SimulatedSession {
            id,
            channel_count: config.channel_count,
            range: config.voltage_range,
            sample_rate: config.sample_rate,
            runtime,
            shared: Arc::new(SessionShared {
                stopped: AtomicBool::new(false),
                pending: AtomicBool::new(false),
                next_sample: AtomicU64::new(0),
                next_deadline: Mutex::new(None),
            }),
        })
    }

    fn begin_read(
        &self,
        session: &SimulatedSession,
        samples_per_channel: usize,
        on_complete: ReadCompletion<SimulatedRead>,
    ) -> Result<(), DeviceError> {
        let shared = &session.shared;
        if shared.stopped.load(Ordering::SeqCst) {
            return Err(DeviceError::SessionClosed {
                session: session.id,
            });
        }
        if shared
            .pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DeviceError::ReadPending {
                session: session.id,
            });
        }

        let read_time =
            Duration::from_secs_f64(samples_per_channel as f64 / f64::from(session.sample_rate));
        let deadline = {
            let mut next = shared.next_deadline.lock();
            let now = Instant::now();
            let start = next.map_or(now, |d| d.max(now));
            let deadline = start + read_time;
            *next = Some(deadline);
            deadline
        };

        let token = SimulatedRead {
            session: session.id,
            first_sample: shared
                .next_sample
                .fetch_add(samples_per_channel as u64, Ordering::SeqCst),
            samples_per_channel,
        };
        trace!(session = session.id, first_sample = token.first_sample, "Read armed");

        session.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_complete(token);
        });
        Ok(())
    }

    fn end_read(
        &self,
        session: &SimulatedSession,
        pending: SimulatedRead,
    ) -> Result<RawSampleBlock, DeviceError> {
        if pending.session != session.id {
            return Err(DeviceError::ReadComplete {
                message: format!(
                    "read belongs to session {}, not {}",
                    pending.session, session.id
                ),
            });
        }
        session.shared.pending.store(false, Ordering::SeqCst);
        if session.shared.stopped.load(Ordering::SeqCst) {
            return Err(DeviceError::SessionClosed {
                session: session.id,
            });
        }

        let mut rng = rand::thread_rng();
        let rate = f64::from(session.sample_rate);
        let mid = (session.range.min + session.range.max) / 2.0;
        let amplitude = session.range.span() * 0.4;
        let half_noise = self.config.noise_volts / 2.0;

        let channels = (0..session.channel_count)
            .map(|ch| {
                let freq = self.config.base_frequency_hz * (ch as f64 + 1.0);
                (0..pending.samples_per_channel)
                    .map(|i| {
                        let t = (pending.first_sample + i as u64) as f64 / rate;
                        let noise = if half_noise > 0.0 {
                            rng.gen_range(-half_noise..half_noise)
                        } else {
                            0.0
                        };
                        session
                            .range
                            .clamp(mid + amplitude * (TAU * freq * t).sin() + noise)
                    })
                    .collect()
            })
            .collect();

        RawSampleBlock::from_channels(channels, Utc::now())
    }

    fn stop(&self, session: &SimulatedSession) -> Result<(), DeviceError> {
        session.shared.stopped.store(true, Ordering::SeqCst);
        debug!(session = session.id, "Simulated session stopped");
        Ok(())
    }

    fn dispose(&self, session: SimulatedSession) {
        session.shared.stopped.store(true, Ordering::SeqCst);
        debug!(session = session.id, "Simulated session disposed");
    }
}
