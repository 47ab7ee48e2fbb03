//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use daq_relay::error::{DeviceError, SinkError};
use daq_relay::hardware::{AcquisitionDevice, ReadCompletion, SessionConfig};
use daq_relay::measurement::RawSampleBlock;
use daq_relay::telemetry::TelemetrySink;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Observable state of a [`FakeDevice`].
#[derive(Default)]
pub struct FakeState {
    pub sessions_opened: AtomicUsize,
    pub live_sessions: AtomicUsize,
    pub reads_issued: AtomicUsize,
    pub overlapping_reads: AtomicUsize,
    pub fail_configure: AtomicBool,
    /// The n-th `begin_read` (1-based) fails
    pub fail_read_number: Mutex<Option<usize>>,
    /// Raw blocks handed out in order; afterwards every sample equals the read number
    pub scripted: Mutex<VecDeque<Vec<Vec<f64>>>>,
}

/// Device completing reads on the tokio runtime after a fixed delay.
///
/// It never refuses a second read silently: an overlapping `begin_read` is
/// counted in `overlapping_reads` and fails.
#[derive(Clone)]
pub struct FakeDevice {
    pub state: Arc<FakeState>,
    pub read_delay: Duration,
}

pub struct FakeSession {
    channel_count: usize,
    outstanding: Arc<AtomicBool>,
}

impl FakeDevice {
    pub fn new(read_delay: Duration) -> Self {
        Self {
            state: Arc::new(FakeState::default()),
            read_delay,
        }
    }

    pub fn script(&self, block: Vec<Vec<f64>>) {
        self.state.scripted.lock().push_back(block);
    }

    pub fn live_sessions(&self) -> usize {
        self.state.live_sessions.load(Ordering::SeqCst)
    }

    pub fn overlapping_reads(&self) -> usize {
        self.state.overlapping_reads.load(Ordering::SeqCst)
    }
}

impl AcquisitionDevice for FakeDevice {
    type Session = FakeSession;
    type PendingRead = usize;

    fn name(&self) -> String {
        "fake".to_string()
    }

    fn configure(&self, config: &SessionConfig) -> Result<FakeSession, DeviceError> {
        if self.state.fail_configure.load(Ordering::SeqCst) {
            return Err(DeviceError::NotFound {
                device: config.device.clone(),
            });
        }
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        self.state.live_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession {
            channel_count: config.channel_count,
            outstanding: Arc::new(AtomicBool::new(false)),
        })
    }

    fn begin_read(
        &self,
        session: &FakeSession,
        _samples_per_channel: usize,
        on_complete: ReadCompletion<usize>,
    ) -> Result<(), DeviceError> {
        let number = self.state.reads_issued.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.state.fail_read_number.lock() == Some(number) {
            return Err(DeviceError::ReadArm {
                message: format!("scripted failure on read {number}"),
            });
        }
        if session.outstanding.swap(true, Ordering::SeqCst) {
            self.state.overlapping_reads.fetch_add(1, Ordering::SeqCst);
            return Err(DeviceError::ReadPending { session: 0 });
        }

        let delay = self.read_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_complete(number);
        });
        Ok(())
    }

    fn end_read(&self, session: &FakeSession, number: usize) -> Result<RawSampleBlock, DeviceError> {
        session.outstanding.store(false, Ordering::SeqCst);
        let channels = self
            .state
            .scripted
            .lock()
            .pop_front()
            .unwrap_or_else(|| vec![vec![number as f64; 2]; session.channel_count]);
        RawSampleBlock::from_channels(channels, Utc::now())
    }

    fn stop(&self, _session: &FakeSession) -> Result<(), DeviceError> {
        Ok(())
    }

    fn dispose(&self, _session: FakeSession) {
        self.state.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sink whose every call fails.
#[derive(Default)]
pub struct FailingSink {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl TelemetrySink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn publish(&self, channel: &str, _payload: Bytes) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Publish {
            channel: channel.to_string(),
            message: "broker unreachable".to_string(),
        })
    }

    async fn upsert(&self, key: &str, _payload: Bytes, _ttl: Option<Duration>) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Upsert {
            key: key.to_string(),
            message: "broker unreachable".to_string(),
        })
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Bytes>, SinkError> {
        Err(SinkError::Subscribe {
            channel: channel.to_string(),
            message: "broker unreachable".to_string(),
        })
    }

    async fn unsubscribe(&self, _channel: &str) -> Result<(), SinkError> {
        Ok(())
    }
}
