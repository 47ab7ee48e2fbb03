//! Continuous acquisition engine.
//!
//! The engine owns the run/stop/error state machine and keeps exactly one device
//! read in flight while running. Every completion is calibrated, handed to the
//! batch queue without waiting, and immediately followed by the next read of the
//! same size.
//!
//! # Architecture
//!
//! ```text
//!   start()                       completion (device thread/task)
//!     │                                   │
//!     ▼                                   ▼
//! ┌──────────┐  begin_read   ┌─────────────────────┐
//! │ Session  │──────────────▶│ on_read_complete    │
//! │ (device) │◀──────────────│  1. still current?  │
//! └──────────┘  re-arm       │  2. end_read        │
//!                            │  3. calibrate       │
//!                            │  4. queue (no wait) │──▶ broadcast<Arc<MeasurementBatch>>
//!                            └─────────────────────┘        │            │
//!                                                      publisher     UI / tests
//! ```
//!
//! # States
//!
//! `Stopped --start--> Running --device error--> Error --stop--> Stopped`, and
//! `Running --stop--> Stopped`. Starting from anything but `Stopped` fails with
//! `AlreadyRunning`; an operator acknowledges an `Error` with `stop()`.
//!
//! # Concurrency
//!
//! The phase lives in an atomic cell checked at the top of every completion.
//! Each session carries a generation number, so a completion that belongs to a
//! session that was stopped (or replaced by a newer one) is discarded silently:
//! no publish, no re-arm. `stop()` marks the engine stopped before it takes the
//! session away from the device, and the session is released outside of any lock
//! the completion path needs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, trace, warn};

use crate::calibration::{calibrate, CalibrationTable};
use crate::error::{AppResult, DaqError, DeviceError, ErrorKind};
use crate::events::{ErrorEvent, ErrorReporter};
use crate::hardware::{AcquisitionDevice, SessionConfig, VoltageRange};
use crate::measurement::MeasurementBatch;
use crate::state::{AcquisitionState, Phase, StateCell};

/// Static device-facing settings for every session the engine opens.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Device name (e.g. `Dev1`)
    pub device: String,
    /// Physical channels sampled per session
    pub channel_count: usize,
    /// Input range for every channel
    pub voltage_range: VoltageRange,
    /// Batches buffered per subscriber before the oldest is evicted
    pub batch_queue_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            device: "Dev1".to_string(),
            channel_count: 16,
            voltage_range: VoltageRange::default(),
            batch_queue_capacity: 64,
        }
    }
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Sessions successfully configured
    pub sessions_started: u64,
    /// Reads collected from the device
    pub reads_completed: u64,
    /// Batches handed to the queue
    pub batches_produced: u64,
    /// Completions discarded because their session was no longer current
    pub stale_completions: u64,
}

/// Point-in-time view used by the status monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineHealth {
    /// Public run state
    pub state: AcquisitionState,
    /// A start is configuring a session right now
    pub starting: bool,
    /// A device session is attached
    pub has_session: bool,
    /// A read is outstanding on the attached session
    pub read_outstanding: bool,
}

impl EngineHealth {
    /// Running without a backing session.
    pub fn is_inconsistent(&self) -> bool {
        self.state == AcquisitionState::Running && !self.starting && !self.has_session
    }
}

#[derive(Default)]
struct Counters {
    sessions: AtomicU64,
    reads: AtomicU64,
    batches: AtomicU64,
    stale: AtomicU64,
}

/// One configured session and the parameters it was started with.
struct SessionSlot<S> {
    generation: u64,
    session: Mutex<Option<S>>,
    samples_per_channel: usize,
    calibration: CalibrationTable,
    outstanding: AtomicBool,
    sequence: AtomicU64,
}

struct Shared<D: AcquisitionDevice> {
    device: D,
    settings: EngineSettings,
    state: StateCell,
    generation: AtomicU64,
    current: Mutex<Option<Arc<SessionSlot<D::Session>>>>,
    control: Mutex<()>,
    batches: broadcast::Sender<Arc<MeasurementBatch>>,
    errors: ErrorReporter,
    counters: Counters,
}

/// Continuous acquisition engine driving one [`AcquisitionDevice`].
pub struct AcquisitionEngine<D: AcquisitionDevice> {
    shared: Arc<Shared<D>>,
}

impl<D: AcquisitionDevice> AcquisitionEngine<D> {
    /// Create an engine with its own error reporter.
    pub fn new(device: D, settings: EngineSettings) -> Self {
        Self::with_error_reporter(device, settings, ErrorReporter::default())
    }

    /// Create an engine that reports into an existing error channel.
    pub fn with_error_reporter(device: D, settings: EngineSettings, errors: ErrorReporter) -> Self {
        let (batches, _rx) = broadcast::channel(settings.batch_queue_capacity.max(1));
        info!(
            device = %device.name(),
            channels = settings.channel_count,
            queue = settings.batch_queue_capacity,
            "Created acquisition engine"
        );
        Self {
            shared: Arc::new(Shared {
                device,
                settings,
                state: StateCell::new(),
                generation: AtomicU64::new(0),
                current: Mutex::new(None),
                control: Mutex::new(()),
                batches,
                errors,
                counters: Counters::default(),
            }),
        }
    }

    /// Start continuous acquisition.
    ///
    /// Fails with `AlreadyRunning` unless the engine is `Stopped`, with
    /// `InvalidParameter` for a zero rate or read size, and with `Device` if the
    /// session cannot be set up. None of these leave a session attached.
    pub fn start(
        &self,
        sample_rate: u32,
        samples_per_channel: usize,
        calibration: CalibrationTable,
    ) -> AppResult<()> {
        let shared = &self.shared;
        let _control = shared.control.lock();

        let phase = shared.state.phase();
        if phase != Phase::Stopped {
            return Err(DaqError::AlreadyRunning(phase.as_state()));
        }
        if sample_rate == 0 {
            return Err(DaqError::InvalidParameter(
                "sample rate must be greater than zero".to_string(),
            ));
        }
        if samples_per_channel == 0 {
            return Err(DaqError::InvalidParameter(
                "samples per channel must be greater than zero".to_string(),
            ));
        }
        if calibration.is_empty() {
            warn!("No calibrated channels; batches will be empty");
        }

        shared
            .state
            .transition(Phase::Stopped, Phase::Starting)
            .map_err(|p| DaqError::AlreadyRunning(p.as_state()))?;
        let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let config = SessionConfig {
            device: shared.settings.device.clone(),
            channel_count: shared.settings.channel_count,
            voltage_range: shared.settings.voltage_range,
            sample_rate,
            samples_per_channel,
        };
        let session = match shared.device.configure(&config) {
            Ok(session) => session,
            Err(e) => {
                shared.state.swap(Phase::Stopped);
                shared
                    .errors
                    .report(ErrorKind::Device, format!("Session setup failed: {e}"));
                return Err(e.into());
            }
        };

        let slot = Arc::new(SessionSlot {
            generation,
            session: Mutex::new(Some(session)),
            samples_per_channel,
            calibration,
            outstanding: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
        });
        *shared.current.lock() = Some(Arc::clone(&slot));
        shared.counters.sessions.fetch_add(1, Ordering::Relaxed);
        shared.state.swap(Phase::Running);

        if let Err(e) = Shared::arm(shared, &slot) {
            shared.state.swap(Phase::Stopped);
            shared.release(&slot);
            shared
                .errors
                .report(e.kind(), format!("First read could not be armed: {e}"));
            return Err(e);
        }

        info!(
            generation,
            sample_rate,
            samples_per_channel,
            calibrated = slot.calibration.len(),
            "Started acquisition"
        );
        Ok(())
    }

    /// Stop acquisition and release the device session.
    ///
    /// Idempotent. From `Error` this acknowledges the failure and returns to
    /// `Stopped`.
    pub fn stop(&self) {
        let shared = &self.shared;
        let _control = shared.control.lock();

        let previous = shared.state.swap(Phase::Stopped);
        let slot = shared.current.lock().take();
        if let Some(slot) = slot {
            shared.release(&slot);
        }

        match previous {
            Phase::Stopped => trace!("Stop ignored; engine already stopped"),
            Phase::Error => info!("Acquisition error acknowledged"),
            Phase::Starting | Phase::Running => {
                let stats = self.stats();
                info!(
                    reads = stats.reads_completed,
                    batches = stats.batches_produced,
                    stale = stats.stale_completions,
                    "Stopped acquisition"
                );
            }
        }
    }

    /// Whether a session is live.
    pub fn is_running(&self) -> bool {
        self.shared.state.is_running()
    }

    /// Current run state.
    pub fn state(&self) -> AcquisitionState {
        self.shared.state.state()
    }

    /// Receive every future state change.
    pub fn watch_state(&self) -> watch::Receiver<AcquisitionState> {
        self.shared.state.subscribe()
    }

    /// Receive every future batch (OnBatchReady).
    ///
    /// A subscriber that falls more than the queue capacity behind loses the
    /// oldest batches and observes `RecvError::Lagged`.
    pub fn subscribe_batches(&self) -> broadcast::Receiver<Arc<MeasurementBatch>> {
        self.shared.batches.subscribe()
    }

    /// Receive every future error event (OnError).
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.shared.errors.subscribe()
    }

    /// Reporter shared with collaborators that report into the same channel.
    pub fn error_reporter(&self) -> &ErrorReporter {
        &self.shared.errors
    }

    /// Device-facing settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.shared.settings
    }

    /// The driven device.
    pub fn device(&self) -> &D {
        &self.shared.device
    }

    /// Snapshot of the engine counters.
    pub fn stats(&self) -> EngineStats {
        let c = &self.shared.counters;
        EngineStats {
            sessions_started: c.sessions.load(Ordering::Relaxed),
            reads_completed: c.reads.load(Ordering::Relaxed),
            batches_produced: c.batches.load(Ordering::Relaxed),
            stale_completions: c.stale.load(Ordering::Relaxed),
        }
    }

    /// Consistency snapshot for the status monitor.
    pub fn health(&self) -> EngineHealth {
        let phase = self.shared.state.phase();
        let current = self.shared.current.lock();
        let (has_session, read_outstanding) = current.as_ref().map_or((false, false), |slot| {
            (
                slot.session.lock().is_some(),
                slot.outstanding.load(Ordering::Acquire),
            )
        });
        EngineHealth {
            state: phase.as_state(),
            starting: phase == Phase::Starting,
            has_session,
            read_outstanding,
        }
    }

    /// Force a running engine without a session into `Error`.
    ///
    /// Re-checks the condition under the control lock; returns `true` only if the
    /// engine really was inconsistent and has now been stopped and flagged.
    pub fn recover_inconsistent(&self) -> bool {
        let shared = &self.shared;
        let _control = shared.control.lock();

        if !self.health().is_inconsistent() {
            return false;
        }
        if shared.state.transition(Phase::Running, Phase::Error).is_err() {
            return false;
        }
        let slot = shared.current.lock().take();
        if let Some(slot) = slot {
            shared.release(&slot);
        }
        shared.errors.report(
            ErrorKind::InconsistentState,
            "Engine reported Running without a device session; forced stop",
        );
        true
    }

    /// Detach the live session without touching the state, leaving a zombie.
    #[cfg(test)]
    pub(crate) fn detach_session_for_test(&self) {
        if let Some(slot) = self.shared.current.lock().as_ref() {
            if let Some(session) = slot.session.lock().take() {
                self.shared.device.dispose(session);
            }
        }
    }
}

impl<D: AcquisitionDevice> Shared<D> {
    fn is_current(&self, slot: &SessionSlot<D::Session>) -> bool {
        self.state.is_running() && self.generation.load(Ordering::Acquire) == slot.generation
    }

    /// Issue the next read on `slot`; never more than one outstanding.
    fn arm(this: &Arc<Self>, slot: &Arc<SessionSlot<D::Session>>) -> AppResult<()> {
        if slot
            .outstanding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DaqError::InconsistentState(format!(
                "read already outstanding on session {}",
                slot.generation
            )));
        }

        let guard = slot.session.lock();
        let Some(session) = guard.as_ref() else {
            slot.outstanding.store(false, Ordering::Release);
            return Err(DeviceError::SessionClosed {
                session: slot.generation,
            }
            .into());
        };

        let engine: Weak<Self> = Arc::downgrade(this);
        let completed = Arc::clone(slot);
        let armed = this.device.begin_read(
            session,
            slot.samples_per_channel,
            Box::new(move |pending| match engine.upgrade() {
                Some(shared) => Shared::on_read_complete(&shared, &completed, pending),
                None => completed.outstanding.store(false, Ordering::Release),
            }),
        );

        if let Err(e) = armed {
            slot.outstanding.store(false, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    fn on_read_complete(
        this: &Arc<Self>,
        slot: &Arc<SessionSlot<D::Session>>,
        pending: D::PendingRead,
    ) {
        slot.outstanding.store(false, Ordering::Release);
        if !this.is_current(slot) {
            this.discard(slot);
            return;
        }

        let collected = {
            let guard = slot.session.lock();
            guard
                .as_ref()
                .map(|session| this.device.end_read(session, pending))
        };
        let Some(collected) = collected else {
            this.discard(slot);
            return;
        };
        let block = match collected {
            Ok(block) => block,
            Err(e) => {
                this.fail(slot, DaqError::Device(e));
                return;
            }
        };
        this.counters.reads.fetch_add(1, Ordering::Relaxed);

        let sequence = slot.sequence.fetch_add(1, Ordering::Relaxed);
        let batch = calibrate(&block, &slot.calibration, sequence);
        drop(block);

        if !this.is_current(slot) {
            this.discard(slot);
            return;
        }
        trace!(sequence, measurements = batch.len(), "Batch ready");
        if this.batches.send(Arc::new(batch)).is_err() {
            trace!(sequence, "No batch subscribers");
        }
        this.counters.batches.fetch_add(1, Ordering::Relaxed);

        if !this.is_current(slot) {
            return;
        }
        if let Err(e) = Self::arm(this, slot) {
            this.fail(slot, e);
        }
    }

    fn discard(&self, slot: &SessionSlot<D::Session>) {
        self.counters.stale.fetch_add(1, Ordering::Relaxed);
        trace!(generation = slot.generation, "Discarded completion from inactive session");
    }

    /// Terminal failure of the live session: `Running → Error`, release, report.
    fn fail(&self, slot: &SessionSlot<D::Session>, err: DaqError) {
        if self.generation.load(Ordering::Acquire) != slot.generation
            || self.state.transition(Phase::Running, Phase::Error).is_err()
        {
            debug!(error = %err, generation = slot.generation, "Ignoring failure from inactive session");
            return;
        }
        self.release(slot);
        self.errors.report_error(&err);
    }

    /// Detach `slot` and hand its session back to the device.
    fn release(&self, slot: &SessionSlot<D::Session>) {
        {
            let mut current = self.current.lock();
            if current
                .as_ref()
                .is_some_and(|c| c.generation == slot.generation)
            {
                *current = None;
            }
        }

        let session = slot.session.lock().take();
        if let Some(session) = session {
            if let Err(e) = self.device.stop(&session) {
                warn!(error = %e, generation = slot.generation, "Device stop failed; disposing anyway");
            }
            self.device.dispose(session);
            debug!(generation = slot.generation, "Released device session");
        }
    }
}

impl<D: AcquisitionDevice> Drop for Shared<D> {
    fn drop(&mut self) {
        self.state.swap(Phase::Stopped);
        if let Some(slot) = self.current.get_mut().take() {
            self.release(&slot);
        }
    }
}
