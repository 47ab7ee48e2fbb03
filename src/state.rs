//! Acquisition run state.
//!
//! [`AcquisitionState`] is the public three-state view. Internally the engine also
//! tracks a transient `Starting` phase while a session is being configured, so that
//! the status monitor does not mistake a half-built session for a zombie. The phase
//! lives in an atomic cell; every successful transition is mirrored into a
//! `tokio::sync::watch` channel so observers are pushed state changes instead of
//! having to poll.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Coarse run state of the acquisition engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AcquisitionState {
    /// No session, no read in flight.
    #[default]
    Stopped,
    /// A session is live and a read is outstanding.
    Running,
    /// The last session died on a device error; `stop()` acknowledges it.
    Error,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Internal engine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Error = 3,
}

impl Phase {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Error,
            _ => Self::Stopped,
        }
    }

    /// Public view; a session still being configured is not running yet.
    pub(crate) fn as_state(self) -> AcquisitionState {
        match self {
            Self::Stopped | Self::Starting => AcquisitionState::Stopped,
            Self::Running => AcquisitionState::Running,
            Self::Error => AcquisitionState::Error,
        }
    }
}

/// Atomic phase cell with a push channel for observers.
pub(crate) struct StateCell {
    phase: AtomicU8,
    tx: watch::Sender<AcquisitionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(AcquisitionState::Stopped);
        Self {
            phase: AtomicU8::new(Phase::Stopped as u8),
            tx,
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase::from_raw(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn state(&self) -> AcquisitionState {
        self.phase().as_state()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    /// Compare-and-swap `from` → `to`. Returns the observed phase on failure.
    pub(crate) fn transition(&self, from: Phase, to: Phase) -> Result<(), Phase> {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| self.notify())
            .map_err(Phase::from_raw)
    }

    /// Unconditionally set `to`, returning the previous phase.
    pub(crate) fn swap(&self, to: Phase) -> Phase {
        let previous = Phase::from_raw(self.phase.swap(to as u8, Ordering::AcqRel));
        if previous != to {
            self.notify();
        }
        previous
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<AcquisitionState> {
        self.tx.subscribe()
    }

    // Publishes whatever the cell holds now, so racing writers converge on the last value.
    fn notify(&self) {
        let current = self.state();
        self.tx.send_if_modified(|seen| {
            if *seen == current {
                false
            } else {
                *seen = current;
                true
            }
        });
    }
}
