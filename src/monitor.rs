//! Status monitor.
//!
//! Derives a presentation-neutral [`DisplayStatus`] from the engine. State changes
//! are pushed through the engine's watch channel; a fixed-interval poll backs that
//! up and runs the consistency check: an engine that claims to be `Running`
//! without a device session is forced into `Error` and everything it held is
//! released.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::{AcquisitionEngine, EngineHealth};
use crate::hardware::AcquisitionDevice;
use crate::state::AcquisitionState;

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Status shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DisplayStatus {
    /// Idle
    #[default]
    Stopped,
    /// Acquiring
    Running,
    /// Needs operator attention
    Error,
}

impl DisplayStatus {
    /// Short label for status bars.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stopped => "Status: Stopped",
            Self::Running => "Status: Running",
            Self::Error => "Status: Error",
        }
    }
}

impl fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<AcquisitionState> for DisplayStatus {
    fn from(state: AcquisitionState) -> Self {
        match state {
            AcquisitionState::Stopped => Self::Stopped,
            AcquisitionState::Running => Self::Running,
            AcquisitionState::Error => Self::Error,
        }
    }
}

/// What the monitor needs from an engine.
pub trait EngineHealthSource: Send + Sync + 'static {
    /// Consistency snapshot.
    fn health(&self) -> EngineHealth;

    /// Force an inconsistent engine into `Error`; `true` if it did.
    fn recover_inconsistent(&self) -> bool;

    /// Push channel of state changes.
    fn watch_state(&self) -> watch::Receiver<AcquisitionState>;
}

impl<D: AcquisitionDevice> EngineHealthSource for AcquisitionEngine<D> {
    fn health(&self) -> EngineHealth {
        AcquisitionEngine::health(self)
    }

    fn recover_inconsistent(&self) -> bool {
        AcquisitionEngine::recover_inconsistent(self)
    }

    fn watch_state(&self) -> watch::Receiver<AcquisitionState> {
        AcquisitionEngine::watch_state(self)
    }
}

/// Periodic health check and status derivation.
pub struct StatusMonitor<E: EngineHealthSource> {
    engine: Arc<E>,
    interval: Duration,
    status: watch::Sender<DisplayStatus>,
}

impl<E: EngineHealthSource> StatusMonitor<E> {
    /// Create a monitor polling every `interval`.
    pub fn new(engine: Arc<E>, interval: Duration) -> Self {
        let initial = DisplayStatus::from(engine.health().state);
        let (status, _rx) = watch::channel(initial);
        Self {
            engine,
            interval,
            status,
        }
    }

    /// Receive every future status change.
    pub fn subscribe(&self) -> watch::Receiver<DisplayStatus> {
        self.status.subscribe()
    }

    /// Run one check: recover a zombie engine, then publish the status.
    pub fn check(&self) -> DisplayStatus {
        if self.engine.health().is_inconsistent() && self.engine.recover_inconsistent() {
            warn!("Engine was running without a session; forced into Error");
        }

        let status = DisplayStatus::from(self.engine.health().state);
        self.status.send_if_modified(|shown| {
            if *shown == status {
                false
            } else {
                debug!(from = %shown, to = %status, "Status changed");
                *shown = status;
                true
            }
        });
        status
    }

    /// Run the monitor on a new task.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let status = self.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));
        MonitorHandle {
            status,
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let mut states = self.engine.watch_state();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "Status monitor started");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        debug!("Engine state channel closed");
                        break;
                    }
                    self.check();
                }
                _ = ticker.tick() => {
                    self.check();
                }
            }
        }
        debug!("Status monitor stopped");
    }
}

/// Handle to a running monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    status: watch::Receiver<DisplayStatus>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Last published status.
    pub fn status(&self) -> DisplayStatus {
        *self.status.borrow()
    }

    /// Receive every future status change.
    pub fn subscribe(&self) -> watch::Receiver<DisplayStatus> {
        self.status.clone()
    }

    /// Stop the monitor task.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Status monitor ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Engine stand-in whose health the test scripts directly.
    struct Scripted {
        health: Mutex<EngineHealth>,
        recoveries: AtomicUsize,
        tx: watch::Sender<AcquisitionState>,
    }

    impl Scripted {
        fn new(state: AcquisitionState, has_session: bool) -> Arc<Self> {
            Arc::new(Self {
                health: Mutex::new(EngineHealth {
                    state,
                    starting: false,
                    has_session,
                    read_outstanding: has_session,
                }),
                recoveries: AtomicUsize::new(0),
                tx: watch::channel(state).0,
            })
        }
    }

    impl EngineHealthSource for Scripted {
        fn health(&self) -> EngineHealth {
            *self.health.lock()
        }

        fn recover_inconsistent(&self) -> bool {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
            self.health.lock().state = AcquisitionState::Error;
            true
        }

        fn watch_state(&self) -> watch::Receiver<AcquisitionState> {
            self.tx.subscribe()
        }
    }

    #[test]
    fn healthy_running_engine_shows_running() {
        let engine = Scripted::new(AcquisitionState::Running, true);
        let monitor = StatusMonitor::new(engine.clone(), DEFAULT_POLL_INTERVAL);
        assert_eq!(monitor.check(), DisplayStatus::Running);
        assert_eq!(engine.recoveries.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn zombie_engine_is_forced_into_error() {
        let engine = Scripted::new(AcquisitionState::Running, false);
        let monitor = StatusMonitor::new(engine.clone(), DEFAULT_POLL_INTERVAL);
        let rx = monitor.subscribe();

        assert_eq!(monitor.check(), DisplayStatus::Error);
        assert_eq!(engine.recoveries.load(Ordering::SeqCst), 1);
        assert_eq!(*rx.borrow(), DisplayStatus::Error);
    }

    #[test]
    fn session_being_configured_is_not_a_zombie() {
        let engine = Scripted::new(AcquisitionState::Running, false);
        engine.health.lock().starting = true;
        let monitor = StatusMonitor::new(engine.clone(), DEFAULT_POLL_INTERVAL);
        monitor.check();
        assert_eq!(engine.recoveries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_monitor_follows_state_pushes() {
        let engine = Scripted::new(AcquisitionState::Stopped, false);
        let handle = StatusMonitor::new(engine.clone(), Duration::from_secs(60)).spawn();
        let mut status = handle.subscribe();

        *engine.health.lock() = EngineHealth {
            state: AcquisitionState::Running,
            starting: false,
            has_session: true,
            read_outstanding: true,
        };
        engine.tx.send_replace(AcquisitionState::Running);

        tokio::time::timeout(Duration::from_secs(1), status.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*status.borrow(), DisplayStatus::Running);
        handle.shutdown().await;
    }

    #[test]
    fn labels() {
        assert_eq!(DisplayStatus::Error.to_string(), "Status: Error");
        assert_eq!(DisplayStatus::from(AcquisitionState::Running), DisplayStatus::Running);
    }
}
