//! Error notifications.
//!
//! Failures that happen on the completion path or in the publisher have no caller to
//! return to, so they are broadcast as [`ErrorEvent`]s. Subscribers hold a
//! `broadcast::Receiver`; dropping it unsubscribes. Every report is also logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::error::{DaqError, ErrorKind};

/// Default number of undelivered error events kept per subscriber.
pub const DEFAULT_ERROR_CAPACITY: usize = 64;

/// One reported failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Failure category
    pub kind: ErrorKind,
    /// Human-readable detail
    pub detail: String,
    /// When the failure was reported
    pub at: DateTime<Utc>,
}

/// Cloneable handle that fans error events out to subscribers.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: broadcast::Sender<ErrorEvent>,
}

impl ErrorReporter {
    /// Create a reporter buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Report a failure. Never blocks; events with no subscriber are only logged.
    pub fn report(&self, kind: ErrorKind, detail: impl Into<String>) {
        let detail = detail.into();
        match kind {
            ErrorKind::Sink | ErrorKind::InvalidParameter | ErrorKind::AlreadyRunning => {
                warn!(kind = %kind, "{detail}")
            }
            _ => error!(kind = %kind, "{detail}"),
        }
        let _ = self.tx.send(ErrorEvent {
            kind,
            detail,
            at: Utc::now(),
        });
    }

    /// Report a crate error under its own kind.
    pub fn report_error(&self, err: &DaqError) {
        self.report(err.kind(), err.to_string());
    }

    /// Subscribe to future error events.
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorEvent> {
        self.tx.subscribe()
    }
}

impl Default for ErrorReporter {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_CAPACITY)
    }
}
