//! Observable negotiation status
//!
//! `SessionStatus` is the single summary external consumers read. It only moves
//! along the legal graph in [`SessionStatus::can_transition_to`]; every failure
//! variant is terminal until the session is reset to `Idle`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Idle,
    CapabilitiesError,
    DeviceLoaded,
    TransportCreationFailed,
    TransportConnecting,
    TransportConnected,
    TransportConnectionFailed,
    ProduceRequested,
    ProduceFailed,
    Live,
    StreamError,
}

impl SessionStatus {
    /// Failure variants. Only a reset to `Idle` leaves them.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            Self::CapabilitiesError
                | Self::TransportCreationFailed
                | Self::TransportConnectionFailed
                | Self::ProduceFailed
                | Self::StreamError
        )
    }

    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }

    /// Legal forward edges. Any state may be reset to `Idle`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (_, Idle)
                | (Idle, DeviceLoaded | CapabilitiesError)
                | (DeviceLoaded, TransportConnecting | TransportCreationFailed)
                | (TransportConnecting, TransportConnected | TransportConnectionFailed)
                | (TransportConnected, ProduceRequested | StreamError)
                | (ProduceRequested, Live | ProduceFailed)
        )
    }

    /// Human-readable label, as shown next to the preview
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "Not Started",
            Self::CapabilitiesError => "RTP Capabilities Error",
            Self::DeviceLoaded => "Device Loaded",
            Self::TransportCreationFailed => "Transport Creation Failed",
            Self::TransportConnecting => "Connecting",
            Self::TransportConnected => "Connected",
            Self::TransportConnectionFailed => "Transport Connection Failed",
            Self::ProduceRequested => "Producing",
            Self::ProduceFailed => "Produce Failed",
            Self::Live => "Live",
            Self::StreamError => "Stream Error",
        }
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Shared, watch-backed holder of the current status.
///
/// Once closed, transitions are refused so acknowledgments that arrive after
/// teardown cannot mutate the session.
#[derive(Clone)]
pub struct StatusCell {
    tx: Arc<watch::Sender<SessionStatus>>,
    closed: Arc<AtomicBool>,
}

impl StatusCell {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionStatus::Idle);
        Self {
            tx: Arc::new(tx),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn get(&self) -> SessionStatus {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Move to `next` if the edge is legal and the cell is still open.
    ///
    /// The closed flag is read under the watch lock, so a transition either
    /// lands before `close` or is refused.
    pub fn transition(&self, next: SessionStatus) -> Result<()> {
        let mut current = SessionStatus::Idle;
        let mut refused_closed = false;
        let applied = self.tx.send_if_modified(|status| {
            if self.closed.load(Ordering::Acquire) {
                refused_closed = true;
                return false;
            }
            current = *status;
            if status.can_transition_to(next) {
                *status = next;
                true
            } else {
                false
            }
        });

        if applied {
            debug!(from = ?current, to = ?next, "Session status changed");
            Ok(())
        } else if refused_closed {
            Err(Error::Cancelled)
        } else {
            error!(from = ?current, to = ?next, "Illegal session status transition");
            Err(Error::InvalidState(format!(
                "illegal status transition {current:?} -> {next:?}"
            )))
        }
    }

    /// Reset to `Idle` at the start of a new negotiation attempt.
    pub fn reset(&self) -> Result<()> {
        self.transition(SessionStatus::Idle)
    }

    /// Reset to `Idle` and refuse every later transition.
    pub fn close(&self) {
        self.tx.send_modify(|status| {
            self.closed.store(true, Ordering::Release);
            *status = SessionStatus::Idle;
        });
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}
