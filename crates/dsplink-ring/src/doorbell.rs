//! Coalescing wake-up signal between the two sides of a ring.
//!
//! On real hardware this is a register write (host → device) or an interrupt
//! (device → host). Repeated rings collapse into one pending notification.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

/// Sending half. Cheap to clone; ringing never blocks.
#[derive(Debug, Clone)]
pub struct Doorbell {
    tx: SyncSender<()>,
}

/// Receiving half.
#[derive(Debug)]
pub struct DoorbellWaiter {
    rx: Receiver<()>,
}

/// Result of waiting on a doorbell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Rung,
    TimedOut,
    /// Every [`Doorbell`] was dropped.
    Closed,
}

/// Create a connected doorbell pair.
pub fn doorbell() -> (Doorbell, DoorbellWaiter) {
    let (tx, rx) = mpsc::sync_channel(1);
    (Doorbell { tx }, DoorbellWaiter { rx })
}

impl Doorbell {
    /// Signal the other side. Returns false if the waiter is gone.
    pub fn ring(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Disconnected(())) => false,
        }
    }
}

impl DoorbellWaiter {
    /// Block until rung or until `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Wake {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => Wake::Rung,
            Err(RecvTimeoutError::Timeout) => Wake::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Wake::Closed,
        }
    }

    /// Consume a pending ring without blocking.
    pub fn try_take(&self) -> bool {
        self.rx.try_recv().is_ok()
    }
}
