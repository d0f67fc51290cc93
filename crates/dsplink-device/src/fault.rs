//! Device fault state.
//!
//! Faults only escalate until [`FaultMonitor::clear`] (device reset).

use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

/// Alert severity code for a recoverable condition.
pub const ALERT_SEVERITY_SOFT: u16 = 1;
/// Alert severity code for a condition that needs a board reset.
pub const ALERT_SEVERITY_FATAL: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultSeverity {
    /// Commands still work; a reset is due before the next allocation.
    Soft,
    /// Every command fails until reset.
    Fatal,
}

impl FaultSeverity {
    /// Severity carried by an alert indication. Unknown codes count as soft.
    pub fn from_alert(code: u16) -> Self {
        match code {
            ALERT_SEVERITY_FATAL => Self::Fatal,
            _ => Self::Soft,
        }
    }

    const fn level(self) -> u8 {
        match self {
            Self::Soft => 1,
            Self::Fatal => 2,
        }
    }
}

impl fmt::Display for FaultSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Soft => f.write_str("soft"),
            Self::Fatal => f.write_str("fatal"),
        }
    }
}

#[derive(Debug, Default)]
pub struct FaultMonitor {
    level: AtomicU8,
    /// Bumped every time the state escalates to fatal.
    fatal_epoch: AtomicU64,
    alerts: AtomicU64,
    last_alert: AtomicU16,
}

impl FaultMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fault. Returns true when this raised the current severity.
    pub fn raise(&self, severity: FaultSeverity) -> bool {
        let previous = self.level.fetch_max(severity.level(), Ordering::AcqRel);
        let escalated = previous < severity.level();
        if escalated && severity == FaultSeverity::Fatal {
            self.fatal_epoch.fetch_add(1, Ordering::AcqRel);
        }
        escalated
    }

    /// Record an alert indication from the device.
    pub fn alert(&self, code: u16, severity: FaultSeverity) -> bool {
        self.alerts.fetch_add(1, Ordering::Relaxed);
        self.last_alert.store(code, Ordering::Relaxed);
        self.raise(severity)
    }

    pub fn current(&self) -> Option<FaultSeverity> {
        match self.level.load(Ordering::Acquire) {
            0 => None,
            1 => Some(FaultSeverity::Soft),
            _ => Some(FaultSeverity::Fatal),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.current() == Some(FaultSeverity::Fatal)
    }

    pub fn fatal_epoch(&self) -> u64 {
        self.fatal_epoch.load(Ordering::Acquire)
    }

    pub fn alerts(&self) -> u64 {
        self.alerts.load(Ordering::Relaxed)
    }

    /// Code of the most recent alert, if any arrived.
    pub fn last_alert(&self) -> Option<u16> {
        (self.alerts() > 0).then(|| self.last_alert.load(Ordering::Relaxed))
    }

    pub fn clear(&self) {
        self.level.store(0, Ordering::Release);
    }
}
