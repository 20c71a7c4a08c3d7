//! Time source for due-date checks
//!
//! The ledger reads the clock once per operation. Production uses wall
//! clock time; tests drive a [`ManualClock`].

use crate::types::Timestamp;
use chrono::Utc;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of the current ledger time
pub trait Clock: Send + Sync + Debug {
    /// Current time in seconds since Unix epoch
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        epoch_seconds(Utc::now().timestamp())
    }
}

/// Wall-clock seconds as a ledger timestamp, saturating at the epoch
fn epoch_seconds(seconds: i64) -> Timestamp {
    Timestamp::try_from(seconds).unwrap_or_else(|_| {
        tracing::error!(seconds, "System clock is before the Unix epoch, saturating to 0");
        0
    })
}

/// Settable clock
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Start at `now`
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Jump to `now`
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `seconds`
    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}
