//! Wall-clock abstraction.
//!
//! Location records carry wall-clock timestamps and the emission throttle
//! compares them, so every time-dependent component reads the time through
//! a [`Clock`]. Production code uses [`SystemClock`]; tests and track replay
//! drive a [`ManualClock`].

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// Instant in time as stored in location records and trips.
pub type Timestamp = DateTime<Utc>;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at `millis` past the Unix epoch.
    pub fn at_millis(millis: i64) -> Self {
        Self::new(timestamp_from_millis(millis))
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += TimeDelta::milliseconds(by.as_millis() as i64);
    }

    /// Jump the clock to an absolute time (may move backwards).
    pub fn set(&self, to: Timestamp) {
        *self.now.lock() = to;
    }

    /// Jump the clock to `millis` past the Unix epoch.
    pub fn set_millis(&self, millis: i64) {
        self.set(timestamp_from_millis(millis));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}

/// Convert milliseconds since the Unix epoch to a timestamp.
///
/// Out-of-range values collapse to the epoch.
pub fn timestamp_from_millis(millis: i64) -> Timestamp {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
