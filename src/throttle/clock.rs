//! Time sources for window computation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// Source of the current wall-clock time.
///
/// Every window index, expiry and retry-after is derived from a single
/// `Clock`, so tests can move time across window boundaries deterministically.
pub trait Clock: Send + Sync {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;

    /// The current time as whole seconds since the Unix epoch.
    ///
    /// Times before the epoch clamp to zero.
    fn unix_secs(&self) -> u64 {
        u64::try_from(self.now().timestamp()).unwrap_or(0)
    }
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually controlled clock for tests.
///
/// Clones share the same underlying time, so a handle kept by the test moves
/// the clock seen by the throttler and the store.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<RwLock<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(RwLock::new(start)),
        }
    }

    /// Create a clock frozen at `secs` seconds after the Unix epoch.
    pub fn at_epoch(secs: i64) -> Self {
        Self::new(epoch(secs))
    }

    /// Move the clock forward by `secs` seconds.
    pub fn travel(&self, secs: i64) {
        let mut current = self.current.write();
        *current += Duration::seconds(secs);
    }

    /// Jump to an absolute time, `secs` seconds after the Unix epoch.
    pub fn travel_to(&self, secs: i64) {
        self.set(epoch(secs));
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.current.write() = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.read()
    }
}

fn epoch(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}
