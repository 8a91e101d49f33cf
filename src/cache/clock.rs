//! Time source for expiry and analytics timestamps.
//!
//! Production code uses [`SystemClock`]; tests drive expiry with [`ManualClock`].

use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::clock";

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(OffsetDateTime::now_utc())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = mutex_lock(&self.now, SOURCE, "advance");
        *now += by;
    }

    pub fn set(&self, at: OffsetDateTime) {
        *mutex_lock(&self.now, SOURCE, "set") = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *mutex_lock(&self.now, SOURCE, "now")
    }
}
