//! ---
//! ats_section: "01-core-functionality"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Wall clock abstraction used by schedule forecasts."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use chrono::{Duration, Local, NaiveDateTime};
use parking_lot::Mutex;

/// Source of area-local wall-clock time.
///
/// Outage schedules are published in local time, so forecasts compare against a
/// naive local timestamp rather than the monotonic runtime clock.
pub trait WallClock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Manually driven clock for dry runs and tests.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<NaiveDateTime>,
}

impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl WallClock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}
