//! ---
//! ats_section: "05-networking-external-interfaces"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "In-memory implementations of the capability traits."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
//! In-memory relay, schedule and notification doubles. The daemon uses
//! [`MemoryRelayDriver`] in dry-run mode; tests use all of them to observe
//! exactly what the controller commanded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::loadshed::AreaSchedule;
use crate::ports::{NotificationSink, PinState, RelayDriver, ScheduleProvider};

/// One batched relay write as seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub at: Instant,
    pub pins: Vec<PinState>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRelayDriver {
    writes: Arc<Mutex<Vec<RecordedWrite>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryRelayDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().clone()
    }

    pub fn last_write(&self) -> Option<RecordedWrite> {
        self.writes.lock().last().cloned()
    }

    /// Make subsequent writes fail, simulating a detached relay board.
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayDriver for MemoryRelayDriver {
    async fn set_pins_state(&self, pins: &[PinState]) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("relay board not responding");
        }
        self.writes.lock().push(RecordedWrite {
            at: Instant::now(),
            pins: pins.to_vec(),
        });
        Ok(())
    }
}

/// Schedule provider serving whatever was last stored in it.
#[derive(Debug, Default)]
pub struct StaticScheduleProvider {
    schedule: Mutex<Option<AreaSchedule>>,
    stage: Mutex<Option<i32>>,
}

impl StaticScheduleProvider {
    pub fn new(schedule: Option<AreaSchedule>, stage: Option<i32>) -> Self {
        Self {
            schedule: Mutex::new(schedule),
            stage: Mutex::new(stage),
        }
    }

    pub fn set_schedule(&self, schedule: Option<AreaSchedule>) {
        *self.schedule.lock() = schedule;
    }

    pub fn set_stage(&self, stage: Option<i32>) {
        *self.stage.lock() = stage;
    }
}

#[async_trait]
impl ScheduleProvider for StaticScheduleProvider {
    async fn fetch_area_schedule(&self) -> anyhow::Result<AreaSchedule> {
        match self.schedule.lock().clone() {
            Some(schedule) => Ok(schedule),
            None => bail!("no area schedule available"),
        }
    }

    async fn fetch_current_stage(&self) -> anyhow::Result<i32> {
        match *self.stage.lock() {
            Some(stage) => Ok(stage),
            None => bail!("no stage status available"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    messages: Arc<Mutex<Vec<String>>>,
}

impl MemoryNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotifier {
    async fn notify(&self, message: &str) -> anyhow::Result<()> {
        self.messages.lock().push(message.to_owned());
        Ok(())
    }
}
