//! ---
//! ats_section: "05-networking-external-interfaces"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Capability traits implemented by hardware and network adapters."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use async_trait::async_trait;
use serde::Serialize;

use crate::loadshed::AreaSchedule;

/// Physical output level of one GPIO pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PinState {
    pub pin: u32,
    pub high: bool,
}

/// Hardware relay bank. Every call carries the full pin vector.
#[async_trait]
pub trait RelayDriver: Send + Sync {
    /// Prepare the pins for output. Called once before the first write.
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_pins_state(&self, pins: &[PinState]) -> anyhow::Result<()>;
}

/// Polled source of the outage schedule for one area.
#[async_trait]
pub trait ScheduleProvider: Send + Sync {
    async fn fetch_area_schedule(&self) -> anyhow::Result<AreaSchedule>;

    /// Nationwide baseline stage, used when no area event covers "now".
    async fn fetch_current_stage(&self) -> anyhow::Result<i32>;
}

/// Best-effort operator notifications (generator start/stop).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, message: &str) -> anyhow::Result<()>;
}
