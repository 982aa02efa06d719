//! ---
//! ats_section: "01-core-functionality"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Failover control core."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
//! Input tracking, relay output control, load shedding forecasts and the
//! failover state machine of the transfer switch controller.

pub mod controller;
pub mod error;
pub mod inputs;
pub mod loadshed;
pub mod memory;
pub mod metrics;
pub mod outputs;
pub mod ports;
pub mod runtime;
pub mod time;
pub mod trace;

pub use controller::{
    Command, ControllerHandle, ControllerStatus, FailoverController, LoadShedStatus, SysState,
};
pub use error::{AtsError, Result};
pub use inputs::{parse_frame, Frame, InputSnapshot, InputTracker, InputWatch, WatchdogStatus};
pub use loadshed::{AreaSchedule, LoadShedForecaster, ScheduleDay, ScheduleEvent};
pub use outputs::{OutputController, PinMap, RelayCommand, RelayState};
pub use ports::{NotificationSink, PinState, RelayDriver, ScheduleProvider};
pub use runtime::{Adapters, AtsRuntime, RuntimeHandle};
pub use time::{FixedClock, SystemClock, WallClock};
pub use trace::{TraceEntry, TraceLog};
