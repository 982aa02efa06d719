//! ---
//! ats_section: "05-networking-external-interfaces"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Device and network adapters."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
//! Concrete implementations of the capability traits in `ats_core::ports`,
//! plus the monitor frame source.

pub mod esp;
pub mod gpio;
pub mod notify;
pub mod serial;

pub use esp::EspScheduleProvider;
#[cfg(target_os = "linux")]
pub use gpio::GpiodRelayDriver;
pub use notify::HttpNotifier;
pub use serial::{
    open_serial, pump_blocking, pump_lines, spawn_frame_source, FrameEndpoint, LineSplitter,
    PumpEnd,
};
