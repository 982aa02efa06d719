//! ---
//! ats_section: "03-persistence-logging"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Prometheus gauges mirroring the controller status."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use ats_metrics::prometheus::Registry;
use ats_metrics::{GaugeSpec, GaugeTable};

use crate::controller::{ControllerStatus, LoadShedStatus};
use crate::inputs::InputSnapshot;
use crate::outputs::RelayState;

pub static CONTROLLER_GAUGES: &[GaugeSpec<ControllerStatus>] = &[
    (
        "ats_system_state",
        "Live source believed to feed the load (0 unknown, 1 primary, 2 secondary)",
        |s| s.sys_state.code(),
    ),
    ("ats_system_busy", "Transition in progress", |s| {
        i64::from(s.system_busy)
    }),
    ("ats_system_error", "Error latch set", |s| {
        i64::from(s.system_error)
    }),
    (
        "ats_prepped_for_load_shedding",
        "Generator prestarted ahead of a window",
        |s| i64::from(s.prepped_for_load_shedding),
    ),
    (
        "ats_generator_runtime_seconds",
        "Seconds of continuous secondary power",
        |s| s.generator_runtime_seconds as i64,
    ),
    (
        "ats_watchdog_countdown",
        "Seconds left before the monitor is declared silent",
        |s| i64::from(s.watchdog.countdown),
    ),
];

pub static INPUT_GAUGES: &[GaugeSpec<InputSnapshot>] = &[
    ("ats_power_primary", "Primary feed energised", |s| {
        i64::from(s.power_primary)
    }),
    ("ats_power_secondary", "Secondary feed energised", |s| {
        i64::from(s.power_secondary)
    }),
    ("ats_power_db", "Distribution board energised", |s| {
        i64::from(s.power_db)
    }),
    ("ats_power_ups", "UPS output energised", |s| {
        i64::from(s.power_ups)
    }),
    ("ats_power_alarm", "Monitored feed lost power", |s| {
        i64::from(s.power_alarm)
    }),
    ("ats_inputs_ready", "First input frame has settled", |s| {
        i64::from(s.initial_state_loaded)
    }),
];

pub static RELAY_GAUGES: &[GaugeSpec<RelayState>] = &[
    ("ats_relay_primary_closed", "Primary contactor commanded closed", |s| {
        i64::from(s.primary)
    }),
    (
        "ats_relay_secondary_closed",
        "Secondary contactor commanded closed",
        |s| i64::from(s.secondary),
    ),
    (
        "ats_relay_generator_running",
        "Generator run signal asserted",
        |s| i64::from(s.generator),
    ),
];

pub static LOAD_SHED_GAUGES: &[GaugeSpec<LoadShedStatus>] = &[
    ("ats_load_shed_stage", "Effective load shedding stage", |s| {
        i64::from(s.stage)
    }),
    ("ats_load_shed_active", "Inside a load shedding window", |s| {
        i64::from(s.in_load_shedding)
    }),
    (
        "ats_load_shed_seconds_until",
        "Seconds until the next window",
        |s| s.time_until_ms / 1000,
    ),
    (
        "ats_load_shed_prestart_countdown",
        "Minutes until generator prestart",
        |s| s.prestart_countdown,
    ),
];

/// All status gauges, refreshed together from one [`ControllerStatus`].
#[derive(Debug)]
pub struct StatusGauges {
    controller: GaugeTable<ControllerStatus>,
    inputs: GaugeTable<InputSnapshot>,
    relays: GaugeTable<RelayState>,
    load_shedding: GaugeTable<LoadShedStatus>,
}

impl StatusGauges {
    pub fn register(registry: &Registry) -> anyhow::Result<Self> {
        Ok(Self {
            controller: GaugeTable::register(registry, CONTROLLER_GAUGES)?,
            inputs: GaugeTable::register(registry, INPUT_GAUGES)?,
            relays: GaugeTable::register(registry, RELAY_GAUGES)?,
            load_shedding: GaugeTable::register(registry, LOAD_SHED_GAUGES)?,
        })
    }

    pub fn update(&self, status: &ControllerStatus) {
        self.controller.update(status);
        self.inputs.update(&status.inputs);
        self.relays.update(&status.relays);
        self.load_shedding.update(&status.load_shedding);
    }
}
