//! ---
//! ats_section: "01-core-functionality"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Shared primitives and utilities for the controller runtime."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
//! Shared primitives for the R-ATS workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by the controller core, the adapters and the daemon.

pub mod config;
pub mod logging;

pub use config::{
    ApiConfig, AppConfig, ControllerConfig, InputsConfig, LoadSheddingConfig, LoadedAppConfig,
    LoggingConfig, MetricsConfig, Mode, NotificationConfig, RelayPinConfig, RelaysConfig,
};
pub use logging::{init_tracing, resolve_filter, FilterSource, LogFormat};
