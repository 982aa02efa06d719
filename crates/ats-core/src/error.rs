//! ---
//! ats_section: "01-core-functionality"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Error taxonomy of the failover core."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AtsError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AtsError {
    #[error("controller is busy with another transition")]
    Busy,
    #[error("invalid override: {0}")]
    InvalidOverride(String),
    #[error("relay driver write failed: {0}")]
    RelayDriver(String),
    #[error("schedule provider failed: {0}")]
    Schedule(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("controller worker is not running")]
    WorkerUnavailable,
    #[error("no frame received from the monitoring device within the watchdog window")]
    WatchdogExpired,
}

impl AtsError {
    /// Wrap an adapter error, keeping its full context chain.
    pub(crate) fn relay(err: anyhow::Error) -> Self {
        AtsError::RelayDriver(format!("{err:#}"))
    }

    pub(crate) fn schedule(err: anyhow::Error) -> Self {
        AtsError::Schedule(format!("{err:#}"))
    }
}
