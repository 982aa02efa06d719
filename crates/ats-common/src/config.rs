//! ---
//! ats_section: "01-core-functionality"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Daemon configuration model, defaults and validation."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_mode() -> Mode {
    Mode::Production
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_settle_window() -> Duration {
    Duration::from_millis(1000)
}

fn default_flap_warn_restarts() -> u32 {
    5
}

fn default_flap_force_restarts() -> u32 {
    10
}

fn default_watchdog_max_count() -> i32 {
    60
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_gpio_chip() -> String {
    "gpiochip0".to_owned()
}

fn default_primary_pin() -> RelayPinConfig {
    RelayPinConfig {
        pin: 4,
        normally_closed: true,
    }
}

fn default_secondary_pin() -> RelayPinConfig {
    RelayPinConfig {
        pin: 22,
        normally_closed: true,
    }
}

fn default_generator_pin() -> RelayPinConfig {
    RelayPinConfig {
        pin: 6,
        normally_closed: false,
    }
}

fn default_boot_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_supervisory_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_load_shed_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_contactor_settle() -> Duration {
    Duration::from_secs(5)
}

fn default_generator_verify() -> Duration {
    Duration::from_secs(15)
}

fn default_generator_warmup() -> Duration {
    Duration::from_secs(45)
}

fn default_primary_stabilise() -> Duration {
    Duration::from_secs(15)
}

fn default_return_to_primary_hold() -> Duration {
    Duration::from_secs(120)
}

fn default_prestart_settle() -> Duration {
    Duration::from_secs(5)
}

fn default_generator_leak_limit() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_prestart_lead_minutes() -> i64 {
    5
}

fn default_api_base() -> String {
    "https://developer.sepush.co.za/business/2.0".to_owned()
}

fn default_requests_per_day() -> u32 {
    50
}

/// Largest budget that still yields a non-zero refresh interval.
pub const MAX_REQUESTS_PER_DAY: u32 = 86_400_000 + 4;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_file_enabled() -> bool {
    true
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Primary configuration object for the transfer switch daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default)]
    pub inputs: InputsConfig,
    #[serde(default)]
    pub relays: RelaysConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub load_shedding: LoadSheddingConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "ATS_CONFIG";

    /// Load configuration from disk, respecting the `ATS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.mode == Mode::Production && self.inputs.device.is_none() && self.inputs.tcp.is_none()
        {
            bail!("production mode requires inputs.device or inputs.tcp");
        }
        self.inputs.validate()?;
        self.relays.validate()?;
        self.controller.validate()?;
        self.load_shedding.validate()?;
        self.notifications.validate()?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            inputs: InputsConfig::default(),
            relays: RelaysConfig::default(),
            controller: ControllerConfig::default(),
            load_shedding: LoadSheddingConfig::default(),
            notifications: NotificationConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Operating mode for the daemon.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    #[default]
    Production,
    /// Relay writes go to an in-memory driver instead of GPIO.
    DryRun,
}

impl Mode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, Mode::DryRun)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "production" => Ok(Mode::Production),
            "dry-run" | "dryrun" => Ok(Mode::DryRun),
            other => Err(format!("unknown mode: {}", other)),
        }
    }
}

/// Monitoring device link and debounce tuning.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputsConfig {
    /// Serial device the monitor writes frames to, e.g. `/dev/ttyUSB0`.
    #[serde(default)]
    pub device: Option<PathBuf>,
    /// Raw TCP endpoint (ser2net style) used instead of a local device.
    #[serde(default)]
    pub tcp: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_reconnect_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reconnect_delay: Duration,
    #[serde(default = "default_settle_window", rename = "settle_window_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub settle_window: Duration,
    #[serde(default = "default_flap_warn_restarts")]
    pub flap_warn_restarts: u32,
    #[serde(default = "default_flap_force_restarts")]
    pub flap_force_restarts: u32,
    /// Seconds without a frame before the monitor watchdog fires.
    #[serde(default = "default_watchdog_max_count")]
    pub watchdog_max_count: i32,
}

impl Default for InputsConfig {
    fn default() -> Self {
        Self {
            device: None,
            tcp: None,
            baud_rate: default_baud_rate(),
            reconnect_delay: default_reconnect_delay(),
            settle_window: default_settle_window(),
            flap_warn_restarts: default_flap_warn_restarts(),
            flap_force_restarts: default_flap_force_restarts(),
            watchdog_max_count: default_watchdog_max_count(),
        }
    }
}

impl InputsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.device.is_some() && self.tcp.is_some() {
            bail!("inputs.device and inputs.tcp are mutually exclusive");
        }
        if self.flap_force_restarts <= self.flap_warn_restarts {
            bail!(
                "inputs.flap_force_restarts ({}) must exceed inputs.flap_warn_restarts ({})",
                self.flap_force_restarts,
                self.flap_warn_restarts
            );
        }
        if self.watchdog_max_count <= 0 {
            bail!("inputs.watchdog_max_count must be positive");
        }
        if self.baud_rate == 0 {
            bail!("inputs.baud_rate must be positive");
        }
        Ok(())
    }
}

/// GPIO wiring of one contactor relay.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayPinConfig {
    pub pin: u32,
    /// A normally-closed relay closes its contactor when the pin is low.
    #[serde(default)]
    pub normally_closed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaysConfig {
    /// GPIO character device holding the relay lines.
    #[serde(default = "default_gpio_chip")]
    pub gpio_chip: String,
    #[serde(default = "default_primary_pin")]
    pub primary: RelayPinConfig,
    #[serde(default = "default_secondary_pin")]
    pub secondary: RelayPinConfig,
    #[serde(default = "default_generator_pin")]
    pub generator: RelayPinConfig,
}

impl Default for RelaysConfig {
    fn default() -> Self {
        Self {
            gpio_chip: default_gpio_chip(),
            primary: default_primary_pin(),
            secondary: default_secondary_pin(),
            generator: default_generator_pin(),
        }
    }
}

impl RelaysConfig {
    pub fn validate(&self) -> Result<()> {
        if self.gpio_chip.trim().is_empty() {
            bail!("relays.gpio_chip must not be empty");
        }
        let mut seen = HashSet::new();
        for (name, relay) in [
            ("primary", self.primary),
            ("secondary", self.secondary),
            ("generator", self.generator),
        ] {
            if !seen.insert(relay.pin) {
                bail!("relays.{} reuses gpio pin {}", name, relay.pin);
            }
        }
        Ok(())
    }
}

/// Timing of the failover state machine.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_boot_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub boot_delay: Duration,
    #[serde(default = "default_supervisory_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub supervisory_interval: Duration,
    #[serde(default = "default_load_shed_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub load_shed_interval: Duration,
    /// Gap between dropping one contactor and raising the next.
    #[serde(default = "default_contactor_settle")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub contactor_settle: Duration,
    #[serde(default = "default_generator_verify")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub generator_verify: Duration,
    #[serde(default = "default_generator_warmup")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub generator_warmup: Duration,
    #[serde(default = "default_primary_stabilise")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub primary_stabilise: Duration,
    #[serde(default = "default_return_to_primary_hold")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub return_to_primary_hold: Duration,
    #[serde(default = "default_prestart_settle")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub prestart_settle: Duration,
    #[serde(default = "default_generator_leak_limit")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub generator_leak_limit: Duration,
    #[serde(default = "default_prestart_lead_minutes")]
    pub prestart_lead_minutes: i64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            boot_delay: default_boot_delay(),
            supervisory_interval: default_supervisory_interval(),
            load_shed_interval: default_load_shed_interval(),
            contactor_settle: default_contactor_settle(),
            generator_verify: default_generator_verify(),
            generator_warmup: default_generator_warmup(),
            primary_stabilise: default_primary_stabilise(),
            return_to_primary_hold: default_return_to_primary_hold(),
            prestart_settle: default_prestart_settle(),
            generator_leak_limit: default_generator_leak_limit(),
            prestart_lead_minutes: default_prestart_lead_minutes(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, period) in [
            ("supervisory_interval", self.supervisory_interval),
            ("load_shed_interval", self.load_shed_interval),
        ] {
            if period.is_zero() {
                bail!("controller.{} must be at least one second", name);
            }
        }
        if self.prestart_lead_minutes < 0 {
            bail!(
                "controller.prestart_lead_minutes must not be negative (got {})",
                self.prestart_lead_minutes
            );
        }
        Ok(())
    }
}

/// Outage schedule provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSheddingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub area_id: Option<String>,
    /// Daily request allowance of the provider account.
    #[serde(default = "default_requests_per_day")]
    pub requests_per_day: u32,
}

impl Default for LoadSheddingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: default_api_base(),
            api_token: None,
            area_id: None,
            requests_per_day: default_requests_per_day(),
        }
    }
}

impl LoadSheddingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.requests_per_day <= 4 {
            bail!(
                "load_shedding.requests_per_day must be greater than 4 (got {})",
                self.requests_per_day
            );
        }
        // Two polls per allotted request must still leave a whole millisecond.
        if self.requests_per_day > MAX_REQUESTS_PER_DAY {
            bail!(
                "load_shedding.requests_per_day must not exceed {} (got {})",
                MAX_REQUESTS_PER_DAY,
                self.requests_per_day
            );
        }
        if self.enabled {
            if self.api_token.as_deref().map_or(true, str::is_empty) {
                bail!("load_shedding.api_token is required when load shedding is enabled");
            }
            if self.area_id.as_deref().map_or(true, str::is_empty) {
                bail!("load_shedding.area_id is required when load shedding is enabled");
            }
            url::Url::parse(&self.api_base)
                .with_context(|| format!("invalid load_shedding.api_base {}", self.api_base))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    /// Webhook receiving generator start/stop messages.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl NotificationConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(endpoint) = &self.endpoint {
            url::Url::parse(endpoint)
                .with_context(|| format!("invalid notifications.endpoint {}", endpoint))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Keep the rolling JSON file next to stdout output.
    #[serde(default = "default_log_file_enabled")]
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file_enabled: default_log_file_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}
