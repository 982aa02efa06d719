//! ---
//! ats_section: "01-core-functionality"
//! ats_subsection: "binary"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Binary entrypoint for the transfer switch daemon."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use ats_api::{spawn_api_server, ApiServerHandle, ApiState};
use ats_common::config::{AppConfig, Mode};
use ats_common::logging::init_tracing;
use ats_core::memory::{MemoryRelayDriver, StaticScheduleProvider};
use ats_core::ports::{NotificationSink, RelayDriver, ScheduleProvider};
use ats_core::{Adapters, AtsError, AtsRuntime, SystemClock};
use ats_metrics::{new_registry, spawn_http_server, SharedRegistry};
use ats_net::{pump_lines, spawn_frame_source, EspScheduleProvider, FrameEndpoint, HttpNotifier};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const FRAME_QUEUE: usize = 256;

#[derive(Debug, Parser)]
#[command(author, version, about = "Automatic transfer switch daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override application mode")]
    mode: Option<CliMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Production,
    DryRun,
}

impl From<CliMode> for Mode {
    fn from(value: CliMode) -> Self {
        match value {
            CliMode::Production => Mode::Production,
            CliMode::DryRun => Mode::DryRun,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the controller")]
    Run,
    #[command(about = "Load and validate the configuration, then print it")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/atsd.toml"));
    candidates.push(PathBuf::from("/etc/atsd/atsd.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(mode) = cli.mode {
        config.mode = mode.into();
        config.validate()?;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("atsd", &config.logging)?;
            info!(config_path = %loaded.source.display(), mode = ?config.mode, "configuration loaded");
            run_daemon(config).await
        }
        Commands::CheckConfig => {
            if let Some(token) = config.load_shedding.api_token.as_mut() {
                *token = "<redacted>".to_owned();
            }
            println!("# {}", loaded.source.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn build_adapters(config: &AppConfig) -> Result<Adapters> {
    let relay_driver: Arc<dyn RelayDriver> = if config.mode.is_dry_run() {
        info!("dry run: relay writes stay in memory");
        Arc::new(MemoryRelayDriver::new())
    } else {
        gpio_relay_driver(config)?
    };

    let schedule: Arc<dyn ScheduleProvider> = if config.load_shedding.enabled {
        Arc::new(EspScheduleProvider::from_config(&config.load_shedding)?)
    } else {
        Arc::new(StaticScheduleProvider::default())
    };

    let notifier = match &config.notifications.endpoint {
        Some(endpoint) => {
            let notifier: Arc<dyn NotificationSink> = Arc::new(HttpNotifier::new(endpoint)?);
            Some(notifier)
        }
        None => None,
    };

    Ok(Adapters {
        relay_driver,
        schedule,
        notifier,
        clock: Arc::new(SystemClock),
    })
}

#[cfg(target_os = "linux")]
fn gpio_relay_driver(config: &AppConfig) -> Result<Arc<dyn RelayDriver>> {
    use ats_core::outputs::PinMap;

    info!(chip = %config.relays.gpio_chip, "relay lines on gpio character device");
    Ok(Arc::new(ats_net::GpiodRelayDriver::new(
        config.relays.gpio_chip.clone(),
        PinMap::from_config(&config.relays),
    )))
}

#[cfg(not(target_os = "linux"))]
fn gpio_relay_driver(_config: &AppConfig) -> Result<Arc<dyn RelayDriver>> {
    anyhow::bail!("gpio relay output needs Linux; use --mode dry-run on this host")
}

/// Monitor frames from the configured endpoint, or from stdin in a dry run without one.
fn spawn_frames(
    config: &AppConfig,
    frames: mpsc::Sender<String>,
    shutdown: broadcast::Receiver<()>,
) -> Result<JoinHandle<()>> {
    if let Some(endpoint) = FrameEndpoint::from_config(&config.inputs) {
        info!(endpoint = %endpoint, "monitor frame source configured");
        return Ok(spawn_frame_source(
            endpoint,
            config.inputs.reconnect_delay,
            frames,
            shutdown,
        ));
    }
    if !config.mode.is_dry_run() {
        anyhow::bail!("production mode requires inputs.device or inputs.tcp");
    }
    info!("dry run: reading monitor frames from stdin");
    Ok(tokio::spawn(async move {
        match pump_lines(tokio::io::stdin(), &frames).await {
            Ok(end) => debug!(?end, "stdin frame source finished"),
            Err(err) => warn!(error = %err, "stdin frame source failed"),
        }
    }))
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let metrics_settings = config.metrics.clone();
    let api_settings = config.api.clone();

    let (metrics_registry, metrics_server): (Option<SharedRegistry>, _) =
        if metrics_settings.enabled {
            let registry = new_registry();
            let server = spawn_http_server(registry.clone(), metrics_settings.listen)?;
            info!(address = %server.addr(), "metrics exporter enabled");
            (Some(registry), Some(server))
        } else {
            info!("metrics exporter disabled by configuration");
            (None, None)
        };

    let adapters = build_adapters(&config)?;
    let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
    let mode = config.mode;
    let frame_config = config.clone();
    let runtime = AtsRuntime::new(config, adapters, metrics_registry)
        .start(frames_rx)
        .await
        .context("failed to start runtime")?;
    let frame_task = spawn_frames(&frame_config, frames_tx, runtime.subscribe_shutdown())?;

    let mut api_server: Option<ApiServerHandle> = None;
    if api_settings.enabled {
        let state = ApiState::new(runtime.controller(), mode);
        match spawn_api_server(state, api_settings.listen).await {
            Ok(server) => api_server = Some(server),
            Err(err) => warn!(error = %err, "failed to start status api"),
        }
    } else {
        info!("status api disabled by configuration");
    }

    info!(mode = ?mode, "daemon running; waiting for termination signal");
    let outcome = tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("ctrl-c received; shutting down");
            Ok(())
        }
        _ = runtime.watchdog_expired() => {
            error!("monitor watchdog expired; exiting for a supervised restart");
            Err(AtsError::WatchdogExpired)
        }
    };

    runtime.shutdown().await?;
    frame_task.abort();
    if let Some(server) = api_server {
        server.shutdown().await?;
    }
    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    outcome.map_err(anyhow::Error::from)
}
