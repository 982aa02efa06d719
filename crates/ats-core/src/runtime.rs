//! ---
//! ats_section: "01-core-functionality"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Runtime wiring and lifecycle management."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ats_common::config::AppConfig;
use ats_metrics::SharedRegistry;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::controller::{ControllerHandle, FailoverController};
use crate::inputs::{spawn_input_tracker, InputTracker, WatchdogStatus};
use crate::loadshed::LoadShedForecaster;
use crate::metrics::StatusGauges;
use crate::outputs::{OutputController, PinMap};
use crate::ports::{NotificationSink, RelayDriver, ScheduleProvider};
use crate::time::WallClock;
use crate::trace::TraceLog;

const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Hardware and network capabilities handed to the runtime.
#[derive(Clone)]
pub struct Adapters {
    pub relay_driver: Arc<dyn RelayDriver>,
    pub schedule: Arc<dyn ScheduleProvider>,
    pub notifier: Option<Arc<dyn NotificationSink>>,
    pub clock: Arc<dyn WallClock>,
}

impl std::fmt::Debug for Adapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapters")
            .field("notifier", &self.notifier.is_some())
            .finish_non_exhaustive()
    }
}

/// Assembles the input tracker, forecaster and failover worker.
#[derive(Debug)]
pub struct AtsRuntime {
    config: Arc<AppConfig>,
    adapters: Adapters,
    metrics_registry: Option<SharedRegistry>,
}

impl AtsRuntime {
    pub fn new(config: AppConfig, adapters: Adapters, metrics: Option<SharedRegistry>) -> Self {
        Self {
            config: Arc::new(config),
            adapters,
            metrics_registry: metrics,
        }
    }

    /// Spawn every task and return a handle for lifecycle control. `frames`
    /// carries raw lines from the monitoring device.
    pub async fn start(self, frames: mpsc::Receiver<String>) -> Result<RuntimeHandle> {
        let (shutdown_tx, _) = broadcast::channel(16);
        let trace = TraceLog::new();
        let config = self.config.clone();
        config
            .controller
            .validate()
            .context("invalid controller timing")?;

        self.adapters
            .relay_driver
            .init()
            .await
            .context("failed to initialise relay driver")?;

        let tracker = InputTracker::new(&config.inputs, trace.clone());
        let (input_watch, input_task) =
            spawn_input_tracker(tracker, frames, shutdown_tx.subscribe());
        let mut tasks = vec![("inputs", input_task)];

        let forecaster = Arc::new(LoadShedForecaster::new(
            self.adapters.schedule.clone(),
            self.adapters.clock.clone(),
            config.load_shedding.requests_per_day,
            trace.clone(),
        )?);
        if config.load_shedding.enabled {
            tasks.push(("schedule", forecaster.spawn_refresh(shutdown_tx.subscribe())));
        } else {
            info!("load shedding schedule disabled");
        }

        let mut outputs = OutputController::new(
            self.adapters.relay_driver.clone(),
            PinMap::from_config(&config.relays),
        );
        if let Some(notifier) = self.adapters.notifier.clone() {
            outputs = outputs.with_notifier(notifier);
        }
        let (controller, handle) = FailoverController::new(
            config.controller.clone(),
            outputs,
            input_watch.clone(),
            forecaster.clone(),
            trace,
        );
        tasks.push(("controller", controller.spawn(shutdown_tx.subscribe())));

        if let Some(registry) = &self.metrics_registry {
            let gauges = StatusGauges::register(registry)?;
            tasks.push((
                "metrics",
                spawn_gauge_refresh(gauges, handle.clone(), shutdown_tx.subscribe()),
            ));
        }

        info!(mode = ?config.mode, "runtime started");

        Ok(RuntimeHandle {
            shutdown: shutdown_tx,
            tasks,
            controller: handle,
            forecaster,
            watchdog: input_watch.watchdog,
            config,
        })
    }
}

fn spawn_gauge_refresh(
    gauges: StatusGauges,
    controller: ControllerHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(GAUGE_REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("gauge refresh shutdown");
                    break;
                }
                _ = ticker.tick() => match controller.status().await {
                    Ok(status) => gauges.update(&status),
                    Err(err) => warn!(error = %err, "status unavailable for metrics"),
                },
            }
        }
    })
}

/// Handle returned from [`AtsRuntime::start`].
#[derive(Debug)]
pub struct RuntimeHandle {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    controller: ControllerHandle,
    forecaster: Arc<LoadShedForecaster>,
    watchdog: watch::Receiver<WatchdogStatus>,
    config: Arc<AppConfig>,
}

impl RuntimeHandle {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn controller(&self) -> ControllerHandle {
        self.controller.clone()
    }

    pub fn forecaster(&self) -> Arc<LoadShedForecaster> {
        self.forecaster.clone()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Resolves once the frame watchdog has run out. Never resolves if the
    /// input tracker stops first.
    pub async fn watchdog_expired(&self) {
        let mut watchdog = self.watchdog.clone();
        loop {
            if watchdog.borrow_and_update().expired {
                return;
            }
            if watchdog.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for (name, task) in self.tasks {
            if let Err(err) = task.await {
                error!(task = name, error = %err, "runtime task join error");
            }
        }
        info!("runtime shutdown complete");
        Ok(())
    }
}
