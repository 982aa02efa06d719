//! ---
//! ats_section: "01-core-functionality"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Failover state machine sequencing contactor transitions."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
//! The failover worker is the single owner of the state machine and the relay
//! outputs. Everything else talks to it through [`ControllerHandle`].
//!
//! Transitions are sequences of relay commands separated by explicit delays.
//! While a sequence waits, the worker keeps answering status queries and
//! rejects operator overrides with [`AtsError::Busy`]; `system_busy` guards
//! re-entry rather than locking anything.

use std::sync::Arc;
use std::time::Duration;

use ats_common::config::ControllerConfig;
use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{AtsError, Result};
use crate::inputs::{InputSnapshot, InputWatch, WatchdogStatus};
use crate::loadshed::{LoadShedForecaster, StageWindowForecast, MAX_STAGE};
use crate::outputs::{OutputController, RelayCommand, RelayState};
use crate::trace::{TraceEntry, TraceLog};

const T: Option<bool> = Some(true);
const F: Option<bool> = Some(false);
const KEEP: Option<bool> = None;

const COMMAND_QUEUE: usize = 32;

/// Prestart countdown when no forecast is available.
pub const COUNTDOWN_UNKNOWN: i64 = -3;
/// Prestart countdown while a window is in progress.
pub const COUNTDOWN_IN_WINDOW: i64 = -1;
/// Prestart countdown once the lead time has been reached.
pub const COUNTDOWN_DUE: i64 = -2;

/// Source the controller believes is feeding the load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SysState {
    #[default]
    Unknown,
    Primary,
    Secondary,
}

impl SysState {
    pub fn code(self) -> i64 {
        match self {
            SysState::Unknown => 0,
            SysState::Primary => 1,
            SysState::Secondary => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadShedStatus {
    pub stage: i32,
    pub in_load_shedding: bool,
    pub time_until_ms: i64,
    pub hours_until: i64,
    pub minutes_until: i64,
    /// Minutes until the generator prestart, or one of the `COUNTDOWN_*` sentinels.
    pub prestart_countdown: i64,
    pub prestart_lead_minutes: i64,
    pub next_start: Option<NaiveDateTime>,
    pub next_end: Option<NaiveDateTime>,
}

impl LoadShedStatus {
    fn unknown(stage: i32, lead: i64) -> Self {
        Self {
            stage,
            in_load_shedding: false,
            time_until_ms: 0,
            hours_until: 0,
            minutes_until: 0,
            prestart_countdown: COUNTDOWN_UNKNOWN,
            prestart_lead_minutes: lead,
            next_start: None,
            next_end: None,
        }
    }
}

/// Read-only snapshot served to the status surface and the metrics exporter.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub sys_state: SysState,
    pub system_busy: bool,
    pub system_error: bool,
    pub prepped_for_load_shedding: bool,
    pub generator_runtime_seconds: u64,
    pub relays: RelayState,
    pub inputs: InputSnapshot,
    pub watchdog: WatchdogStatus,
    pub load_shedding: LoadShedStatus,
    pub next_window_any_stage: Option<StageWindowForecast>,
    pub trace: Vec<TraceEntry>,
}

#[derive(Debug)]
pub enum Command {
    Status(oneshot::Sender<ControllerStatus>),
    /// `running = false` hands the load back to primary, `true` moves it to the generator.
    ForceGenerator {
        running: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetLoadShedStage {
        stage: Option<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable client of the failover worker.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
}

impl ControllerHandle {
    pub fn new(commands: mpsc::Sender<Command>) -> Self {
        Self { commands }
    }

    pub async fn status(&self) -> Result<ControllerStatus> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Status(reply)).await?;
        response.await.map_err(|_| AtsError::WorkerUnavailable)
    }

    /// Operator generator override: `0` returns to primary, `1` runs on the generator.
    pub async fn force_generator(&self, stage: u8) -> Result<()> {
        let running = match stage {
            0 => false,
            1 => true,
            other => {
                return Err(AtsError::InvalidOverride(format!(
                    "generator stage {} must be 0 or 1",
                    other
                )))
            }
        };
        let (reply, response) = oneshot::channel();
        self.send(Command::ForceGenerator { running, reply }).await?;
        response.await.map_err(|_| AtsError::WorkerUnavailable)?
    }

    /// Pin the load shedding stage (`None` clears the override) and re-run the updater.
    pub async fn set_load_shed_stage(&self, stage: Option<u8>) -> Result<()> {
        if let Some(stage) = stage {
            if stage > MAX_STAGE {
                return Err(AtsError::InvalidOverride(format!(
                    "load shedding stage {} outside 0..={}",
                    stage, MAX_STAGE
                )));
            }
        }
        let (reply, response) = oneshot::channel();
        self.send(Command::SetLoadShedStage { stage, reply }).await?;
        response.await.map_err(|_| AtsError::WorkerUnavailable)?
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AtsError::WorkerUnavailable)
    }
}

pub struct FailoverController {
    timing: ControllerConfig,
    outputs: OutputController,
    inputs: watch::Receiver<InputSnapshot>,
    watchdog: watch::Receiver<WatchdogStatus>,
    forecaster: Arc<LoadShedForecaster>,
    trace: TraceLog,
    commands: mpsc::Receiver<Command>,
    supervisory: Interval,
    load_shed_timer: Interval,
    sys_state: SysState,
    busy: bool,
    error: bool,
    prepped: bool,
    generator_runtime: u64,
    load_shed: LoadShedStatus,
}

impl FailoverController {
    /// Build the worker. Must be called inside a tokio runtime.
    pub fn new(
        timing: ControllerConfig,
        outputs: OutputController,
        inputs: InputWatch,
        forecaster: Arc<LoadShedForecaster>,
        trace: TraceLog,
    ) -> (Self, ControllerHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let mut supervisory = interval_at(
            Instant::now() + timing.supervisory_interval,
            timing.supervisory_interval,
        );
        supervisory.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut load_shed_timer = interval(timing.load_shed_interval);
        load_shed_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let lead = timing.prestart_lead_minutes;

        let controller = Self {
            timing,
            outputs,
            inputs: inputs.snapshots,
            watchdog: inputs.watchdog,
            forecaster,
            trace,
            commands,
            supervisory,
            load_shed_timer,
            sys_state: SysState::Unknown,
            busy: false,
            error: false,
            prepped: false,
            generator_runtime: 0,
            load_shed: LoadShedStatus::unknown(0, lead),
        };
        (controller, ControllerHandle::new(commands_tx))
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Boot reconciliation followed by the supervisory loop, until shutdown.
    /// A transition in progress always completes before shutdown is honoured.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        if !self.boot(&mut shutdown).await {
            info!("controller stopped before boot completed");
            return;
        }

        let mut inputs_open = true;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("controller shutdown signal received");
                    break;
                }
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                _ = self.supervisory.tick() => self.on_supervisory_tick().await,
                _ = self.load_shed_timer.tick() => self.on_load_shed_tick().await,
                changed = self.inputs.changed(), if inputs_open => {
                    if changed.is_err() {
                        warn!("input tracker stopped; relying on supervisory ticks");
                        inputs_open = false;
                    } else {
                        self.on_input_change().await;
                    }
                }
            }
        }
        info!(state = ?self.sys_state, relays = %self.outputs.state(), "controller stopped");
    }

    fn snapshot(&self) -> InputSnapshot {
        self.inputs.borrow().clone()
    }

    fn status(&self) -> ControllerStatus {
        ControllerStatus {
            sys_state: self.sys_state,
            system_busy: self.busy,
            system_error: self.error,
            prepped_for_load_shedding: self.prepped,
            generator_runtime_seconds: self.generator_runtime,
            relays: self.outputs.state(),
            inputs: self.snapshot(),
            watchdog: self.watchdog.borrow().clone(),
            load_shedding: self.load_shed,
            next_window_any_stage: self.forecaster.time_until_next_window_any_stage(),
            trace: self.trace.entries(),
        }
    }

    async fn boot(&mut self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        self.busy = true;
        if !self.wait_until_ready(shutdown).await {
            self.busy = false;
            return false;
        }
        let result = self.boot_sequence().await;
        self.busy = false;
        self.settle(result);
        if self.sys_state == SysState::Unknown {
            self.error = true;
        }
        info!(state = ?self.sys_state, system_error = self.error, "boot reconciliation complete");
        true
    }

    async fn wait_until_ready(&mut self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let delay = tokio::time::sleep(self.timing.boot_delay);
        tokio::pin!(delay);
        let mut delayed = false;
        loop {
            if delayed && self.inputs.borrow().initial_state_loaded {
                return true;
            }
            tokio::select! {
                _ = shutdown.recv() => return false,
                _ = &mut delay, if !delayed => {
                    delayed = true;
                    info!(state = ?self.sys_state, "checking system state");
                }
                changed = self.inputs.changed(), if delayed => {
                    if changed.is_err() {
                        error!("input tracker stopped before the first frame settled");
                        return false;
                    }
                }
                Some(command) = self.commands.recv() => self.handle_while_busy(command),
            }
        }
    }

    async fn boot_sequence(&mut self) -> Result<()> {
        let inputs = self.snapshot();
        match (inputs.power_primary, inputs.power_secondary) {
            (true, true) => {
                self.send(RelayCommand::new(F, F, KEEP), "boot: drop both contactors")
                    .await?;
                self.pause(self.timing.contactor_settle).await;
                self.send(RelayCommand::new(T, F, F), "boot: raise primary")
                    .await?;
                self.pause(self.timing.primary_stabilise).await;
                self.send(RelayCommand::new(T, T, F), "boot: restore secondary")
                    .await?;
                self.set_sys_state(SysState::Primary);
            }
            (true, false) => {
                self.send(RelayCommand::new(T, F, F), "boot: raise primary")
                    .await?;
                self.pause(self.timing.contactor_settle).await;
                self.send(RelayCommand::new(T, T, F), "boot: raise secondary")
                    .await?;
                self.set_sys_state(SysState::Primary);
            }
            (false, true) => {
                self.send(RelayCommand::new(F, T, T), "boot: secondary already powered")
                    .await?;
                self.set_sys_state(SysState::Secondary);
            }
            (false, false) => {
                self.send(RelayCommand::new(F, F, F), "boot: drop all")
                    .await?;
                self.pause(self.timing.contactor_settle).await;
                self.cold_start_generator("boot").await?;
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::ForceGenerator { running, reply } => {
                let _ = reply.send(Ok(()));
                self.busy = true;
                let result = self.force_generator(running).await;
                self.busy = false;
                self.settle(result);
            }
            Command::SetLoadShedStage { stage, reply } => {
                let result = self.forecaster.set_stage_override(stage);
                let accepted = result.is_ok();
                let _ = reply.send(result);
                if accepted {
                    self.on_load_shed_tick().await;
                }
            }
        }
    }

    fn handle_while_busy(&mut self, command: Command) {
        match command {
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::ForceGenerator { running, reply } => {
                warn!(running, "generator override rejected: system busy");
                let _ = reply.send(Err(AtsError::Busy));
            }
            Command::SetLoadShedStage { stage, reply } => {
                let result = self.forecaster.set_stage_override(stage);
                if result.is_ok() {
                    warn!("load shedding update deferred: system busy");
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Wait inside a transition while still serving the command channel and timers.
    async fn pause(&mut self, duration: Duration) {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                Some(command) = self.commands.recv() => self.handle_while_busy(command),
                _ = self.supervisory.tick() => {
                    self.track_generator_runtime();
                    warn!("supervisory check skipped: system busy");
                }
                _ = self.load_shed_timer.tick() => {
                    warn!("load shedding update skipped: system busy");
                }
            }
        }
    }

    fn settle(&mut self, result: Result<()>) {
        if let Err(err) = result {
            error!(error = %err, relays = %self.outputs.state(), "transition aborted");
            self.trace.push(format!("TRANSITION ABORTED: {err}"));
            self.error = true;
        }
    }

    async fn send(&mut self, command: RelayCommand, note: &str) -> Result<()> {
        info!(command = %command, note, "sending contactor update");
        self.trace.push(format!("{note} {command}"));
        self.outputs.set_state(command).await?;
        Ok(())
    }

    fn set_sys_state(&mut self, state: SysState) {
        if self.sys_state != state {
            info!(from = ?self.sys_state, to = ?state, "system state changed");
            self.trace.push(format!("System state {:?}", state));
        }
        self.sys_state = state;
    }

    /// Name the source the already closed contactors carry.
    fn resync_sys_state(&mut self, inputs: &InputSnapshot) {
        let relays = self.outputs.state();
        if relays.primary && inputs.power_primary {
            self.set_sys_state(SysState::Primary);
        } else if relays.secondary && inputs.power_secondary {
            self.set_sys_state(SysState::Secondary);
        }
    }

    fn track_generator_runtime(&mut self) {
        if self.inputs.borrow().power_secondary {
            self.generator_runtime += self.timing.supervisory_interval.as_secs().max(1);
        } else {
            self.generator_runtime = 0;
        }
    }

    async fn on_supervisory_tick(&mut self) {
        self.track_generator_runtime();
        self.reconcile().await;
    }

    async fn on_input_change(&mut self) {
        debug!("input snapshot changed");
        self.reconcile().await;
    }

    async fn reconcile(&mut self) {
        if self.busy {
            return;
        }
        self.busy = true;
        let result = self.supervise().await;
        self.busy = false;
        self.settle(result);
    }

    async fn supervise(&mut self) -> Result<()> {
        let inputs = self.snapshot();
        if !inputs.initial_state_loaded {
            return Ok(());
        }
        if self.error {
            if inputs.power_primary || inputs.power_secondary {
                info!("input power restored; clearing system error latch");
                self.trace.push("System error cleared by input change");
                self.error = false;
                self.resync_sys_state(&inputs);
            } else {
                error!("CANNOT FUNCTION: SYSTEM ERROR");
                return Ok(());
            }
        }

        let relays = self.outputs.state();
        if self.generator_runtime > self.timing.generator_leak_limit.as_secs()
            && relays.generator
            && !relays.secondary
            && inputs.power_secondary
        {
            warn!(
                runtime_secs = self.generator_runtime,
                "generator running without load; stopping"
            );
            self.send(RelayCommand::new(KEEP, KEEP, F), "leak guard: stop idle generator")
                .await?;
            self.prepped = false;
            return Ok(());
        }

        if inputs.power_primary {
            if !relays.primary {
                if inputs.power_secondary {
                    self.return_to_primary().await?;
                } else {
                    self.set_to_primary().await?;
                }
            }
        } else if !relays.secondary {
            self.move_to_secondary(inputs.power_secondary).await?;
        } else if !inputs.power_secondary {
            error!("NO POWER ON SECONDARY!");
            self.send(RelayCommand::new(F, F, F), "no power on secondary: drop all")
                .await?;
        }
        Ok(())
    }

    async fn return_to_primary(&mut self) -> Result<()> {
        info!(
            hold_secs = self.timing.return_to_primary_hold.as_secs(),
            "primary power back; holding before return"
        );
        self.trace.push("Return to primary: holding");
        self.pause(self.timing.return_to_primary_hold).await;
        if !self.snapshot().power_primary {
            warn!("POWER FAILED TO RESTORE");
            self.trace.push("Return to primary: power failed to restore");
            return Ok(());
        }
        self.send(RelayCommand::new(F, F, KEEP), "return to primary: drop both")
            .await?;
        self.pause(self.timing.contactor_settle).await;
        self.send(RelayCommand::new(T, F, F), "return to primary: raise primary")
            .await?;
        self.pause(self.timing.primary_stabilise).await;
        self.send(RelayCommand::new(T, T, F), "return to primary: restore secondary")
            .await?;
        self.set_sys_state(SysState::Primary);
        Ok(())
    }

    async fn set_to_primary(&mut self) -> Result<()> {
        self.send(RelayCommand::new(F, F, F), "set to primary: drop all")
            .await?;
        self.pause(self.timing.contactor_settle).await;
        self.send(RelayCommand::new(T, F, F), "set to primary: raise primary")
            .await?;
        self.pause(self.timing.contactor_settle).await;
        self.send(RelayCommand::new(T, T, F), "set to primary: raise secondary")
            .await?;
        self.set_sys_state(SysState::Primary);
        Ok(())
    }

    async fn move_to_secondary(&mut self, secondary_powered: bool) -> Result<()> {
        self.send(RelayCommand::new(F, KEEP, KEEP), "check secondary: drop primary")
            .await?;
        if secondary_powered {
            self.pause(self.timing.contactor_settle).await;
            self.send(RelayCommand::new(F, T, T), "restore to secondary")
                .await?;
            self.set_sys_state(SysState::Secondary);
            self.prepped = false;
            return Ok(());
        }
        self.cold_start_generator("activate generator").await
    }

    /// Assert the generator alone, verify secondary power, warm up, then switch over.
    /// Without power after the verify window the relays go to the fail-safe
    /// configuration and the error latch is set.
    async fn cold_start_generator(&mut self, origin: &str) -> Result<()> {
        self.send(
            RelayCommand::new(F, F, T),
            &format!("{origin}: start generator"),
        )
        .await?;
        self.pause(self.timing.generator_verify).await;
        if !self.snapshot().power_secondary {
            self.send(
                RelayCommand::new(F, F, F),
                &format!("{origin}: generator failed, stop"),
            )
            .await?;
            self.send(
                RelayCommand::new(T, T, F),
                &format!("{origin}: generator failed, fail-safe"),
            )
            .await?;
            error!("FAILED TO START GENERATOR: RESTART BSB TO RE-ACQUIRE");
            self.trace.push("FAILED TO START GENERATOR");
            self.error = true;
            return Ok(());
        }
        info!(
            warmup_secs = self.timing.generator_warmup.as_secs(),
            "generator running; warming up"
        );
        self.pause(self.timing.generator_warmup).await;
        self.send(
            RelayCommand::new(F, T, T),
            &format!("{origin}: activate secondary"),
        )
        .await?;
        self.set_sys_state(SysState::Secondary);
        self.prepped = false;
        Ok(())
    }

    async fn on_load_shed_tick(&mut self) {
        if self.busy {
            warn!("load shedding update skipped: system busy");
            return;
        }
        self.busy = true;
        let result = self.update_load_shedding().await;
        self.busy = false;
        self.settle(result);
    }

    async fn update_load_shedding(&mut self) -> Result<()> {
        let lead = self.timing.prestart_lead_minutes;
        let stage = self.forecaster.stage();
        let mut status = LoadShedStatus::unknown(stage, lead);

        if let Some((start, end)) = self.forecaster.active_window(stage) {
            status.in_load_shedding = true;
            status.prestart_countdown = COUNTDOWN_IN_WINDOW;
            status.next_start = Some(start);
            status.next_end = Some(end);
            self.load_shed = status;
            return Ok(());
        }

        let forecast = self.forecaster.time_until_next_window(None);
        debug!(stage, time_until_ms = forecast.time_until_ms, "load shedding forecast");
        if !forecast.is_known() {
            self.load_shed = status;
            return Ok(());
        }

        let minutes = forecast.time_until_ms / 60_000;
        status.time_until_ms = forecast.time_until_ms;
        status.hours_until = minutes / 60;
        status.minutes_until = minutes % 60;
        status.prestart_countdown = if minutes - lead < 0 {
            COUNTDOWN_DUE
        } else {
            minutes - lead
        };
        status.next_start = forecast.start;
        status.next_end = forecast.end;
        self.load_shed = status;

        let relays = self.outputs.state();
        let inputs = self.snapshot();
        if forecast.time_until_ms <= lead * 60_000 && !relays.generator && !inputs.power_secondary
        {
            if self.error {
                warn!("generator prestart suppressed: system error latched");
                return Ok(());
            }
            self.prestart_generator().await?;
        }
        Ok(())
    }

    async fn prestart_generator(&mut self) -> Result<()> {
        warn!("starting generator in preparation for load shedding");
        self.send(RelayCommand::new(KEEP, F, T), "prestart: start generator")
            .await?;
        self.pause(self.timing.generator_verify).await;
        if self.snapshot().power_secondary {
            info!("generator prepared for load shedding");
            self.prepped = true;
        } else {
            self.send(RelayCommand::new(KEEP, T, F), "prestart failed: release generator")
                .await?;
            error!("FAILED TO PREP GENERATOR FOR LOAD SHEDDING!");
            self.trace.push("FAILED TO PREP GENERATOR FOR LOAD SHEDDING");
        }
        self.pause(self.timing.prestart_settle).await;
        Ok(())
    }

    async fn force_generator(&mut self, running: bool) -> Result<()> {
        info!(running, "operator generator override");
        self.trace
            .push(format!("Operator generator override {}", u8::from(running)));
        if running {
            self.send(RelayCommand::new(F, F, T), "operator: start generator")
                .await?;
            self.pause(self.timing.generator_verify).await;
            self.send(RelayCommand::new(F, T, T), "operator: switch to secondary")
                .await?;
            self.set_sys_state(SysState::Secondary);
        } else {
            self.send(RelayCommand::new(F, F, F), "operator: stop generator")
                .await?;
            self.pause(self.timing.contactor_settle).await;
            self.send(RelayCommand::new(T, F, F), "operator: raise primary")
                .await?;
            self.pause(self.timing.contactor_settle).await;
            self.send(RelayCommand::new(T, T, F), "operator: raise secondary")
                .await?;
            self.set_sys_state(SysState::Primary);
        }
        self.error = false;
        Ok(())
    }
}

impl std::fmt::Debug for FailoverController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverController")
            .field("sys_state", &self.sys_state)
            .field("busy", &self.busy)
            .field("error", &self.error)
            .field("prepped", &self.prepped)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_validates_overrides_before_queueing() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = ControllerHandle::new(tx);
        assert!(matches!(
            handle.force_generator(2).await,
            Err(AtsError::InvalidOverride(_))
        ));
        assert!(matches!(
            handle.set_load_shed_stage(Some(MAX_STAGE + 1)).await,
            Err(AtsError::InvalidOverride(_))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stopped_worker_is_reported_as_unavailable() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let handle = ControllerHandle::new(tx);
        assert_eq!(handle.status().await.err(), Some(AtsError::WorkerUnavailable));
        assert_eq!(
            handle.force_generator(1).await,
            Err(AtsError::WorkerUnavailable)
        );
    }

    #[test]
    fn sys_state_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&SysState::Secondary).unwrap(),
            "\"secondary\""
        );
        assert_eq!(SysState::Unknown.code(), 0);
    }
}
