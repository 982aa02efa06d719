//! ---
//! ats_section: "01-core-functionality"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Load-shedding schedule cache and time-to-window forecasts."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{AtsError, Result};
use crate::ports::ScheduleProvider;
use crate::time::WallClock;
use crate::trace::TraceLog;

/// `stage()` when no area schedule has been fetched.
pub const STAGE_NO_SCHEDULE: i32 = -3;
/// `stage()` when the baseline stage status is unavailable.
pub const STAGE_NO_STATUS: i32 = -4;
/// `time_until_ms` when no area schedule has been fetched.
pub const WINDOW_NO_SCHEDULE: i64 = -1;
/// `time_until_ms` when the schedule has no upcoming window for the stage.
pub const WINDOW_NONE: i64 = -5;

pub const MAX_STAGE: u8 = 8;

const ALERT_MINUTES: [i64; 5] = [60, 45, 30, 15, 5];
const DAY_MS: u64 = 24 * 60 * 60 * 1000;
/// Requests held back from the daily budget for manual use.
const RESERVED_REQUESTS: u32 = 4;

/// Provider-declared outage overriding the regular rota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleEvent {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub stage: i32,
}

/// One day of the rota. `stages[n]` holds the `"HH:MM-HH:MM"` windows of stage `n + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleDay {
    pub date: NaiveDate,
    pub name: String,
    pub stages: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AreaSchedule {
    pub events: Vec<ScheduleEvent>,
    pub days: Vec<ScheduleDay>,
}

/// Extract the stage number from a provider note such as `"Stage 2"`.
pub fn parse_stage_note(note: &str) -> Option<i32> {
    note.trim()
        .strip_prefix("Stage")
        .or_else(|| note.trim().strip_prefix("stage"))
        .and_then(|rest| rest.trim().parse().ok())
}

fn parse_window(date: NaiveDate, window: &str) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let (from, to) = window.split_once('-')?;
    let from = NaiveTime::parse_from_str(from.trim(), "%H:%M").ok()?;
    let to = NaiveTime::parse_from_str(to.trim(), "%H:%M").ok()?;
    let start = date.and_time(from);
    let mut end = date.and_time(to);
    if end <= start {
        end += chrono::Duration::days(1);
    }
    Some((start, end))
}

impl AreaSchedule {
    fn windows(&self, stage: i32) -> impl Iterator<Item = (NaiveDateTime, NaiveDateTime)> + '_ {
        let index = usize::try_from(stage - 1).ok();
        self.days.iter().flat_map(move |day| {
            index
                .and_then(|idx| day.stages.get(idx))
                .into_iter()
                .flatten()
                .filter_map(move |window| {
                    let parsed = parse_window(day.date, window);
                    if parsed.is_none() {
                        debug!(day = %day.date, window = %window, "skipping malformed window");
                    }
                    parsed
                })
        })
    }

    fn event_stage(&self, now: NaiveDateTime) -> Option<i32> {
        self.events
            .iter()
            .find(|event| event.start <= now && now < event.end)
            .map(|event| event.stage)
    }
}

/// Time until the next outage window. Negative values are sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowForecast {
    pub time_until_ms: i64,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl WindowForecast {
    fn sentinel(code: i64) -> Self {
        Self {
            time_until_ms: code,
            start: None,
            end: None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.time_until_ms >= 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageWindowForecast {
    pub stage: u8,
    #[serde(flatten)]
    pub window: WindowForecast,
}

#[derive(Debug, Default)]
struct ForecastCache {
    schedule: Option<AreaSchedule>,
    baseline_stage: Option<i32>,
    override_stage: Option<u8>,
    last_stage: Option<i32>,
    last_alert: Option<(NaiveDateTime, i64)>,
}

/// Cached outage schedule plus the current stage, refreshed in the background.
pub struct LoadShedForecaster {
    provider: Arc<dyn ScheduleProvider>,
    clock: Arc<dyn WallClock>,
    refresh_interval: Duration,
    cache: Mutex<ForecastCache>,
    trace: TraceLog,
}

impl LoadShedForecaster {
    pub fn new(
        provider: Arc<dyn ScheduleProvider>,
        clock: Arc<dyn WallClock>,
        requests_per_day: u32,
        trace: TraceLog,
    ) -> Result<Self> {
        Ok(Self {
            provider,
            clock,
            refresh_interval: Self::refresh_interval_for(requests_per_day)?,
            cache: Mutex::new(ForecastCache::default()),
            trace,
        })
    }

    /// Spread the daily request budget over the day, two calls (area + status) per refresh.
    pub fn refresh_interval_for(requests_per_day: u32) -> Result<Duration> {
        if requests_per_day <= RESERVED_REQUESTS {
            return Err(AtsError::Config(format!(
                "request budget {} leaves nothing for polling",
                requests_per_day
            )));
        }
        let per_request = DAY_MS / u64::from(requests_per_day - RESERVED_REQUESTS);
        if per_request == 0 {
            return Err(AtsError::Config(format!(
                "request budget {} is too large to schedule",
                requests_per_day
            )));
        }
        Ok(Duration::from_millis(per_request * 2))
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Fetch schedule and stage. A failed fetch keeps the previous cache entry.
    pub async fn refresh(&self) -> Result<()> {
        let schedule = self.provider.fetch_area_schedule().await;
        let stage = self.provider.fetch_current_stage().await;
        let mut failure = None;
        {
            let mut cache = self.cache.lock();
            match schedule {
                Ok(schedule) => {
                    debug!(
                        days = schedule.days.len(),
                        events = schedule.events.len(),
                        "area schedule refreshed"
                    );
                    cache.schedule = Some(schedule);
                }
                Err(err) => {
                    warn!(error = %err, "area schedule refresh failed; keeping cached schedule");
                    failure = Some(AtsError::schedule(err));
                }
            }
            match stage {
                Ok(stage) => cache.baseline_stage = Some(stage),
                Err(err) => {
                    warn!(error = %err, "stage status refresh failed; keeping cached stage");
                    failure.get_or_insert(AtsError::schedule(err));
                }
            }
        }
        self.stage();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Periodic refresh until shutdown. The first refresh runs immediately.
    pub fn spawn_refresh(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let forecaster = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(forecaster.refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = forecaster.refresh_interval.as_secs(),
                "schedule refresh started"
            );
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("schedule refresh shutdown");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = forecaster.refresh().await {
                            debug!(error = %err, "schedule refresh incomplete");
                        }
                    }
                }
            }
        })
    }

    pub fn has_schedule(&self) -> bool {
        self.cache.lock().schedule.is_some()
    }

    /// Operator override of the stage; `None` returns to provider data.
    pub fn set_stage_override(&self, stage: Option<u8>) -> Result<()> {
        if let Some(stage) = stage {
            if stage > MAX_STAGE {
                return Err(AtsError::InvalidOverride(format!(
                    "load shedding stage {} outside 0..={}",
                    stage, MAX_STAGE
                )));
            }
        }
        self.cache.lock().override_stage = stage;
        info!(stage = ?stage, "load shedding stage override set");
        self.trace.push(match stage {
            Some(stage) => format!("Load shedding stage override {stage}"),
            None => "Load shedding stage override cleared".to_owned(),
        });
        self.stage();
        Ok(())
    }

    pub fn stage_override(&self) -> Option<u8> {
        self.cache.lock().override_stage
    }

    /// Current stage: operator override, then an event covering now, then the baseline.
    pub fn stage(&self) -> i32 {
        let now = self.clock.now();
        let mut cache = self.cache.lock();
        self.observe_stage(&mut cache, now)
    }

    fn observe_stage(&self, cache: &mut ForecastCache, now: NaiveDateTime) -> i32 {
        let stage = if let Some(stage) = cache.override_stage {
            i32::from(stage)
        } else if let Some(schedule) = &cache.schedule {
            match cache.baseline_stage {
                None => STAGE_NO_STATUS,
                Some(baseline) => match schedule.event_stage(now) {
                    Some(event_stage) if event_stage > 0 => event_stage,
                    _ => baseline,
                },
            }
        } else {
            STAGE_NO_SCHEDULE
        };

        if cache.last_stage != Some(stage) {
            match cache.last_stage {
                Some(previous) => {
                    info!(from = previous, to = stage, "load shedding stage changed");
                    self.trace
                        .push(format!("Load shedding stage {previous} > {stage}"));
                }
                None => info!(stage, "load shedding stage known"),
            }
            cache.last_stage = Some(stage);
        }
        stage
    }

    /// Time until the next window of `stage`, or of the current stage when `None`.
    ///
    /// Only current-stage queries record the 60/45/30/15/5 minute alerts.
    pub fn time_until_next_window(&self, stage: Option<i32>) -> WindowForecast {
        let now = self.clock.now();
        let mut cache = self.cache.lock();
        if cache.schedule.is_none() {
            return WindowForecast::sentinel(WINDOW_NO_SCHEDULE);
        }
        let active = match stage {
            Some(stage) => stage,
            None => self.observe_stage(&mut cache, now),
        };
        if active < 0 {
            return WindowForecast::sentinel(i64::from(active));
        }
        if active == 0 {
            return WindowForecast::sentinel(WINDOW_NONE);
        }

        let next = cache.schedule.as_ref().and_then(|schedule| {
            schedule
                .windows(active)
                .filter(|(start, _)| *start > now)
                .min_by_key(|(start, _)| *start)
        });
        let Some((start, end)) = next else {
            return WindowForecast::sentinel(WINDOW_NONE);
        };

        let time_until_ms = (start - now).num_milliseconds();
        if stage.is_none() {
            self.record_alert(&mut cache, start, time_until_ms);
        }
        WindowForecast {
            time_until_ms,
            start: Some(start),
            end: Some(end),
        }
    }

    fn record_alert(&self, cache: &mut ForecastCache, start: NaiveDateTime, time_until_ms: i64) {
        let minutes = time_until_ms / 60_000;
        if !ALERT_MINUTES.contains(&minutes) || cache.last_alert == Some((start, minutes)) {
            return;
        }
        cache.last_alert = Some((start, minutes));
        warn!(minutes, start = %start, "load shedding approaching");
        self.trace
            .push(format!("Load shedding in {minutes} minutes ({start})"));
    }

    /// Window of `stage` covering "now", if any.
    pub fn active_window(&self, stage: i32) -> Option<(NaiveDateTime, NaiveDateTime)> {
        if stage <= 0 {
            return None;
        }
        let now = self.clock.now();
        let cache = self.cache.lock();
        let schedule = cache.schedule.as_ref()?;
        let found = schedule
            .windows(stage)
            .find(|(start, end)| *start <= now && now < *end);
        found
    }

    /// Soonest upcoming window across stages 1..=8. Used for display only.
    pub fn time_until_next_window_any_stage(&self) -> Option<StageWindowForecast> {
        if !self.has_schedule() {
            return None;
        }
        (1..=MAX_STAGE)
            .filter_map(|stage| {
                let window = self.time_until_next_window(Some(i32::from(stage)));
                (window.time_until_ms > 0).then_some(StageWindowForecast { stage, window })
            })
            .min_by_key(|forecast| forecast.window.time_until_ms)
    }
}

impl fmt::Debug for LoadShedForecaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadShedForecaster")
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}
