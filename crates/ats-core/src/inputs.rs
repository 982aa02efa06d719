//! ---
//! ats_section: "01-core-functionality"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Monitoring frame parsing, debouncing and the ping watchdog."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use std::time::Duration;

use ats_common::config::InputsConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::trace::TraceLog;

/// Number of monitored inputs carried by a `STATE` frame.
pub const FEED_COUNT: usize = 8;

const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

/// One monitored line as reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedState {
    /// 1-based input number on the monitoring board.
    pub input: u8,
    pub connected: bool,
    pub energized: bool,
}

impl FeedState {
    fn from_level(input: u8, level: u8) -> Self {
        Self {
            input,
            connected: level > 0,
            energized: level == 2,
        }
    }

    fn is_live(&self) -> bool {
        self.connected && self.energized
    }

    fn bit(&self) -> u8 {
        u8::from(self.energized)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Feeds {
    pub primary: FeedState,
    pub secondary: FeedState,
    pub db_in: FeedState,
    pub ups_out: FeedState,
    pub blue_core: FeedState,
    pub db_red: FeedState,
    pub red: FeedState,
    pub blue_house: FeedState,
}

impl Feeds {
    /// Map raw levels (`0` disconnected, `1` connected, `2` powered) in board order.
    pub fn from_levels(levels: &[u8; FEED_COUNT]) -> Self {
        let feed = |idx: usize| FeedState::from_level(idx as u8 + 1, levels[idx]);
        Self {
            primary: feed(0),
            secondary: feed(1),
            db_in: feed(2),
            ups_out: feed(3),
            blue_core: feed(4),
            db_red: feed(5),
            red: feed(6),
            blue_house: feed(7),
        }
    }

    pub fn source_fingerprint(&self) -> String {
        format!(
            "P:{}|S:{}|D:{}",
            self.primary.bit(),
            self.secondary.bit(),
            self.db_in.bit()
        )
    }

    pub fn aux_fingerprint(&self) -> String {
        format!(
            "U:{}|B:{}|G:{}|R:{}|H:{}",
            self.ups_out.bit(),
            self.blue_core.bit(),
            self.db_red.bit(),
            self.red.bit(),
            self.blue_house.bit()
        )
    }

    /// Hard alarm: the distribution board halves disagree, a protected load is dark,
    /// or a source line is physically disconnected.
    pub fn power_alarm(&self) -> bool {
        self.db_in.energized != self.db_red.energized
            || !self.ups_out.is_live()
            || !self.blue_core.is_live()
            || !self.blue_house.is_live()
            || !self.primary.connected
            || !self.secondary.connected
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ping,
    State(Feeds),
}

/// Parse one line from the monitor. Anything without a known bracketed tag is `None`.
pub fn parse_frame(line: &str) -> Option<Frame> {
    let start = line.find('[')?;
    let end = start + line[start..].find(']')?;
    let mut parts = line[start + 1..end].split(':');
    match parts.next()?.trim() {
        "PING" => Some(Frame::Ping),
        "STATE" => {
            let mut levels = [0u8; FEED_COUNT];
            for slot in levels.iter_mut() {
                let level: u8 = parts.next()?.trim().parse().ok()?;
                if level > 2 {
                    return None;
                }
                *slot = level;
            }
            Some(Frame::State(Feeds::from_levels(&levels)))
        }
        _ => None,
    }
}

/// Debounced view of the monitored feeds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InputSnapshot {
    pub feeds: Feeds,
    pub power_primary: bool,
    pub power_secondary: bool,
    pub power_db: bool,
    pub power_db_red: bool,
    pub power_ups: bool,
    pub power_blue_core: bool,
    pub power_blue_house: bool,
    pub power_red_house: bool,
    /// False until the first frame has settled; other fields are meaningless before.
    pub initial_state_loaded: bool,
    pub power_alarm: bool,
    pub last_db_power: Option<DateTime<Utc>>,
    pub source_fingerprint: String,
    pub aux_fingerprint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WatchdogStatus {
    /// Seconds left before the monitor is declared silent.
    pub countdown: i32,
    pub last_ping: Option<DateTime<Utc>>,
    pub expired: bool,
}

#[derive(Debug)]
struct PendingSettle {
    feeds: Feeds,
    deadline: Instant,
}

/// Owns the input snapshot. Frames are debounced on the trailing edge: a fingerprint
/// change arms the settle window and every further change restarts it.
#[derive(Debug)]
pub struct InputTracker {
    settle_window: Duration,
    flap_warn_restarts: u32,
    flap_force_restarts: u32,
    watchdog_max: i32,
    snapshot: InputSnapshot,
    watchdog: WatchdogStatus,
    last_source: String,
    last_aux: String,
    pending: Option<PendingSettle>,
    restarts: u32,
    trace: TraceLog,
}

impl InputTracker {
    pub fn new(config: &InputsConfig, trace: TraceLog) -> Self {
        Self {
            settle_window: config.settle_window,
            flap_warn_restarts: config.flap_warn_restarts,
            flap_force_restarts: config.flap_force_restarts,
            watchdog_max: config.watchdog_max_count,
            snapshot: InputSnapshot::default(),
            watchdog: WatchdogStatus {
                countdown: config.watchdog_max_count,
                ..WatchdogStatus::default()
            },
            last_source: String::new(),
            last_aux: String::new(),
            pending: None,
            restarts: 0,
            trace,
        }
    }

    pub fn state(&self) -> InputSnapshot {
        self.snapshot.clone()
    }

    pub fn watchdog(&self) -> WatchdogStatus {
        self.watchdog.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot.initial_state_loaded
    }

    pub fn settle_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|pending| pending.deadline)
    }

    /// Feed one raw line. Returns `true` when the snapshot was replaced.
    pub fn on_frame(&mut self, line: &str, now: Instant) -> bool {
        let Some(frame) = parse_frame(line) else {
            debug!(line, "ignoring malformed monitor frame");
            return false;
        };
        self.feed_watchdog();
        match frame {
            Frame::Ping => {
                trace!("monitor ping");
                false
            }
            Frame::State(feeds) => self.on_state(feeds, now),
        }
    }

    fn on_state(&mut self, feeds: Feeds, now: Instant) -> bool {
        let mut changed = false;
        let source = feeds.source_fingerprint();
        if source != self.last_source {
            info!(fingerprint = %source, "source feeds changed");
            self.trace.push(format!("Inputs: {source}"));
            self.last_source = source;
            changed = true;
        }
        let aux = feeds.aux_fingerprint();
        if aux != self.last_aux {
            info!(fingerprint = %aux, "auxiliary feeds changed");
            self.trace.push(format!("Inputs: {aux}"));
            self.last_aux = aux;
            changed = true;
        }

        if !changed {
            // connectivity-only differences still ride along with a pending settle
            if let Some(pending) = self.pending.as_mut() {
                pending.feeds = feeds;
            }
            return false;
        }

        if self.pending.is_some() {
            self.restarts += 1;
            if self.restarts >= self.flap_force_restarts {
                warn!(
                    restarts = self.restarts,
                    "inputs flapping; forcing latest frame"
                );
                self.trace.push("Inputs: FORCE RESET");
                self.pending = None;
                self.restarts = 0;
                self.apply(feeds);
                return true;
            }
            if self.restarts > self.flap_warn_restarts {
                warn!(restarts = self.restarts, "inputs flapping");
                self.trace
                    .push(format!("Inputs: FLAPPING {}", self.restarts));
            }
        }
        self.pending = Some(PendingSettle {
            feeds,
            deadline: now + self.settle_window,
        });
        false
    }

    /// Apply the pending frame once its settle window has elapsed.
    pub fn poll_settle(&mut self, now: Instant) -> bool {
        match &self.pending {
            Some(pending) if pending.deadline <= now => {}
            _ => return false,
        }
        let Some(pending) = self.pending.take() else {
            return false;
        };
        self.restarts = 0;
        self.apply(pending.feeds);
        true
    }

    fn apply(&mut self, feeds: Feeds) {
        let snapshot = &mut self.snapshot;
        snapshot.power_primary = feeds.primary.energized;
        snapshot.power_secondary = feeds.secondary.energized;
        snapshot.power_db = feeds.db_in.energized;
        snapshot.power_db_red = feeds.db_red.energized;
        snapshot.power_ups = feeds.ups_out.energized;
        snapshot.power_blue_core = feeds.blue_core.energized;
        snapshot.power_blue_house = feeds.blue_house.energized;
        snapshot.power_red_house = feeds.red.energized;
        snapshot.initial_state_loaded = true;
        if feeds.db_in.energized {
            snapshot.last_db_power = Some(Utc::now());
        }
        snapshot.source_fingerprint = feeds.source_fingerprint();
        snapshot.aux_fingerprint = feeds.aux_fingerprint();
        snapshot.power_alarm = feeds.power_alarm();
        if snapshot.power_alarm {
            error!(
                source = %snapshot.source_fingerprint,
                aux = %snapshot.aux_fingerprint,
                "NO POWER ALERT"
            );
            self.trace.push(format!(
                "NO POWER ALERT {} {}",
                snapshot.source_fingerprint, snapshot.aux_fingerprint
            ));
        }
        snapshot.feeds = feeds;
        debug!(
            primary = snapshot.power_primary,
            secondary = snapshot.power_secondary,
            "input snapshot applied"
        );
    }

    fn feed_watchdog(&mut self) {
        if self.watchdog.expired {
            info!("monitor frames resumed");
        }
        self.watchdog.countdown = self.watchdog_max;
        self.watchdog.last_ping = Some(Utc::now());
        self.watchdog.expired = false;
    }

    /// One-second watchdog step. Returns `true` while the monitor is considered silent.
    pub fn watchdog_tick(&mut self) -> bool {
        self.watchdog.countdown = self.watchdog.countdown.saturating_sub(1);
        if self.watchdog.countdown < 0 {
            if !self.watchdog.expired {
                self.trace.push("NO PING FROM MONITOR");
            }
            self.watchdog.expired = true;
            error!(
                countdown = self.watchdog.countdown,
                "NO PING FROM MONITOR"
            );
        }
        self.watchdog.expired
    }

    /// Drop any pending settle; the snapshot itself is kept.
    pub fn dispose(&mut self) {
        self.pending = None;
        self.restarts = 0;
    }
}

/// Receivers for everything the input task publishes.
#[derive(Debug, Clone)]
pub struct InputWatch {
    pub snapshots: watch::Receiver<InputSnapshot>,
    pub watchdog: watch::Receiver<WatchdogStatus>,
}

/// Run the tracker in its own task: frames, settle timer and watchdog tick.
pub fn spawn_input_tracker(
    mut tracker: InputTracker,
    mut frames: mpsc::Receiver<String>,
    mut shutdown: broadcast::Receiver<()>,
) -> (InputWatch, JoinHandle<()>) {
    let (snapshot_tx, snapshot_rx) = watch::channel(tracker.state());
    let (watchdog_tx, watchdog_rx) = watch::channel(tracker.watchdog());

    let task = tokio::spawn(async move {
        let mut watchdog_tick = interval_at(Instant::now() + WATCHDOG_PERIOD, WATCHDOG_PERIOD);
        watchdog_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frames_open = true;

        loop {
            let settle_at = tracker.settle_deadline();
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("input tracker shutdown");
                    break;
                }
                line = frames.recv(), if frames_open => match line {
                    Some(line) => {
                        if tracker.on_frame(&line, Instant::now()) {
                            snapshot_tx.send_replace(tracker.state());
                        }
                        watchdog_tx.send_replace(tracker.watchdog());
                    }
                    None => {
                        warn!("frame source closed; inputs frozen");
                        frames_open = false;
                    }
                },
                _ = sleep_until(settle_at.unwrap_or_else(Instant::now)), if settle_at.is_some() => {
                    if tracker.poll_settle(Instant::now()) {
                        snapshot_tx.send_replace(tracker.state());
                    }
                }
                _ = watchdog_tick.tick() => {
                    tracker.watchdog_tick();
                    watchdog_tx.send_replace(tracker.watchdog());
                }
            }
        }
        tracker.dispose();
    });

    (
        InputWatch {
            snapshots: snapshot_rx,
            watchdog: watchdog_rx,
        },
        task,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_LIVE: &str = "[STATE:2:2:2:2:2:2:2:2]";
    const PRIMARY_DOWN: &str = "[STATE:1:2:2:2:2:2:2:2]";

    fn tracker() -> InputTracker {
        InputTracker::new(&InputsConfig::default(), TraceLog::new())
    }

    #[test]
    fn parses_state_levels_in_board_order() {
        let Some(Frame::State(feeds)) = parse_frame("noise [STATE:2:1:0:2:2:2:0:2] tail") else {
            panic!("expected a state frame");
        };
        assert!(feeds.primary.energized && feeds.primary.connected);
        assert!(feeds.secondary.connected && !feeds.secondary.energized);
        assert!(!feeds.db_in.connected);
        assert_eq!(feeds.db_red.input, 6);
        assert!(!feeds.red.connected);
        assert_eq!(feeds.source_fingerprint(), "P:1|S:0|D:0");
        assert_eq!(feeds.aux_fingerprint(), "U:1|B:1|G:1|R:0|H:1");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(parse_frame("STATE:2:2"), None);
        assert_eq!(parse_frame("[STATE:2:2:2]"), None);
        assert_eq!(parse_frame("[STATE:2:2:x:2:2:2:2:2]"), None);
        assert_eq!(parse_frame("[STATE:2:2:3:2:2:2:2:2]"), None);
        assert_eq!(parse_frame("[HELLO]"), None);
        assert_eq!(parse_frame("[PING]"), Some(Frame::Ping));
    }

    #[test]
    fn frame_applies_after_settle_window() {
        let mut inputs = tracker();
        let start = Instant::now();
        assert!(!inputs.on_frame(ALL_LIVE, start));
        assert!(!inputs.is_ready());
        assert!(!inputs.poll_settle(start + Duration::from_millis(999)));
        assert!(inputs.poll_settle(start + Duration::from_secs(1)));
        let state = inputs.state();
        assert!(state.initial_state_loaded);
        assert!(state.power_primary && state.power_secondary);
        assert!(!state.power_alarm);
        assert!(state.last_db_power.is_some());
    }

    #[test]
    fn alternating_burst_settles_once_with_last_values() {
        let mut inputs = tracker();
        let start = Instant::now();
        let mut applied = 0;
        for idx in 0..10u64 {
            let line = if idx % 2 == 0 { ALL_LIVE } else { PRIMARY_DOWN };
            if inputs.on_frame(line, start + Duration::from_millis(idx * 50)) {
                applied += 1;
            }
        }
        let after_burst = start + Duration::from_millis(450) + Duration::from_secs(1);
        if inputs.poll_settle(after_burst) {
            applied += 1;
        }
        assert_eq!(applied, 1);
        // the tenth frame (idx 9) was PRIMARY_DOWN
        assert!(!inputs.state().power_primary);
    }

    #[test]
    fn sustained_flapping_forces_the_latest_frame() {
        let mut inputs = tracker();
        let start = Instant::now();
        for idx in 0..10u64 {
            let line = if idx % 2 == 0 { ALL_LIVE } else { PRIMARY_DOWN };
            assert!(!inputs.on_frame(line, start + Duration::from_millis(idx * 50)));
        }
        // eleventh change restarts the settle window for the tenth time
        assert!(inputs.on_frame(ALL_LIVE, start + Duration::from_millis(500)));
        assert!(inputs.state().power_primary);
        assert_eq!(inputs.settle_deadline(), None);
    }

    #[test]
    fn identical_frames_do_not_rearm_the_window() {
        let mut inputs = tracker();
        let start = Instant::now();
        inputs.on_frame(ALL_LIVE, start);
        inputs.on_frame(ALL_LIVE, start + Duration::from_millis(800));
        assert_eq!(inputs.settle_deadline(), Some(start + Duration::from_secs(1)));
    }

    #[test]
    fn alarm_raised_when_board_halves_disagree() {
        let mut inputs = tracker();
        let start = Instant::now();
        inputs.on_frame("[STATE:2:2:2:2:2:1:2:2]", start);
        inputs.poll_settle(start + Duration::from_secs(1));
        assert!(inputs.state().power_alarm);
    }

    #[test]
    fn watchdog_expires_without_frames_and_recovers_on_ping() {
        let config = InputsConfig {
            watchdog_max_count: 2,
            ..InputsConfig::default()
        };
        let mut inputs = InputTracker::new(&config, TraceLog::new());
        assert!(!inputs.watchdog_tick());
        assert!(!inputs.watchdog_tick());
        assert!(inputs.watchdog_tick());
        assert!(inputs.watchdog().expired);

        inputs.on_frame("[PING]", Instant::now());
        let status = inputs.watchdog();
        assert!(!status.expired);
        assert_eq!(status.countdown, 2);
        assert!(status.last_ping.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_tracker_publishes_settled_snapshots() {
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (mut watch, task) = spawn_input_tracker(tracker(), rx, shutdown_rx);

        tx.send(ALL_LIVE.to_owned()).await.unwrap();
        watch.snapshots.changed().await.unwrap();
        assert!(watch.snapshots.borrow().initial_state_loaded);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
