//! ---
//! ats_section: "01-core-functionality"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Idempotent contactor relay control."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use ats_common::config::{RelayPinConfig, RelaysConfig};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{AtsError, Result};
use crate::ports::{NotificationSink, PinState, RelayDriver};

/// Commanded contactor configuration. `true` means closed (or generator running).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayState {
    pub primary: bool,
    pub secondary: bool,
    pub generator: bool,
}

impl RelayState {
    /// All relays released: both contactors closed through their normally-closed
    /// contacts and the generator run signal dropped.
    pub const FAIL_SAFE: RelayState = RelayState {
        primary: true,
        secondary: true,
        generator: false,
    };
}

impl Default for RelayState {
    fn default() -> Self {
        Self::FAIL_SAFE
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |on: bool| if on { 'T' } else { 'F' };
        write!(
            f,
            "({},{},{})",
            flag(self.primary),
            flag(self.secondary),
            flag(self.generator)
        )
    }
}

/// Partial relay command; `None` leaves that relay untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayCommand {
    pub primary: Option<bool>,
    pub secondary: Option<bool>,
    pub generator: Option<bool>,
}

impl RelayCommand {
    pub const fn new(primary: Option<bool>, secondary: Option<bool>, generator: Option<bool>) -> Self {
        Self {
            primary,
            secondary,
            generator,
        }
    }

    pub fn apply_to(&self, state: RelayState) -> RelayState {
        RelayState {
            primary: self.primary.unwrap_or(state.primary),
            secondary: self.secondary.unwrap_or(state.secondary),
            generator: self.generator.unwrap_or(state.generator),
        }
    }
}

impl fmt::Display for RelayCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |value: Option<bool>| match value {
            Some(true) => 'T',
            Some(false) => 'F',
            None => '-',
        };
        write!(
            f,
            "({},{},{})",
            flag(self.primary),
            flag(self.secondary),
            flag(self.generator)
        )
    }
}

/// Wiring of one relay output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayPin {
    pub pin: u32,
    pub normally_closed: bool,
}

impl RelayPin {
    /// Pin level that puts the contactor in the requested position.
    pub fn level(&self, closed: bool) -> bool {
        closed != self.normally_closed
    }
}

impl From<RelayPinConfig> for RelayPin {
    fn from(value: RelayPinConfig) -> Self {
        Self {
            pin: value.pin,
            normally_closed: value.normally_closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinMap {
    pub primary: RelayPin,
    pub secondary: RelayPin,
    pub generator: RelayPin,
}

impl PinMap {
    pub fn from_config(config: &RelaysConfig) -> Self {
        Self {
            primary: config.primary.into(),
            secondary: config.secondary.into(),
            generator: config.generator.into(),
        }
    }

    pub fn pins(&self) -> [u32; 3] {
        [self.primary.pin, self.secondary.pin, self.generator.pin]
    }

    /// Logical state to physical levels, in primary/secondary/generator order.
    pub fn levels(&self, state: RelayState) -> Vec<PinState> {
        vec![
            PinState {
                pin: self.primary.pin,
                high: self.primary.level(state.primary),
            },
            PinState {
                pin: self.secondary.pin,
                high: self.secondary.level(state.secondary),
            },
            PinState {
                pin: self.generator.pin,
                high: self.generator.level(state.generator),
            },
        ]
    }

    /// Recover the logical state from a full pin vector written by [`PinMap::levels`].
    pub fn decode(&self, pins: &[PinState]) -> Option<RelayState> {
        let level = |relay: &RelayPin| {
            pins.iter()
                .find(|p| p.pin == relay.pin)
                .map(|p| p.high != relay.normally_closed)
        };
        Some(RelayState {
            primary: level(&self.primary)?,
            secondary: level(&self.secondary)?,
            generator: level(&self.generator)?,
        })
    }
}

impl Default for PinMap {
    fn default() -> Self {
        Self::from_config(&RelaysConfig::default())
    }
}

/// Sole owner of the commanded relay state.
pub struct OutputController {
    driver: Arc<dyn RelayDriver>,
    pins: PinMap,
    state: RelayState,
    /// Set until a full vector has been written successfully.
    needs_write: bool,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl OutputController {
    /// The initial commanded state is [`RelayState::FAIL_SAFE`]; the first call to
    /// [`OutputController::set_state`] always writes.
    pub fn new(driver: Arc<dyn RelayDriver>, pins: PinMap) -> Self {
        Self {
            driver,
            pins,
            state: RelayState::FAIL_SAFE,
            needs_write: true,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn pins(&self) -> PinMap {
        self.pins
    }

    /// Apply a partial command. Returns `Ok(false)` when nothing changed and no
    /// write was needed.
    pub async fn set_state(&mut self, command: RelayCommand) -> Result<bool> {
        let previous = self.state;
        let next = command.apply_to(previous);
        if next == previous && !self.needs_write {
            return Ok(false);
        }

        self.log_relay("primary", self.pins.primary, previous.primary, next.primary);
        self.log_relay(
            "secondary",
            self.pins.secondary,
            previous.secondary,
            next.secondary,
        );
        self.log_relay(
            "generator",
            self.pins.generator,
            previous.generator,
            next.generator,
        );

        self.state = next;
        self.needs_write = true;
        self.driver
            .set_pins_state(&self.pins.levels(next))
            .await
            .map_err(AtsError::relay)?;
        self.needs_write = false;

        if next.generator != previous.generator {
            self.notify_generator(next.generator);
        }
        Ok(true)
    }

    fn log_relay(&self, relay: &'static str, wiring: RelayPin, from: bool, to: bool) {
        info!(
            relay,
            pin = wiring.pin,
            from = wiring.level(from),
            to = wiring.level(to),
            closed = to,
            "relay output"
        );
    }

    fn notify_generator(&self, running: bool) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        let message = if running {
            "Generator started"
        } else {
            "Generator stopped"
        };
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(message).await {
                warn!(error = %err, "generator notification failed");
            }
        });
    }
}

impl fmt::Debug for OutputController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputController")
            .field("pins", &self.pins)
            .field("state", &self.state)
            .field("needs_write", &self.needs_write)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryNotifier, MemoryRelayDriver};

    const T: Option<bool> = Some(true);
    const F: Option<bool> = Some(false);

    fn controller() -> (OutputController, MemoryRelayDriver) {
        let driver = MemoryRelayDriver::new();
        let outputs = OutputController::new(Arc::new(driver.clone()), PinMap::default());
        (outputs, driver)
    }

    #[test]
    fn fail_safe_releases_every_pin_with_default_wiring() {
        let levels = PinMap::default().levels(RelayState::FAIL_SAFE);
        assert!(levels.iter().all(|pin| !pin.high));
        assert_eq!(
            levels.iter().map(|p| p.pin).collect::<Vec<_>>(),
            vec![4, 22, 6]
        );
    }

    #[tokio::test]
    async fn repeated_command_is_not_rewritten() {
        let (mut outputs, driver) = controller();
        assert!(outputs.set_state(RelayCommand::new(F, T, T)).await.unwrap());
        assert!(!outputs.set_state(RelayCommand::new(F, T, T)).await.unwrap());
        assert!(!outputs.set_state(RelayCommand::new(None, None, T)).await.unwrap());
        assert_eq!(driver.writes().len(), 1);
    }

    #[tokio::test]
    async fn first_command_writes_even_when_unchanged() {
        let (mut outputs, driver) = controller();
        outputs
            .set_state(RelayCommand::new(T, T, F))
            .await
            .unwrap();
        assert_eq!(driver.writes().len(), 1);
    }

    #[tokio::test]
    async fn partial_command_writes_the_full_vector() {
        let (mut outputs, driver) = controller();
        outputs
            .set_state(RelayCommand::new(None, None, T))
            .await
            .unwrap();
        let write = driver.last_write().unwrap();
        assert_eq!(write.pins.len(), 3);
        let decoded = outputs.pins().decode(&write.pins).unwrap();
        assert_eq!(
            decoded,
            RelayState {
                primary: true,
                secondary: true,
                generator: true
            }
        );
    }

    #[tokio::test]
    async fn failed_write_is_retried_on_the_next_command() {
        let (mut outputs, driver) = controller();
        outputs.set_state(RelayCommand::new(F, F, F)).await.unwrap();
        driver.set_failing(true);
        let err = outputs
            .set_state(RelayCommand::new(T, None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, AtsError::RelayDriver(_)));
        assert!(outputs.state().primary);

        driver.set_failing(false);
        assert!(outputs.set_state(RelayCommand::new(T, None, None)).await.unwrap());
        assert_eq!(driver.writes().len(), 2);
    }

    #[tokio::test]
    async fn generator_changes_are_notified() {
        let driver = MemoryRelayDriver::new();
        let notifier = MemoryNotifier::default();
        let mut outputs = OutputController::new(Arc::new(driver), PinMap::default())
            .with_notifier(Arc::new(notifier.clone()));

        outputs.set_state(RelayCommand::new(None, None, T)).await.unwrap();
        outputs.set_state(RelayCommand::new(F, None, None)).await.unwrap();
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(notifier.messages(), vec!["Generator started".to_owned()]);
    }
}
