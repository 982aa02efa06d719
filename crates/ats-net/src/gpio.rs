//! ---
//! ats_section: "05-networking-external-interfaces"
//! ats_subsection: "module"
//! ats_type: "source"
//! ats_scope: "code"
//! ats_description: "Relay driver over the Linux GPIO character device."
//! ats_version: "v0.0.0-prealpha"
//! ats_owner: "tbd"
//! ---
//! The three relay lines are requested together from one chip, so every
//! write lands as a single `set_values` call rather than one write per pin.

use anyhow::{anyhow, bail, Result};
use ats_core::ports::PinState;

/// Consumer label shown by `gpioinfo` for the requested lines.
pub const CONSUMER: &str = "atsd";

/// Levels for `offsets`, in request order. Every requested line must be given
/// a level and no other line may appear.
pub fn ordered_levels(offsets: &[u32; 3], pins: &[PinState]) -> Result<[bool; 3]> {
    if let Some(stray) = pins.iter().find(|p| !offsets.contains(&p.pin)) {
        bail!("gpio line {} is not one of the requested relay lines", stray.pin);
    }
    let mut levels = [false; 3];
    for (level, offset) in levels.iter_mut().zip(offsets) {
        *level = pins
            .iter()
            .find(|p| p.pin == *offset)
            .map(|p| p.high)
            .ok_or_else(|| anyhow!("no level given for gpio line {}", offset))?;
    }
    Ok(levels)
}

#[cfg(target_os = "linux")]
pub use chip::GpiodRelayDriver;

#[cfg(target_os = "linux")]
mod chip {
    use anyhow::{anyhow, Context, Result};
    use async_trait::async_trait;
    use ats_core::outputs::{PinMap, RelayState};
    use ats_core::ports::{PinState, RelayDriver};
    use gpiod::{Chip, Lines, Options, Output};
    use parking_lot::Mutex;
    use tracing::{debug, info};

    use super::{ordered_levels, CONSUMER};

    /// Drives the relay lines of one GPIO chip, e.g. `gpiochip0` on a Raspberry Pi.
    pub struct GpiodRelayDriver {
        chip: String,
        offsets: [u32; 3],
        fail_safe: [bool; 3],
        lines: Mutex<Option<Lines<Output>>>,
    }

    impl GpiodRelayDriver {
        pub fn new(chip: impl Into<String>, pins: PinMap) -> Self {
            let offsets = pins.pins();
            let fail_safe = ordered_levels(&offsets, &pins.levels(RelayState::FAIL_SAFE))
                .unwrap_or_default();
            Self {
                chip: chip.into(),
                offsets,
                fail_safe,
                lines: Mutex::new(None),
            }
        }
    }

    impl std::fmt::Debug for GpiodRelayDriver {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("GpiodRelayDriver")
                .field("chip", &self.chip)
                .field("offsets", &self.offsets)
                .field("requested", &self.lines.lock().is_some())
                .finish()
        }
    }

    #[async_trait]
    impl RelayDriver for GpiodRelayDriver {
        /// Request the lines as outputs, driven to the fail-safe levels.
        async fn init(&self) -> Result<()> {
            let chip = Chip::new(&self.chip)
                .with_context(|| format!("failed to open gpio chip {}", self.chip))?;
            let options = Options::output(self.offsets)
                .values(self.fail_safe)
                .consumer(CONSUMER);
            let lines = chip.request_lines(options).with_context(|| {
                format!(
                    "failed to request gpio lines {:?} on {}",
                    self.offsets, self.chip
                )
            })?;
            info!(chip = %self.chip, lines = ?self.offsets, levels = ?self.fail_safe, "relay lines requested");
            *self.lines.lock() = Some(lines);
            Ok(())
        }

        async fn set_pins_state(&self, pins: &[PinState]) -> Result<()> {
            let levels = ordered_levels(&self.offsets, pins)?;
            let guard = self.lines.lock();
            let lines = guard
                .as_ref()
                .ok_or_else(|| anyhow!("relay lines written before they were requested"))?;
            lines.set_values(levels).with_context(|| {
                format!("failed to set gpio lines {:?} on {}", self.offsets, self.chip)
            })?;
            debug!(lines = ?self.offsets, levels = ?levels, "gpio written");
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn missing_chip_fails_init() {
            let driver = GpiodRelayDriver::new("gpiochip-ats-missing", PinMap::default());
            let err = driver.init().await.unwrap_err();
            assert!(format!("{err:#}").contains("gpiochip-ats-missing"));
        }

        #[tokio::test]
        async fn writes_before_init_are_rejected() {
            let pins = PinMap::default();
            let driver = GpiodRelayDriver::new("gpiochip0", pins);
            let err = driver
                .set_pins_state(&pins.levels(RelayState::FAIL_SAFE))
                .await
                .unwrap_err();
            assert!(err.to_string().contains("before they were requested"));
        }

        #[test]
        fn fail_safe_request_drives_every_line_low() {
            let driver = GpiodRelayDriver::new("gpiochip0", PinMap::default());
            assert_eq!(driver.offsets, [4, 22, 6]);
            assert_eq!(driver.fail_safe, [false, false, false]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ats_core::outputs::{PinMap, RelayState};

    #[test]
    fn levels_follow_request_order_not_argument_order() {
        let pins = [
            PinState { pin: 6, high: true },
            PinState { pin: 4, high: true },
            PinState { pin: 22, high: false },
        ];
        assert_eq!(ordered_levels(&[4, 22, 6], &pins).unwrap(), [true, false, true]);
    }

    #[test]
    fn levels_follow_the_relay_wiring() {
        let map = PinMap::default();
        let on_generator = RelayState {
            primary: false,
            secondary: true,
            generator: true,
        };
        assert_eq!(
            ordered_levels(&map.pins(), &map.levels(on_generator)).unwrap(),
            [true, false, true]
        );
    }

    #[test]
    fn partial_or_foreign_pin_sets_are_rejected() {
        let partial = [PinState { pin: 4, high: true }];
        let err = ordered_levels(&[4, 22, 6], &partial).unwrap_err();
        assert!(err.to_string().contains("gpio line 22"));

        let foreign = [
            PinState { pin: 4, high: true },
            PinState { pin: 22, high: true },
            PinState { pin: 6, high: true },
            PinState { pin: 17, high: true },
        ];
        let err = ordered_levels(&[4, 22, 6], &foreign).unwrap_err();
        assert!(err.to_string().contains("gpio line 17"));
    }
}
