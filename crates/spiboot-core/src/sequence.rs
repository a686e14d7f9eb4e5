//! Reset and strap sequencing
//!
//! Before any image is streamed, every target must be put into its boot
//! state: the DSP by pulsing its (possibly shared) reset line, the FPGA by
//! walking its PROGRAM_B/INIT_B strap pins through a fixed order.
//!
//! Every level change is followed by a blocking hold of at least
//! [`SETTLE_FLOOR`].

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use crate::error::SequenceError;
use crate::programmer::{GpioPort, Level};
use crate::target::{GpioStep, TargetConfig, SETTLE_FLOOR};

/// Drives reset and strap lines through their boot sequences
pub struct BootSequencer<'a> {
    gpio: &'a dyn GpioPort,
}

impl<'a> BootSequencer<'a> {
    /// Create a sequencer on top of a GPIO port
    pub fn new(gpio: &'a dyn GpioPort) -> Self {
        Self { gpio }
    }

    fn output(&self, pin: u32) -> Result<(), SequenceError> {
        self.gpio.set_output(pin).map_err(|source| SequenceError {
            pin,
            action: "configure as output",
            source,
        })
    }

    fn drive(&self, pin: u32, level: Level, settle: Duration) -> Result<(), SequenceError> {
        self.gpio.write(pin, level).map_err(|source| SequenceError {
            pin,
            action: match level {
                Level::Low => "drive low",
                Level::High => "drive high",
            },
            source,
        })?;
        thread::sleep(settle.max(SETTLE_FLOOR));
        Ok(())
    }

    /// Pulse an active-low reset line: low, hold, high, hold
    pub fn reset(&self, pin: u32, settle: Duration) -> Result<(), SequenceError> {
        log::debug!("sequence: reset begins on GPIO{}", pin);
        self.output(pin)?;
        self.drive(pin, Level::Low, settle)?;
        self.drive(pin, Level::High, settle)?;
        log::debug!("sequence: reset ends on GPIO{}", pin);
        Ok(())
    }

    /// Run an ordered list of strap steps
    pub fn run_steps(&self, steps: &[GpioStep]) -> Result<(), SequenceError> {
        let mut configured = Vec::new();
        for step in steps {
            if !configured.contains(&step.pin) {
                self.output(step.pin)?;
                configured.push(step.pin);
            }
        }
        for step in steps {
            log::debug!(
                "sequence: {} (GPIO{}) -> {}",
                step.name,
                step.pin,
                if step.high { "high" } else { "low" }
            );
            self.drive(step.pin, step.high.into(), step.settle)?;
        }
        Ok(())
    }

    /// Bring every target into its boot state
    ///
    /// Each distinct reset line is pulsed exactly once, however many targets
    /// share it, using the longest settle time among them. Strap sequences
    /// run afterwards, per target, in the order given.
    pub fn prepare<'t, I>(&self, targets: I) -> Result<(), SequenceError>
    where
        I: IntoIterator<Item = &'t TargetConfig>,
    {
        let targets: Vec<&TargetConfig> = targets.into_iter().collect();

        let mut resets: BTreeMap<u32, Duration> = BTreeMap::new();
        for target in &targets {
            if let Some(pin) = target.reset_pin {
                let settle = resets.entry(pin).or_insert(target.settle);
                *settle = (*settle).max(target.settle);
            }
        }

        for (&pin, &settle) in &resets {
            let sharing: Vec<&str> = targets
                .iter()
                .filter(|t| t.reset_pin == Some(pin))
                .map(|t| t.name.as_str())
                .collect();
            log::info!(
                "Resetting {} via GPIO{} ({} ms settle)",
                sharing.join(", "),
                pin,
                settle.max(SETTLE_FLOOR).as_millis()
            );
            self.reset(pin, settle)?;
        }

        for target in &targets {
            let steps = target.strap_sequence();
            if !steps.is_empty() {
                log::info!("Running {} strap sequence for {}", target.family, target.name);
                self.run_steps(&steps)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{ChannelKey, SpiMode, TargetFamily};
    use crate::testutil::{Event, MockHw};
    use std::time::Instant;

    fn dsp(name: &str, cs: u8, reset: Option<u32>) -> TargetConfig {
        TargetConfig {
            name: name.into(),
            family: TargetFamily::Adsp21489,
            key: ChannelKey::new(0, cs),
            pins: None,
            reset_pin: reset,
            strap_pins: Default::default(),
            clock_hz: 1_000_000,
            buffer_size: 4096,
            mode: SpiMode::MODE_3,
            settle: SETTLE_FLOOR,
        }
    }

    #[test]
    fn test_reset_order_and_timing() {
        let hw = MockHw::new();
        let seq = BootSequencer::new(&hw);

        let start = Instant::now();
        seq.reset(17, Duration::from_millis(1)).unwrap();
        // The floor applies even though 1 ms was requested
        assert!(start.elapsed() >= SETTLE_FLOOR * 2);

        assert_eq!(
            hw.events(),
            vec![
                Event::Output(17),
                Event::Write(17, Level::Low),
                Event::Write(17, Level::High)
            ]
        );
    }

    #[test]
    fn test_shared_reset_pulsed_once() {
        let hw = MockHw::new();
        let seq = BootSequencer::new(&hw);
        let targets = [
            dsp("dsp0", 0, Some(17)),
            dsp("dsp1", 1, Some(17)),
            dsp("dsp2", 2, Some(4)),
            dsp("dsp3", 3, None),
        ];
        seq.prepare(&targets).unwrap();

        let lows: Vec<u32> = hw
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Write(pin, Level::Low) => Some(pin),
                _ => None,
            })
            .collect();
        assert_eq!(lows, vec![4, 17]);
    }

    #[test]
    fn test_strap_steps_configure_outputs_first() {
        let hw = MockHw::new();
        let seq = BootSequencer::new(&hw);
        let steps = [
            GpioStep {
                name: "program_b".into(),
                pin: 27,
                high: false,
                settle: SETTLE_FLOOR,
            },
            GpioStep {
                name: "init_b".into(),
                pin: 22,
                high: false,
                settle: SETTLE_FLOOR,
            },
            GpioStep {
                name: "program_b".into(),
                pin: 27,
                high: true,
                settle: SETTLE_FLOOR,
            },
        ];
        seq.run_steps(&steps).unwrap();
        assert_eq!(
            hw.events(),
            vec![
                Event::Output(27),
                Event::Output(22),
                Event::Write(27, Level::Low),
                Event::Write(22, Level::Low),
                Event::Write(27, Level::High),
            ]
        );
    }
}
