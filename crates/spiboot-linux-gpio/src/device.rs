//! Bitbang SPI channels over Linux GPIO lines
//!
//! [`LinuxGpioSpi`] holds the four lines of one channel (CS, SCK, MOSI as
//! outputs, MISO as input) and clocks bytes through the helpers in
//! [`spiboot_core::programmer::bitbang`]. [`LinuxGpioSpiDriver`] keeps the
//! open channels by chip-select and implements [`SpiChannelDriver`].
//!
//! Targets on one bus share SCK/MOSI/MISO, so only one channel per bus can
//! hold its lines at a time. The orchestrator boots targets on a bus one
//! after the other, which satisfies this. While a channel is open it also
//! holds the other chip-selects of its bus high, so the idle targets never
//! see the shared clock as addressed to them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use gpiocdev::line::Value;
use gpiocdev::request::{Config, Request};

use spiboot_core::programmer::bitbang::{self, BitbangLines};
use spiboot_core::programmer::SpiChannelDriver;
use spiboot_core::target::{ChannelKey, ChannelParams, SpiMode, SpiPins};
use spiboot_core::DriverError;

use crate::error::{LinuxGpioError, Result};

/// Half periods shorter than this are busy-waited; `thread::sleep` cannot
/// resolve them.
const SPIN_THRESHOLD: Duration = Duration::from_micros(50);

fn level(high: bool) -> Value {
    if high {
        Value::Active
    } else {
        Value::Inactive
    }
}

/// One open bitbang SPI channel
pub struct LinuxGpioSpi {
    /// GPIO line request handle, including the idle chip-selects of the bus
    request: Request,
    pins: SpiPins,
    mode: SpiMode,
    half_period: Duration,
    /// First line error seen during the current transaction
    fault: Option<gpiocdev::Error>,
}

impl LinuxGpioSpi {
    /// Request the channel's lines on `chip`
    ///
    /// `idle_cs` are the chip-selects of the other targets sharing the bus.
    /// They are requested as outputs driven high until the channel closes.
    pub fn open(
        chip: &Path,
        pins: SpiPins,
        idle_cs: &[u32],
        clock_hz: u32,
        mode: SpiMode,
    ) -> Result<Self> {
        log::debug!("linux_gpio: opening bitbang SPI on {}", chip.display());

        // Initial state: every CS high (inactive), SCK at its idle level, MOSI low
        let mut config = Config::default();
        config.with_line(pins.cs).as_output(Value::Active);
        for &cs in idle_cs {
            config.with_line(cs).as_output(Value::Active);
        }
        config
            .with_line(pins.sclk)
            .as_output(level(mode.idle_clock_high()));
        config.with_line(pins.mosi).as_output(Value::Inactive);
        config.with_line(pins.miso).as_input();

        let request = Request::from_config(config)
            .on_chip(chip)
            .with_consumer("spiboot")
            .request()
            .map_err(|source| LinuxGpioError::LineRequestFailed {
                chip: chip.to_path_buf(),
                offsets: [pins.cs, pins.sclk, pins.mosi, pins.miso]
                    .into_iter()
                    .chain(idle_cs.iter().copied())
                    .collect(),
                source,
            })?;

        let half_period = Duration::from_nanos(bitbang::half_period_ns(clock_hz));
        log::info!(
            "linux_gpio: opened {} (cs={}, sck={}, mosi={}, miso={}, {}, ~{} Hz)",
            chip.display(),
            pins.cs,
            pins.sclk,
            pins.mosi,
            pins.miso,
            mode,
            clock_hz
        );
        if !idle_cs.is_empty() {
            log::debug!("linux_gpio: holding idle chip-selects {:?} high", idle_cs);
        }

        Ok(Self {
            request,
            pins,
            mode,
            half_period,
            fault: None,
        })
    }

    /// Clock `data` out in one CS-framed transaction
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.fault = None;
        let mode = self.mode;
        bitbang::transaction(self, mode, data);
        match self.fault.take() {
            Some(e) => Err(LinuxGpioError::SetValueFailed(e)),
            None => Ok(data.len()),
        }
    }

    fn set_line(&mut self, offset: u32, high: bool) {
        if self.fault.is_some() {
            return;
        }
        if let Err(e) = self.request.set_value(offset, level(high)) {
            log::error!("linux_gpio: failed to set GPIO{}: {}", offset, e);
            self.fault = Some(e);
        }
    }
}

impl BitbangLines for LinuxGpioSpi {
    fn set_cs(&mut self, active: bool) {
        // CS is active low
        self.set_line(self.pins.cs, !active);
    }

    fn set_sck(&mut self, high: bool) {
        self.set_line(self.pins.sclk, high);
    }

    fn set_mosi(&mut self, high: bool) {
        self.set_line(self.pins.mosi, high);
    }

    fn get_miso(&self) -> bool {
        match self.request.value(self.pins.miso) {
            Ok(Value::Active) => true,
            Ok(Value::Inactive) => false,
            Err(e) => {
                log::error!("linux_gpio: failed to read MISO: {}", e);
                false
            }
        }
    }

    fn half_period_delay(&self) {
        if self.half_period.is_zero() {
            return;
        }
        if self.half_period < SPIN_THRESHOLD {
            let start = Instant::now();
            while start.elapsed() < self.half_period {
                std::hint::spin_loop();
            }
        } else {
            std::thread::sleep(self.half_period);
        }
    }
}

/// Bitbang [`SpiChannelDriver`] on one GPIO chip
pub struct LinuxGpioSpiDriver {
    chip: PathBuf,
    /// Every chip-select line known per bus
    bus_chip_selects: BTreeMap<u8, Vec<u32>>,
    channels: Mutex<BTreeMap<ChannelKey, Arc<Mutex<LinuxGpioSpi>>>>,
}

impl LinuxGpioSpiDriver {
    /// Create a driver for channels on `chip`
    pub fn new(chip: impl Into<PathBuf>) -> Self {
        Self {
            chip: chip.into(),
            bus_chip_selects: BTreeMap::new(),
            channels: Mutex::new(BTreeMap::new()),
        }
    }

    /// Declare the chip-select line of a target on `bus`
    ///
    /// Opening a channel drives every other declared chip-select of its bus
    /// inactive for as long as the channel stays open.
    pub fn with_chip_select(mut self, bus: u8, cs: u32) -> Self {
        let lines = self.bus_chip_selects.entry(bus).or_default();
        if !lines.contains(&cs) {
            lines.push(cs);
        }
        self
    }

    /// Chip-selects on `bus` other than `active`
    fn idle_chip_selects(&self, bus: u8, active: u32) -> Vec<u32> {
        self.bus_chip_selects
            .get(&bus)
            .map(|lines| lines.iter().copied().filter(|&cs| cs != active).collect())
            .unwrap_or_default()
    }

    fn channels(&self) -> MutexGuard<'_, BTreeMap<ChannelKey, Arc<Mutex<LinuxGpioSpi>>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn channel(&self, key: ChannelKey) -> Result<Arc<Mutex<LinuxGpioSpi>>> {
        self.channels()
            .get(&key)
            .cloned()
            .ok_or(LinuxGpioError::NotOpen(key))
    }
}

impl SpiChannelDriver for LinuxGpioSpiDriver {
    fn name(&self) -> &'static str {
        "linux_gpio"
    }

    fn open(&self, params: &ChannelParams) -> std::result::Result<(), DriverError> {
        let key = params.key;
        let pins = params.pins.ok_or(LinuxGpioError::MissingPins(key))?;

        let mut channels = self.channels();
        if channels.contains_key(&key) {
            return Err(LinuxGpioError::AlreadyOpen(key).into());
        }
        let idle_cs = self.idle_chip_selects(key.bus, pins.cs);
        let spi = LinuxGpioSpi::open(&self.chip, pins, &idle_cs, params.clock_hz, params.mode)?;
        channels.insert(key, Arc::new(Mutex::new(spi)));
        Ok(())
    }

    fn transfer(&self, key: ChannelKey, data: &[u8]) -> std::result::Result<usize, DriverError> {
        // The map lock is released before clocking so close() never waits
        // on a chunk; a closed channel's lines are freed once the chunk ends.
        let channel = self.channel(key)?;
        let mut spi = channel.lock().unwrap_or_else(|e| e.into_inner());
        Ok(spi.write(data)?)
    }

    fn close(&self, key: ChannelKey) -> std::result::Result<(), DriverError> {
        if self.channels().remove(&key).is_some() {
            log::debug!("linux_gpio: released {}", key);
        }
        Ok(())
    }

    fn is_open(&self, key: ChannelKey) -> bool {
        self.channels().contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pins: Option<SpiPins>) -> ChannelParams {
        ChannelParams {
            key: ChannelKey::new(0, 1),
            pins,
            clock_hz: 100_000,
            mode: SpiMode::MODE_3,
        }
    }

    #[test]
    fn test_open_requires_pins() {
        let driver = LinuxGpioSpiDriver::new("/dev/gpiochip-does-not-exist");
        let err = driver.open(&params(None)).unwrap_err();
        assert!(err.to_string().contains("spi0.cs1"));
        assert!(!driver.is_open(ChannelKey::new(0, 1)));
    }

    #[test]
    fn test_open_on_missing_chip_fails() {
        let driver = LinuxGpioSpiDriver::new("/dev/gpiochip-does-not-exist");
        let pins = SpiPins {
            miso: 9,
            mosi: 10,
            sclk: 11,
            cs: 8,
        };
        assert!(driver.open(&params(Some(pins))).is_err());
        assert!(!driver.is_open(ChannelKey::new(0, 1)));
    }

    #[test]
    fn test_sibling_chip_selects_held_idle() {
        let driver = LinuxGpioSpiDriver::new("/dev/gpiochip0")
            .with_chip_select(0, 8)
            .with_chip_select(0, 7)
            .with_chip_select(0, 8)
            .with_chip_select(1, 18)
            .with_chip_select(1, 16);

        assert_eq!(driver.idle_chip_selects(0, 8), vec![7]);
        assert_eq!(driver.idle_chip_selects(0, 7), vec![8]);
        assert_eq!(driver.idle_chip_selects(1, 16), vec![18]);
        assert!(driver.idle_chip_selects(2, 5).is_empty());
    }

    #[test]
    fn test_open_failure_names_idle_lines() {
        let pins = SpiPins {
            miso: 9,
            mosi: 10,
            sclk: 11,
            cs: 8,
        };
        let err = LinuxGpioSpi::open(
            Path::new("/dev/gpiochip-does-not-exist"),
            pins,
            &[7],
            100_000,
            SpiMode::MODE_3,
        )
        .err()
        .unwrap();
        match err {
            LinuxGpioError::LineRequestFailed { offsets, .. } => {
                assert_eq!(offsets, vec![8, 11, 10, 9, 7]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unopened_channel() {
        let driver = LinuxGpioSpiDriver::new("/dev/gpiochip0");
        let key = ChannelKey::new(1, 0);
        assert!(driver.transfer(key, &[0x00]).is_err());
        assert!(driver.close(key).is_ok());
        assert!(driver.close(key).is_ok());
    }
}
