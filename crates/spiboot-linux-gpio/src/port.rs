//! Reset and strap lines on a Linux GPIO chip
//!
//! Each line is requested on first use and held until [`GpioPort::cleanup`],
//! so the level a sequence leaves on a line is kept while images stream.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use gpiocdev::line::Value;
use gpiocdev::request::{Config, Request};

use spiboot_core::programmer::{GpioPort, Level};
use spiboot_core::DriverError;

use crate::error::{LinuxGpioError, Result};

/// GPIO port on one `/dev/gpiochipN`
pub struct LinuxGpioPort {
    chip: PathBuf,
    lines: Mutex<BTreeMap<u32, Request>>,
}

impl LinuxGpioPort {
    /// Create a port on `chip`; no line is requested until it is used
    pub fn new(chip: impl Into<PathBuf>) -> Self {
        Self {
            chip: chip.into(),
            lines: Mutex::new(BTreeMap::new()),
        }
    }

    /// GPIO chip device path
    pub fn chip(&self) -> &Path {
        &self.chip
    }

    fn lines(&self) -> MutexGuard<'_, BTreeMap<u32, Request>> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn request_output(&self, pin: u32) -> Result<Request> {
        // Reset and strap lines are active low: start released
        let mut config = Config::default();
        config.with_line(pin).as_output(Value::Active);

        Request::from_config(config)
            .on_chip(&self.chip)
            .with_consumer("spiboot")
            .request()
            .map_err(|source| LinuxGpioError::LineRequestFailed {
                chip: self.chip.clone(),
                offsets: vec![pin],
                source,
            })
    }

    fn set(&self, pin: u32, level: Level) -> Result<()> {
        let lines = self.lines();
        let request = lines.get(&pin).ok_or(LinuxGpioError::NotConfigured(pin))?;
        let value = match level {
            Level::High => Value::Active,
            Level::Low => Value::Inactive,
        };
        request
            .set_value(pin, value)
            .map_err(LinuxGpioError::SetValueFailed)?;
        Ok(())
    }
}

impl GpioPort for LinuxGpioPort {
    fn set_output(&self, pin: u32) -> std::result::Result<(), DriverError> {
        let mut lines = self.lines();
        if lines.contains_key(&pin) {
            return Ok(());
        }
        let request = self.request_output(pin)?;
        log::debug!("linux_gpio: GPIO{} on {} is output", pin, self.chip.display());
        lines.insert(pin, request);
        Ok(())
    }

    fn write(&self, pin: u32, level: Level) -> std::result::Result<(), DriverError> {
        self.set(pin, level)?;
        log::trace!("linux_gpio: GPIO{} = {:?}", pin, level);
        Ok(())
    }

    fn cleanup(&self) -> std::result::Result<(), DriverError> {
        let mut lines = self.lines();
        if !lines.is_empty() {
            log::debug!("linux_gpio: releasing {} line(s)", lines.len());
        }
        // Dropping a request releases its line
        lines.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_requires_output() {
        let port = LinuxGpioPort::new("/dev/gpiochip-does-not-exist");
        let err = port.set(17, Level::Low).unwrap_err();
        assert!(matches!(err, LinuxGpioError::NotConfigured(17)));
        assert!(port.write(17, Level::High).is_err());
    }

    #[test]
    fn test_request_on_missing_chip_fails() {
        let port = LinuxGpioPort::new("/dev/gpiochip-does-not-exist");
        assert!(port.set_output(17).is_err());
        // Cleanup with nothing requested is fine
        assert!(port.cleanup().is_ok());
    }
}
