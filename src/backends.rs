//! Backend registration and dispatch
//!
//! A backend supplies both hardware capabilities for a run: the GPIO port
//! for reset/strap lines and the SPI channel driver. Backends are
//! feature-gated, so the registry only lists what this build can open.

use std::sync::Arc;

use spiboot_core::config::DeviceConfig;
use spiboot_core::programmer::{GpioPort, SpiChannelDriver};

use crate::RunError;

/// Information about a backend
pub struct BackendInfo {
    /// Name used with `--backend`
    pub name: &'static str,
    /// Short description
    pub description: &'static str,
}

/// Get information about all available backends (enabled at compile time)
#[allow(unused_mut, clippy::vec_init_then_push)]
pub fn available_backends() -> Vec<BackendInfo> {
    let mut backends = Vec::new();

    #[cfg(feature = "linux-gpio")]
    backends.push(BackendInfo {
        name: "linux",
        description: "GPIO character device (bitbanged DSP channels), spidev for FPGAs",
    });

    #[cfg(feature = "dummy")]
    backends.push(BackendInfo {
        name: "dummy",
        description: "In-memory recorder for dry runs, touches no hardware",
    });

    backends
}

/// Generate a short list of backend names for help and error messages
pub fn backend_names_short() -> String {
    let names: Vec<&str> = available_backends().iter().map(|b| b.name).collect();
    names.join(", ")
}

/// Hardware opened for one run
pub struct Backend {
    pub gpio: Arc<dyn GpioPort>,
    pub driver: Arc<dyn SpiChannelDriver>,
    #[cfg(feature = "dummy")]
    dummy: Option<Arc<spiboot_dummy::DummyHardware>>,
}

impl Backend {
    /// Log what the backend did, for backends that record
    pub fn log_summary(&self) {
        #[cfg(feature = "dummy")]
        if let Some(dummy) = &self.dummy {
            dummy.log_summary();
        }
    }
}

/// Open the backend named `name` for the targets in `config`
///
/// Nothing is touched yet: lines and channels are requested lazily by the
/// boot sequence and the workers.
pub fn open_backend(name: &str, config: &DeviceConfig) -> Result<Backend, RunError> {
    match name {
        #[cfg(feature = "linux-gpio")]
        "linux" => open_linux(config),

        #[cfg(feature = "dummy")]
        "dummy" => {
            log::info!(
                "Dry run: {} target(s) on the dummy backend",
                config.targets.len()
            );
            let hw = Arc::new(spiboot_dummy::DummyHardware::default());
            Ok(Backend {
                gpio: hw.clone(),
                driver: hw.clone(),
                dummy: Some(hw),
            })
        }

        _ => Err(RunError::UnknownBackend {
            name: name.to_string(),
            available: backend_names_short(),
        }),
    }
}

#[cfg(feature = "linux-gpio")]
fn open_linux(config: &DeviceConfig) -> Result<Backend, RunError> {
    use spiboot_linux_gpio::{LinuxGpioPort, LinuxGpioSpiDriver};

    let gpio = Arc::new(LinuxGpioPort::new(config.gpiochip.clone()));
    let bitbanged = config.targets.iter().all(|t| t.family.is_bitbanged());

    let driver: Arc<dyn SpiChannelDriver> = if bitbanged {
        log::debug!("Using bitbanged SPI on {}", config.gpiochip.display());
        // Targets on a bus share SCK/MOSI/MISO; every chip-select is declared
        // so the ones not being booted stay deasserted.
        let driver = config
            .targets
            .iter()
            .filter_map(|t| t.pins.map(|pins| (t.key.bus, pins.cs)))
            .fold(
                LinuxGpioSpiDriver::new(config.gpiochip.clone()),
                |driver, (bus, cs)| driver.with_chip_select(bus, cs),
            );
        Arc::new(driver)
    } else {
        open_spidev()?
    };

    Ok(Backend {
        gpio,
        driver,
        #[cfg(feature = "dummy")]
        dummy: None,
    })
}

#[cfg(all(feature = "linux-gpio", feature = "linux-spi"))]
fn open_spidev() -> Result<Arc<dyn SpiChannelDriver>, RunError> {
    log::debug!("Using hardware SPI via spidev");
    Ok(Arc::new(spiboot_linux_spi::LinuxSpiDriver::default()))
}

#[cfg(all(feature = "linux-gpio", not(feature = "linux-spi")))]
fn open_spidev() -> Result<Arc<dyn SpiChannelDriver>, RunError> {
    Err(RunError::Unsupported(
        "hardware SPI targets need the linux-spi feature".to_string(),
    ))
}

/// Print the backend list
pub fn list_backends() {
    let backends = available_backends();
    if backends.is_empty() {
        println!("No backends available (recompile with backend features enabled)");
        return;
    }

    println!("Available backends:");
    println!();
    for b in &backends {
        println!("  {:8} - {}", b.name, b.description);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spiboot_core::config::ConfigLayout;

    const SINGLE: &str = r#"{
        "spi": { "baudrate": 500000, "buffer_size": 4096 },
        "pin_mapping": { "cs": 8, "reset": 17, "miso": 9, "mosi": 10, "sclk": 11 }
    }"#;

    #[test]
    fn test_unknown_backend() {
        let config = DeviceConfig::parse(SINGLE, ConfigLayout::SingleDsp).unwrap();
        let err = open_backend("ch341a", &config).err().unwrap();
        assert!(matches!(err, RunError::UnknownBackend { .. }));
    }

    #[cfg(feature = "dummy")]
    #[test]
    fn test_dummy_backend_listed() {
        assert!(backend_names_short().contains("dummy"));
        let config = DeviceConfig::parse(SINGLE, ConfigLayout::SingleDsp).unwrap();
        let backend = open_backend("dummy", &config).unwrap();
        assert_eq!(backend.driver.name(), "dummy");
    }
}
