//! spiboot-linux-gpio - Linux GPIO support for spiboot
//!
//! This crate drives the boot lines of SPI-loaded targets through the Linux
//! character device GPIO interface (gpiocdev):
//!
//! - [`LinuxGpioPort`] implements [`spiboot_core::programmer::GpioPort`] for reset and strap lines.
//! - [`LinuxGpioSpiDriver`] implements [`spiboot_core::programmer::SpiChannelDriver`] as a bitbang SPI
//!   master, one channel per (bus, chip-select).
//!
//! The gpiocdev crate is a pure Rust implementation of the GPIO character
//! device interface, the modern replacement for the deprecated sysfs one.
//!
//! # Example
//!
//! ```no_run
//! use spiboot_core::programmer::{GpioPort, Level, SpiChannelDriver};
//! use spiboot_core::target::{ChannelKey, ChannelParams, SpiMode, SpiPins};
//! use spiboot_linux_gpio::{LinuxGpioPort, LinuxGpioSpiDriver};
//!
//! let gpio = LinuxGpioPort::new("/dev/gpiochip0");
//! gpio.set_output(17)?;
//! gpio.write(17, Level::Low)?;
//! gpio.write(17, Level::High)?;
//!
//! // A second target on bus 0 uses GPIO7 as chip-select
//! let spi = LinuxGpioSpiDriver::new("/dev/gpiochip0")
//!     .with_chip_select(0, 8)
//!     .with_chip_select(0, 7);
//! let key = ChannelKey::new(0, 0);
//! spi.open(&ChannelParams {
//!     key,
//!     pins: Some(SpiPins { miso: 9, mosi: 10, sclk: 11, cs: 8 }),
//!     clock_hz: 500_000,
//!     mode: SpiMode::MODE_3,
//! })?;
//! spi.transfer(key, &[0x01, 0x02, 0x03])?;
//! spi.close(key)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # GPIO Pin Wiring (ADSP-21489 SPI slave boot)
//!
//! | DSP Pin    | GPIO Function  | Description |
//! |------------|----------------|-------------|
//! | SPIDS#     | CS (output)    | Chip select, one per DSP on a shared bus |
//! | SPICLK     | SCK (output)   | Serial clock |
//! | MOSI       | MOSI (output)  | Boot data |
//! | MISO       | MISO (input)   | Unused during boot |
//! | RESET#     | reset (output) | May be shared by several DSPs |
//!
//! # System Requirements
//!
//! - Linux kernel 4.8+ with GPIO character device support (kernel 5.5+ for v2 API)
//! - Access to `/dev/gpiochipN` devices (may require root or udev rules)

pub mod device;
pub mod error;
pub mod port;

// Re-exports
pub use device::{LinuxGpioSpi, LinuxGpioSpiDriver};
pub use error::{LinuxGpioError, Result};
pub use port::LinuxGpioPort;
