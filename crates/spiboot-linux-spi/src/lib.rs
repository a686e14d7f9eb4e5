//! spiboot-linux-spi - Linux spidev support
//!
//! This crate provides hardware SPI channels for spiboot via the
//! `/dev/spidevX.Y` device interface, where X is the bus number and Y is
//! the chip select. It is used to load Spartan-6 bitstreams in slave serial
//! mode, which needs a much faster clock than bitbanging can provide.
//!
//! # Example
//!
//! ```no_run
//! use spiboot_core::programmer::SpiChannelDriver;
//! use spiboot_core::target::{ChannelKey, ChannelParams, SpiMode};
//! use spiboot_linux_spi::LinuxSpiDriver;
//!
//! let spi = LinuxSpiDriver::default();
//! let key = ChannelKey::new(0, 0);
//! spi.open(&ChannelParams {
//!     key,
//!     pins: None,
//!     clock_hz: 8_000_000,
//!     mode: SpiMode::MODE_0,
//! })?;
//! spi.transfer(key, &std::fs::read("top.bit")?)?;
//! spi.close(key)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # System Requirements
//!
//! - Linux kernel with spidev support enabled (`CONFIG_SPI_SPIDEV`)
//! - Read/write access to `/dev/spidevX.Y` device
//! - May require adding user to `spi` group or using udev rules
//!
//! Writes larger than the spidev `bufsiz` module parameter are split into
//! several messages.

pub mod device;
pub mod error;

// Re-exports
pub use device::{device_path, LinuxSpi, LinuxSpiDriver};
pub use error::{LinuxSpiError, Result};
