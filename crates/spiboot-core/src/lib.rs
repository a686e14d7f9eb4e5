//! spiboot-core - Boot-transfer engine for SPI-loaded targets
//!
//! This crate drives the boot of external chips (an ADSP-21489 class DSP and
//! a Spartan-6 class FPGA) that receive their firmware over SPI after a GPIO
//! reset/strap sequence.
//!
//! The crate never talks to hardware directly. Everything goes through two
//! capability traits in [`programmer`]:
//!
//! - [`programmer::GpioPort`] for reset and strap lines
//! - [`programmer::SpiChannelDriver`] for the SPI channel (bit-banged or
//!   a hardware spidev bus)
//!
//! # Data flow
//!
//! ```text
//! JSON config -> DeviceConfig -> BootSequencer (reset/straps)
//!             -> Orchestrator spawns one worker per bus
//!                -> ChannelManager::open -> TransferEngine::stream -> close
//!             -> global cleanup -> BootSummary
//! ```
//!
//! # Example
//!
//! ```ignore
//! use spiboot_core::config::{ConfigLayout, DeviceConfig};
//! use spiboot_core::orchestrator::{Orchestrator, TransferJob};
//!
//! let config = DeviceConfig::from_file("dsp.json", ConfigLayout::MultiDsp)?;
//! let jobs = TransferJob::for_config(&config, &paths)?;
//! let orchestrator = Orchestrator::new(gpio, driver, cancel);
//! let summary = orchestrator.run(jobs)?;
//! summary.log_report();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cancel;
pub mod channel;
pub mod config;
pub mod error;
pub mod image;
pub mod orchestrator;
pub mod programmer;
pub mod sequence;
pub mod target;
pub mod transfer;
pub mod transform;

#[cfg(test)]
pub(crate) mod testutil;

pub use cancel::CancelToken;
pub use error::{BootError, ChannelError, ConfigError, DriverError, FileError, SequenceError};
