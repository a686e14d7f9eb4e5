//! Error types for Linux GPIO operations

use std::path::PathBuf;

use spiboot_core::target::ChannelKey;
use spiboot_core::DriverError;
use thiserror::Error;

/// Linux GPIO specific errors
#[derive(Debug, Error)]
pub enum LinuxGpioError {
    /// Failed to request GPIO lines
    #[error("Failed to request GPIO lines {offsets:?} on '{}': {source}", .chip.display())]
    LineRequestFailed {
        chip: PathBuf,
        offsets: Vec<u32>,
        #[source]
        source: gpiocdev::Error,
    },

    /// Failed to set GPIO line value
    #[error("Failed to set GPIO line value: {0}")]
    SetValueFailed(#[source] gpiocdev::Error),

    /// Line was written before being configured as output
    #[error("GPIO{0} is not configured as output")]
    NotConfigured(u32),

    /// A bitbang channel was opened without pin assignments
    #[error("{0} has no miso/mosi/sclk/cs pins configured")]
    MissingPins(ChannelKey),

    /// Channel is already open
    #[error("{0} is already open")]
    AlreadyOpen(ChannelKey),

    /// Channel is not open
    #[error("{0} is not open")]
    NotOpen(ChannelKey),
}

/// Result type for Linux GPIO operations
pub type Result<T> = std::result::Result<T, LinuxGpioError>;

impl From<LinuxGpioError> for DriverError {
    fn from(e: LinuxGpioError) -> Self {
        DriverError::new(e)
    }
}
