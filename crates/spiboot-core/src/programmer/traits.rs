//! Hardware capability traits
//!
//! The boot engine depends only on these contracts. Backends (Linux GPIO
//! character device, spidev, the in-memory recorder) implement them in
//! their own crates.
//!
//! Both traits take `&self` and must be `Send + Sync`: one worker per bus
//! calls into the same driver concurrently, and the orchestrator's cleanup
//! path may close a channel while its worker is still running.

use crate::error::DriverError;
use crate::target::{ChannelKey, ChannelParams};

/// Logic level of a GPIO output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Driven low
    Low,
    /// Driven high
    High,
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// Process-wide GPIO access for reset and strap lines
pub trait GpioPort: Send + Sync {
    /// Configure `pin` as an output
    fn set_output(&self, pin: u32) -> Result<(), DriverError>;

    /// Drive `pin` to `level`; the pin must have been configured as output
    fn write(&self, pin: u32, level: Level) -> Result<(), DriverError>;

    /// Release every line this port configured
    fn cleanup(&self) -> Result<(), DriverError>;
}

/// SPI channel capability, addressed by chip-select
///
/// Channels are opened and closed by [`ChannelKey`] rather than through an
/// owned object, because the underlying driver may still hold a channel from
/// an earlier process that exited without closing it.
pub trait SpiChannelDriver: Send + Sync {
    /// Short backend name for log messages
    fn name(&self) -> &'static str;

    /// Open a channel with the given pins, clock and mode
    fn open(&self, params: &ChannelParams) -> Result<(), DriverError>;

    /// Clock `data` out on an open channel, returning the number of bytes sent
    fn transfer(&self, key: ChannelKey, data: &[u8]) -> Result<usize, DriverError>;

    /// Close a channel; closing a channel that is not open is not an error
    fn close(&self, key: ChannelKey) -> Result<(), DriverError>;

    /// Whether the driver currently has `key` open
    ///
    /// Used to detect channels leaked by an earlier ungraceful exit.
    fn is_open(&self, key: ChannelKey) -> bool;
}
