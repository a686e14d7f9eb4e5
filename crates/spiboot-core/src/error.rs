//! Error types for spiboot-core
//!
//! The taxonomy mirrors how failures propagate:
//!
//! - [`ConfigError`] and [`FileError`] are fatal for the whole run and are
//!   raised before any hardware is touched.
//! - [`ChannelError`] fails the owning job only; sibling jobs on other buses
//!   keep running.
//! - [`SequenceError`] is a GPIO failure during reset/strap sequencing and
//!   aborts the run, since no target behind the line can be booted.
//! - [`BootError::Interrupted`] marks jobs stopped by operator cancellation.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::target::ChannelKey;

/// Failure reported by a hardware capability (GPIO or SPI backend)
///
/// Backends keep their own error types and box them at the trait boundary.
#[derive(Debug)]
pub struct DriverError(Box<dyn std::error::Error + Send + Sync>);

impl DriverError {
    /// Wrap a backend error or message
    pub fn new(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(err.into())
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Malformed or missing configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("could not open/read config file {}: {source}", .path.display())]
    Io {
        /// Path of the configuration file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid JSON
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A required key is absent
    #[error("missing configuration key `{field}`")]
    Missing {
        /// Dotted path of the absent key, e.g. `spi.buffer_size`
        field: String,
    },

    /// A key holds a value of the wrong type
    #[error("configuration key `{field}` must be {expected}")]
    WrongType {
        /// Dotted path of the offending key
        field: String,
        /// Description of the expected type
        expected: &'static str,
    },

    /// A key is present but its value is not acceptable
    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid {
        /// Dotted path of the offending key, e.g. `spi.0.buffer_size`
        field: String,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigError {
    /// Dotted path of the offending key, if the error names one
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Missing { field } | Self::WrongType { field, .. } | Self::Invalid { field, .. } => {
                Some(field)
            }
            Self::Io { .. } | Self::Parse(_) => None,
        }
    }

    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Firmware image (or conversion output) file errors
#[derive(Debug, Error)]
pub enum FileError {
    /// Image could not be read
    #[error("could not open/read program file {}: {source}", .path.display())]
    Read {
        /// Image path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Output could not be written
    #[error("could not write {}: {source}", .path.display())]
    Write {
        /// Output path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Input does not carry the expected extension
    #[error("{}: loader file must have .{expected} extension", .path.display())]
    BadExtension {
        /// Offending path
        path: PathBuf,
        /// Expected extension, without the dot
        expected: &'static str,
    },

    /// Image was already bit-reversed by `convert` and would be reversed again
    #[error(
        "{}: .dat files are already bit-reversed, pass the .ldr loader file instead",
        .path.display()
    )]
    AlreadyConverted {
        /// Offending path
        path: PathBuf,
    },
}

/// Channel lifecycle and transfer failures
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The chip-select is held by a live handle in this process
    #[error("{0} is already open")]
    AlreadyOpen(ChannelKey),

    /// The backend refused to open the channel
    #[error("failed to open {key}: {source}")]
    OpenFailed {
        /// Channel that failed
        key: ChannelKey,
        /// Backend error
        #[source]
        source: DriverError,
    },

    /// A chunk transfer failed
    #[error("transfer on {key} failed at offset {offset}: {source}")]
    TransferFailed {
        /// Channel that failed
        key: ChannelKey,
        /// Image offset of the failing chunk
        offset: usize,
        /// Backend error
        #[source]
        source: DriverError,
    },

    /// The backend acknowledged fewer bytes than were sent
    #[error("short transfer on {key} at offset {offset}: {sent} of {expected} bytes")]
    ShortTransfer {
        /// Channel that failed
        key: ChannelKey,
        /// Image offset of the chunk
        offset: usize,
        /// Bytes acknowledged
        sent: usize,
        /// Bytes in the chunk
        expected: usize,
    },

    /// The channel was closed underneath the handle (forced cleanup)
    #[error("{0} was closed")]
    Closed(ChannelKey),
}

/// GPIO failure while sequencing reset or strap lines
#[derive(Debug, Error)]
#[error("GPIO{pin}: failed to {action}: {source}")]
pub struct SequenceError {
    /// GPIO offset
    pub pin: u32,
    /// What was being attempted
    pub action: &'static str,
    /// Backend error
    #[source]
    pub source: DriverError,
}

/// Umbrella error for a boot run or a single job
#[derive(Debug, Error)]
pub enum BootError {
    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Image file error
    #[error(transparent)]
    File(#[from] FileError),

    /// Channel error
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Reset/strap sequencing error
    #[error(transparent)]
    Sequence(#[from] SequenceError),

    /// Stopped by operator cancellation
    #[error("interrupted")]
    Interrupted,

    /// The worker thread for a bus could not be started
    #[error("could not start worker for SPI bus {bus}: {source}")]
    WorkerSpawn {
        /// Bus the worker would have owned
        bus: u8,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The worker for a bus panicked before reporting
    #[error("worker for SPI bus {bus} panicked")]
    WorkerPanicked {
        /// Bus the worker owned
        bus: u8,
    },
}

impl BootError {
    /// Whether this error is an operator interrupt
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}
