//! spiboot - GPIO/SPI boot loader for DSPs and FPGAs
//!
//! Boots ADSP-21489 DSPs (bitbanged SPI slave boot) and Spartan-6 FPGAs
//! (slave serial over spidev) from a Raspberry Pi class host.
//!
//! # Architecture
//!
//! The boot engine lives in `spiboot-core` and only sees two capabilities,
//! a GPIO port and an SPI channel driver. This binary picks a backend that
//! provides them (`linux` or `dummy`), loads the configuration layout that
//! matches the subcommand and reports per-target results.

mod backends;
mod cli;
mod commands;

use std::time::Duration;

use clap::Parser;
use cli::{Cli, Commands};
use commands::BootOptions;
use spiboot_core::target::ChannelKey;
use spiboot_core::{BootError, ConfigError};
use thiserror::Error;

/// Fatal errors of a CLI run
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Boot(#[from] BootError),

    #[error("unknown backend `{name}` (available: {available})")]
    UnknownBackend { name: String, available: String },

    #[error("{0}")]
    Unsupported(String),

    #[error("more than one program file given for {0}")]
    DuplicateProgram(ChannelKey),

    #[error("could not install the Ctrl-C handler: {0}")]
    Signal(#[from] ctrlc::Error),

    #[error("{failed} of {total} target(s) failed to boot")]
    JobsFailed { failed: usize, total: usize },
}

impl From<ConfigError> for RunError {
    fn from(e: ConfigError) -> Self {
        Self::Boot(e.into())
    }
}

/// Log filter for the requested verbosity
fn log_filter(verbose: u8, debug: bool) -> &'static str {
    match (verbose, debug) {
        (0, false) => "warn",
        (1, false) => "info",
        (0..=2, _) => "debug",
        _ => "trace",
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logger; RUST_LOG still wins when set
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_filter(cli.verbose, cli.debug)),
    )
    .init();

    let opts = BootOptions::new(&cli.backend);

    let result = match &cli.command {
        Commands::Dsp { program, config } => commands::run_dsp(&opts, program, config),
        Commands::Multi {
            programs,
            config,
            grace_ms,
        } => {
            let opts = BootOptions {
                grace: Duration::from_millis(*grace_ms),
                ..opts
            };
            commands::run_multi(&opts, programs, config)
        }
        Commands::Spartan {
            program,
            config,
            speed,
        } => commands::run_spartan(&opts, program, config, *speed),
        Commands::Convert { input, output } => commands::run_convert(input, output.as_deref()),
        Commands::ListBackends => {
            backends::list_backends();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
