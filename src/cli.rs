//! CLI argument parsing

use clap::{Parser, Subcommand};
use spiboot_core::target::ChannelKey;
use std::path::PathBuf;

/// A program file bound to one chip-select, given as `BUS.CS=PATH`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelImage {
    pub key: ChannelKey,
    pub path: PathBuf,
}

/// Parse `BUS.CS=PATH`, e.g. `0.1=dsp1.ldr`
fn parse_channel_image(s: &str) -> Result<ChannelImage, String> {
    let (channel, path) = s
        .split_once('=')
        .ok_or_else(|| format!("expected BUS.CS=PATH, got `{}`", s))?;
    let (bus, cs) = channel
        .split_once('.')
        .ok_or_else(|| format!("expected BUS.CS before `=`, got `{}`", channel))?;
    let bus = bus
        .trim()
        .parse::<u8>()
        .map_err(|e| format!("Invalid bus number `{}`: {}", bus, e))?;
    let cs = cs
        .trim()
        .parse::<u8>()
        .map_err(|e| format!("Invalid chip-select `{}`: {}", cs, e))?;
    if path.is_empty() {
        return Err("program file path is empty".to_string());
    }
    Ok(ChannelImage {
        key: ChannelKey::new(bus, cs),
        path: PathBuf::from(path),
    })
}

#[derive(Parser)]
#[command(name = "spiboot")]
#[command(author, version, about = "GPIO/SPI boot loader for DSPs and FPGAs", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Debug output (same as -vv)
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Hardware backend: `linux` drives real GPIO/spidev lines, `dummy`
    /// records everything in memory (dry run)
    #[arg(short, long, global = true, default_value = "linux")]
    pub backend: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Boot a single ADSP-21489 over bitbanged SPI
    Dsp {
        /// Loader file (.ldr, MSB-first as produced by the toolchain)
        #[arg(short, long)]
        program: PathBuf,

        /// JSON configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Boot up to three ADSP-21489s sharing one reset line
    Multi {
        /// Program file per chip-select as BUS.CS=PATH (repeatable);
        /// configured targets without one are skipped
        #[arg(short, long = "program", value_parser = parse_channel_image, required = true)]
        programs: Vec<ChannelImage>,

        /// JSON configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Time in-flight transfers get to finish after Ctrl-C
        #[arg(long, default_value_t = 2000)]
        grace_ms: u64,
    },

    /// Load a bitstream into a Spartan-6 in slave serial mode
    Spartan {
        /// Bitstream file (.bit/.bin)
        #[arg(short, long)]
        program: PathBuf,

        /// JSON configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// SPI clock in Hz, overriding the configuration
        #[arg(short, long)]
        speed: Option<u32>,
    },

    /// Convert an MSB-first .ldr loader file to an LSB-first .dat file
    Convert {
        /// Input loader file (must end in .ldr)
        input: PathBuf,

        /// Output file (defaults to the input with a .dat extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List hardware backends compiled into this build
    ListBackends,
}
