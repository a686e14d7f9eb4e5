//! Device configuration
//!
//! Configuration files are JSON. Each loader uses its own layout, selected
//! by the caller rather than guessed from the file contents:
//!
//! - [`ConfigLayout::SingleDsp`]: one ADSP-21489 behind a bit-banged channel
//!   and its own reset line.
//! - [`ConfigLayout::MultiDsp`]: up to [`MAX_TARGETS`] ADSP-21489s spread
//!   over bit-banged buses, optionally sharing one reset line (`dsp_reset`).
//! - [`ConfigLayout::Spartan`]: one Spartan-6 on a hardware spidev channel.
//!
//! Loading is all-or-nothing and never touches hardware. Every error names
//! the offending key by its dotted path (e.g. `spi.0.cs.1`).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;

use crate::error::ConfigError;
use crate::target::{ChannelKey, SpiMode, SpiPins, TargetConfig, TargetFamily, SETTLE_FLOOR};

/// GPIO character device used when the configuration does not name one
pub const DEFAULT_GPIOCHIP: &str = "/dev/gpiochip0";

/// Maximum number of targets a multi-DSP configuration may describe
pub const MAX_TARGETS: usize = 3;

/// Maximum number of SPI buses a multi-DSP configuration may describe
pub const MAX_BUSES: usize = 2;

/// Chunk size for the FPGA loader when `spi.buffer_size` is absent
pub const DEFAULT_SPIDEV_BUFFER: usize = 4096;

/// Configuration file layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayout {
    /// Single DSP: `spi` + `pin_mapping`
    SingleDsp,
    /// Several DSPs: `spi.<bus>` blocks with `cs` maps and optional `dsp_reset`
    MultiDsp,
    /// Spartan-6 FPGA on spidev: `spi.{bus, device}` + strap pins
    Spartan,
}

/// Validated configuration for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Layout the file was read as
    pub layout: ConfigLayout,
    /// GPIO character device holding every configured line
    pub gpiochip: PathBuf,
    /// Targets in (bus, chip-select) order
    pub targets: Vec<TargetConfig>,
}

impl DeviceConfig {
    /// Read and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>, layout: ConfigLayout) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text, layout)?;
        log::debug!(
            "config: {} target(s) loaded from {}",
            config.targets.len(),
            path.display()
        );
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn parse(text: &str, layout: ConfigLayout) -> Result<Self, ConfigError> {
        let raw: Value = serde_json::from_str(text)?;
        Self::load(&raw, layout)
    }

    /// Validate an already-parsed JSON document
    pub fn load(raw: &Value, layout: ConfigLayout) -> Result<Self, ConfigError> {
        let root = Field::root(raw);
        root.object()?;

        let gpiochip = match root.get("gpiochip")? {
            Some(f) => PathBuf::from(f.str()?),
            None => PathBuf::from(DEFAULT_GPIOCHIP),
        };
        let settle = settle_time(&root)?;

        let mut targets = match layout {
            ConfigLayout::SingleDsp => vec![load_single_dsp(&root, settle)?],
            ConfigLayout::MultiDsp => load_multi_dsp(&root, settle)?,
            ConfigLayout::Spartan => vec![load_spartan(&root, settle)?],
        };
        targets.sort_by_key(|t| t.key);

        Ok(Self {
            layout,
            gpiochip,
            targets,
        })
    }

    /// Target configured on `key`
    pub fn target(&self, key: ChannelKey) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.key == key)
    }

    /// Physical buses in use
    pub fn buses(&self) -> BTreeSet<u8> {
        self.targets.iter().map(|t| t.key.bus).collect()
    }

    /// Override the SPI clock of every target
    pub fn with_clock_hz(mut self, clock_hz: u32) -> Result<Self, ConfigError> {
        if clock_hz == 0 {
            return Err(ConfigError::invalid("clock_speed", "must be greater than 0"));
        }
        for target in &mut self.targets {
            target.clock_hz = clock_hz;
        }
        Ok(self)
    }
}

fn load_single_dsp(root: &Field<'_>, settle: Duration) -> Result<TargetConfig, ConfigError> {
    let family = TargetFamily::Adsp21489;
    let spi = root.require("spi")?;
    let map = root.require("pin_mapping")?;

    let cs = map.require("cs")?;
    let reset = map.require("reset")?;
    let (miso, mosi, sclk) = (map.require("miso")?, map.require("mosi")?, map.require("sclk")?);
    check_distinct(&[&miso, &mosi, &sclk, &cs, &reset])?;

    Ok(TargetConfig {
        name: "dsp".to_string(),
        family,
        key: ChannelKey::new(0, 0),
        pins: Some(SpiPins {
            miso: miso.pin()?,
            mosi: mosi.pin()?,
            sclk: sclk.pin()?,
            cs: cs.pin()?,
        }),
        reset_pin: Some(reset.pin()?),
        strap_pins: Default::default(),
        clock_hz: clock_hz(&spi)?,
        buffer_size: buffer_size(&spi)?,
        mode: spi_mode(&spi, family)?,
        settle,
    })
}

fn load_multi_dsp(root: &Field<'_>, settle: Duration) -> Result<Vec<TargetConfig>, ConfigError> {
    let family = TargetFamily::Adsp21489;
    let reset = root.get("dsp_reset")?;
    let reset_pin = reset.as_ref().map(Field::pin).transpose()?;
    if reset_pin.is_none() {
        log::warn!("config: no dsp_reset configured, targets will not be reset");
    }

    let spi = root.require("spi")?;
    let buses = spi.entries()?;
    if buses.is_empty() {
        return Err(ConfigError::invalid(spi.path, "no SPI bus configured"));
    }
    if buses.len() > MAX_BUSES {
        return Err(ConfigError::invalid(
            spi.path,
            format!(
                "at most {} SPI buses are supported, found {}",
                MAX_BUSES,
                buses.len()
            ),
        ));
    }

    // Every line of every bit-banged bus must be distinct
    let mut lines: Vec<Field<'_>> = reset.into_iter().collect();
    let mut targets = Vec::new();

    for (name, block) in &buses {
        let bus: u8 = name
            .parse()
            .map_err(|_| ConfigError::invalid(&block.path, "bus id must be an integer 0-255"))?;

        let clock_hz = clock_hz(block)?;
        let buffer_size = buffer_size(block)?;
        let mode = spi_mode(block, family)?;
        let (miso, mosi, sclk) = (
            block.require("miso")?,
            block.require("mosi")?,
            block.require("sclk")?,
        );
        let data = (miso.pin()?, mosi.pin()?, sclk.pin()?);

        let cs_map = block.require("cs")?;
        let chip_selects = cs_map.entries()?;
        if chip_selects.is_empty() {
            return Err(ConfigError::invalid(cs_map.path, "no chip-select configured"));
        }

        lines.extend([miso, mosi, sclk]);
        for (index, cs) in chip_selects {
            let chip_select: u8 = index.parse().map_err(|_| {
                ConfigError::invalid(&cs.path, "chip-select index must be an integer 0-255")
            })?;
            let key = ChannelKey::new(bus, chip_select);
            targets.push(TargetConfig {
                name: key.to_string(),
                family,
                key,
                pins: Some(SpiPins {
                    miso: data.0,
                    mosi: data.1,
                    sclk: data.2,
                    cs: cs.pin()?,
                }),
                reset_pin,
                strap_pins: Default::default(),
                clock_hz,
                buffer_size,
                mode,
                settle,
            });
            lines.push(cs);
        }
    }

    if targets.len() > MAX_TARGETS {
        return Err(ConfigError::invalid(
            spi.path,
            format!(
                "at most {} targets are supported, found {}",
                MAX_TARGETS,
                targets.len()
            ),
        ));
    }
    check_distinct(&lines.iter().collect::<Vec<_>>())?;
    Ok(targets)
}

fn load_spartan(root: &Field<'_>, settle: Duration) -> Result<TargetConfig, ConfigError> {
    let family = TargetFamily::Spartan6;
    let spi = root.require("spi")?;
    let map = root.require("pin_mapping")?;

    let program_b = map.require("program_b")?;
    let init_b = map.require("init_b")?;
    check_distinct(&[&program_b, &init_b])?;

    let buffer_size = match spi.get("buffer_size")? {
        Some(_) => buffer_size(&spi)?,
        None => DEFAULT_SPIDEV_BUFFER,
    };

    let strap_pins = [
        ("program_b".to_string(), program_b.pin()?),
        ("init_b".to_string(), init_b.pin()?),
    ]
    .into_iter()
    .collect();

    Ok(TargetConfig {
        name: "fpga".to_string(),
        family,
        key: ChannelKey::new(spi.require("bus")?.u8()?, spi.require("device")?.u8()?),
        pins: None,
        reset_pin: None,
        strap_pins,
        clock_hz: clock_hz(&spi)?,
        buffer_size,
        mode: spi_mode(&spi, family)?,
        settle,
    })
}

fn settle_time(root: &Field<'_>) -> Result<Duration, ConfigError> {
    let Some(field) = root.get("settle_ms")? else {
        return Ok(SETTLE_FLOOR);
    };
    let settle = Duration::from_millis(field.u64()?);
    if settle < SETTLE_FLOOR {
        log::warn!(
            "config: settle_ms {} is below the {} ms floor, using the floor",
            settle.as_millis(),
            SETTLE_FLOOR.as_millis()
        );
        return Ok(SETTLE_FLOOR);
    }
    Ok(settle)
}

fn clock_hz(spi: &Field<'_>) -> Result<u32, ConfigError> {
    let field = spi.require_any(&["baudrate", "clock_speed"])?;
    match field.u32()? {
        0 => Err(ConfigError::invalid(field.path, "must be greater than 0")),
        hz => Ok(hz),
    }
}

fn buffer_size(spi: &Field<'_>) -> Result<usize, ConfigError> {
    let field = spi.require("buffer_size")?;
    match field.u64()? {
        0 => Err(ConfigError::invalid(field.path, "must be greater than 0")),
        n => usize::try_from(n).map_err(|_| ConfigError::invalid(field.path, "value out of range")),
    }
}

fn spi_mode(spi: &Field<'_>, family: TargetFamily) -> Result<SpiMode, ConfigError> {
    let Some(field) = spi.get("mode")? else {
        return Ok(family.default_mode());
    };
    SpiMode::from_number(field.u8()?)
        .ok_or_else(|| ConfigError::invalid(field.path, "SPI mode must be 0, 1, 2 or 3"))
}

/// Reject a GPIO line configured under two names
fn check_distinct(lines: &[&Field<'_>]) -> Result<(), ConfigError> {
    for (i, line) in lines.iter().enumerate() {
        let pin = line.pin()?;
        for earlier in &lines[..i] {
            if earlier.pin()? == pin {
                return Err(ConfigError::invalid(
                    &line.path,
                    format!("GPIO{} is already used by `{}`", pin, earlier.path),
                ));
            }
        }
    }
    Ok(())
}

/// A JSON value together with its dotted path
struct Field<'a> {
    path: String,
    value: &'a Value,
}

impl<'a> Field<'a> {
    fn root(value: &'a Value) -> Self {
        Self {
            path: String::new(),
            value,
        }
    }

    fn join(&self, key: &str) -> String {
        if self.path.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.path, key)
        }
    }

    fn wrong_type(&self, expected: &'static str) -> ConfigError {
        ConfigError::WrongType {
            field: if self.path.is_empty() {
                "<root>".to_string()
            } else {
                self.path.clone()
            },
            expected,
        }
    }

    fn object(&self) -> Result<&'a serde_json::Map<String, Value>, ConfigError> {
        self.value.as_object().ok_or_else(|| self.wrong_type("an object"))
    }

    fn get(&self, key: &str) -> Result<Option<Field<'a>>, ConfigError> {
        Ok(self.object()?.get(key).map(|value| Field {
            path: self.join(key),
            value,
        }))
    }

    fn require(&self, key: &str) -> Result<Field<'a>, ConfigError> {
        self.get(key)?
            .ok_or_else(|| ConfigError::Missing { field: self.join(key) })
    }

    /// First present key among aliases
    fn require_any(&self, keys: &[&str]) -> Result<Field<'a>, ConfigError> {
        for key in keys {
            if let Some(field) = self.get(key)? {
                return Ok(field);
            }
        }
        Err(ConfigError::Missing {
            field: self.join(&keys.join("|")),
        })
    }

    fn entries(&self) -> Result<Vec<(&'a str, Field<'a>)>, ConfigError> {
        Ok(self
            .object()?
            .iter()
            .map(|(key, value)| {
                (
                    key.as_str(),
                    Field {
                        path: self.join(key),
                        value,
                    },
                )
            })
            .collect())
    }

    fn str(&self) -> Result<&'a str, ConfigError> {
        self.value.as_str().ok_or_else(|| self.wrong_type("a string"))
    }

    fn u64(&self) -> Result<u64, ConfigError> {
        self.value
            .as_u64()
            .ok_or_else(|| self.wrong_type("a non-negative integer"))
    }

    fn u32(&self) -> Result<u32, ConfigError> {
        u32::try_from(self.u64()?).map_err(|_| ConfigError::invalid(&self.path, "value out of range"))
    }

    fn u8(&self) -> Result<u8, ConfigError> {
        u8::try_from(self.u64()?).map_err(|_| ConfigError::invalid(&self.path, "value out of range"))
    }

    fn pin(&self) -> Result<u32, ConfigError> {
        self.u32()
    }
}
