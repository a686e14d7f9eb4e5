//! Target descriptions
//!
//! A target is one chip that receives a firmware image over one SPI channel.
//! Targets are identified on the wire by their (bus, chip-select) pair.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

use crate::transform::BitOrder;

/// Minimum hold time after any reset or strap level change
pub const SETTLE_FLOOR: Duration = Duration::from_millis(10);

bitflags! {
    /// SPI clock polarity/phase
    ///
    /// The bit values match the Linux spidev mode byte, so a mode can be
    /// handed to `SPI_IOC_WR_MODE` unchanged.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SpiMode: u8 {
        /// Data is sampled on the trailing clock edge
        const CPHA = 0x01;
        /// Clock idles high
        const CPOL = 0x02;

        /// CPOL=0, CPHA=0
        const MODE_0 = 0;
        /// CPOL=0, CPHA=1
        const MODE_1 = Self::CPHA.bits();
        /// CPOL=1, CPHA=0
        const MODE_2 = Self::CPOL.bits();
        /// CPOL=1, CPHA=1
        const MODE_3 = Self::CPOL.bits() | Self::CPHA.bits();
    }
}

impl SpiMode {
    /// Build a mode from its number (0-3)
    pub fn from_number(mode: u8) -> Option<Self> {
        Self::from_bits(mode)
    }

    /// Mode number (0-3)
    pub fn number(self) -> u8 {
        self.bits()
    }

    /// Clock level while idle
    pub fn idle_clock_high(self) -> bool {
        self.contains(Self::CPOL)
    }

    /// Whether data is shifted out on the leading edge and sampled on the trailing one
    pub fn samples_on_trailing_edge(self) -> bool {
        self.contains(Self::CPHA)
    }
}

impl fmt::Display for SpiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mode {}", self.number())
    }
}

/// Identity of one SPI channel: a bus plus a chip-select index on that bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelKey {
    /// Physical bus number
    pub bus: u8,
    /// Chip-select index on the bus
    pub chip_select: u8,
}

impl ChannelKey {
    /// Create a new channel key
    pub const fn new(bus: u8, chip_select: u8) -> Self {
        Self { bus, chip_select }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spi{}.cs{}", self.bus, self.chip_select)
    }
}

/// GPIO offsets of a bit-banged SPI channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpiPins {
    /// Master in, slave out
    pub miso: u32,
    /// Master out, slave in
    pub mosi: u32,
    /// Serial clock
    pub sclk: u32,
    /// Chip select (active low)
    pub cs: u32,
}

/// Supported target families
///
/// The family fixes the wire protocol: transport, bit order and the strap
/// sequence run before transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetFamily {
    /// Analog Devices ADSP-21489 booting from a bit-banged SPI slave port
    Adsp21489,
    /// Xilinx Spartan-6 (XC6SLX25) in slave serial mode over hardware SPI
    Spartan6,
}

impl TargetFamily {
    /// Bit order the receiving hardware expects on the wire
    pub fn bit_order(self) -> BitOrder {
        match self {
            Self::Adsp21489 => BitOrder::LsbFirst,
            Self::Spartan6 => BitOrder::MsbFirst,
        }
    }

    /// SPI mode used when the configuration does not override it
    pub fn default_mode(self) -> SpiMode {
        match self {
            Self::Adsp21489 => SpiMode::MODE_3,
            Self::Spartan6 => SpiMode::MODE_0,
        }
    }

    /// Whether the family is driven over a bit-banged channel
    pub fn is_bitbanged(self) -> bool {
        matches!(self, Self::Adsp21489)
    }

    /// Human-readable part name
    pub fn part_name(self) -> &'static str {
        match self {
            Self::Adsp21489 => "ADSP-21489",
            Self::Spartan6 => "XC6SLX25",
        }
    }
}

impl fmt::Display for TargetFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.part_name())
    }
}

/// One GPIO level change followed by a hold time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpioStep {
    /// Strap name the pin was configured under (e.g. "program_b")
    pub name: String,
    /// GPIO offset
    pub pin: u32,
    /// Level to drive
    pub high: bool,
    /// Hold time after the change
    pub settle: Duration,
}

/// Validated configuration of one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    /// Display name, e.g. "dsp" or "spi0.cs1"
    pub name: String,
    /// Target family
    pub family: TargetFamily,
    /// Bus and chip-select
    pub key: ChannelKey,
    /// Bit-bang pins; `None` for hardware SPI where the kernel owns the pins
    pub pins: Option<SpiPins>,
    /// Reset line (active low), if the target has its own or shares one
    pub reset_pin: Option<u32>,
    /// Strap/program pins by name
    pub strap_pins: BTreeMap<String, u32>,
    /// SPI clock in Hz, always > 0
    pub clock_hz: u32,
    /// Transfer chunk size in bytes, always > 0
    pub buffer_size: usize,
    /// SPI mode
    pub mode: SpiMode,
    /// Hold time after each GPIO change, never below [`SETTLE_FLOOR`]
    pub settle: Duration,
}

impl TargetConfig {
    /// Parameters handed to the channel driver when opening this target
    pub fn channel_params(&self) -> ChannelParams {
        ChannelParams {
            key: self.key,
            pins: self.pins,
            clock_hz: self.clock_hz,
            mode: self.mode,
        }
    }

    /// Ordered strap sequence to run before transfer
    ///
    /// The Spartan-6 is put into configuration mode by pulsing PROGRAM_B
    /// while INIT_B is held low, then releasing INIT_B last. Families with
    /// no strap pins return an empty sequence.
    pub fn strap_sequence(&self) -> Vec<GpioStep> {
        match self.family {
            TargetFamily::Spartan6 => {
                let (Some(&program_b), Some(&init_b)) = (
                    self.strap_pins.get("program_b"),
                    self.strap_pins.get("init_b"),
                ) else {
                    return Vec::new();
                };
                let step = |name: &str, pin: u32, high: bool| GpioStep {
                    name: name.to_string(),
                    pin,
                    high,
                    settle: self.settle,
                };
                vec![
                    step("program_b", program_b, false),
                    step("init_b", init_b, false),
                    step("program_b", program_b, true),
                    step("init_b", init_b, true),
                ]
            }
            TargetFamily::Adsp21489 => Vec::new(),
        }
    }
}

/// Everything a channel driver needs to open a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelParams {
    /// Bus and chip-select
    pub key: ChannelKey,
    /// Bit-bang pins, `None` for hardware SPI
    pub pins: Option<SpiPins>,
    /// SPI clock in Hz
    pub clock_hz: u32,
    /// SPI mode
    pub mode: SpiMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spi_mode_numbers() {
        assert_eq!(SpiMode::from_number(0), Some(SpiMode::MODE_0));
        assert_eq!(SpiMode::from_number(3), Some(SpiMode::MODE_3));
        assert_eq!(SpiMode::from_number(4), None);
        assert!(SpiMode::MODE_2.idle_clock_high());
        assert!(!SpiMode::MODE_2.samples_on_trailing_edge());
        assert!(SpiMode::MODE_1.samples_on_trailing_edge());
        assert_eq!(SpiMode::MODE_3.number(), 3);
    }

    #[test]
    fn test_channel_key_display() {
        assert_eq!(ChannelKey::new(1, 2).to_string(), "spi1.cs2");
    }

    #[test]
    fn test_spartan_strap_sequence() {
        let mut strap_pins = BTreeMap::new();
        strap_pins.insert("program_b".to_string(), 27);
        strap_pins.insert("init_b".to_string(), 22);
        let target = TargetConfig {
            name: "fpga".into(),
            family: TargetFamily::Spartan6,
            key: ChannelKey::new(0, 0),
            pins: None,
            reset_pin: None,
            strap_pins,
            clock_hz: 1_000_000,
            buffer_size: 4096,
            mode: SpiMode::MODE_0,
            settle: SETTLE_FLOOR,
        };

        let seq: Vec<(u32, bool)> = target
            .strap_sequence()
            .iter()
            .map(|s| (s.pin, s.high))
            .collect();
        assert_eq!(seq, vec![(27, false), (22, false), (27, true), (22, true)]);
    }
}
