//! Bitbang SPI helpers
//!
//! This module provides the line-level primitives for clocking bytes out of
//! software-controlled GPIO pins. A backend implements [`BitbangLines`] on
//! top of whatever GPIO API it uses and then calls the functions in
//! [`single`] to move data.
//!
//! All four SPI modes are supported. Bytes are always shifted MSB first;
//! targets that expect LSB first get their image bit-reversed up front
//! (see [`crate::transform`]).

use crate::target::SpiMode;

/// Trait for low-level bitbang SPI operations
pub trait BitbangLines {
    /// Set chip select (CS is active low, so `active=true` means CS=0)
    fn set_cs(&mut self, active: bool);

    /// Set clock line value
    fn set_sck(&mut self, high: bool);

    /// Set MOSI line value
    fn set_mosi(&mut self, high: bool);

    /// Get MISO line value
    fn get_miso(&self) -> bool;

    /// Delay for half a clock period
    fn half_period_delay(&self);

    /// Optional: Set SCK and MOSI atomically (optimization)
    ///
    /// Default implementation calls `set_sck` then `set_mosi`.
    fn set_sck_set_mosi(&mut self, sck: bool, mosi: bool) {
        self.set_sck(sck);
        self.set_mosi(mosi);
    }

    /// Optional: Set SCK and get MISO atomically (optimization)
    ///
    /// Default implementation calls `set_sck` then `get_miso`.
    fn set_sck_get_miso(&mut self, sck: bool) -> bool {
        self.set_sck(sck);
        self.get_miso()
    }
}

/// Half-period delay in nanoseconds for a given SPI clock
pub fn half_period_ns(clock_hz: u32) -> u64 {
    if clock_hz == 0 {
        return 0;
    }
    500_000_000 / clock_hz as u64
}

/// Bitbang helper functions for single-wire I/O
pub mod single {
    use super::BitbangLines;
    use crate::target::SpiMode;

    /// Exchange one byte (MSB first) in the given mode
    ///
    /// The clock must be at its idle level on entry and is left there.
    pub fn transfer_byte<M: BitbangLines + ?Sized>(master: &mut M, mode: SpiMode, byte: u8) -> u8 {
        let idle = mode.idle_clock_high();
        let mut rx = 0u8;

        for i in (0..8).rev() {
            let bit = (byte >> i) & 1 != 0;
            rx <<= 1;
            if mode.samples_on_trailing_edge() {
                // CPHA=1: shift out on the leading edge, sample on the trailing edge
                master.set_sck_set_mosi(!idle, bit);
                master.half_period_delay();
                if master.set_sck_get_miso(idle) {
                    rx |= 1;
                }
                master.half_period_delay();
            } else {
                // CPHA=0: data valid before the leading edge, sampled on it
                master.set_mosi(bit);
                master.half_period_delay();
                if master.set_sck_get_miso(!idle) {
                    rx |= 1;
                }
                master.half_period_delay();
                master.set_sck(idle);
            }
        }
        rx
    }

    /// Exchange a buffer, returning the bytes read back on MISO
    pub fn transfer_bytes<M: BitbangLines + ?Sized>(
        master: &mut M,
        mode: SpiMode,
        bytes: &[u8],
    ) -> Vec<u8> {
        bytes
            .iter()
            .map(|&b| transfer_byte(master, mode, b))
            .collect()
    }

    /// Clock one byte out (MSB first) without sampling MISO
    ///
    /// Same edges as [`transfer_byte`]; the clock must be idle on entry.
    pub fn write_byte<M: BitbangLines + ?Sized>(master: &mut M, mode: SpiMode, byte: u8) {
        let idle = mode.idle_clock_high();

        for i in (0..8).rev() {
            let bit = (byte >> i) & 1 != 0;
            if mode.samples_on_trailing_edge() {
                master.set_sck_set_mosi(!idle, bit);
                master.half_period_delay();
                master.set_sck(idle);
                master.half_period_delay();
            } else {
                master.set_mosi(bit);
                master.half_period_delay();
                master.set_sck(!idle);
                master.half_period_delay();
                master.set_sck(idle);
            }
        }
    }

    /// Write a buffer, never reading MISO
    pub fn write_bytes<M: BitbangLines + ?Sized>(master: &mut M, mode: SpiMode, bytes: &[u8]) {
        for &byte in bytes {
            write_byte(master, mode, byte);
        }
    }
}

/// Run one chip-select framed transaction
///
/// Asserts CS, writes `data` and deasserts CS with the clock back at idle.
pub fn transaction<M: BitbangLines + ?Sized>(master: &mut M, mode: SpiMode, data: &[u8]) {
    master.set_sck(mode.idle_clock_high());
    master.set_cs(true);
    master.half_period_delay();

    single::write_bytes(master, mode, data);

    master.set_sck(mode.idle_clock_high());
    master.half_period_delay();
    master.set_cs(false);
    master.half_period_delay();
}
