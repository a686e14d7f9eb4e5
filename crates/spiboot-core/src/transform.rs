//! Bit-order transform for firmware images
//!
//! Loader files are produced MSB-first. Targets whose SPI slave port shifts
//! bits in LSB-first need every byte bit-reversed before it is clocked out
//! by an MSB-first master.

/// Bit order expected by the receiving hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BitOrder {
    /// Bytes go on the wire as stored
    MsbFirst,
    /// Every byte is bit-reversed before transfer
    LsbFirst,
}

/// Reverse the bits of every byte (bit 0 <-> bit 7, bit 1 <-> bit 6, ...)
///
/// The transform is its own inverse.
pub fn reverse_bits(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b.reverse_bits()).collect()
}

/// Reverse the bits of every byte in place
pub fn reverse_bits_in_place(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        *b = b.reverse_bits();
    }
}

/// Prepare raw file bytes for the wire according to `order`
pub fn prepare(mut bytes: Vec<u8>, order: BitOrder) -> Vec<u8> {
    if order == BitOrder::LsbFirst {
        reverse_bits_in_place(&mut bytes);
    }
    bytes
}
