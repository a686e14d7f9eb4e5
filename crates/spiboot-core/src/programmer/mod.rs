//! Hardware capability traits and abstractions
//!
//! This module defines the contracts every GPIO/SPI backend must implement
//! to be driven by the boot engine.

pub mod bitbang;
mod traits;

pub use bitbang::BitbangLines;
pub use traits::*;
