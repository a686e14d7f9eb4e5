//! CLI command implementations
//!
//! The boot commands (`dsp`, `multi`, `spartan`) share one flow in [`boot`];
//! [`convert`] is an offline file transform that never touches hardware.

pub mod boot;
pub mod convert;
mod progress;

pub use boot::{run_dsp, run_multi, run_spartan, BootOptions};
pub use convert::run_convert;
