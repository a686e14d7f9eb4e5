//! Convert command implementation

use std::path::Path;

use spiboot_core::image::convert_loader_file;

use crate::RunError;

/// Bit-reverse an `.ldr` loader file into a `.dat` file
pub fn run_convert(input: &Path, output: Option<&Path>) -> Result<(), RunError> {
    let out = convert_loader_file(input, output).map_err(spiboot_core::BootError::from)?;
    println!("Converted {} -> {}", input.display(), out.display());
    Ok(())
}
