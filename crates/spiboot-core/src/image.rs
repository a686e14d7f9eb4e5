//! Firmware images
//!
//! An image is read fully into memory before any transfer starts, then
//! prepared for the wire exactly once according to the target's bit order.
//! The prepared bytes are immutable and shared cheaply between the job and
//! the worker that streams it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::FileError;
use crate::transform::{self, BitOrder};

/// Extension of loader files as produced by the DSP toolchain (MSB-first)
pub const LOADER_EXTENSION: &str = "ldr";

/// Extension of loader files already converted to LSB-first
pub const CONVERTED_EXTENSION: &str = "dat";

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

/// Immutable, wire-ready firmware image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    bytes: Arc<[u8]>,
    source: Option<PathBuf>,
    order: BitOrder,
}

impl FirmwareImage {
    /// Prepare raw bytes for a target expecting `order`
    pub fn from_bytes(raw: Vec<u8>, order: BitOrder) -> Self {
        Self {
            bytes: transform::prepare(raw, order).into(),
            source: None,
            order,
        }
    }

    /// Read an image file and prepare it for a target expecting `order`
    ///
    /// LSB-first targets refuse `.dat` files: those have been reversed
    /// already and reversing them again would put MSB-first bytes on the
    /// wire.
    pub fn load(path: impl AsRef<Path>, order: BitOrder) -> Result<Self, FileError> {
        let path = path.as_ref();
        if order == BitOrder::LsbFirst && has_extension(path, CONVERTED_EXTENSION) {
            return Err(FileError::AlreadyConverted {
                path: path.to_path_buf(),
            });
        }
        log::debug!("Reading program file: {}", path.display());
        let raw = std::fs::read(path).map_err(|source| FileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Read {} bytes from {}", raw.len(), path.display());

        let mut image = Self::from_bytes(raw, order);
        image.source = Some(path.to_path_buf());
        Ok(image)
    }

    /// Wire-ready bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Image length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// File the image was loaded from, if any
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Bit order the bytes were prepared for
    pub fn bit_order(&self) -> BitOrder {
        self.order
    }

    /// Original file contents (undoes the wire transform)
    pub fn to_raw(&self) -> Vec<u8> {
        transform::prepare(self.bytes.to_vec(), self.order)
    }
}

/// Convert an MSB-first `.ldr` loader file into a bit-reversed `.dat` file
///
/// Returns the output path. When `output` is `None` the `.dat` file is
/// written next to the input.
pub fn convert_loader_file(input: &Path, output: Option<&Path>) -> Result<PathBuf, FileError> {
    if !has_extension(input, LOADER_EXTENSION) {
        return Err(FileError::BadExtension {
            path: input.to_path_buf(),
            expected: LOADER_EXTENSION,
        });
    }

    let image = FirmwareImage::load(input, BitOrder::LsbFirst)?;
    let out = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| input.with_extension(CONVERTED_EXTENSION));

    std::fs::write(&out, image.bytes()).map_err(|source| FileError::Write {
        path: out.clone(),
        source,
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("spiboot-image-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_transform_applied_once() {
        let image = FirmwareImage::from_bytes(vec![0x01, 0x02], BitOrder::LsbFirst);
        assert_eq!(image.bytes(), &[0x80, 0x40]);
        assert_eq!(image.to_raw(), vec![0x01, 0x02]);

        // Cloning shares the prepared bytes and does not transform again
        let copy = image.clone();
        assert_eq!(copy.bytes(), image.bytes());
    }

    #[test]
    fn test_load_missing_file() {
        let err = FirmwareImage::load(temp_path("missing.bin"), BitOrder::MsbFirst).unwrap_err();
        assert!(matches!(err, FileError::Read { .. }));
        assert!(err.to_string().contains("missing.bin"));
    }

    #[test]
    fn test_load_and_convert() {
        let input = temp_path("app.ldr");
        std::fs::write(&input, [0x2D, 0xFF, 0x00]).unwrap();

        let image = FirmwareImage::load(&input, BitOrder::MsbFirst).unwrap();
        assert_eq!(image.bytes(), &[0x2D, 0xFF, 0x00]);
        assert_eq!(image.source(), Some(input.as_path()));

        let out = convert_loader_file(&input, None).unwrap();
        assert_eq!(out, input.with_extension("dat"));
        assert_eq!(std::fs::read(&out).unwrap(), vec![0xB4, 0xFF, 0x00]);

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&out).ok();
    }

    #[test]
    fn test_converted_file_not_reversed_twice() {
        let input = temp_path("twice.ldr");
        std::fs::write(&input, [0x01, 0x2D]).unwrap();
        let dat = convert_loader_file(&input, None).unwrap();

        let err = FirmwareImage::load(&dat, BitOrder::LsbFirst).unwrap_err();
        assert!(matches!(err, FileError::AlreadyConverted { .. }));
        assert!(err.to_string().contains(".ldr"));

        // MSB-first targets take any file as is
        let image = FirmwareImage::load(&dat, BitOrder::MsbFirst).unwrap();
        assert_eq!(image.bytes(), &[0x80, 0xB4]);

        std::fs::remove_file(&input).ok();
        std::fs::remove_file(&dat).ok();
    }

    #[test]
    fn test_convert_rejects_wrong_extension() {
        let err = convert_loader_file(Path::new("firmware.bin"), None).unwrap_err();
        assert!(matches!(err, FileError::BadExtension { .. }));
    }
}
