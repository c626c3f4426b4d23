//! Format detection and loader construction.
//!
//! FITS is read natively. The HDF5-IDIA, CASA and MIRIAD adapters wrap
//! native libraries that are external collaborators of the core; their
//! formats are detected here so callers get a precise capability error
//! rather than a parse failure.

use crate::error::{IoError, IoResult};
use crate::fits::FitsLoader;
use crate::traits::FileLoader;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// HDF5 superblock magic.
const HDF5_MAGIC: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];

/// Image formats a path can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// FITS primary HDU.
    Fits,
    /// HDF5 with the IDIA schema.
    Hdf5,
    /// CASA paged image directory.
    Casa,
    /// MIRIAD image directory.
    Miriad,
}

/// Detects the on-disk format of an image path.
pub fn detect_format(path: impl AsRef<Path>) -> IoResult<ImageFormat> {
    let path = path.as_ref();

    if path.is_dir() {
        if path.join("table.dat").is_file() {
            return Ok(ImageFormat::Casa);
        }
        if path.join("header").is_file() && path.join("image").is_file() {
            return Ok(ImageFormat::Miriad);
        }
        return Err(IoError::parse(format!(
            "{}: directory is not a recognized image",
            path.display()
        )));
    }

    let mut file = File::open(path)
        .map_err(|e| IoError::file_access(path.display().to_string(), e.to_string()))?;
    let mut magic = [0u8; 9];
    file.read_exact(&mut magic)
        .map_err(|e| IoError::file_access(path.display().to_string(), e.to_string()))?;

    if magic[..8] == HDF5_MAGIC {
        return Ok(ImageFormat::Hdf5);
    }
    if &magic[..9] == b"SIMPLE  =" {
        return Ok(ImageFormat::Fits);
    }
    Err(IoError::parse(format!(
        "{}: unrecognized image format",
        path.display()
    )))
}

/// Constructs the loader for a path, without opening it.
pub fn open_loader(path: impl AsRef<Path>) -> IoResult<Box<dyn FileLoader>> {
    let path = path.as_ref();
    match detect_format(path)? {
        ImageFormat::Fits => Ok(Box::new(FitsLoader::new(path))),
        ImageFormat::Hdf5 => Err(IoError::not_supported(
            "HDF5 images require the IDIA schema adapter",
        )),
        ImageFormat::Casa => Err(IoError::not_supported(
            "CASA paged images require the table system adapter",
        )),
        ImageFormat::Miriad => Err(IoError::not_supported(
            "MIRIAD images require the native adapter",
        )),
    }
}
