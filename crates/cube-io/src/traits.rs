//! The loader capability trait.
//!
//! [`FileLoader`] is the narrow seam between the compute core and on-disk
//! image formats. A frame owns exactly one loader; every call into it is
//! serialized by the frame's image mutex because the underlying format
//! libraries are not reentrant per file handle.
//!
//! Optional capabilities (precomputed mipmaps, tiled reads, swizzled
//! spectra, per-plane statistics) default to "not supported"; the compute
//! code probes and falls back, never assumes.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! | FileLoader (dyn) |
//! +------------------+
//!         ^
//!         |
//! +-------+--------+
//! | FitsLoader     |  seek-based reads of the primary HDU
//! | MemoryLoader   |  in-memory cubes, generated images, tests
//! +----------------+
//! ```

use crate::error::{IoError, IoResult};
use cube_core::messages::{HistogramData, StatsType};
use cube_core::{CoordinateSystem, ImageBounds, ImageShape, Slicer, StokesSource, StokesType};
use cube_stats::BasicStats;
use std::collections::HashMap;

/// Precomputed per-plane statistics a format may carry.
#[derive(Debug, Clone)]
pub struct LoaderStats {
    /// Basic statistics of the plane.
    pub basic: BasicStats,
    /// Precomputed histogram, when the format stores one.
    pub histogram: Option<HistogramData>,
}

/// Progress callback of the region-spectral fast path; returning `false`
/// cancels the read.
pub type SpectralProgress<'a> = &'a mut dyn FnMut(f64) -> bool;

/// Capability interface over one opened image.
pub trait FileLoader: Send + Sync {
    /// Idempotent open of the given HDU; callable again after
    /// [`close_image_if_updated`](FileLoader::close_image_if_updated).
    fn open_file(&mut self, hdu: &str) -> IoResult<()>;

    /// Display name of the file.
    fn file_name(&self) -> &str;

    /// Shape with axis roles; valid after a successful open.
    fn shape(&self) -> &ImageShape;

    /// Coordinate system for pixel ↔ world conversion. Computed-Stokes
    /// sources share the original system.
    fn coordinate_system(&self, source: &StokesSource) -> CoordinateSystem;

    /// Stokes type labelling of a real Stokes index.
    fn stokes_type_at(&self, index: usize) -> Option<StokesType>;

    /// Restoring-beam area in pixels, when the header carries a beam.
    fn beam_area(&self) -> Option<f64> {
        None
    }

    /// Reads a hyper-rectangle into `buf` (canonical order, x fastest).
    /// `buf.len()` must equal `slicer.length()`.
    fn get_slice(&mut self, buf: &mut [f32], slicer: &Slicer) -> IoResult<()>;

    /// Whether the format stores a decimated copy at this mip.
    fn has_mip(&self, _mip: i32) -> bool {
        false
    }

    /// Reads downsampled raster data from a stored mipmap.
    ///
    /// `bounds` are in full-resolution image pixels; the output grid is
    /// `ceil(bounds.width / mip) × ceil(bounds.height / mip)`.
    fn get_downsampled_raster_data(
        &mut self,
        _buf: &mut Vec<f32>,
        _z: usize,
        _stokes: usize,
        _bounds: &ImageBounds,
        _mip: i32,
    ) -> IoResult<()> {
        Err(IoError::not_supported("downsampled raster data"))
    }

    /// Whether reads should go through the chunked tile cache instead of
    /// whole-plane channel caching.
    fn use_tile_cache(&self) -> bool {
        false
    }

    /// Whether whole-spectrum cursor reads are O(1) (swizzled layout).
    fn has_cursor_spectral_data(&self) -> bool {
        false
    }

    /// Reads the full spectrum under one spatial pixel.
    fn get_cursor_spectral_data(
        &mut self,
        _buf: &mut Vec<f32>,
        _stokes: usize,
        _x: usize,
        _y: usize,
    ) -> IoResult<()> {
        Err(IoError::not_supported("cursor spectral data"))
    }

    /// Whether the region-spectral fast path should be used for a region
    /// of the given bounding-box shape.
    fn use_region_spectral_data(&self, _region_shape: (usize, usize)) -> bool {
        false
    }

    /// Computes per-channel statistics of a masked region directly from
    /// the swizzled layout, reporting progress as it goes.
    #[allow(clippy::too_many_arguments)]
    fn get_region_spectral_data(
        &mut self,
        _mask: &[bool],
        _mask_width: usize,
        _mask_height: usize,
        _origin: (usize, usize),
        _z_range: (usize, usize),
        _stokes: usize,
        _progress: SpectralProgress<'_>,
    ) -> IoResult<HashMap<StatsType, Vec<f64>>> {
        Err(IoError::not_supported("region spectral data"))
    }

    /// Precomputed statistics for one plane, when the format carries them.
    fn get_image_stats(&self, _stokes: usize, _z: usize) -> Option<LoaderStats> {
        None
    }

    /// Advisory: drop and reopen if the file changed on disk. Returns
    /// `true` when a reopen happened (caches must be invalidated).
    fn close_image_if_updated(&mut self) -> IoResult<bool> {
        Ok(false)
    }
}

impl std::fmt::Debug for dyn FileLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLoader")
            .field("file_name", &self.file_name())
            .finish()
    }
}
