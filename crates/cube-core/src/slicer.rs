//! Hyper-rectangle slicers over the canonical (x, y, z, stokes) space.
//!
//! Compute code addresses pixels in a canonical axis order regardless of the
//! file's on-disk layout; loaders translate through [`crate::ImageShape`].
//! A [`Slicer`] names a dense hyper-rectangle; the buffer it fills is
//! row-major with x fastest, then y, then z, then stokes.

use crate::error::{Error, Result};
use crate::shape::ImageShape;
use crate::stokes::StokesSource;

/// Dense hyper-rectangle in canonical (x, y, z, stokes) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slicer {
    /// Inclusive start per canonical axis.
    pub start: [usize; 4],
    /// Extent per canonical axis; every component ≥ 1.
    pub count: [usize; 4],
}

impl Slicer {
    /// Creates a slicer from explicit start and count.
    pub fn new(start: [usize; 4], count: [usize; 4]) -> Self {
        Self { start, count }
    }

    /// One whole xy plane at (z, stokes).
    pub fn plane(shape: &ImageShape, z: usize, stokes: usize) -> Self {
        Self {
            start: [0, 0, z, stokes],
            count: [shape.width(), shape.height(), 1, 1],
        }
    }

    /// An xy sub-rectangle of one plane.
    pub fn plane_region(
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        z: usize,
        stokes: usize,
    ) -> Self {
        Self {
            start: [x, y, z, stokes],
            count: [width, height, 1, 1],
        }
    }

    /// A single spatial pixel over an inclusive channel range.
    pub fn spectrum(x: usize, y: usize, z_from: usize, z_to: usize, stokes: usize) -> Self {
        Self {
            start: [x, y, z_from, stokes],
            count: [1, 1, z_to - z_from + 1, 1],
        }
    }

    /// Number of pixels the slicer covers.
    #[inline]
    pub fn length(&self) -> usize {
        self.count.iter().product()
    }

    /// Validates the slicer against a shape.
    pub fn check(&self, shape: &ImageShape) -> Result<()> {
        let limits = [
            shape.width(),
            shape.height(),
            shape.depth(),
            shape.num_stokes(),
        ];
        for axis in 0..4 {
            if self.count[axis] == 0 {
                return Err(Error::invalid_request("empty slicer extent"));
            }
            let end = self.start[axis] + self.count[axis];
            if end > limits[axis] {
                return Err(Error::out_of_range(
                    format!("slicer axis {axis}"),
                    end as i64 - 1,
                    limits[axis] as i64,
                ));
            }
        }
        Ok(())
    }
}

/// A slicer tagged with the pixel source it reads from.
///
/// Computed-Stokes sources synthesize their pixels from the real planes, so
/// the consumer must route these through the computed-Stokes expansion
/// rather than a raw loader read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StokesSlicer {
    /// Where the pixels come from.
    pub source: StokesSource,
    /// The hyper-rectangle to read.
    pub slicer: Slicer,
}

impl StokesSlicer {
    /// Creates a slicer over the original image.
    pub fn original(slicer: Slicer) -> Self {
        Self {
            source: StokesSource::Original,
            slicer,
        }
    }
}
