//! Image cube shape and axis roles.
//!
//! An image cube has 2, 3 or 4 axes. The first two are always the spatial
//! x/y axes; a spectral (z) axis and a polarization (Stokes) axis are
//! optional and may appear in either order. [`ImageShape`] records the axis
//! lengths in file order together with the role assignment and provides the
//! canonical accessors the compute code uses everywhere (`width`, `height`,
//! `depth`, `num_stokes`).

use crate::error::{Error, Result};

/// Axis lengths of an image cube plus the spectral / Stokes role assignment.
///
/// Invariants, enforced at construction:
/// - 2 ≤ `ndim` ≤ 4
/// - axes 0 and 1 are spatial x and y
/// - `spectral_axis` and `stokes_axis`, when present, are distinct indices
///   in `[2, ndim)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageShape {
    dims: Vec<usize>,
    spectral_axis: Option<usize>,
    stokes_axis: Option<usize>,
}

impl ImageShape {
    /// Creates a shape from axis lengths in file order and role indices.
    ///
    /// `spectral_axis` / `stokes_axis` use the loader convention where a
    /// negative index means "absent".
    pub fn new(dims: Vec<usize>, spectral_axis: i32, stokes_axis: i32) -> Result<Self> {
        let ndim = dims.len();
        if !(2..=4).contains(&ndim) {
            return Err(Error::invalid_shape(ndim));
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(Error::invalid_shape(ndim));
        }

        let spectral_axis = axis_index(spectral_axis, ndim)?;
        let stokes_axis = axis_index(stokes_axis, ndim)?;
        if spectral_axis.is_some() && spectral_axis == stokes_axis {
            return Err(Error::invalid_request(
                "spectral and stokes axes must be distinct",
            ));
        }

        // Every axis beyond x/y must have a role, otherwise slicing is ambiguous.
        let assigned = spectral_axis.iter().count() + stokes_axis.iter().count();
        if assigned != ndim - 2 {
            return Err(Error::invalid_shape(ndim));
        }

        Ok(Self {
            dims,
            spectral_axis,
            stokes_axis,
        })
    }

    /// Creates a plain 2-d shape.
    pub fn plane(width: usize, height: usize) -> Result<Self> {
        Self::new(vec![width, height], -1, -1)
    }

    /// Creates a 3-d cube with the spectral axis last.
    pub fn cube(width: usize, height: usize, depth: usize) -> Result<Self> {
        Self::new(vec![width, height, depth], 2, -1)
    }

    /// Creates a 4-d cube laid out as (x, y, z, stokes).
    pub fn hypercube(
        width: usize,
        height: usize,
        depth: usize,
        num_stokes: usize,
    ) -> Result<Self> {
        Self::new(vec![width, height, depth, num_stokes], 2, 3)
    }

    /// Number of axes (2, 3 or 4).
    #[inline]
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Axis lengths in file order.
    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Spatial width (axis 0).
    #[inline]
    pub fn width(&self) -> usize {
        self.dims[0]
    }

    /// Spatial height (axis 1).
    #[inline]
    pub fn height(&self) -> usize {
        self.dims[1]
    }

    /// Length of the spectral axis, or 1 when absent.
    #[inline]
    pub fn depth(&self) -> usize {
        self.spectral_axis.map_or(1, |ax| self.dims[ax])
    }

    /// Length of the Stokes axis, or 1 when absent.
    #[inline]
    pub fn num_stokes(&self) -> usize {
        self.stokes_axis.map_or(1, |ax| self.dims[ax])
    }

    /// Index of the spectral axis in file order, if any.
    #[inline]
    pub fn spectral_axis(&self) -> Option<usize> {
        self.spectral_axis
    }

    /// Index of the Stokes axis in file order, if any.
    #[inline]
    pub fn stokes_axis(&self) -> Option<usize> {
        self.stokes_axis
    }

    /// Total pixel count of one xy plane.
    #[inline]
    pub fn plane_size(&self) -> usize {
        self.width() * self.height()
    }

    /// Total pixel count of the whole cube.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.dims.iter().product()
    }

    /// Returns `true` when (x, y) addresses a pixel inside the plane.
    #[inline]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && (x as usize) < self.width() && (y as usize) < self.height()
    }
}

fn axis_index(axis: i32, ndim: usize) -> Result<Option<usize>> {
    if axis < 0 {
        return Ok(None);
    }
    let axis = axis as usize;
    if axis < 2 || axis >= ndim {
        return Err(Error::invalid_request(format!(
            "axis index {axis} out of range for {ndim}-d image"
        )));
    }
    Ok(Some(axis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane() {
        let shape = ImageShape::plane(10, 20).unwrap();
        assert_eq!(shape.ndim(), 2);
        assert_eq!(shape.width(), 10);
        assert_eq!(shape.height(), 20);
        assert_eq!(shape.depth(), 1);
        assert_eq!(shape.num_stokes(), 1);
    }

    #[test]
    fn test_hypercube() {
        let shape = ImageShape::hypercube(1110, 1110, 25, 4).unwrap();
        assert_eq!(shape.ndim(), 4);
        assert_eq!(shape.depth(), 25);
        assert_eq!(shape.num_stokes(), 4);
        assert_eq!(shape.spectral_axis(), Some(2));
        assert_eq!(shape.stokes_axis(), Some(3));
    }

    #[test]
    fn test_stokes_before_spectral() {
        // (x, y, stokes, z) layout as some FITS files order it
        let shape = ImageShape::new(vec![64, 64, 4, 100], 3, 2).unwrap();
        assert_eq!(shape.depth(), 100);
        assert_eq!(shape.num_stokes(), 4);
    }

    #[test]
    fn test_rejects_bad_ndim() {
        assert!(ImageShape::new(vec![10], -1, -1).is_err());
        assert!(ImageShape::new(vec![1, 2, 3, 4, 5], 2, 3).is_err());
    }

    #[test]
    fn test_rejects_unassigned_axis() {
        // 3-d with no role for axis 2
        assert!(ImageShape::new(vec![10, 10, 5], -1, -1).is_err());
        // 4-d with only one role assigned
        assert!(ImageShape::new(vec![10, 10, 5, 4], 2, -1).is_err());
    }

    #[test]
    fn test_rejects_duplicate_roles() {
        assert!(ImageShape::new(vec![10, 10, 5, 4], 2, 2).is_err());
    }

    #[test]
    fn test_contains() {
        let shape = ImageShape::plane(10, 10).unwrap();
        assert!(shape.contains(0.0, 0.0));
        assert!(shape.contains(9.9, 9.9));
        assert!(!shape.contains(-0.1, 5.0));
        assert!(!shape.contains(10.0, 5.0));
    }
}
