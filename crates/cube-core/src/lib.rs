//! # cube-core
//!
//! Core types for the cube-rs compute engine: the server side of an
//! interactive viewer for radio-astronomy image cubes.
//!
//! This crate provides the foundational types used throughout the
//! workspace:
//!
//! - [`ImageShape`] - axis lengths with x/y/spectral/Stokes roles
//! - [`StokesType`], [`ComputedStokes`], [`StokesSource`] - polarization model
//! - [`AxisRange`], [`Slicer`], [`StokesSlicer`] - pixel addressing
//! - [`Tile`], [`get_tiles`], [`tile_image_bounds`] - raster tile addressing
//! - [`CoordinateSystem`] - linear pixel ↔ world conversion
//! - [`messages`] - plain-data output messages handed to session callbacks
//! - [`Error`], [`Result`] - the unified error kinds
//!
//! ## Crate Structure
//!
//! `cube-core` is the foundation of cube-rs and has no internal
//! dependencies. All other cube-rs crates depend on it:
//!
//! ```text
//! cube-core (this crate)
//!    ^
//!    |
//!    +-- cube-stats (statistics & histogram kernels)
//!    +-- cube-kernels (SIMD pixel kernels)
//!    +-- cube-io (loader seam, FITS, in-memory images)
//!    +-- cube-region (region geometry)
//!    +-- cube-frame (per-file compute)
//!    +-- cube-handler (cross-file region compute)
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod consts;
pub mod coord;
pub mod error;
pub mod messages;
pub mod range;
pub mod requests;
pub mod shape;
pub mod slicer;
pub mod stokes;
pub mod tile;

// Re-exports for convenience
pub use consts::*;
pub use coord::{arcsec_per_unit, AxisDescriptor, CoordinateSystem};
pub use error::{Error, Result};
pub use range::{AxisRange, ALL_Z, CURRENT_Z};
pub use shape::ImageShape;
pub use slicer::{Slicer, StokesSlicer};
pub use stokes::{
    is_computed_stokes, parse_coordinate, ComputedStokes, Coordinate, ProfileAxis,
    StokesSelector, StokesSource, StokesType, COMPUTED_STOKES_BASE,
};
pub use tile::{
    aligned_index, get_tiles, layer_to_mip, mip_to_layer, tile_image_bounds, ImageBounds,
    Tile, CHUNK_SIZE, TILE_SIZE,
};

/// Prelude module for convenient imports.
///
/// # Usage
///
/// ```
/// use cube_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::consts::*;
    pub use crate::coord::{AxisDescriptor, CoordinateSystem};
    pub use crate::error::{Error, Result};
    pub use crate::messages::*;
    pub use crate::requests::*;
    pub use crate::range::{AxisRange, ALL_Z, CURRENT_Z};
    pub use crate::shape::ImageShape;
    pub use crate::slicer::{Slicer, StokesSlicer};
    pub use crate::stokes::{
        is_computed_stokes, parse_coordinate, ComputedStokes, Coordinate, ProfileAxis,
        StokesSelector, StokesSource, StokesType,
    };
    pub use crate::tile::{
        get_tiles, layer_to_mip, mip_to_layer, tile_image_bounds, ImageBounds, Tile,
        CHUNK_SIZE, TILE_SIZE,
    };
}
