//! # cube-region
//!
//! Region geometry for the cube-rs compute engine.
//!
//! - [`state`] - region types, control points, rotation, style
//! - [`region`] - lifecycle: snapshots, change generations, task tracking
//! - [`mask`] - lattice-mask rasterization and cross-file conversion
//!
//! A region is defined once in its reference file's pixel grid and
//! applied to any open file; the handler owns the [`Region`] objects and
//! snapshots their state for every long-running task.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod mask;
pub mod region;
pub mod state;

pub use mask::{
    convert_control_points, rect_corners, to_lattice_mask, to_lattice_mask_in, RegionMask,
    StokesRegion,
};
pub use region::Region;
pub use state::{
    RegionProperties, RegionState, RegionStyle, RegionType, ROTATION_TOLERANCE,
};
