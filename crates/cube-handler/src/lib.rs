//! # cube-handler
//!
//! Cross-file region compute for the cube-rs engine.
//!
//! The [`RegionHandler`] owns every region and holds weak references to
//! the open frames; it cross-applies regions to any frame, maintains the
//! histogram / spectral / spatial / statistics requirement sets, caches
//! results per (file, region, stokes, z), and drives the line-profile,
//! PV and generator pipelines.
//!
//! - [`handler`] - region ownership, requirements, caches, histogram and
//!   statistics streams
//! - [`spectral`] - region spectral streams with adaptive chunking
//! - [`line_profiles`] - the line/polyline box decomposition engine
//! - [`pv`] - position-velocity images, previews and line spatial
//!   profiles
//! - [`generators`] - moments and fitting dispatch

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod generators;
pub mod handler;
pub mod line_profiles;
pub mod pv;
pub mod spectral;

#[cfg(test)]
pub(crate) mod testutil;

pub use handler::{CacheId, ConfigId, ExportRegionAck, ImportRegionAck, RegionHandler};
pub use line_profiles::{adjust_increment_unit, LineProfiles};
pub use pv::PV_ID_MULTIPLIER;
