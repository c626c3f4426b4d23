//! # cube-frame
//!
//! Per-file compute for the cube-rs engine. A [`Frame`] wraps one opened
//! image behind its loader and serves everything the viewer needs from a
//! single file:
//!
//! - raster tiles with down-sampling and lossy compression ([`frame`])
//! - channel/tile caches ([`cache`])
//! - cursor spatial profiles with extrema-preserving decimation
//!   ([`spatial`])
//! - incremental cursor spectral profiles ([`spectral`])
//! - per-plane histograms and statistics with local caches ([`frame`])
//! - contour tracing from raw, smoothed or block-averaged grids
//!   ([`contours`])
//! - polarization vector-overlay tile streams ([`vector_field`])
//! - moment images, Gaussian fitting, sub-cube export ([`moment`],
//!   [`fitter`], [`save`])
//!
//! Concurrency: session threads enter a frame concurrently. The loader
//! mutex serializes file access, the channel cache has a shared/exclusive
//! lock, and long-running producers hold the active-task lock shared
//! while polling the connected flag.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod cache;
pub mod contours;
pub mod fitter;
pub mod frame;
pub mod moment;
pub mod save;
pub mod spatial;
pub mod spectral;
pub mod vector_field;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{ChannelCache, TileCache};
pub use fitter::MODEL_ID_MULTIPLIER;
pub use frame::{combine_computed_stokes, Frame, PointXy};
pub use moment::MOMENT_ID_MULTIPLIER;
pub use spatial::decimate_min_max;
