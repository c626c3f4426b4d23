//! # cube-stats
//!
//! Parallel statistics and histogram kernels for image cube compute.
//!
//! - [`basic`] - NaN-aware min/max/sum/mean/σ over contiguous buffers
//! - [`histogram`] - fixed-width binning with automatic bin sizing
//! - [`region_stats`] - per-axis statistics over masked region sub-lattices
//!
//! All kernels treat NaN and ±Inf as missing data and parallelize with
//! rayon above a fixed chunk threshold; results are independent of the
//! split.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod basic;
pub mod histogram;
pub mod region_stats;

pub use basic::{calc_basic_stats, min_max, BasicStats};
pub use histogram::{auto_bin_size, calc_histogram, Histogram};
pub use region_stats::{calc_stats_values, RegionLattice, SPECTRAL_STATS};
