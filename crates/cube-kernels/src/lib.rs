//! # cube-kernels
//!
//! SIMD pixel kernels for the cube-rs compute engine.
//!
//! - [`smoothing`] - block-mean and nearest-neighbour down-sampling
//! - [`gaussian`] - NaN-aware separable Gaussian smoothing
//! - [`compression`] - fixed-precision lossy tile compression
//! - [`nanenc`] - run-length NaN mask encoding
//! - [`contour`] - marching-squares contour tracing
//! - [`dispatch`] - runtime CPU feature dispatch
//!
//! All kernels share the missing-data convention: NaN (and ±Inf where
//! noted) cells contribute nothing, and a result with no finite input is
//! NaN. Vector variants agree with the scalar references within
//! documented tolerances; the active vector width is chosen once per
//! process from CPU feature detection.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod compression;
pub mod contour;
pub mod dispatch;
pub mod gaussian;
pub mod nanenc;
pub mod smoothing;

pub use compression::{compress, decompress};
pub use contour::{trace_contours, ContourCallback};
pub use dispatch::{simd_level, SimdLevel};
pub use gaussian::{gaussian_smooth, make_kernel, SMOOTHING_TEMP_BUFFER_SIZE_MB};
pub use nanenc::{decode_nans, encode_nans_block};
pub use smoothing::{block_smooth, block_smooth_scalar, nearest_neighbor};
