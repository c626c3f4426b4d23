//! Error types for cube compute operations.
//!
//! This module provides the unified error handling system shared by the
//! frame and region compute crates. The kinds are stable and client-visible:
//! the session layer maps each variant onto its wire-level error field.
//!
//! # Overview
//!
//! The [`Error`] enum covers all failure modes that can occur during:
//! - File opening and shape validation
//! - Channel / Stokes selection
//! - Region application across files
//! - Long-running computations (cancellation)
//! - Loader capability probing (unsupported fast paths)
//!
//! # Usage
//!
//! ```rust
//! use cube_core::{Error, Result};
//!
//! fn check_channel(z: i32, depth: usize) -> Result<()> {
//!     if z < 0 || z as usize >= depth {
//!         return Err(Error::out_of_range("channel", z as i64, depth as i64));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during cube compute operations.
///
/// This enum uses [`thiserror`] for automatic [`std::error::Error`] and
/// [`std::fmt::Display`] implementations.
///
/// # Categories
///
/// - **File errors**: [`FileOpen`](Error::FileOpen), [`InvalidShape`](Error::InvalidShape)
/// - **Request errors**: [`OutOfRange`](Error::OutOfRange), [`InvalidRequest`](Error::InvalidRequest)
/// - **Region errors**: [`RegionOutsideImage`](Error::RegionOutsideImage)
/// - **Flow control**: [`Cancelled`](Error::Cancelled), [`Unsupported`](Error::Unsupported)
/// - **Catch-all**: [`Internal`](Error::Internal), [`Io`](Error::Io)
#[derive(Debug, Error)]
pub enum Error {
    /// The loader could not open the image; fatal for the frame.
    #[error("failed to open {path}: {reason}")]
    FileOpen {
        /// Path of the image that failed to open
        path: String,
        /// Loader-provided reason
        reason: String,
    },

    /// The image is not 2-d, 3-d or 4-d; the frame is marked invalid.
    #[error("image has {ndim} dimensions, expected 2, 3 or 4")]
    InvalidShape {
        /// Number of dimensions found
        ndim: usize,
    },

    /// A requested index (channel, stokes, pixel) is out of bounds.
    ///
    /// Reported as a per-call message; no state change occurs.
    #[error("{what} {value} out of range [0, {max})")]
    OutOfRange {
        /// Name of the index that was out of bounds
        what: String,
        /// Requested value
        value: i64,
        /// Exclusive upper bound
        max: i64,
    },

    /// A request carried invalid parameters (negative bounds, zero mip, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The region does not intersect the target image.
    ///
    /// Not an error when streaming: partial results are emitted with NaN
    /// payloads and progress still reaches 1.0.
    #[error("region {region_id} is outside image {file_id}")]
    RegionOutsideImage {
        /// Region id in the handler's namespace
        region_id: i32,
        /// Target file id
        file_id: i32,
    },

    /// A long-running computation was cancelled before completion.
    ///
    /// Surfaced as `cancelled = true` on the request response; no further
    /// callbacks are made after this is raised.
    #[error("{operation} cancelled")]
    Cancelled {
        /// Name of the cancelled operation
        operation: String,
    },

    /// The loader or format lacks a capability.
    ///
    /// The caller falls back if a fallback path exists, else surfaces this.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Catch-all wrapping failures from lower layers.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error during loader reads or file export.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates an [`Error::FileOpen`] error.
    #[inline]
    pub fn file_open(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FileOpen {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an [`Error::InvalidShape`] error.
    #[inline]
    pub fn invalid_shape(ndim: usize) -> Self {
        Self::InvalidShape { ndim }
    }

    /// Creates an [`Error::OutOfRange`] error.
    #[inline]
    pub fn out_of_range(what: impl Into<String>, value: i64, max: i64) -> Self {
        Self::OutOfRange {
            what: what.into(),
            value,
            max,
        }
    }

    /// Creates an [`Error::InvalidRequest`] error.
    #[inline]
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Creates an [`Error::Cancelled`] error.
    #[inline]
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Creates an [`Error::Unsupported`] error.
    #[inline]
    pub fn unsupported(op: impl Into<String>) -> Self {
        Self::Unsupported(op.into())
    }

    /// Creates an [`Error::Internal`] error.
    #[inline]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns `true` if the error means the caller should try a fallback
    /// path rather than surface the failure.
    #[inline]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }

    /// Returns `true` if this error represents cancellation.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns `true` if the frame that produced this error is permanently
    /// unusable (open failure or invalid shape).
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FileOpen { .. } | Self::InvalidShape { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_message() {
        let err = Error::out_of_range("channel", 30, 25);
        let msg = err.to_string();
        assert!(msg.contains("channel"));
        assert!(msg.contains("30"));
        assert!(msg.contains("25"));
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(Error::file_open("a.fits", "no such file").is_fatal());
        assert!(Error::invalid_shape(5).is_fatal());
        assert!(!Error::cancelled("moments").is_fatal());
    }

    #[test]
    fn test_cancelled() {
        let err = Error::cancelled("pv generator");
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("pv generator"));
    }

    #[test]
    fn test_unsupported_is_fallback() {
        assert!(Error::unsupported("mipmap read").is_unsupported());
        assert!(!Error::internal("boom").is_unsupported());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
