//! Error types for cube I/O.

use thiserror::Error;

/// Result type alias for I/O operations.
pub type IoResult<T> = std::result::Result<T, IoError>;

/// Errors raised by loaders and writers.
#[derive(Debug, Error)]
pub enum IoError {
    /// The file could not be opened or read.
    #[error("file access error for {path}: {reason}")]
    FileAccess {
        /// Path involved.
        path: String,
        /// Underlying reason.
        reason: String,
    },

    /// A slicer or region does not fit the image.
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    /// A requested index is out of bounds.
    #[error("{what} {value} out of range [0, {max})")]
    OutOfRange {
        /// Index name.
        what: String,
        /// Requested value.
        value: i64,
        /// Exclusive upper bound.
        max: i64,
    },

    /// The loader lacks the requested capability; callers fall back.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The file is structurally malformed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Wrapped [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IoError {
    /// Creates a [`IoError::FileAccess`] error.
    pub fn file_access(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FileAccess {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a [`IoError::NotSupported`] error.
    pub fn not_supported(what: impl Into<String>) -> Self {
        Self::NotSupported(what.into())
    }

    /// Creates a [`IoError::Parse`] error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Returns `true` when the caller should try a fallback path.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }
}

impl From<IoError> for cube_core::Error {
    fn from(err: IoError) -> Self {
        match err {
            IoError::FileAccess { path, reason } => cube_core::Error::file_open(path, reason),
            IoError::InvalidRegion(msg) => cube_core::Error::invalid_request(msg),
            IoError::OutOfRange { what, value, max } => {
                cube_core::Error::out_of_range(what, value, max)
            }
            IoError::NotSupported(msg) => cube_core::Error::unsupported(msg),
            IoError::Parse(msg) => cube_core::Error::internal(msg),
            IoError::Io(err) => cube_core::Error::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_supported_predicate() {
        assert!(IoError::not_supported("mipmaps").is_not_supported());
        assert!(!IoError::parse("bad header").is_not_supported());
    }

    #[test]
    fn test_maps_to_core_kinds() {
        let core: cube_core::Error = IoError::not_supported("x").into();
        assert!(core.is_unsupported());

        let core: cube_core::Error = IoError::file_access("a.fits", "denied").into();
        assert!(core.is_fatal());
    }
}
