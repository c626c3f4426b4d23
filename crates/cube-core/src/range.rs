//! Inclusive axis ranges with sentinel semantics.
//!
//! Requests address the spectral axis with an inclusive `[from, to]` range.
//! Two sentinel values select "the whole axis" and "the frame's current
//! channel"; both are resolved against the frame state at dispatch time.

use crate::error::{Error, Result};

/// Sentinel selecting every index along the axis.
pub const ALL_Z: i32 = -2;

/// Sentinel selecting the frame's current channel.
pub const CURRENT_Z: i32 = -1;

/// Inclusive `[from, to]` range along the spectral axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AxisRange {
    /// First index, inclusive. May be a sentinel.
    pub from: i32,
    /// Last index, inclusive. May be a sentinel.
    pub to: i32,
}

impl AxisRange {
    /// Creates an explicit `[from, to]` range.
    #[inline]
    pub fn new(from: i32, to: i32) -> Self {
        Self { from, to }
    }

    /// Range covering exactly one index.
    #[inline]
    pub fn single(index: i32) -> Self {
        Self {
            from: index,
            to: index,
        }
    }

    /// Range covering the whole axis.
    #[inline]
    pub fn all() -> Self {
        Self {
            from: 0,
            to: ALL_Z,
        }
    }

    /// Range selecting the frame's current channel.
    #[inline]
    pub fn current() -> Self {
        Self {
            from: CURRENT_Z,
            to: CURRENT_Z,
        }
    }

    /// Returns `true` for the whole-axis sentinel range.
    #[inline]
    pub fn is_all(&self) -> bool {
        self.to == ALL_Z
    }

    /// Returns `true` for the current-channel sentinel range.
    #[inline]
    pub fn is_current(&self) -> bool {
        self.from == CURRENT_Z && self.to == CURRENT_Z
    }

    /// Resolves sentinels against the axis `depth` and the frame's
    /// `current` channel, returning concrete inclusive bounds.
    pub fn resolve(&self, depth: usize, current: usize) -> Result<(usize, usize)> {
        let max = depth as i64;
        let resolve_one = |v: i32| -> Result<usize> {
            match v {
                CURRENT_Z => Ok(current),
                v if v >= 0 && (v as i64) < max => Ok(v as usize),
                v => Err(Error::out_of_range("channel", v as i64, max)),
            }
        };

        if self.is_all() {
            if depth == 0 {
                return Err(Error::out_of_range("channel", 0, 0));
            }
            return Ok((0, depth - 1));
        }

        let from = resolve_one(self.from)?;
        let to = resolve_one(self.to)?;
        if from > to {
            return Err(Error::invalid_request(format!(
                "inverted channel range [{from}, {to}]"
            )));
        }
        Ok((from, to))
    }
}

impl Default for AxisRange {
    fn default() -> Self {
        Self::all()
    }
}
