//! Polarization (Stokes) indexing and computed-Stokes quantities.
//!
//! A frame addresses polarization by index into the image's Stokes axis.
//! On top of the real planes, five *computed* quantities are synthesized
//! from I/Q/U/V by closed-form algebra:
//!
//! | Quantity | Definition |
//! |----------|------------|
//! | Ptotal   | `sqrt(Q² + U² + V²)` |
//! | PFtotal  | `100 · Ptotal / I` |
//! | Plinear  | `sqrt(Q² + U²)` |
//! | PFlinear | `100 · Plinear / I` |
//! | Pangle   | `0.5 · atan2(U, Q)` in degrees |
//!
//! Computed quantities are addressed by distinguished indices starting at
//! [`COMPUTED_STOKES_BASE`] so that plain `i32` Stokes indices flow through
//! the request plumbing unchanged.

use crate::range::AxisRange;

/// First index reserved for computed Stokes quantities.
pub const COMPUTED_STOKES_BASE: i32 = 100;

/// A real polarization plane as labelled on the image's Stokes axis.
///
/// Discriminants follow the FITS convention (`CRVAL` on the Stokes axis).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StokesType {
    /// Total intensity.
    I = 1,
    /// Linear polarization, 0/90 degrees.
    Q = 2,
    /// Linear polarization, 45/135 degrees.
    U = 3,
    /// Circular polarization.
    V = 4,
}

impl StokesType {
    /// Parses the FITS Stokes axis value.
    pub fn from_fits_value(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::I),
            2 => Some(Self::Q),
            3 => Some(Self::U),
            4 => Some(Self::V),
            _ => None,
        }
    }

    /// Single-letter label used in profile coordinate strings.
    pub fn label(&self) -> &'static str {
        match self {
            Self::I => "I",
            Self::Q => "Q",
            Self::U => "U",
            Self::V => "V",
        }
    }
}

/// A polarization quantity derived from two or more real Stokes planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputedStokes {
    /// Total polarized intensity `sqrt(Q² + U² + V²)`.
    Ptotal,
    /// Fractional total polarization `100 · Ptotal / I`.
    PFtotal,
    /// Linearly polarized intensity `sqrt(Q² + U²)`.
    Plinear,
    /// Fractional linear polarization `100 · Plinear / I`.
    PFlinear,
    /// Polarization angle `0.5 · atan2(U, Q)` in degrees.
    Pangle,
}

impl ComputedStokes {
    const ALL: [ComputedStokes; 5] = [
        Self::Ptotal,
        Self::PFtotal,
        Self::Plinear,
        Self::PFlinear,
        Self::Pangle,
    ];

    /// Maps a distinguished Stokes index back to the quantity.
    pub fn from_index(index: i32) -> Option<Self> {
        let offset = index - COMPUTED_STOKES_BASE;
        Self::ALL.get(usize::try_from(offset).ok()?).copied()
    }

    /// The distinguished Stokes index for this quantity.
    pub fn index(&self) -> i32 {
        COMPUTED_STOKES_BASE
            + Self::ALL.iter().position(|c| c == self).unwrap_or(0) as i32
    }

    /// Label used in profile coordinate strings.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ptotal => "Ptotal",
            Self::PFtotal => "PFtotal",
            Self::Plinear => "Plinear",
            Self::PFlinear => "PFlinear",
            Self::Pangle => "Pangle",
        }
    }

    /// The real planes needed to synthesize this quantity.
    pub fn required_components(&self) -> &'static [StokesType] {
        match self {
            Self::Ptotal => &[StokesType::Q, StokesType::U, StokesType::V],
            Self::PFtotal => {
                &[StokesType::I, StokesType::Q, StokesType::U, StokesType::V]
            }
            Self::Plinear => &[StokesType::Q, StokesType::U],
            Self::PFlinear => &[StokesType::I, StokesType::Q, StokesType::U],
            Self::Pangle => &[StokesType::Q, StokesType::U],
        }
    }
}

/// Returns `true` when `index` addresses a computed quantity rather than a
/// real plane of the Stokes axis.
#[inline]
pub fn is_computed_stokes(index: i32) -> bool {
    index >= COMPUTED_STOKES_BASE
}

/// Identifies which image pixels feed a computation: the original image, or
/// a synthetic sub-image combining real Stokes planes over a z-range.
///
/// Equality is structural; two sources compare equal iff they name the same
/// pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StokesSource {
    /// Pixels come straight from the opened image.
    #[default]
    Original,
    /// Pixels are synthesized from real Stokes planes on the fly.
    Computed {
        /// Distinguished index of the computed quantity.
        stokes: i32,
        /// Channels the synthetic sub-image spans.
        z_range: AxisRange,
    },
}

impl StokesSource {
    /// Creates the source for a Stokes index: computed indices get a
    /// synthetic sub-image over `z_range`, real indices the original image.
    pub fn for_stokes(stokes: i32, z_range: AxisRange) -> Self {
        if is_computed_stokes(stokes) {
            Self::Computed { stokes, z_range }
        } else {
            Self::Original
        }
    }

    /// Returns `true` for the original-image source.
    #[inline]
    pub fn is_original(&self) -> bool {
        matches!(self, Self::Original)
    }
}

/// Profile direction named by the trailing character of a coordinate string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileAxis {
    /// Spatial profile along x (a row).
    X,
    /// Spatial profile along y (a column).
    Y,
    /// Spectral profile along z.
    Z,
}

/// A parsed profile coordinate: optional Stokes selector plus axis.
///
/// `None` for the selector means "the frame's current Stokes".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coordinate {
    /// Requested polarization, if pinned by the coordinate string.
    pub stokes: Option<StokesSelector>,
    /// Profile direction.
    pub axis: ProfileAxis,
}

/// Polarization selector of a coordinate string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StokesSelector {
    /// A real plane named by its Stokes type.
    Real(StokesType),
    /// A computed quantity.
    Computed(ComputedStokes),
}

/// Parses a profile coordinate string such as `"z"`, `"Ix"`, `"Qy"` or
/// `"Ptotalz"`.
///
/// Returns `None` for malformed strings.
pub fn parse_coordinate(coordinate: &str) -> Option<Coordinate> {
    let axis = match coordinate.chars().last()? {
        'x' => ProfileAxis::X,
        'y' => ProfileAxis::Y,
        'z' => ProfileAxis::Z,
        _ => return None,
    };
    let prefix = &coordinate[..coordinate.len() - 1];

    let stokes = if prefix.is_empty() {
        None
    } else if let Some(computed) = ComputedStokes::ALL
        .iter()
        .find(|c| c.label() == prefix)
    {
        Some(StokesSelector::Computed(*computed))
    } else {
        let stokes_type = match prefix {
            "I" => StokesType::I,
            "Q" => StokesType::Q,
            "U" => StokesType::U,
            "V" => StokesType::V,
            _ => return None,
        };
        Some(StokesSelector::Real(stokes_type))
    };

    Some(Coordinate { stokes, axis })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_computed_index_round_trip() {
        for c in ComputedStokes::ALL {
            assert_eq!(ComputedStokes::from_index(c.index()), Some(c));
            assert!(is_computed_stokes(c.index()));
        }
        assert!(!is_computed_stokes(0));
        assert!(!is_computed_stokes(3));
    }

    #[test]
    fn test_parse_plain_axes() {
        let c = parse_coordinate("z").unwrap();
        assert_eq!(c.axis, ProfileAxis::Z);
        assert!(c.stokes.is_none());

        assert_eq!(parse_coordinate("x").unwrap().axis, ProfileAxis::X);
        assert_eq!(parse_coordinate("y").unwrap().axis, ProfileAxis::Y);
    }

    #[test]
    fn test_parse_fixed_stokes() {
        let c = parse_coordinate("Qy").unwrap();
        assert_eq!(c.axis, ProfileAxis::Y);
        assert_eq!(c.stokes, Some(StokesSelector::Real(StokesType::Q)));
    }

    #[test]
    fn test_parse_computed_stokes() {
        let c = parse_coordinate("Ptotalz").unwrap();
        assert_eq!(c.axis, ProfileAxis::Z);
        assert_eq!(
            c.stokes,
            Some(StokesSelector::Computed(ComputedStokes::Ptotal))
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_coordinate("").is_none());
        assert!(parse_coordinate("w").is_none());
        assert!(parse_coordinate("Xz").is_none());
        assert!(parse_coordinate("Ptotal").is_none());
    }

    #[test]
    fn test_stokes_source() {
        let src = StokesSource::for_stokes(2, AxisRange::all());
        assert!(src.is_original());

        let computed =
            StokesSource::for_stokes(ComputedStokes::Plinear.index(), AxisRange::single(3));
        assert!(!computed.is_original());
        assert_ne!(computed, StokesSource::Original);
    }
}
