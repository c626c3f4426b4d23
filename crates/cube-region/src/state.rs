//! Region state and style.
//!
//! A region is a parameterized 2-d geometry expressed in the pixel
//! coordinate system of its *reference* file: a type, ordered control
//! points and a rotation. Style is purely presentational and never
//! affects geometry.
//!
//! Control-point conventions (reference-file pixel coordinates):
//! - Point / annotation point: `[position]`
//! - Line / polyline / polygon: the vertices in order
//! - Rectangle: `[center, (width, height)]`
//! - Ellipse: `[center, (semi_major, semi_minor)]`

use glam::DVec2;
use serde::{Deserialize, Serialize};

/// Two region rotations compare equal within this many degrees.
///
/// The caches key on a region generation counter rather than float bits,
/// so mathematically identical rotations from different clients hit.
pub const ROTATION_TOLERANCE: f64 = 1e-6;

/// Geometry type of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionType {
    /// Single pixel position.
    Point,
    /// Two-point line.
    Line,
    /// Multi-segment open line.
    Polyline,
    /// Axis-aligned or rotated rectangle.
    Rectangle,
    /// Rotated ellipse.
    Ellipse,
    /// Closed polygon.
    Polygon,
    /// Annotation variants: rendered by the client, never applied to data.
    AnnPoint,
    /// Annotation line.
    AnnLine,
    /// Annotation polyline.
    AnnPolyline,
    /// Annotation rectangle.
    AnnRectangle,
    /// Annotation ellipse.
    AnnEllipse,
    /// Annotation polygon.
    AnnPolygon,
    /// Annotation vector arrow.
    AnnVector,
    /// Annotation ruler.
    AnnRuler,
    /// Annotation text box.
    AnnText,
    /// Annotation compass.
    AnnCompass,
}

impl RegionType {
    /// Closed types can produce a lattice mask (histograms, statistics).
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Rectangle | Self::Ellipse | Self::Polygon)
    }

    /// Point and line families (spatial profile sources).
    pub fn is_line_type(&self) -> bool {
        matches!(self, Self::Line | Self::Polyline)
    }

    /// Whether the type is annotation-only.
    pub fn is_annotation(&self) -> bool {
        matches!(
            self,
            Self::AnnPoint
                | Self::AnnLine
                | Self::AnnPolyline
                | Self::AnnRectangle
                | Self::AnnEllipse
                | Self::AnnPolygon
                | Self::AnnVector
                | Self::AnnRuler
                | Self::AnnText
                | Self::AnnCompass
        )
    }
}

/// Geometry of one region in its reference file's pixel coordinates.
#[derive(Debug, Clone)]
pub struct RegionState {
    /// File id whose pixel grid the control points live in.
    pub reference_file_id: i32,
    /// Geometry type.
    pub region_type: RegionType,
    /// Ordered control points.
    pub control_points: Vec<DVec2>,
    /// Rotation in degrees, counter-clockwise.
    pub rotation: f64,
}

impl RegionState {
    /// Creates a region state.
    pub fn new(
        reference_file_id: i32,
        region_type: RegionType,
        control_points: Vec<DVec2>,
        rotation: f64,
    ) -> Self {
        Self {
            reference_file_id,
            region_type,
            control_points,
            rotation,
        }
    }

    /// Returns `true` when the state has the control-point arity its type
    /// requires.
    pub fn is_valid(&self) -> bool {
        let n = self.control_points.len();
        match self.region_type {
            RegionType::Point | RegionType::AnnPoint | RegionType::AnnText => n == 1,
            RegionType::Rectangle
            | RegionType::Ellipse
            | RegionType::AnnRectangle
            | RegionType::AnnEllipse
            | RegionType::Line
            | RegionType::AnnLine
            | RegionType::AnnVector
            | RegionType::AnnRuler
            | RegionType::AnnCompass => n == 2,
            RegionType::Polyline | RegionType::AnnPolyline => n >= 2,
            RegionType::Polygon | RegionType::AnnPolygon => n >= 3,
        }
    }
}

impl PartialEq for RegionState {
    fn eq(&self, other: &Self) -> bool {
        self.reference_file_id == other.reference_file_id
            && self.region_type == other.region_type
            && self.control_points == other.control_points
            && (self.rotation - other.rotation).abs() <= ROTATION_TOLERANCE
    }
}

/// Presentational style of a region.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RegionStyle {
    /// Stroke color, client syntax.
    pub color: String,
    /// Stroke width in display pixels.
    pub line_width: i32,
    /// Dash pattern.
    pub dash_list: Vec<i32>,
    /// Annotation font name, when applicable.
    pub font: String,
    /// Annotation point shape, when applicable.
    pub point_shape: i32,
}

/// The full persistable description of a region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionProperties {
    /// Geometry.
    pub state: RegionState,
    /// Presentation.
    pub style: RegionStyle,
}
