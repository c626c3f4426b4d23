//! Lattice-mask rasterization and cross-file conversion.
//!
//! A closed region converts to a boolean mask over its bounding box in a
//! *target* file's pixel grid. When the target is not the reference file,
//! control points round-trip through world coordinates first. Pixel
//! membership tests the pixel center; polygons use the even-odd rule.
//!
//! Line, point-as-profile and annotation types produce no mask: the
//! caller either rejects them or routes them through the line engine.

use crate::state::{RegionState, RegionType};
use cube_core::CoordinateSystem;
use glam::DVec2;

/// Boolean mask over a bounding box in target pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionMask {
    /// Bottom-left corner of the box in image pixels.
    pub origin: (usize, usize),
    /// Box width.
    pub width: usize,
    /// Box height.
    pub height: usize,
    /// Row-major membership, `width * height` long.
    pub mask: Vec<bool>,
}

impl RegionMask {
    /// Count of selected pixels.
    pub fn num_selected(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }
}

/// A 2-d mask extended along the spectral and Stokes axes.
#[derive(Debug, Clone, PartialEq)]
pub struct StokesRegion {
    /// The spatial mask.
    pub mask: RegionMask,
    /// First channel, inclusive.
    pub z_from: usize,
    /// Last channel, inclusive.
    pub z_to: usize,
    /// Stokes index (possibly computed).
    pub stokes: i32,
}

/// Converts a region's control points from its reference frame into the
/// target frame's pixel grid.
pub fn convert_control_points(
    points: &[DVec2],
    reference_csys: &CoordinateSystem,
    target_csys: &CoordinateSystem,
) -> Option<Vec<DVec2>> {
    points
        .iter()
        .map(|p| {
            let (wx, wy) = reference_csys.pixel_to_world(p.x, p.y);
            target_csys
                .world_to_pixel(wx, wy)
                .ok()
                .map(|(x, y)| DVec2::new(x, y))
        })
        .collect()
}

/// Rasterizes a region state into a mask over `(width, height)`.
///
/// `None` when the type cannot produce a mask or the geometry lies
/// entirely outside the image.
pub fn to_lattice_mask(
    state: &RegionState,
    image_width: usize,
    image_height: usize,
) -> Option<RegionMask> {
    if state.region_type.is_annotation() || !state.is_valid() {
        return None;
    }
    match state.region_type {
        RegionType::Point => point_mask(state.control_points[0], image_width, image_height),
        RegionType::Rectangle => {
            let corners = rect_corners(
                state.control_points[0],
                state.control_points[1],
                state.rotation,
            );
            rasterize_polygon(&corners, image_width, image_height)
        }
        RegionType::Ellipse => rasterize_ellipse(
            state.control_points[0],
            state.control_points[1],
            state.rotation,
            image_width,
            image_height,
        ),
        RegionType::Polygon => {
            rasterize_polygon(&state.control_points, image_width, image_height)
        }
        _ => None,
    }
}

/// Rasterizes in a target frame, converting through world coordinates
/// when the target is not the reference file.
pub fn to_lattice_mask_in(
    state: &RegionState,
    reference_csys: &CoordinateSystem,
    target_csys: &CoordinateSystem,
    same_file: bool,
    image_width: usize,
    image_height: usize,
) -> Option<RegionMask> {
    if same_file {
        return to_lattice_mask(state, image_width, image_height);
    }
    if state.region_type.is_annotation() || !state.is_valid() {
        return None;
    }

    // convert a vertex representation so rotation survives the transform
    match state.region_type {
        RegionType::Point => {
            let converted = convert_control_points(
                &state.control_points,
                reference_csys,
                target_csys,
            )?;
            point_mask(converted[0], image_width, image_height)
        }
        RegionType::Rectangle => {
            let corners = rect_corners(
                state.control_points[0],
                state.control_points[1],
                state.rotation,
            );
            let converted = convert_control_points(&corners, reference_csys, target_csys)?;
            rasterize_polygon(&converted, image_width, image_height)
        }
        RegionType::Ellipse => {
            let outline = ellipse_outline(
                state.control_points[0],
                state.control_points[1],
                state.rotation,
            );
            let converted = convert_control_points(&outline, reference_csys, target_csys)?;
            rasterize_polygon(&converted, image_width, image_height)
        }
        RegionType::Polygon => {
            let converted = convert_control_points(
                &state.control_points,
                reference_csys,
                target_csys,
            )?;
            rasterize_polygon(&converted, image_width, image_height)
        }
        _ => None,
    }
}

/// Corners of a rotated rectangle given `[center, (width, height)]`.
pub fn rect_corners(center: DVec2, size: DVec2, rotation_deg: f64) -> Vec<DVec2> {
    let (sin, cos) = rotation_deg.to_radians().sin_cos();
    let (hw, hh) = (size.x / 2.0, size.y / 2.0);
    [(-hw, -hh), (hw, -hh), (hw, hh), (-hw, hh)]
        .iter()
        .map(|&(dx, dy)| {
            DVec2::new(
                center.x + dx * cos - dy * sin,
                center.y + dx * sin + dy * cos,
            )
        })
        .collect()
}

/// Dense polygonal outline of a rotated ellipse, for cross-frame
/// conversion.
fn ellipse_outline(center: DVec2, semi_axes: DVec2, rotation_deg: f64) -> Vec<DVec2> {
    const SEGMENTS: usize = 64;
    let (sin, cos) = rotation_deg.to_radians().sin_cos();
    (0..SEGMENTS)
        .map(|i| {
            let theta = i as f64 / SEGMENTS as f64 * std::f64::consts::TAU;
            let (dx, dy) = (semi_axes.x * theta.cos(), semi_axes.y * theta.sin());
            DVec2::new(
                center.x + dx * cos - dy * sin,
                center.y + dx * sin + dy * cos,
            )
        })
        .collect()
}

fn point_mask(point: DVec2, image_width: usize, image_height: usize) -> Option<RegionMask> {
    let x = point.x.round();
    let y = point.y.round();
    if x < 0.0 || y < 0.0 || x >= image_width as f64 || y >= image_height as f64 {
        return None;
    }
    Some(RegionMask {
        origin: (x as usize, y as usize),
        width: 1,
        height: 1,
        mask: vec![true],
    })
}

fn bounding_box(
    points: &[DVec2],
    image_width: usize,
    image_height: usize,
) -> Option<(usize, usize, usize, usize)> {
    let min_x = points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
    let max_x = points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
    let min_y = points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let max_y = points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);

    if max_x < 0.0 || max_y < 0.0 || min_x >= image_width as f64 || min_y >= image_height as f64
    {
        return None;
    }
    let x0 = min_x.floor().max(0.0) as usize;
    let y0 = min_y.floor().max(0.0) as usize;
    let x1 = (max_x.ceil() as usize).min(image_width - 1);
    let y1 = (max_y.ceil() as usize).min(image_height - 1);
    Some((x0, y0, x1, y1))
}

fn rasterize_polygon(
    points: &[DVec2],
    image_width: usize,
    image_height: usize,
) -> Option<RegionMask> {
    if points.len() < 3 {
        return None;
    }
    let (x0, y0, x1, y1) = bounding_box(points, image_width, image_height)?;
    let (width, height) = (x1 - x0 + 1, y1 - y0 + 1);
    let mut mask = vec![false; width * height];
    let mut any = false;

    for (row, chunk) in mask.chunks_mut(width).enumerate() {
        let py = (y0 + row) as f64;
        for (col, cell) in chunk.iter_mut().enumerate() {
            let px = (x0 + col) as f64;
            if point_in_polygon(px, py, points) {
                *cell = true;
                any = true;
            }
        }
    }
    any.then_some(RegionMask {
        origin: (x0, y0),
        width,
        height,
        mask,
    })
}

/// Even-odd containment test at a pixel center.
fn point_in_polygon(px: f64, py: f64, points: &[DVec2]) -> bool {
    let mut inside = false;
    let n = points.len();
    let mut j = n - 1;
    for i in 0..n {
        let (pi, pj) = (points[i], points[j]);
        if ((pi.y > py) != (pj.y > py))
            && (px < (pj.x - pi.x) * (py - pi.y) / (pj.y - pi.y) + pi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn rasterize_ellipse(
    center: DVec2,
    semi_axes: DVec2,
    rotation_deg: f64,
    image_width: usize,
    image_height: usize,
) -> Option<RegionMask> {
    let extent = semi_axes.x.abs().max(semi_axes.y.abs());
    let bbox_points = [
        DVec2::new(center.x - extent, center.y - extent),
        DVec2::new(center.x + extent, center.y + extent),
    ];
    let (x0, y0, x1, y1) = bounding_box(&bbox_points, image_width, image_height)?;
    let (width, height) = (x1 - x0 + 1, y1 - y0 + 1);

    let (sin, cos) = rotation_deg.to_radians().sin_cos();
    let (a, b) = (semi_axes.x.max(1e-9), semi_axes.y.max(1e-9));
    let mut mask = vec![false; width * height];
    let mut any = false;

    for (row, chunk) in mask.chunks_mut(width).enumerate() {
        let dy = (y0 + row) as f64 - center.y;
        for (col, cell) in chunk.iter_mut().enumerate() {
            let dx = (x0 + col) as f64 - center.x;
            // rotate into the ellipse frame
            let u = dx * cos + dy * sin;
            let v = -dx * sin + dy * cos;
            if (u / a) * (u / a) + (v / b) * (v / b) <= 1.0 {
                *cell = true;
                any = true;
            }
        }
    }
    any.then_some(RegionMask {
        origin: (x0, y0),
        width,
        height,
        mask,
    })
}
