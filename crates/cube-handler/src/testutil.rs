//! Shared fixtures for the handler test modules.

use crate::handler::RegionHandler;
use cube_core::{AxisDescriptor, CoordinateSystem, ImageShape};
use cube_frame::Frame;
use cube_io::MemoryLoader;
use cube_region::{RegionState, RegionType};
use glam::DVec2;
use std::sync::Arc;

/// Coordinate system with 1 arcsec pixels.
pub fn arcsec_csys() -> CoordinateSystem {
    CoordinateSystem {
        x: AxisDescriptor {
            ctype: "RA---SIN".into(),
            cunit: "deg".into(),
            crpix: 0.0,
            crval: 180.0,
            cdelt: -1.0 / 3600.0,
        },
        y: AxisDescriptor {
            ctype: "DEC--SIN".into(),
            cunit: "deg".into(),
            crpix: 0.0,
            crval: -30.0,
            cdelt: 1.0 / 3600.0,
        },
        spectral: Some(AxisDescriptor {
            ctype: "FREQ".into(),
            cunit: "Hz".into(),
            crpix: 0.0,
            crval: 1.4e9,
            cdelt: 1e6,
        }),
        radesys: "ICRS".into(),
    }
}

fn make_shape(width: usize, height: usize, depth: usize, stokes: usize) -> ImageShape {
    match (depth, stokes) {
        (1, 1) => ImageShape::plane(width, height).unwrap(),
        (_, 1) => ImageShape::cube(width, height, depth).unwrap(),
        _ => ImageShape::hypercube(width, height, depth, stokes).unwrap(),
    }
}

/// A handler with one registered ramp frame at file id 0, pixel csys.
pub fn handler_with_frame(
    width: usize,
    height: usize,
    depth: usize,
    stokes: usize,
) -> (RegionHandler, Arc<Frame>) {
    let shape = make_shape(width, height, depth, stokes);
    let data: Vec<f32> = (0..shape.total_size()).map(|i| i as f32).collect();
    let loader = MemoryLoader::new("ramp", shape, CoordinateSystem::pixel(), data).unwrap();
    let frame = Arc::new(Frame::new(0, Box::new(loader), "0").unwrap());

    let handler = RegionHandler::new();
    handler.add_frame(0, &frame);
    (handler, frame)
}

/// A handler with one registered ramp frame using 1 arcsec pixels.
pub fn handler_with_angular_frame(
    width: usize,
    height: usize,
    depth: usize,
) -> (RegionHandler, Arc<Frame>) {
    let shape = make_shape(width, height, depth, 1);
    let data: Vec<f32> = (0..shape.total_size()).map(|i| i as f32).collect();
    let loader = MemoryLoader::new("angular", shape, arcsec_csys(), data).unwrap();
    let frame = Arc::new(Frame::new(0, Box::new(loader), "0").unwrap());

    let handler = RegionHandler::new();
    handler.add_frame(0, &frame);
    (handler, frame)
}

/// Rectangle region state `[center, (width, height)]`.
pub fn rect_state(file_id: i32, cx: f64, cy: f64, w: f64, h: f64) -> RegionState {
    RegionState::new(
        file_id,
        RegionType::Rectangle,
        vec![DVec2::new(cx, cy), DVec2::new(w, h)],
        0.0,
    )
}

/// Line region state between two points.
pub fn line_state(file_id: i32, x1: f64, y1: f64, x2: f64, y2: f64) -> RegionState {
    RegionState::new(
        file_id,
        RegionType::Line,
        vec![DVec2::new(x1, y1), DVec2::new(x2, y2)],
        0.0,
    )
}
