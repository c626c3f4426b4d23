//! Shared fixtures for the frame test modules.

use crate::frame::Frame;
use cube_core::{CoordinateSystem, AxisDescriptor, ImageShape};
use cube_io::MemoryLoader;

/// Coordinate system with 1 arcsec pixels, for angular-spacing tests.
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

/// Shape for the given dimensionality.
pub fn make_shape(width: usize, height: usize, depth: usize, stokes: usize) -> ImageShape {
    match (depth, stokes) {
        (1, 1) => ImageShape::plane(width, height).unwrap(),
        (_, 1) => ImageShape::cube(width, height, depth).unwrap(),
        _ => ImageShape::hypercube(width, height, depth, stokes).unwrap(),
    }
}

/// Frame over a ramp cube (`value = linear index`), pixel coordinates.
pub fn ramp_frame(width: usize, height: usize, depth: usize, stokes: usize) -> Frame {
    let shape = make_shape(width, height, depth, stokes);
    let data: Vec<f32> = (0..shape.total_size()).map(|i| i as f32).collect();
    let loader = MemoryLoader::new("ramp", shape, CoordinateSystem::pixel(), data).unwrap();
    Frame::new(0, Box::new(loader), "0").unwrap()
}

/// Frame with explicit data and coordinate system.
pub fn frame_with(
    width: usize,
    height: usize,
    depth: usize,
    stokes: usize,
    data: Vec<f32>,
    csys: CoordinateSystem,
) -> Frame {
    let shape = make_shape(width, height, depth, stokes);
    let loader = MemoryLoader::new("data", shape, csys, data).unwrap();
    Frame::new(0, Box::new(loader), "0").unwrap()
}

/// Frame whose loader carries a swizzled layout (cursor-spectral fast path).
pub fn swizzled_frame(width: usize, height: usize, depth: usize, stokes: usize) -> Frame {
    let shape = make_shape(width, height, depth, stokes);
    let data: Vec<f32> = (0..shape.total_size()).map(|i| i as f32).collect();
    let loader = MemoryLoader::new("swizzled", shape, CoordinateSystem::pixel(), data)
        .unwrap()
        .with_swizzle();
    Frame::new(0, Box::new(loader), "0").unwrap()
}
