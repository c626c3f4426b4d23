//! Integration fixtures for the cube-rs crates.
//!
//! The actual scenario tests live in `tests/`; this library provides the
//! shared cube builders and the instrumented loader used to exercise
//! cancellation deterministically.

use cube_core::{AxisDescriptor, CoordinateSystem, ImageShape, Slicer, StokesSource, StokesType};
use cube_io::{FileLoader, IoResult, MemoryLoader};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Coordinate system with 1 arcsec pixels and a frequency axis.
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

/// Shape helper covering 2-d, 3-d and 4-d cubes.
pub fn make_shape(width: usize, height: usize, depth: usize, stokes: usize) -> ImageShape {
    match (depth, stokes) {
        (1, 1) => ImageShape::plane(width, height).unwrap(),
        (_, 1) => ImageShape::cube(width, height, depth).unwrap(),
        _ => ImageShape::hypercube(width, height, depth, stokes).unwrap(),
    }
}

/// Ramp cube: every cell equals its linear index.
pub fn ramp_loader(width: usize, height: usize, depth: usize, stokes: usize) -> MemoryLoader {
    let shape = make_shape(width, height, depth, stokes);
    let data: Vec<f32> = (0..shape.total_size()).map(|i| i as f32).collect();
    MemoryLoader::new("ramp", shape, CoordinateSystem::pixel(), data).unwrap()
}

/// A loader that invokes a hook after every `get_slice`, used to change
/// frame state (e.g. move the cursor) between chunked reads.
pub struct HookedLoader {
    inner: MemoryLoader,
    slice_calls: AtomicUsize,
    /// Invoked with the completed call count after each slice read.
    pub hook: Arc<Mutex<Option<Box<dyn Fn(usize) + Send + Sync>>>>,
}

impl HookedLoader {
    /// Wraps a memory loader.
    pub fn new(inner: MemoryLoader) -> Self {
        Self {
            inner,
            slice_calls: AtomicUsize::new(0),
            hook: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared handle to install the hook after frame construction.
    pub fn hook_cell(&self) -> Arc<Mutex<Option<Box<dyn Fn(usize) + Send + Sync>>>> {
        Arc::clone(&self.hook)
    }
}

impl FileLoader for HookedLoader {
    fn open_file(&mut self, hdu: &str) -> IoResult<()> {
        self.inner.open_file(hdu)
    }

    fn file_name(&self) -> &str {
        self.inner.file_name()
    }

    fn shape(&self) -> &ImageShape {
        self.inner.shape()
    }

    fn coordinate_system(&self, source: &StokesSource) -> CoordinateSystem {
        self.inner.coordinate_system(source)
    }

    fn stokes_type_at(&self, index: usize) -> Option<StokesType> {
        self.inner.stokes_type_at(index)
    }

    fn get_slice(&mut self, buf: &mut [f32], slicer: &Slicer) -> IoResult<()> {
        let result = self.inner.get_slice(buf, slicer);
        let calls = self.slice_calls.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(calls);
        }
        result
    }
}
