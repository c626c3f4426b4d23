//! In-memory cube loader.
//!
//! Backs generated images (moments, PV) and the test suites. The loader
//! stores the cube in canonical order (x fastest, then y, z, stokes) and
//! can optionally carry the fast-path capabilities real formats expose:
//! precomputed mipmaps, a swizzled (z-fastest) copy for O(1) spectra,
//! per-plane statistics, and chunked tile reads.

use crate::error::{IoError, IoResult};
use crate::traits::{FileLoader, LoaderStats, SpectralProgress};
use cube_core::messages::{GeneratedImage, StatsType};
use cube_core::{
    CoordinateSystem, ImageBounds, ImageShape, Slicer, StokesSource, StokesType,
};
use cube_kernels::smoothing::block_smooth;
use cube_stats::{calc_basic_stats, calc_histogram, calc_stats_values, RegionLattice};
use std::collections::HashMap;

struct MipLevel {
    width: usize,
    height: usize,
    /// One downsampled plane per (stokes, z), z fastest.
    planes: Vec<Vec<f32>>,
}

/// Loader over an in-memory cube.
pub struct MemoryLoader {
    name: String,
    shape: ImageShape,
    csys: CoordinateSystem,
    data: Vec<f32>,
    stokes_types: Vec<StokesType>,
    beam_area: Option<f64>,
    mipmaps: HashMap<i32, MipLevel>,
    swizzled: Option<Vec<f32>>,
    plane_stats: HashMap<(usize, usize), LoaderStats>,
    tile_cache: bool,
}

impl MemoryLoader {
    /// Wraps a canonical-order buffer; `data.len()` must match the shape.
    pub fn new(
        name: impl Into<String>,
        shape: ImageShape,
        csys: CoordinateSystem,
        data: Vec<f32>,
    ) -> IoResult<Self> {
        if data.len() != shape.total_size() {
            return Err(IoError::InvalidRegion(format!(
                "data length {} != shape size {}",
                data.len(),
                shape.total_size()
            )));
        }
        Ok(Self {
            name: name.into(),
            shape,
            csys,
            data,
            stokes_types: vec![
                StokesType::I,
                StokesType::Q,
                StokesType::U,
                StokesType::V,
            ],
            beam_area: None,
            mipmaps: HashMap::new(),
            swizzled: None,
            plane_stats: HashMap::new(),
            tile_cache: false,
        })
    }

    /// Wraps a generator output as an openable image.
    pub fn from_generated(image: &GeneratedImage) -> IoResult<Self> {
        Self::new(
            image.name.clone(),
            image.shape.clone(),
            image.csys.clone(),
            image.data.clone(),
        )
    }

    /// Overrides the Stokes axis labelling.
    pub fn with_stokes_types(mut self, types: Vec<StokesType>) -> Self {
        self.stokes_types = types;
        self
    }

    /// Sets a restoring-beam area in pixels.
    pub fn with_beam_area(mut self, area: f64) -> Self {
        self.beam_area = Some(area);
        self
    }

    /// Precomputes block-mean mipmaps at the given factors.
    pub fn with_mipmaps(mut self, mips: &[i32]) -> Self {
        let (w, h) = (self.shape.width(), self.shape.height());
        for &mip in mips {
            if mip < 2 {
                continue;
            }
            let dw = w.div_ceil(mip as usize);
            let dh = h.div_ceil(mip as usize);
            let mut planes = Vec::with_capacity(self.shape.depth() * self.shape.num_stokes());
            for s in 0..self.shape.num_stokes() {
                for z in 0..self.shape.depth() {
                    let plane = self.plane(z, s);
                    let mut down = vec![0.0f32; dw * dh];
                    block_smooth(plane, &mut down, w, h, dw, dh, 0, 0, mip as usize);
                    planes.push(down);
                }
            }
            self.mipmaps.insert(
                mip,
                MipLevel {
                    width: dw,
                    height: dh,
                    planes,
                },
            );
        }
        self
    }

    /// Builds the z-fastest swizzled copy enabling the spectral fast paths.
    pub fn with_swizzle(mut self) -> Self {
        let (w, h) = (self.shape.width(), self.shape.height());
        let (depth, num_stokes) = (self.shape.depth(), self.shape.num_stokes());
        let mut swizzled = vec![0.0f32; self.data.len()];
        for s in 0..num_stokes {
            for z in 0..depth {
                let plane = self.plane(z, s);
                for y in 0..h {
                    for x in 0..w {
                        swizzled[((s * h + y) * w + x) * depth + z] = plane[y * w + x];
                    }
                }
            }
        }
        self.swizzled = Some(swizzled);
        self
    }

    /// Precomputes per-plane statistics and histograms.
    pub fn with_plane_stats(mut self, num_bins: usize) -> Self {
        for s in 0..self.shape.num_stokes() {
            for z in 0..self.shape.depth() {
                let plane = self.plane(z, s);
                let basic = calc_basic_stats(plane);
                let histogram = calc_histogram(num_bins, &basic, plane);
                self.plane_stats.insert(
                    (s, z),
                    LoaderStats {
                        basic,
                        histogram: Some(histogram),
                    },
                );
            }
        }
        self
    }

    /// Makes the loader advertise chunked tile reads.
    pub fn with_tile_cache(mut self) -> Self {
        self.tile_cache = true;
        self
    }

    /// One xy plane of the canonical buffer.
    fn plane(&self, z: usize, stokes: usize) -> &[f32] {
        let plane_size = self.shape.plane_size();
        let offset = (stokes * self.shape.depth() + z) * plane_size;
        &self.data[offset..offset + plane_size]
    }
}

impl FileLoader for MemoryLoader {
    fn open_file(&mut self, _hdu: &str) -> IoResult<()> {
        Ok(())
    }

    fn file_name(&self) -> &str {
        &self.name
    }

    fn shape(&self) -> &ImageShape {
        &self.shape
    }

    fn coordinate_system(&self, _source: &StokesSource) -> CoordinateSystem {
        self.csys.clone()
    }

    fn stokes_type_at(&self, index: usize) -> Option<StokesType> {
        self.stokes_types.get(index).copied()
    }

    fn beam_area(&self) -> Option<f64> {
        self.beam_area
    }

    fn get_slice(&mut self, buf: &mut [f32], slicer: &Slicer) -> IoResult<()> {
        slicer
            .check(&self.shape)
            .map_err(|e| IoError::InvalidRegion(e.to_string()))?;
        if buf.len() != slicer.length() {
            return Err(IoError::InvalidRegion(format!(
                "buffer length {} != slicer length {}",
                buf.len(),
                slicer.length()
            )));
        }

        let (w, h, depth) = (self.shape.width(), self.shape.height(), self.shape.depth());
        let [x0, y0, z0, s0] = slicer.start;
        let [nx, ny, nz, ns] = slicer.count;
        for s in 0..ns {
            for z in 0..nz {
                for y in 0..ny {
                    let src_base = (((s0 + s) * depth + z0 + z) * h + y0 + y) * w + x0;
                    let dst_base = ((s * nz + z) * ny + y) * nx;
                    buf[dst_base..dst_base + nx]
                        .copy_from_slice(&self.data[src_base..src_base + nx]);
                }
            }
        }
        Ok(())
    }

    fn has_mip(&self, mip: i32) -> bool {
        self.mipmaps.contains_key(&mip)
    }

    fn get_downsampled_raster_data(
        &mut self,
        buf: &mut Vec<f32>,
        z: usize,
        stokes: usize,
        bounds: &ImageBounds,
        mip: i32,
    ) -> IoResult<()> {
        let level = self
            .mipmaps
            .get(&mip)
            .ok_or_else(|| IoError::not_supported(format!("mip {mip}")))?;
        let plane = &level.planes[stokes * self.shape.depth() + z];

        let mip = mip as usize;
        let x0 = bounds.x_min as usize / mip;
        let y0 = bounds.y_min as usize / mip;
        let out_w = (bounds.width() as usize).div_ceil(mip);
        let out_h = (bounds.height() as usize).div_ceil(mip);
        if x0 + out_w > level.width || y0 + out_h > level.height {
            return Err(IoError::InvalidRegion("mipmap bounds".to_string()));
        }

        buf.resize(out_w * out_h, 0.0);
        for row in 0..out_h {
            let src = (y0 + row) * level.width + x0;
            buf[row * out_w..(row + 1) * out_w]
                .copy_from_slice(&plane[src..src + out_w]);
        }
        Ok(())
    }

    fn use_tile_cache(&self) -> bool {
        self.tile_cache
    }

    fn has_cursor_spectral_data(&self) -> bool {
        self.swizzled.is_some()
    }

    fn get_cursor_spectral_data(
        &mut self,
        buf: &mut Vec<f32>,
        stokes: usize,
        x: usize,
        y: usize,
    ) -> IoResult<()> {
        let swizzled = self
            .swizzled
            .as_ref()
            .ok_or_else(|| IoError::not_supported("cursor spectral data"))?;
        let (w, h, depth) = (self.shape.width(), self.shape.height(), self.shape.depth());
        if x >= w || y >= h {
            return Err(IoError::OutOfRange {
                what: "cursor".to_string(),
                value: x.max(y) as i64,
                max: w.max(h) as i64,
            });
        }
        let base = ((stokes * h + y) * w + x) * depth;
        buf.clear();
        buf.extend_from_slice(&swizzled[base..base + depth]);
        Ok(())
    }

    fn use_region_spectral_data(&self, _region_shape: (usize, usize)) -> bool {
        self.swizzled.is_some()
    }

    fn get_region_spectral_data(
        &mut self,
        mask: &[bool],
        mask_width: usize,
        mask_height: usize,
        origin: (usize, usize),
        z_range: (usize, usize),
        stokes: usize,
        progress: SpectralProgress<'_>,
    ) -> IoResult<HashMap<StatsType, Vec<f64>>> {
        let swizzled = self
            .swizzled
            .as_ref()
            .ok_or_else(|| IoError::not_supported("region spectral data"))?;
        let (w, h, depth) = (self.shape.width(), self.shape.height(), self.shape.depth());
        let (z_from, z_to) = z_range;
        let num_z = z_to - z_from + 1;

        // gather masked spectra, then reduce per channel
        let mut per_channel: Vec<Vec<f32>> = vec![Vec::new(); num_z];
        let mut visited = 0usize;
        let total = mask.iter().filter(|&&m| m).count().max(1);
        for my in 0..mask_height {
            for mx in 0..mask_width {
                if !mask[my * mask_width + mx] {
                    continue;
                }
                let (x, y) = (origin.0 + mx, origin.1 + my);
                if x >= w || y >= h {
                    continue;
                }
                let base = ((stokes * h + y) * w + x) * depth;
                for (i, z) in (z_from..=z_to).enumerate() {
                    per_channel[i].push(swizzled[base + z]);
                }
                visited += 1;
                if visited % 64 == 0 && !progress(visited as f64 / total as f64) {
                    return Err(IoError::not_supported("cancelled"));
                }
            }
        }

        let mut results: HashMap<StatsType, Vec<f64>> = HashMap::new();
        for (i, channel) in per_channel.iter().enumerate() {
            let lattice = RegionLattice {
                data: channel,
                width: channel.len().max(1),
                height: 1,
                num_z: 1,
                mask: None,
                origin,
                beam_area: self.beam_area,
            };
            let empty = [0.0f32];
            let lattice = if channel.is_empty() {
                RegionLattice {
                    data: &empty[..0],
                    width: 0,
                    height: 0,
                    ..lattice
                }
            } else {
                lattice
            };
            let channel_stats =
                calc_stats_values(&lattice, &cube_stats::SPECTRAL_STATS, false);
            for (stats_type, values) in channel_stats {
                results
                    .entry(stats_type)
                    .or_insert_with(|| vec![f64::NAN; num_z])[i] = values[0];
            }
        }
        progress(1.0);
        Ok(results)
    }

    fn get_image_stats(&self, stokes: usize, z: usize) -> Option<LoaderStats> {
        self.plane_stats.get(&(stokes, z)).cloned()
    }
}
