//! Cursor spatial profiles.
//!
//! One profile is a row or column cut through the cursor, optionally
//! decimated to a client `mip`. Extraction picks the cheapest of four
//! paths: a stored loader mipmap, tile-cache stitching, the channel
//! cache, and a direct slice for non-current (or computed) Stokes.
//!
//! Without a native mipmap, decimation preserves extrema: every bucket of
//! `2·mip` cells is replaced by its (min, max) pair in order of
//! occurrence, so peaks survive the downsample.

use crate::frame::{Frame, PointXy};
use cube_core::messages::{SpatialProfile, SpatialProfileData};
use cube_core::requests::SpatialConfig;
use cube_core::{
    aligned_index, is_computed_stokes, Error, ImageBounds, ProfileAxis, Result, Slicer,
    CHUNK_SIZE, CURSOR_REGION_ID,
};

impl Frame {
    /// Replaces the cursor spatial requirements.
    pub fn set_spatial_requirements(&self, configs: Vec<SpatialConfig>) {
        *self.spatial_configs.lock().expect("spatial configs") = configs;
    }

    /// Produces spatial profiles at the current cursor, one per
    /// requirement. `Ok(None)` when the cursor is outside the image.
    pub fn fill_spatial_profile_data(&self) -> Result<Option<SpatialProfileData>> {
        let configs = self.spatial_configs.lock().expect("spatial configs").clone();
        if configs.is_empty() {
            return Ok(None);
        }
        self.fill_spatial_profile_data_at(self.cursor(), &configs, CURSOR_REGION_ID)
    }

    /// Produces spatial profiles at an arbitrary point (cursor or point
    /// region).
    pub fn fill_spatial_profile_data_at(
        &self,
        point: PointXy,
        configs: &[SpatialConfig],
        region_id: i32,
    ) -> Result<Option<SpatialProfileData>> {
        if !point.in_image(self.width(), self.height()) {
            return Ok(None);
        }
        let start_time = std::time::Instant::now();
        let (x_index, y_index) = point.to_index();
        let (z, current_stokes) = (self.current_z(), self.current_stokes());

        // cursor value from the channel cache when it has the plane
        let value = self.with_channel_cache(|cache| {
            cache
                .available(z, current_stokes)
                .then(|| cache.get_value(x_index, y_index))
        });
        let value = match value {
            Some(v) => v,
            None => {
                let slicer = Slicer::plane_region(x_index, y_index, 1, 1, z, 0);
                self.get_slice_data(&slicer, current_stokes)?[0]
            }
        };

        let mut profiles = Vec::with_capacity(configs.len());
        for config in configs {
            let axis = Frame::profile_axis(&config.coordinate)?;
            if axis == ProfileAxis::Z {
                continue; // spectral requirements are not spatial configs
            }
            let stokes = self.get_stokes_type_index(&config.coordinate)?;
            match self.extract_spatial_profile(config, axis, stokes, point) {
                Ok(profile) => profiles.push(profile),
                Err(err) if err.is_cancelled() => return Ok(None),
                Err(err) => return Err(err),
            }
        }

        tracing::debug!(
            "filled {} spatial profiles in {:.3} ms",
            profiles.len(),
            start_time.elapsed().as_secs_f64() * 1e3
        );
        Ok(Some(SpatialProfileData {
            file_id: self.file_id(),
            region_id,
            x: point.x,
            y: point.y,
            channel: z,
            stokes: current_stokes,
            value,
            profiles,
        }))
    }

    fn extract_spatial_profile(
        &self,
        config: &SpatialConfig,
        axis: ProfileAxis,
        stokes: i32,
        point: PointXy,
    ) -> Result<SpatialProfile> {
        let (x_index, y_index) = point.to_index();
        let full_length = match axis {
            ProfileAxis::X => self.width(),
            _ => self.height(),
        };
        let start = config.start.min(full_length);
        let end = if config.end == 0 {
            full_length
        } else {
            config.end.min(full_length)
        };
        if start >= end {
            return Err(Error::invalid_request("empty spatial profile window"));
        }
        let mip = config.mip.max(1);
        let z = self.current_z();

        // (values at full resolution, or mipmap-decimated already)
        let mut native_mip = false;
        let values: Vec<f32> = if mip >= 2
            && !is_computed_stokes(stokes)
            && self.with_loader(|loader| loader.has_mip(mip))
        {
            native_mip = true;
            self.mipmap_profile(axis, stokes, start, end, mip, x_index, y_index)?
        } else if stokes == self.current_stokes() && self.uses_tile_cache() {
            self.tile_stitched_profile(axis, start, end, point)?
        } else if stokes == self.current_stokes() {
            self.fill_image_cache()?;
            self.with_channel_cache(|cache| match axis {
                ProfileAxis::X => (start..end).map(|x| cache.get_value(x, y_index)).collect(),
                _ => (start..end).map(|y| cache.get_value(x_index, y)).collect(),
            })
        } else {
            let slicer = match axis {
                ProfileAxis::X => Slicer::plane_region(start, y_index, end - start, 1, z, 0),
                _ => Slicer::plane_region(x_index, start, 1, end - start, z, 0),
            };
            self.get_slice_data(&slicer, stokes)?
        };

        let values = if mip >= 2 && !native_mip {
            decimate_min_max(&values, mip as usize)
        } else {
            values
        };

        let desc = match axis {
            ProfileAxis::X => &self.coordinate_system().x,
            _ => &self.coordinate_system().y,
        };
        Ok(SpatialProfile {
            coordinate: config.coordinate.clone(),
            start,
            end,
            mip,
            values,
            crpix: desc.crpix,
            crval: desc.crval,
            cdelt: desc.cdelt,
            unit: desc.cunit.clone(),
        })
    }

    fn mipmap_profile(
        &self,
        axis: ProfileAxis,
        stokes: i32,
        start: usize,
        end: usize,
        mip: i32,
        x_index: usize,
        y_index: usize,
    ) -> Result<Vec<f32>> {
        let mip_u = mip as usize;
        let z = self.current_z();
        // one mip row (or column) containing the point
        let bounds = match axis {
            ProfileAxis::X => ImageBounds::new(
                start as i32,
                end as i32,
                aligned_index(y_index as i32, mip_u),
                (aligned_index(y_index as i32, mip_u) + mip).min(self.height() as i32),
            ),
            _ => ImageBounds::new(
                aligned_index(x_index as i32, mip_u),
                (aligned_index(x_index as i32, mip_u) + mip).min(self.width() as i32),
                start as i32,
                end as i32,
            ),
        };
        let mut buf = Vec::new();
        self.with_loader(|loader| {
            loader.get_downsampled_raster_data(&mut buf, z, stokes.max(0) as usize, &bounds, mip)
        })
        .map_err(Error::from)?;
        Ok(buf)
    }

    /// Stitches a row/column from cached tiles.
    ///
    /// Interrupt contract: when no other profile holds the latch, a
    /// cursor that leaves the profile's chunk row (or column) aborts the
    /// stitch early. Best effort only; never a correctness barrier.
    fn tile_stitched_profile(
        &self,
        axis: ProfileAxis,
        start: usize,
        end: usize,
        point: PointXy,
    ) -> Result<Vec<f32>> {
        // owning the latch means no other profile is mid-read, so cursor
        // interrupts can be ignored for this stitch
        let latch = self.spatial_interrupt_latch.try_lock();
        let ignore_interrupt = latch.is_ok();
        let (x_index, y_index) = point.to_index();

        let mut values = vec![f32::NAN; end - start];
        let mut pos = aligned_index(start as i32, cube_core::TILE_SIZE) as usize;
        while pos < end {
            if !ignore_interrupt {
                let cursor = self.cursor();
                let moved = match axis {
                    ProfileAxis::X => {
                        aligned_index(cursor.y.round() as i32, CHUNK_SIZE)
                            != aligned_index(y_index as i32, CHUNK_SIZE)
                    }
                    _ => {
                        aligned_index(cursor.x.round() as i32, CHUNK_SIZE)
                            != aligned_index(x_index as i32, CHUNK_SIZE)
                    }
                };
                if moved {
                    return Err(Error::cancelled("spatial profile"));
                }
            }

            let key = match axis {
                ProfileAxis::X => (
                    pos as i32,
                    aligned_index(y_index as i32, cube_core::TILE_SIZE),
                ),
                _ => (
                    aligned_index(x_index as i32, cube_core::TILE_SIZE),
                    pos as i32,
                ),
            };
            let tile = self.get_cached_tile(key)?;
            let tile_w = cube_core::TILE_SIZE.min(self.width() - key.0 as usize);
            let tile_h = cube_core::TILE_SIZE.min(self.height() - key.1 as usize);

            match axis {
                ProfileAxis::X => {
                    let row = y_index - key.1 as usize;
                    let copy_start = start.max(pos);
                    let copy_end = end.min(pos + tile_w);
                    for x in copy_start..copy_end {
                        values[x - start] = tile[row * tile_w + (x - pos)];
                    }
                }
                _ => {
                    let col = x_index - key.0 as usize;
                    let copy_start = start.max(pos);
                    let copy_end = end.min(pos + tile_h);
                    for y in copy_start..copy_end {
                        values[y - start] = tile[(y - pos) * tile_w + col];
                    }
                }
            }
            pos += cube_core::TILE_SIZE;
        }
        Ok(values)
    }
}

/// Extrema-preserving decimation: each bucket of `2·mip` cells becomes
/// its (min, max) pair, emitted in order of occurrence.
pub fn decimate_min_max(values: &[f32], mip: usize) -> Vec<f32> {
    let bucket = 2 * mip;
    let mut out = Vec::with_capacity(values.len().div_ceil(bucket) * 2);
    for chunk in values.chunks(bucket) {
        let mut min_idx: Option<usize> = None;
        let mut max_idx: Option<usize> = None;
        for (i, &v) in chunk.iter().enumerate() {
            if v.is_nan() {
                continue;
            }
            if min_idx.is_none_or(|m| v < chunk[m]) {
                min_idx = Some(i);
            }
            if max_idx.is_none_or(|m| v > chunk[m]) {
                max_idx = Some(i);
            }
        }
        match (min_idx, max_idx) {
            (Some(lo), Some(hi)) => {
                if lo <= hi {
                    out.push(chunk[lo]);
                    out.push(chunk[hi]);
                } else {
                    out.push(chunk[hi]);
                    out.push(chunk[lo]);
                }
            }
            _ => {
                out.push(f32::NAN);
                out.push(f32::NAN);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_shape, ramp_frame};
    use approx::assert_relative_eq;
    use cube_core::CoordinateSystem;
    use cube_io::MemoryLoader;

    fn config(coordinate: &str, mip: i32) -> SpatialConfig {
        SpatialConfig {
            coordinate: coordinate.to_string(),
            start: 0,
            end: 0,
            mip,
            width: 0,
        }
    }

    #[test]
    fn test_full_resolution_profiles() {
        let frame = ramp_frame(16, 16, 1, 1);
        frame.set_cursor(3.0, 5.0);
        frame.set_spatial_requirements(vec![config("x", 1), config("y", 1)]);

        let data = frame.fill_spatial_profile_data().unwrap().unwrap();
        assert_relative_eq!(data.value, (5 * 16 + 3) as f32);
        assert_eq!(data.profiles.len(), 2);

        let x_profile = &data.profiles[0];
        assert_eq!(x_profile.values.len(), 16);
        assert_relative_eq!(x_profile.values[0], (5 * 16) as f32);
        assert_relative_eq!(x_profile.values[15], (5 * 16 + 15) as f32);

        let y_profile = &data.profiles[1];
        assert_eq!(y_profile.values.len(), 16);
        assert_relative_eq!(y_profile.values[7], (7 * 16 + 3) as f32);
    }

    #[test]
    fn test_cursor_outside_image_is_none() {
        let frame = ramp_frame(8, 8, 1, 1);
        frame.set_cursor(20.0, 2.0);
        frame.set_spatial_requirements(vec![config("x", 1)]);
        assert!(frame.fill_spatial_profile_data().unwrap().is_none());
    }

    #[test]
    fn test_fixed_stokes_profile() {
        let frame = ramp_frame(8, 8, 2, 4);
        frame.set_cursor(2.0, 2.0);
        frame.set_spatial_requirements(vec![config("Qx", 1)]);
        let data = frame.fill_spatial_profile_data().unwrap().unwrap();
        // stokes Q = index 1: plane offset = 1 * depth * 64
        let q_offset = (2 * 64) as f32;
        assert_relative_eq!(data.profiles[0].values[0], q_offset + (2 * 8) as f32);
    }

    #[test]
    fn test_decimate_min_max_pairs() {
        let values = [5.0f32, 1.0, 3.0, 9.0, 2.0, 2.0, 2.0, 2.0];
        let out = decimate_min_max(&values, 2);
        // bucket [5,1,3,9]: min 1 (idx 1) before max 9 (idx 3)
        assert_eq!(out[0], 1.0);
        assert_eq!(out[1], 9.0);
        // constant bucket
        assert_eq!(out[2], 2.0);
        assert_eq!(out[3], 2.0);
    }

    #[test]
    fn test_decimate_preserves_occurrence_order() {
        let values = [9.0f32, 0.0, 1.0, 1.0];
        let out = decimate_min_max(&values, 2);
        // max 9 occurs before min 0
        assert_eq!(out, vec![9.0, 0.0]);
    }

    #[test]
    fn test_decimate_all_nan_bucket() {
        let values = [f32::NAN; 4];
        let out = decimate_min_max(&values, 2);
        assert!(out.iter().all(|v| v.is_nan()));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_decimated_profile_length() {
        let frame = ramp_frame(64, 64, 1, 1);
        frame.set_cursor(0.0, 0.0);
        frame.set_spatial_requirements(vec![config("x", 4)]);
        let data = frame.fill_spatial_profile_data().unwrap().unwrap();
        // 64 cells in buckets of 8 -> 8 buckets -> 16 outputs
        assert_eq!(data.profiles[0].values.len(), 16);
        assert_eq!(data.profiles[0].mip, 4);
    }

    #[test]
    fn test_mipmap_shortcut_used() {
        let shape = make_shape(64, 64, 1, 1);
        let data: Vec<f32> = (0..64 * 64).map(|i| i as f32).collect();
        let loader = MemoryLoader::new("mips", shape, CoordinateSystem::pixel(), data)
            .unwrap()
            .with_mipmaps(&[4]);
        let frame = Frame::new(0, Box::new(loader), "0").unwrap();
        frame.set_cursor(1.0, 1.0);
        frame.set_spatial_requirements(vec![config("x", 4)]);

        let data = frame.fill_spatial_profile_data().unwrap().unwrap();
        // native mipmap: 16 block means, not 32 min/max pairs
        assert_eq!(data.profiles[0].values.len(), 16);
        // first 4x4 block mean of the ramp rows 0..4
        let expected: f32 = (0..4)
            .flat_map(|y| (0..4).map(move |x| (y * 64 + x) as f32))
            .sum::<f32>()
            / 16.0;
        assert_relative_eq!(data.profiles[0].values[0], expected);
    }

    #[test]
    fn test_tile_cache_stitched_profile() {
        let shape = make_shape(600, 600, 1, 1);
        let data: Vec<f32> = (0..600 * 600).map(|i| i as f32).collect();
        let loader = MemoryLoader::new("tiles", shape, CoordinateSystem::pixel(), data)
            .unwrap()
            .with_tile_cache();
        let frame = Frame::new(0, Box::new(loader), "0").unwrap();
        frame.set_cursor(300.0, 10.0);
        frame.set_spatial_requirements(vec![config("x", 1)]);

        let data = frame.fill_spatial_profile_data().unwrap().unwrap();
        let profile = &data.profiles[0];
        assert_eq!(profile.values.len(), 600);
        assert_relative_eq!(profile.values[0], (10 * 600) as f32);
        assert_relative_eq!(profile.values[599], (10 * 600 + 599) as f32);
    }
}
