//! Polarization vector-overlay tile stream.
//!
//! For every tile of the mip-downsampled raster the stream computes
//! polarized intensity and angle from the Stokes Q/U planes:
//!
//! ```text
//! pi = sqrt(max(0, Q² + U² - (q_err² + u_err²) / 2))   (debiasing)
//! pi = pi / I                                          (fractional)
//! pi ≤ threshold  ->  NaN
//! pa = 0.5 · atan2(U, Q)    radians; NaN wherever pi is NaN
//! ```
//!
//! A non-negative `stokes_intensity` / `stokes_angle` picks a raw plane
//! instead of the computed quantity. Tile pairs stream through the
//! callback with monotone progress ending at exactly 1.0, and identical
//! settings at an unchanged channel replay the cached tiles without any
//! loader read.

use crate::frame::Frame;
use cube_core::messages::{
    CompressionType, TileData, TilePayload, VectorOverlayTileData,
};
use cube_core::requests::VectorFieldSettings;
use cube_core::{
    get_tiles, tile_image_bounds, Error, ImageBounds, Result, Slicer, StokesType,
};
use cube_kernels::{block_smooth, compress, encode_nans_block};

impl Frame {
    /// Replaces the vector-overlay settings. Returns `true` when they
    /// changed (the cached tiles stay valid otherwise).
    pub fn set_vector_overlay_parameters(&self, settings: VectorFieldSettings) -> bool {
        let mut cache = self.vector_field.lock().expect("vector field");
        match &cache.settings {
            Some(current) if current.same_as(&settings) => false,
            _ => {
                cache.settings = Some(settings);
                cache.tiles.clear();
                true
            }
        }
    }

    /// Streams the vector-overlay tiles for the current channel.
    pub fn fill_vector_field(
        &self,
        mut callback: impl FnMut(VectorOverlayTileData),
    ) -> Result<bool> {
        let z = self.current_z();
        let (settings, replay) = {
            let cache = self.vector_field.lock().expect("vector field");
            let Some(settings) = cache.settings.clone() else {
                return Ok(false);
            };
            // identical settings and unchanged channel: replay the cache
            let replay = (cache.z == z && !cache.tiles.is_empty())
                .then(|| cache.tiles.clone());
            (settings, replay)
        };
        if let Some(tiles) = replay {
            for message in tiles {
                callback(message);
            }
            return Ok(true);
        }

        let _task = self.active_task_lock().read().expect("active task lock");
        let start = std::time::Instant::now();
        let mip = settings.mip.max(1);
        let tiles = get_tiles(self.width(), self.height(), mip);
        let num_tiles = tiles.len();
        let compute_pi = settings.stokes_intensity < 0;
        let compute_pa = settings.stokes_angle < 0;
        let need_qu = compute_pi || compute_pa;
        let need_i = compute_pi && settings.fractional;

        let mut produced = Vec::with_capacity(num_tiles);
        for (index, tile) in tiles.iter().enumerate() {
            if !self.is_connected() || self.current_z() != z {
                return Ok(false);
            }
            let bounds = tile_image_bounds(tile, self.width(), self.height(), mip);
            if bounds.width() <= 0 || bounds.height() <= 0 {
                continue;
            }

            let (q, u) = if need_qu {
                (
                    Some(self.downsampled_stokes_block(&bounds, mip, StokesType::Q, z)?),
                    Some(self.downsampled_stokes_block(&bounds, mip, StokesType::U, z)?),
                )
            } else {
                (None, None)
            };
            let i_block = if need_i {
                Some(self.downsampled_stokes_block(&bounds, mip, StokesType::I, z)?)
            } else {
                None
            };

            let out_w = (bounds.width() as usize).div_ceil(mip as usize);
            let out_h = (bounds.height() as usize).div_ceil(mip as usize);
            let cells = out_w * out_h;

            let mut pi = vec![f32::NAN; cells];
            let mut pa = vec![f32::NAN; cells];
            for idx in 0..cells {
                let (qv, uv) = match (&q, &u) {
                    (Some(q), Some(u)) => (q[idx] as f64, u[idx] as f64),
                    _ => (f64::NAN, f64::NAN),
                };
                let mut value = if settings.debiasing {
                    (qv * qv + uv * uv
                        - (settings.q_error * settings.q_error
                            + settings.u_error * settings.u_error)
                            / 2.0)
                        .max(0.0)
                        .sqrt()
                } else {
                    (qv * qv + uv * uv).sqrt()
                };
                if settings.fractional {
                    if let Some(i_block) = &i_block {
                        value /= i_block[idx] as f64;
                    }
                }
                if !settings.threshold.is_nan() && value <= settings.threshold {
                    value = f64::NAN;
                }
                pi[idx] = value as f32;
                pa[idx] = if value.is_nan() {
                    f32::NAN
                } else {
                    (0.5 * uv.atan2(qv)) as f32
                };
            }

            // raw-plane channels override the computed quantities
            if !compute_pi {
                pi = self.downsampled_plane_block(
                    &bounds,
                    mip,
                    settings.stokes_intensity,
                    z,
                    settings.threshold,
                )?;
            }
            if !compute_pa {
                pa = self.downsampled_plane_block(
                    &bounds,
                    mip,
                    settings.stokes_angle,
                    z,
                    settings.threshold,
                )?;
            }

            let progress = (index + 1) as f64 / num_tiles as f64;
            let message = VectorOverlayTileData {
                file_id: self.file_id(),
                channel: z,
                stokes_intensity: settings.stokes_intensity,
                stokes_angle: settings.stokes_angle,
                compression_type: if settings.compression_quality > 0.0 {
                    CompressionType::Zfp
                } else {
                    CompressionType::None
                },
                compression_quality: settings.compression_quality,
                progress,
                intensity_tiles: vec![make_tile(
                    tile.layer,
                    tile.x,
                    tile.y,
                    out_w,
                    out_h,
                    mip,
                    pi,
                    settings.compression_quality,
                )],
                angle_tiles: vec![make_tile(
                    tile.layer,
                    tile.x,
                    tile.y,
                    out_w,
                    out_h,
                    mip,
                    pa,
                    settings.compression_quality,
                )],
            };
            callback(message.clone());
            produced.push(message);
        }

        let mut cache = self.vector_field.lock().expect("vector field");
        cache.z = z;
        cache.tiles = produced;
        tracing::debug!(
            "vector field over {} tiles in {:.3} ms",
            num_tiles,
            start.elapsed().as_secs_f64() * 1e3
        );
        Ok(true)
    }

    /// Block-mean downsampled rectangle of a named Stokes plane.
    fn downsampled_stokes_block(
        &self,
        bounds: &ImageBounds,
        mip: i32,
        stokes_type: StokesType,
        z: usize,
    ) -> Result<Vec<f32>> {
        let index = self.stokes_index_of(stokes_type)?;
        self.downsampled_plane_block(bounds, mip, index, z, f64::NAN)
    }

    fn downsampled_plane_block(
        &self,
        bounds: &ImageBounds,
        mip: i32,
        stokes: i32,
        z: usize,
        threshold: f64,
    ) -> Result<Vec<f32>> {
        if stokes < 0 {
            return Err(Error::invalid_request("negative stokes for plane block"));
        }
        let (w, h) = (bounds.width() as usize, bounds.height() as usize);
        let slicer = Slicer::plane_region(
            bounds.x_min as usize,
            bounds.y_min as usize,
            w,
            h,
            z,
            0,
        );
        let full = self.get_slice_data(&slicer, stokes)?;

        let mip_u = mip.max(1) as usize;
        let out_w = w.div_ceil(mip_u);
        let out_h = h.div_ceil(mip_u);
        let mut down = vec![0.0f32; out_w * out_h];
        block_smooth(&full, &mut down, w, h, out_w, out_h, 0, 0, mip_u);

        if !threshold.is_nan() {
            for v in &mut down {
                if (*v as f64) <= threshold {
                    *v = f32::NAN;
                }
            }
        }
        Ok(down)
    }
}

#[allow(clippy::too_many_arguments)]
fn make_tile(
    layer: i32,
    x: i32,
    y: i32,
    width: usize,
    height: usize,
    mip: i32,
    mut values: Vec<f32>,
    quality: f32,
) -> TileData {
    let payload = if quality > 0.0 {
        let nan_encodings = encode_nans_block(&mut values, 0, width, height);
        let data = compress(&values, width, height, quality.round().max(1.0) as u32);
        TilePayload::Compressed {
            data,
            nan_encodings,
        }
    } else {
        TilePayload::Raw(values)
    };
    TileData {
        layer,
        x,
        y,
        width,
        height,
        mip,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::make_shape;
    use approx::assert_relative_eq;
    use cube_core::CoordinateSystem;
    use cube_io::MemoryLoader;

    /// A 4-stokes frame with constant Q = 0.3, U = 0.4, I = 1.0, V = 0.
    fn qu_frame(width: usize, height: usize) -> Frame {
        let shape = make_shape(width, height, 1, 4);
        let plane = width * height;
        let mut data = vec![0.0f32; shape.total_size()];
        data[..plane].fill(1.0); // I
        data[plane..2 * plane].fill(0.3); // Q
        data[2 * plane..3 * plane].fill(0.4); // U
        let loader =
            MemoryLoader::new("qu", shape, CoordinateSystem::pixel(), data).unwrap();
        Frame::new(0, Box::new(loader), "0").unwrap()
    }

    fn settings_s5() -> VectorFieldSettings {
        VectorFieldSettings {
            mip: 4,
            fractional: true,
            threshold: 0.1,
            debiasing: true,
            q_error: 1e-3,
            u_error: 1e-3,
            stokes_intensity: -1,
            stokes_angle: -1,
            compression_quality: 0.0,
        }
    }

    fn raw_values(tile: &TileData) -> &[f32] {
        match &tile.payload {
            TilePayload::Raw(values) => values,
            _ => panic!("expected raw payload"),
        }
    }

    #[test]
    fn test_s5_pi_pa_values() {
        let frame = qu_frame(64, 64);
        frame.set_vector_overlay_parameters(settings_s5());

        let mut messages = Vec::new();
        assert!(frame.fill_vector_field(|m| messages.push(m)).unwrap());
        let last = messages.last().unwrap();
        assert_relative_eq!(last.progress, 1.0);

        let pi = raw_values(&last.intensity_tiles[0]);
        let pa = raw_values(&last.angle_tiles[0]);
        // S5: pi = sqrt(0.09 + 0.16 - 1e-6) / 1.0, pa = 0.5 atan2(0.4, 0.3)
        assert_relative_eq!(pi[0], 0.499_999, epsilon = 1e-5);
        assert_relative_eq!(pa[0], 0.463_647_6, epsilon = 1e-5);
    }

    #[test]
    fn test_threshold_blanks_both() {
        let frame = qu_frame(32, 32);
        frame.set_vector_overlay_parameters(VectorFieldSettings {
            threshold: 0.6,
            ..settings_s5()
        });
        let mut messages = Vec::new();
        frame.fill_vector_field(|m| messages.push(m)).unwrap();
        let last = messages.last().unwrap();
        assert!(raw_values(&last.intensity_tiles[0]).iter().all(|v| v.is_nan()));
        assert!(raw_values(&last.angle_tiles[0]).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_identical_settings_replay_cache() {
        let frame = qu_frame(32, 32);
        frame.set_vector_overlay_parameters(settings_s5());

        let mut first = Vec::new();
        frame.fill_vector_field(|m| first.push(m)).unwrap();

        // same settings again: unchanged, replayed from cache
        assert!(!frame.set_vector_overlay_parameters(settings_s5()));
        let mut second = Vec::new();
        frame.fill_vector_field(|m| second.push(m)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_changed_settings_recompute() {
        let frame = qu_frame(32, 32);
        frame.set_vector_overlay_parameters(settings_s5());
        let mut first = Vec::new();
        frame.fill_vector_field(|m| first.push(m)).unwrap();

        assert!(frame.set_vector_overlay_parameters(VectorFieldSettings {
            fractional: false,
            ..settings_s5()
        }));
        let mut second = Vec::new();
        frame.fill_vector_field(|m| second.push(m)).unwrap();
        assert_ne!(
            raw_values(&first.last().unwrap().intensity_tiles[0])[0],
            raw_values(&second.last().unwrap().intensity_tiles[0])[0],
        );
    }

    #[test]
    fn test_progress_monotone() {
        let frame = qu_frame(1110, 1110);
        frame.set_vector_overlay_parameters(VectorFieldSettings {
            mip: 4,
            ..settings_s5()
        });
        let mut progresses = Vec::new();
        frame
            .fill_vector_field(|m| progresses.push(m.progress))
            .unwrap();
        // S2 tile arithmetic: ceil(ceil(1110/4) / 256)^2 tiles
        let downsampled = 1110usize.div_ceil(4);
        let expected = downsampled.div_ceil(256).pow(2);
        assert_eq!(progresses.len(), expected);
        assert!(progresses.windows(2).all(|w| w[0] <= w[1]));
        assert_relative_eq!(*progresses.last().unwrap(), 1.0);
    }

    #[test]
    fn test_no_settings_declines() {
        let frame = qu_frame(16, 16);
        assert!(!frame.fill_vector_field(|_| ()).unwrap());
    }
}
