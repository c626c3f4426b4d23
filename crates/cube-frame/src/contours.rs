//! Contour tracing over the current channel.
//!
//! The grid handed to the tracer is the raw channel, a Gaussian-smoothed
//! copy, or a block-averaged copy. Scale and offset are passed through to
//! the tracer so chunked contour vertices arrive in source pixel
//! coordinates: block averaging multiplies by the mip, Gaussian smoothing
//! shifts by the kernel half-width it consumed.

use crate::frame::Frame;
use cube_core::messages::{ContourImageData, ContourSet};
use cube_core::requests::{ContourSettings, SmoothingMode};
use cube_core::{ImageBounds, Result};
use cube_kernels::{gaussian_smooth, trace_contours};

impl Frame {
    /// Replaces the contour settings. Returns `true` when they changed.
    pub fn set_contour_parameters(&self, settings: ContourSettings) -> bool {
        let mut current = self.contour_settings.lock().expect("contour settings");
        if *current == settings {
            false
        } else {
            *current = settings;
            true
        }
    }

    /// Traces the configured levels, streaming chunks through `callback`.
    pub fn contour_image(
        &self,
        mut callback: impl FnMut(ContourImageData),
    ) -> Result<bool> {
        let settings = self.contour_settings.lock().expect("contour settings").clone();
        if settings.levels.is_empty() {
            return Ok(false);
        }
        let _task = self.active_task_lock().read().expect("active task lock");

        // contours always work from a fresh channel cache
        self.fill_image_cache()?;
        let (z, stokes) = (self.current_z(), self.current_stokes());
        let (width, height) = (self.width(), self.height());

        let (grid, grid_w, grid_h, scale, offset) = match settings.smoothing_mode {
            SmoothingMode::None => {
                let data = self.with_channel_cache(|cache| cache.data().to_vec());
                (data, width, height, 1.0, 0.0)
            }
            SmoothingMode::Gaussian if settings.smoothing_factor > 1 => {
                let half_width = (settings.smoothing_factor - 1) as usize;
                let dw = width.saturating_sub(2 * half_width);
                let dh = height.saturating_sub(2 * half_width);
                if dw == 0 || dh == 0 {
                    return Ok(false);
                }
                let src = self.with_channel_cache(|cache| cache.data().to_vec());
                let mut dst = vec![0.0f32; dw * dh];
                gaussian_smooth(
                    &src,
                    &mut dst,
                    width,
                    height,
                    dw,
                    dh,
                    settings.smoothing_factor as usize,
                )?;
                (dst, dw, dh, 1.0, half_width as f64)
            }
            SmoothingMode::BlockAverage if settings.smoothing_factor > 1 => {
                let bounds = ImageBounds::full(width, height);
                let (data, dw, dh) =
                    self.get_raster_data(&bounds, settings.smoothing_factor, true)?;
                (data, dw, dh, settings.smoothing_factor as f64, 0.0)
            }
            _ => {
                let data = self.with_channel_cache(|cache| cache.data().to_vec());
                (data, width, height, 1.0, 0.0)
            }
        };

        let file_id = self.file_id();
        let mut cancelled = false;
        let mut emit = |level: f64, vertices: &[f32], indices: &[i32], progress: f64| {
            if !self.is_connected() || self.z_stokes_changed(z, stokes) {
                cancelled = true;
                return;
            }
            callback(ContourImageData {
                file_id,
                channel: z,
                stokes,
                progress,
                contour_sets: vec![ContourSet {
                    level,
                    decimation_factor: settings.decimation_factor,
                    vertices: vertices.to_vec(),
                    start_indices: indices.to_vec(),
                }],
            });
        };
        trace_contours(
            &grid,
            grid_w,
            grid_h,
            scale,
            offset,
            offset,
            &settings.levels,
            settings.chunk_size,
            &mut emit,
        );
        Ok(!cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{frame_with, make_shape};
    use cube_core::CoordinateSystem;

    fn step_frame(width: usize, height: usize) -> Frame {
        // left half 0, right half 1
        let data: Vec<f32> = (0..width * height)
            .map(|i| if i % width < width / 2 { 0.0 } else { 1.0 })
            .collect();
        frame_with(width, height, 1, 1, data, CoordinateSystem::pixel())
    }

    fn settings(mode: SmoothingMode, factor: i32) -> ContourSettings {
        ContourSettings {
            levels: vec![0.5],
            smoothing_mode: mode,
            smoothing_factor: factor,
            ..Default::default()
        }
    }

    #[test]
    fn test_raw_contour_positions() {
        let frame = step_frame(32, 32);
        frame.set_contour_parameters(settings(SmoothingMode::None, 1));

        let mut vertices = Vec::new();
        let mut final_progress = 0.0;
        frame
            .contour_image(|msg| {
                for set in &msg.contour_sets {
                    vertices.extend_from_slice(&set.vertices);
                }
                final_progress = msg.progress;
            })
            .unwrap();

        assert!(!vertices.is_empty());
        assert_eq!(final_progress, 1.0);
        // the 0.5 level sits halfway between columns 15 and 16
        for pair in vertices.chunks(2) {
            assert!((pair[0] - 15.5).abs() < 1e-5);
        }
    }

    #[test]
    fn test_block_average_scales_coordinates() {
        let frame = step_frame(64, 64);
        frame.set_contour_parameters(settings(SmoothingMode::BlockAverage, 4));

        let mut xs = Vec::new();
        frame
            .contour_image(|msg| {
                for set in &msg.contour_sets {
                    for pair in set.vertices.chunks(2) {
                        xs.push(pair[0]);
                    }
                }
            })
            .unwrap();

        assert!(!xs.is_empty());
        // downsampled crossing near column 7.5 scaled by mip 4 -> 30
        for x in xs {
            assert!((x - 30.0).abs() < 4.0, "vertex x = {x}");
        }
    }

    #[test]
    fn test_gaussian_offset_restores_coordinates() {
        let frame = step_frame(64, 64);
        frame.set_contour_parameters(settings(SmoothingMode::Gaussian, 3));

        let mut xs = Vec::new();
        frame
            .contour_image(|msg| {
                for set in &msg.contour_sets {
                    for pair in set.vertices.chunks(2) {
                        xs.push(pair[0]);
                    }
                }
            })
            .unwrap();
        assert!(!xs.is_empty());
        // the halo offset re-centers crossings near the original column
        for x in xs {
            assert!((x - 31.5).abs() < 3.0, "vertex x = {x}");
        }
    }

    #[test]
    fn test_no_levels_declines() {
        let frame = step_frame(8, 8);
        frame.set_contour_parameters(ContourSettings::default());
        assert!(!frame.contour_image(|_| ()).unwrap());
    }

    #[test]
    fn test_settings_change_detection() {
        let frame = step_frame(8, 8);
        let s = settings(SmoothingMode::None, 1);
        assert!(frame.set_contour_parameters(s.clone()));
        assert!(!frame.set_contour_parameters(s));
    }

    #[test]
    fn test_empty_grid_after_smoothing_declines() {
        let shape = make_shape(4, 4, 1, 1);
        let frame = frame_with(
            shape.width(),
            shape.height(),
            1,
            1,
            vec![0.0; 16],
            CoordinateSystem::pixel(),
        );
        frame.set_contour_parameters(settings(SmoothingMode::Gaussian, 5));
        assert!(!frame.contour_image(|_| ()).unwrap());
    }
}
