//! Cursor spectral profiles with incremental delivery.
//!
//! A spectral profile walks the z axis under the cursor in adaptively
//! sized chunks: the first chunk measures wall time and retunes the
//! chunk size toward [`TARGET_DELTA_TIME_MS`], which bounds cancellation
//! latency independent of cube depth. Partial messages go out no more
//! often than [`TARGET_PARTIAL_CURSOR_TIME_MS`]; the terminal message
//! carries progress exactly 1.0.
//!
//! Cancellation sources, polled before every chunk: cursor moved, frame
//! disconnected, requirement removed. A Stokes change skips fixed-Stokes
//! configs but leaves the current-Stokes ("z") profile running.

use crate::frame::Frame;
use cube_core::messages::{
    ProfileValues, SpectralProfile, SpectralProfileData, StatsType,
};
use cube_core::requests::SpectralConfig;
use cube_core::{
    is_computed_stokes, Error, Result, Slicer, CURSOR_REGION_ID, INIT_DELTA_Z,
    TARGET_DELTA_TIME_MS, TARGET_PARTIAL_CURSOR_TIME_MS,
};

impl Frame {
    /// Replaces the cursor spectral requirements. Only the cursor region
    /// may carry spectral requirements on a frame.
    pub fn set_spectral_requirements(
        &self,
        region_id: i32,
        configs: Vec<SpectralConfig>,
    ) -> Result<()> {
        if region_id != CURSOR_REGION_ID {
            return Err(Error::invalid_request(
                "frame spectral requirements are cursor-only",
            ));
        }
        *self.spectral_configs.lock().expect("spectral configs") = configs;
        Ok(())
    }

    /// Whether a config is still part of the requirements (removal is a
    /// cancellation source).
    pub fn has_spectral_config(&self, config: &SpectralConfig) -> bool {
        self.spectral_configs
            .lock()
            .expect("spectral configs")
            .iter()
            .any(|c| c == config)
    }

    /// Streams cursor spectral profiles through `callback`.
    ///
    /// Returns `Ok(false)` when the stream was cancelled (cursor moved or
    /// frame closed); no terminal message is emitted in that case.
    pub fn fill_spectral_profile_data(
        &self,
        mut callback: impl FnMut(SpectralProfileData),
        stokes_changed: bool,
    ) -> Result<bool> {
        if self.shape().spectral_axis().is_none() {
            return Ok(false);
        }
        let configs = self.spectral_configs.lock().expect("spectral configs").clone();
        if configs.is_empty() {
            return Ok(false);
        }

        let _task = self.active_task_lock().read().expect("active task lock");
        let start_cursor = self.cursor();
        let start_time = std::time::Instant::now();

        for config in &configs {
            if self.cursor() != start_cursor || !self.is_connected() {
                return Ok(false);
            }
            if !self.has_spectral_config(config) {
                return Ok(false);
            }
            if config.coordinate != "z" && stokes_changed {
                continue; // fixed-stokes profile is unaffected by the change
            }
            if !start_cursor.in_image(self.width(), self.height()) {
                continue;
            }

            let stokes = self.get_stokes_type_index(&config.coordinate)?;
            let stats_type = config.stats_types.first().copied().unwrap_or(StatsType::Sum);
            let (x_index, y_index) = start_cursor.to_index();

            // swizzled-layout fast path
            if !is_computed_stokes(stokes) {
                let fast = self.with_loader(|loader| {
                    if loader.has_cursor_spectral_data() {
                        let mut buf = Vec::new();
                        loader
                            .get_cursor_spectral_data(
                                &mut buf,
                                stokes.max(0) as usize,
                                x_index,
                                y_index,
                            )
                            .ok()
                            .map(|_| buf)
                    } else {
                        None
                    }
                });
                if let Some(values) = fast {
                    callback(self.spectral_message(
                        config,
                        stats_type,
                        values,
                        1.0,
                    ));
                    continue;
                }
            }

            if !self.stream_sliced_spectral_profile(
                config,
                stats_type,
                stokes,
                (x_index, y_index),
                &start_cursor,
                &mut callback,
            )? {
                return Ok(false);
            }
        }

        tracing::debug!(
            "filled cursor spectral profiles in {:.3} ms",
            start_time.elapsed().as_secs_f64() * 1e3
        );
        Ok(true)
    }

    /// The slow path: read z-range slices with adaptive chunking.
    fn stream_sliced_spectral_profile(
        &self,
        config: &SpectralConfig,
        stats_type: StatsType,
        stokes: i32,
        (x_index, y_index): (usize, usize),
        start_cursor: &crate::frame::PointXy,
        callback: &mut impl FnMut(SpectralProfileData),
    ) -> Result<bool> {
        let profile_size = self.depth();
        let mut spectral_data = vec![f32::NAN; profile_size];
        let mut delta_z = INIT_DELTA_Z;
        let mut z = 0usize;
        let mut progress = 0.0f64;
        let mut first_slice = true;
        let mut last_update = std::time::Instant::now();

        while progress < 1.0 {
            let slice_start = std::time::Instant::now();
            let nz = delta_z.min(profile_size - z);
            let slicer = Slicer::spectrum(x_index, y_index, z, z + nz - 1, 0);
            let buffer = self.get_slice_data(&slicer, stokes)?;
            spectral_data[z..z + nz].copy_from_slice(&buffer);
            z += nz;
            progress = z as f64 / profile_size as f64;

            // retune the chunk once, toward the target slice time
            if first_slice {
                first_slice = false;
                let dt_ms = slice_start.elapsed().as_secs_f64() * 1e3;
                if dt_ms > 0.0 {
                    let scaled = (delta_z as f64 * TARGET_DELTA_TIME_MS / dt_ms) as usize;
                    delta_z = scaled.clamp(1, profile_size);
                }
            }

            if self.cursor() != *start_cursor || !self.is_connected() {
                return Ok(false);
            }
            if !self.has_spectral_config(config) {
                // requirement removed cancels this profile only
                return Ok(true);
            }

            if progress >= 1.0 {
                callback(self.spectral_message(config, stats_type, spectral_data.clone(), 1.0));
            } else if last_update.elapsed().as_secs_f64() * 1e3
                > TARGET_PARTIAL_CURSOR_TIME_MS
            {
                last_update = std::time::Instant::now();
                callback(self.spectral_message(
                    config,
                    stats_type,
                    spectral_data.clone(),
                    progress,
                ));
            }
        }
        Ok(true)
    }

    fn spectral_message(
        &self,
        config: &SpectralConfig,
        stats_type: StatsType,
        values: Vec<f32>,
        progress: f64,
    ) -> SpectralProfileData {
        SpectralProfileData {
            file_id: self.file_id(),
            region_id: CURSOR_REGION_ID,
            stokes: self.current_stokes(),
            progress,
            profiles: vec![SpectralProfile {
                coordinate: config.coordinate.clone(),
                stats_type,
                values: ProfileValues::F32(values),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ramp_frame, swizzled_frame};
    use approx::assert_relative_eq;

    fn z_config() -> SpectralConfig {
        SpectralConfig::new("z", vec![StatsType::Sum])
    }

    fn collect(frame: &Frame, stokes_changed: bool) -> (Vec<SpectralProfileData>, bool) {
        let mut messages = Vec::new();
        let completed = frame
            .fill_spectral_profile_data(|m| messages.push(m), stokes_changed)
            .unwrap();
        (messages, completed)
    }

    #[test]
    fn test_profile_reaches_terminal_progress() {
        let frame = ramp_frame(8, 8, 25, 1);
        frame.set_cursor(3.0, 3.0);
        frame
            .set_spectral_requirements(CURSOR_REGION_ID, vec![z_config()])
            .unwrap();

        let (messages, completed) = collect(&frame, false);
        assert!(completed);
        let last = messages.last().unwrap();
        assert_relative_eq!(last.progress, 1.0);

        match &last.profiles[0].values {
            ProfileValues::F32(values) => {
                assert_eq!(values.len(), 25);
                // pixel (3,3) of channel z is z*64 + 27
                assert_relative_eq!(values[0], 27.0);
                assert_relative_eq!(values[24], (24 * 64 + 27) as f32);
            }
            _ => panic!("cursor profiles are f32"),
        }
    }

    #[test]
    fn test_progress_is_monotone() {
        let frame = ramp_frame(8, 8, 50, 1);
        frame.set_cursor(0.0, 0.0);
        frame
            .set_spectral_requirements(CURSOR_REGION_ID, vec![z_config()])
            .unwrap();
        let (messages, _) = collect(&frame, false);
        let progresses: Vec<f64> = messages.iter().map(|m| m.progress).collect();
        assert!(progresses.windows(2).all(|w| w[0] <= w[1]));
        assert_relative_eq!(*progresses.last().unwrap(), 1.0);
    }

    #[test]
    fn test_no_spectral_axis_declines() {
        let frame = ramp_frame(8, 8, 1, 1);
        frame
            .set_spectral_requirements(CURSOR_REGION_ID, vec![z_config()])
            .unwrap();
        let (messages, completed) = collect(&frame, false);
        assert!(!completed);
        assert!(messages.is_empty());
    }

    #[test]
    fn test_cursor_outside_image_no_messages() {
        let frame = ramp_frame(8, 8, 10, 1);
        frame.set_cursor(100.0, 3.0);
        frame
            .set_spectral_requirements(CURSOR_REGION_ID, vec![z_config()])
            .unwrap();
        let (messages, completed) = collect(&frame, false);
        assert!(completed);
        assert!(messages.is_empty());
    }

    #[test]
    fn test_fixed_stokes_skipped_on_stokes_change() {
        let frame = ramp_frame(8, 8, 5, 4);
        frame.set_cursor(1.0, 1.0);
        frame
            .set_spectral_requirements(
                CURSOR_REGION_ID,
                vec![SpectralConfig::new("Qz", vec![StatsType::Sum])],
            )
            .unwrap();
        let (messages, completed) = collect(&frame, true);
        assert!(completed);
        assert!(messages.is_empty());

        // unchanged stokes delivers it
        let (messages, _) = collect(&frame, false);
        assert_eq!(messages.last().unwrap().profiles[0].coordinate, "Qz");
    }

    #[test]
    fn test_swizzled_fast_path() {
        let frame = swizzled_frame(8, 8, 25, 1);
        frame.set_cursor(4.0, 4.0);
        frame
            .set_spectral_requirements(CURSOR_REGION_ID, vec![z_config()])
            .unwrap();
        let (messages, completed) = collect(&frame, false);
        assert!(completed);
        // the fast path emits exactly one terminal message
        assert_eq!(messages.len(), 1);
        assert_relative_eq!(messages[0].progress, 1.0);
    }

    #[test]
    fn test_computed_stokes_profile() {
        let frame = ramp_frame(4, 4, 3, 4);
        frame.set_cursor(0.0, 0.0);
        frame
            .set_spectral_requirements(
                CURSOR_REGION_ID,
                vec![SpectralConfig::new("Plinearz", vec![StatsType::Sum])],
            )
            .unwrap();
        let (messages, completed) = collect(&frame, false);
        assert!(completed);
        let last = messages.last().unwrap();
        match &last.profiles[0].values {
            ProfileValues::F32(values) => {
                // Q plane offset 1*3*16, U plane offset 2*3*16 at (0,0)
                let q = (3 * 16) as f32;
                let u = (2 * 3 * 16) as f32;
                assert_relative_eq!(values[0], (q * q + u * u).sqrt(), epsilon = 1e-3);
            }
            _ => panic!("expected f32 values"),
        }
    }
}
