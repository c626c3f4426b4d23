//! Region spectral profile streams.
//!
//! A region spectral profile is a vector of per-channel statistics over
//! the region mask. The stream initializes every requested statistic to
//! NaN over the full depth, fills it in adaptively sized z-chunks, and
//! emits partial messages no more often than
//! [`TARGET_PARTIAL_REGION_TIME_MS`]; the terminal message carries
//! progress exactly 1.0 and the complete all-stats vector is cached per
//! (file, region, stokes) so a re-request answers instantly.
//!
//! Cancellation is polled before every chunk: region state changed, frame
//! disconnected, requirement removed, and a Stokes change for profiles
//! keyed on the current Stokes.

use crate::handler::RegionHandler;
use cube_core::messages::{
    ProfileValues, SpectralProfile, SpectralProfileData, StatsType,
};
use cube_core::requests::SpectralConfig;
use cube_core::{
    Result, INIT_DELTA_Z, TARGET_DELTA_TIME_MS, TARGET_PARTIAL_REGION_TIME_MS,
};
use cube_region::{RegionType, StokesRegion};
use std::collections::HashMap;

impl RegionHandler {
    /// Streams spectral profiles for every requirement of (region, file).
    ///
    /// Returns `Ok(false)` when there is nothing to send or the stream
    /// was cancelled before its terminal message.
    pub fn fill_spectral_profile_data(
        &self,
        region_id: i32,
        file_id: i32,
        stokes_changed: bool,
        mut callback: impl FnMut(SpectralProfileData),
    ) -> Result<bool> {
        let configs = self.spectral_configs(region_id, file_id);
        if configs.is_empty() {
            return Ok(false);
        }
        let Some(frame) = self.frame(file_id) else {
            return Ok(false);
        };
        let Some(region) = self.region(region_id) else {
            return Ok(false);
        };
        if frame.shape().spectral_axis().is_none() {
            return Ok(false);
        }

        let _region_task = region.active_task_lock().read().expect("task lock");
        let _frame_task = frame.active_task_lock().read().expect("task lock");

        for config in &configs {
            if config.coordinate != "z" && stokes_changed {
                continue; // fixed-stokes profiles are unaffected
            }
            let stokes = frame.get_stokes_type_index(&config.coordinate)?;
            let depth = frame.depth();
            let start_generation = region.generation();
            let start_stokes = frame.current_stokes();

            let cancelled = || {
                region.generation() != start_generation
                    || !region.is_connected()
                    || !frame.is_connected()
                    || !self.has_spectral_requirement(region_id, file_id, config)
                    || (config.coordinate == "z" && frame.current_stokes() != start_stokes)
            };

            // a previously completed profile answers without recompute
            let cache_key = (file_id, region_id, stokes);
            let cached = {
                let cache = self.spectral_cache.lock().expect("spectral cache");
                cache.get(&cache_key).and_then(|stats| {
                    config
                        .stats_types
                        .iter()
                        .all(|s| stats.contains_key(s))
                        .then(|| stats.clone())
                })
            };
            if let Some(stats) = cached {
                callback(spectral_message(
                    file_id, region_id, stokes, config, &stats, 1.0,
                ));
                continue;
            }

            // the loop fills the whole spectral-stats set so the cache
            // answers any later config without recomputation
            let mut results: HashMap<StatsType, Vec<f64>> = cube_stats::SPECTRAL_STATS
                .iter()
                .chain(config.stats_types.iter())
                .map(|&s| (s, vec![f64::NAN; depth]))
                .collect();

            let Some(mask) = self.apply_region_to_file(region_id, file_id) else {
                // outside the image: NaN profile, stream still terminates
                callback(spectral_message(
                    file_id, region_id, stokes, config, &results, 1.0,
                ));
                continue;
            };

            // swizzled-layout fast path for real Stokes
            if !cube_core::is_computed_stokes(stokes)
                && region.state().region_type != RegionType::Point
            {
                let use_loader = frame.with_loader(|loader| {
                    loader.use_region_spectral_data((mask.width, mask.height))
                });
                if use_loader {
                    let loader_stats = frame.with_loader(|loader| {
                        loader.get_region_spectral_data(
                            &mask.mask,
                            mask.width,
                            mask.height,
                            mask.origin,
                            (0, depth - 1),
                            stokes.max(0) as usize,
                            &mut |_progress: f64| !cancelled(),
                        )
                    });
                    if let Ok(stats) = loader_stats {
                        for (stats_type, values) in &stats {
                            if let Some(dst) = results.get_mut(stats_type) {
                                dst.clone_from(values);
                            }
                        }
                        self.spectral_cache
                            .lock()
                            .expect("spectral cache")
                            .insert(cache_key, stats);
                        callback(spectral_message(
                            file_id, region_id, stokes, config, &results, 1.0,
                        ));
                        continue;
                    }
                    if cancelled() {
                        return Ok(false);
                    }
                    // loader refused; fall through to the chunked path
                }
            }

            // chunked z slices with adaptive retuning
            let mut delta_z = INIT_DELTA_Z;
            let mut z = 0usize;
            let mut first_slice = true;
            let mut last_update = std::time::Instant::now();
            let mut complete = true;

            while z < depth {
                if cancelled() {
                    complete = false;
                    break;
                }
                let slice_start = std::time::Instant::now();
                let nz = delta_z.min(depth - z);
                let chunk_region = StokesRegion {
                    mask: mask.clone(),
                    z_from: z,
                    z_to: z + nz - 1,
                    stokes,
                };
                let chunk_stats =
                    frame.get_region_stats(&chunk_region, &cube_stats::SPECTRAL_STATS, true)?;
                for (stats_type, values) in chunk_stats {
                    if let Some(dst) = results.get_mut(&stats_type) {
                        dst[z..z + nz].copy_from_slice(&values);
                    }
                }
                z += nz;

                if first_slice {
                    first_slice = false;
                    let dt_ms = slice_start.elapsed().as_secs_f64() * 1e3;
                    if dt_ms > 0.0 {
                        let scaled =
                            (delta_z as f64 * TARGET_DELTA_TIME_MS / dt_ms) as usize;
                        delta_z = scaled.clamp(1, depth);
                    }
                }

                let progress = z as f64 / depth as f64;
                if progress >= 1.0 {
                    // cache the complete all-stats vector before the final send
                    self.spectral_cache
                        .lock()
                        .expect("spectral cache")
                        .insert(cache_key, results.clone());
                    callback(spectral_message(
                        file_id, region_id, stokes, config, &results, 1.0,
                    ));
                } else if last_update.elapsed().as_secs_f64() * 1e3
                    > TARGET_PARTIAL_REGION_TIME_MS
                {
                    last_update = std::time::Instant::now();
                    callback(spectral_message(
                        file_id, region_id, stokes, config, &results, progress,
                    ));
                }
            }
            if !complete {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn spectral_message(
    file_id: i32,
    region_id: i32,
    stokes: i32,
    config: &SpectralConfig,
    results: &HashMap<StatsType, Vec<f64>>,
    progress: f64,
) -> SpectralProfileData {
    SpectralProfileData {
        file_id,
        region_id,
        stokes,
        progress,
        profiles: config
            .stats_types
            .iter()
            .map(|&stats_type| SpectralProfile {
                coordinate: config.coordinate.clone(),
                stats_type,
                values: ProfileValues::F64(
                    results.get(&stats_type).cloned().unwrap_or_default(),
                ),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{handler_with_frame, rect_state};
    use approx::assert_relative_eq;
    use cube_core::CoordinateSystem;
    use cube_frame::Frame;
    use cube_io::MemoryLoader;
    use cube_region::RegionStyle;
    use std::sync::Arc;

    fn mean_config() -> SpectralConfig {
        SpectralConfig::new("z", vec![StatsType::Mean, StatsType::NumPixels])
    }

    #[test]
    fn test_region_spectral_stream_completes() {
        let (handler, _frame) = handler_with_frame(8, 8, 6, 1);
        let mut id = 0;
        handler
            .set_region(&mut id, rect_state(0, 4.0, 4.0, 2.0, 2.0), RegionStyle::default())
            .unwrap();
        handler
            .set_spectral_requirements(id, 0, vec![mean_config()])
            .unwrap();

        let mut messages = Vec::new();
        let complete = handler
            .fill_spectral_profile_data(id, 0, false, |m| messages.push(m))
            .unwrap();
        assert!(complete);

        let last = messages.last().unwrap();
        assert_relative_eq!(last.progress, 1.0);
        let mean = last
            .profiles
            .iter()
            .find(|p| p.stats_type == StatsType::Mean)
            .unwrap();
        match &mean.values {
            ProfileValues::F64(values) => {
                assert_eq!(values.len(), 6);
                assert!(values.iter().all(|v| v.is_finite()));
                // each channel's mean grows by one plane worth of ramp
                assert_relative_eq!(values[1] - values[0], 64.0);
            }
            _ => panic!("region stats are f64"),
        }
    }

    #[test]
    fn test_completed_profile_is_cached() {
        let (handler, _frame) = handler_with_frame(8, 8, 4, 1);
        let mut id = 0;
        handler
            .set_region(&mut id, rect_state(0, 4.0, 4.0, 2.0, 2.0), RegionStyle::default())
            .unwrap();
        handler
            .set_spectral_requirements(id, 0, vec![mean_config()])
            .unwrap();

        let mut first = Vec::new();
        handler
            .fill_spectral_profile_data(id, 0, false, |m| first.push(m))
            .unwrap();
        assert_eq!(handler.spectral_cache.lock().unwrap().len(), 1);

        // second request answers from the cache with one terminal message
        let mut second = Vec::new();
        handler
            .fill_spectral_profile_data(id, 0, false, |m| second.push(m))
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_relative_eq!(second[0].progress, 1.0);
        assert_eq!(second[0].profiles, first.last().unwrap().profiles);
    }

    #[test]
    fn test_region_outside_image_nan_profile() {
        let (handler, _frame) = handler_with_frame(8, 8, 4, 1);
        let mut id = 0;
        handler
            .set_region(
                &mut id,
                rect_state(0, 50.0, 50.0, 2.0, 2.0),
                RegionStyle::default(),
            )
            .unwrap();
        handler
            .set_spectral_requirements(id, 0, vec![mean_config()])
            .unwrap();

        let mut messages = Vec::new();
        handler
            .fill_spectral_profile_data(id, 0, false, |m| messages.push(m))
            .unwrap();
        let last = messages.last().unwrap();
        assert_relative_eq!(last.progress, 1.0);
        match &last.profiles[0].values {
            ProfileValues::F64(values) => assert!(values.iter().all(|v| v.is_nan())),
            _ => panic!(),
        }
    }

    #[test]
    fn test_swizzled_fast_path_matches_sliced() {
        let shape = cube_core::ImageShape::cube(8, 8, 5).unwrap();
        let data: Vec<f32> = (0..shape.total_size()).map(|i| i as f32).collect();

        let plain = MemoryLoader::new(
            "plain",
            shape.clone(),
            CoordinateSystem::pixel(),
            data.clone(),
        )
        .unwrap();
        let swizzled = MemoryLoader::new("sw", shape, CoordinateSystem::pixel(), data)
            .unwrap()
            .with_swizzle();

        let run = |loader: MemoryLoader| {
            let frame = Arc::new(Frame::new(0, Box::new(loader), "0").unwrap());
            let handler = RegionHandler::new();
            handler.add_frame(0, &frame);
            let mut id = 0;
            handler
                .set_region(
                    &mut id,
                    rect_state(0, 4.0, 4.0, 3.0, 3.0),
                    RegionStyle::default(),
                )
                .unwrap();
            handler
                .set_spectral_requirements(id, 0, vec![mean_config()])
                .unwrap();
            let mut messages = Vec::new();
            handler
                .fill_spectral_profile_data(id, 0, false, |m| messages.push(m))
                .unwrap();
            messages.last().unwrap().clone()
        };

        let a = run(plain);
        let b = run(swizzled);
        let get = |m: &SpectralProfileData| match &m
            .profiles
            .iter()
            .find(|p| p.stats_type == StatsType::Mean)
            .unwrap()
            .values
        {
            ProfileValues::F64(v) => v.clone(),
            _ => panic!(),
        };
        let (va, vb) = (get(&a), get(&b));
        assert_eq!(va.len(), vb.len());
        for (x, y) in va.iter().zip(&vb) {
            assert_relative_eq!(*x, *y, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_no_requirements_declines() {
        let (handler, _frame) = handler_with_frame(8, 8, 4, 1);
        let mut id = 0;
        handler
            .set_region(&mut id, rect_state(0, 4.0, 4.0, 2.0, 2.0), RegionStyle::default())
            .unwrap();
        let mut messages = Vec::new();
        let complete = handler
            .fill_spectral_profile_data(id, 0, false, |m| messages.push(m))
            .unwrap();
        assert!(!complete);
        assert!(messages.is_empty());
    }
}
