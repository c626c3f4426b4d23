//! The region handler: cross-file region compute.
//!
//! Owns every region; holds frames only as weak references by file id,
//! resolved before each use (a dropped frame turns the call into a
//! no-op). Requirement sets are keyed by [`ConfigId`], results by
//! [`CacheId`]; removing a region or closing a file purges everything
//! that mentions it, after waiting for in-flight tasks.

use cube_core::messages::{
    HistogramData, RegionHistogramData, RegionStatsData, StatsValue,
};
use cube_core::requests::{
    HistogramConfig, SpatialConfig, SpectralConfig, StatsConfig,
};
use cube_core::{
    AxisRange, Error, Result, ALL_REGIONS, CURRENT_Z,
};
use cube_frame::Frame;
use cube_region::{
    to_lattice_mask_in, Region, RegionMask, RegionProperties, RegionState, RegionStyle,
    StokesRegion,
};
use cube_stats::BasicStats;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Requirement key: (file id, region id).
pub type ConfigId = (i32, i32);

/// Result-cache key: (file id, region id, stokes, z).
pub type CacheId = (i32, i32, i32, i32);

/// Acknowledgement of a region import.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportRegionAck {
    /// Whether every region imported.
    pub success: bool,
    /// Failure detail when unsuccessful.
    pub message: String,
    /// Assigned ids with their properties.
    pub regions: Vec<(i32, RegionProperties)>,
}

/// Acknowledgement of a region export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRegionAck {
    /// Whether every region exported.
    pub success: bool,
    /// Failure detail when unsuccessful.
    pub message: String,
    /// The exported properties in request order.
    pub regions: Vec<RegionProperties>,
}

/// Owns regions and dispatches region-applied compute across frames.
#[derive(Default)]
pub struct RegionHandler {
    regions: Mutex<HashMap<i32, Arc<Region>>>,
    next_region_id: AtomicI32,
    frames: Mutex<HashMap<i32, Weak<Frame>>>,

    histogram_requirements: Mutex<HashMap<ConfigId, Vec<HistogramConfig>>>,
    spectral_requirements: Mutex<HashMap<ConfigId, Vec<SpectralConfig>>>,
    spatial_requirements: Mutex<HashMap<ConfigId, Vec<SpatialConfig>>>,
    stats_requirements: Mutex<HashMap<ConfigId, Vec<StatsConfig>>>,

    pub(crate) basic_stats_cache: Mutex<HashMap<CacheId, BasicStats>>,
    pub(crate) histogram_cache: Mutex<HashMap<CacheId, HistogramData>>,
    pub(crate) stats_cache: Mutex<HashMap<CacheId, Vec<StatsValue>>>,
    /// Complete per-channel stats vectors keyed by (file, region, stokes).
    pub(crate) spectral_cache:
        Mutex<HashMap<(i32, i32, i32), HashMap<cube_core::messages::StatsType, Vec<f64>>>>,

    pub(crate) pv_stop: Mutex<HashMap<i32, Arc<AtomicBool>>>,
    /// Serializes temporary-region reuse inside the line engine.
    pub(crate) line_profile_mutex: Mutex<()>,
}

impl RegionHandler {
    /// Creates an empty handler.
    pub fn new() -> Self {
        Self {
            next_region_id: AtomicI32::new(1),
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // Frames

    /// Registers (or replaces) a frame by file id. The handler keeps only
    /// a weak reference.
    pub fn add_frame(&self, file_id: i32, frame: &Arc<Frame>) {
        self.frames
            .lock()
            .expect("frames")
            .insert(file_id, Arc::downgrade(frame));
    }

    /// Drops a closing file: purges its requirements and caches.
    pub fn remove_frame(&self, file_id: i32) {
        self.stop_pv(file_id);
        self.frames.lock().expect("frames").remove(&file_id);
        self.histogram_requirements
            .lock()
            .expect("requirements")
            .retain(|&(f, _), _| f != file_id);
        self.spectral_requirements
            .lock()
            .expect("requirements")
            .retain(|&(f, _), _| f != file_id);
        self.spatial_requirements
            .lock()
            .expect("requirements")
            .retain(|&(f, _), _| f != file_id);
        self.stats_requirements
            .lock()
            .expect("requirements")
            .retain(|&(f, _), _| f != file_id);
        self.purge_caches(|&(f, _, _, _)| f == file_id);
        self.spectral_cache
            .lock()
            .expect("spectral cache")
            .retain(|&(f, _, _), _| f != file_id);
    }

    /// Resolves a frame; `None` after the session dropped it.
    pub fn frame(&self, file_id: i32) -> Option<Arc<Frame>> {
        self.frames
            .lock()
            .expect("frames")
            .get(&file_id)
            .and_then(Weak::upgrade)
    }

    // ------------------------------------------------------------------
    // Regions

    /// Creates or updates a region. A requested id ≤ 0 assigns the next
    /// free id; updating an existing region with a changed state bumps
    /// its generation and drops every cache keyed on it.
    pub fn set_region(
        &self,
        region_id: &mut i32,
        state: RegionState,
        style: RegionStyle,
    ) -> Result<()> {
        if !state.is_valid() {
            return Err(Error::invalid_request("malformed region control points"));
        }
        let mut regions = self.regions.lock().expect("regions");

        if *region_id <= 0 {
            *region_id = self.next_region_id.fetch_add(1, Ordering::AcqRel);
            regions.insert(*region_id, Arc::new(Region::new(state, style)));
            return Ok(());
        }

        match regions.get(region_id) {
            Some(region) => {
                if region.set_state(state) {
                    drop(regions);
                    self.invalidate_region(*region_id);
                }
                Ok(())
            }
            None => {
                regions.insert(*region_id, Arc::new(Region::new(state, style)));
                Ok(())
            }
        }
    }

    /// Looks up a region.
    pub fn region(&self, region_id: i32) -> Option<Arc<Region>> {
        self.regions.lock().expect("regions").get(&region_id).cloned()
    }

    /// Number of live regions.
    pub fn num_regions(&self) -> usize {
        self.regions.lock().expect("regions").len()
    }

    /// Removes one region (or every region for [`ALL_REGIONS`]), waiting
    /// for tasks that still reference it.
    pub fn remove_region(&self, region_id: i32) {
        let removed: Vec<(i32, Arc<Region>)> = {
            let mut regions = self.regions.lock().expect("regions");
            if region_id == ALL_REGIONS {
                regions.drain().collect()
            } else {
                regions.remove(&region_id).map(|r| (region_id, r)).into_iter().collect()
            }
        };
        for (id, region) in removed {
            region.wait_for_task_cancellation();
            self.purge_region(id);
        }
    }

    fn purge_region(&self, region_id: i32) {
        self.histogram_requirements
            .lock()
            .expect("requirements")
            .retain(|&(_, r), _| r != region_id);
        self.spectral_requirements
            .lock()
            .expect("requirements")
            .retain(|&(_, r), _| r != region_id);
        self.spatial_requirements
            .lock()
            .expect("requirements")
            .retain(|&(_, r), _| r != region_id);
        self.stats_requirements
            .lock()
            .expect("requirements")
            .retain(|&(_, r), _| r != region_id);
        self.invalidate_region(region_id);
    }

    fn invalidate_region(&self, region_id: i32) {
        self.purge_caches(|&(_, r, _, _)| r == region_id);
        self.spectral_cache
            .lock()
            .expect("spectral cache")
            .retain(|&(_, r, _), _| r != region_id);
    }

    fn purge_caches(&self, predicate: impl Fn(&CacheId) -> bool) {
        self.basic_stats_cache
            .lock()
            .expect("cache")
            .retain(|key, _| !predicate(key));
        self.histogram_cache
            .lock()
            .expect("cache")
            .retain(|key, _| !predicate(key));
        self.stats_cache
            .lock()
            .expect("cache")
            .retain(|key, _| !predicate(key));
    }

    // ------------------------------------------------------------------
    // Requirements

    /// Sets histogram requirements; closed region types only.
    pub fn set_histogram_requirements(
        &self,
        region_id: i32,
        file_id: i32,
        configs: Vec<HistogramConfig>,
    ) -> Result<()> {
        let region = self
            .region(region_id)
            .ok_or_else(|| Error::invalid_request("unknown region"))?;
        if !region.state().region_type.is_closed() {
            return Err(Error::invalid_request(
                "histogram requirements need a closed region",
            ));
        }
        self.histogram_requirements
            .lock()
            .expect("requirements")
            .insert((file_id, region_id), configs);
        Ok(())
    }

    /// Sets spectral requirements; any non-line, non-annotation region.
    ///
    /// An update keeps already-satisfied statistics: the diff against the
    /// previous configs (and the completed-profile cache) decides what is
    /// recomputed.
    pub fn set_spectral_requirements(
        &self,
        region_id: i32,
        file_id: i32,
        configs: Vec<SpectralConfig>,
    ) -> Result<()> {
        let region = self
            .region(region_id)
            .ok_or_else(|| Error::invalid_request("unknown region"))?;
        let region_type = region.state().region_type;
        if region_type.is_line_type() || region_type.is_annotation() {
            return Err(Error::invalid_request(
                "spectral requirements need a non-line region",
            ));
        }
        self.spectral_requirements
            .lock()
            .expect("requirements")
            .insert((file_id, region_id), configs);
        Ok(())
    }

    /// Sets spatial requirements; point and line families only.
    pub fn set_spatial_requirements(
        &self,
        region_id: i32,
        file_id: i32,
        configs: Vec<SpatialConfig>,
    ) -> Result<()> {
        let region = self
            .region(region_id)
            .ok_or_else(|| Error::invalid_request("unknown region"))?;
        let state = region.state();
        let allowed = state.region_type.is_line_type()
            || state.region_type == cube_region::RegionType::Point;
        if !allowed {
            return Err(Error::invalid_request(
                "spatial requirements need a point or line region",
            ));
        }
        self.spatial_requirements
            .lock()
            .expect("requirements")
            .insert((file_id, region_id), configs);
        Ok(())
    }

    /// Sets statistics requirements; closed region types only.
    pub fn set_stats_requirements(
        &self,
        region_id: i32,
        file_id: i32,
        configs: Vec<StatsConfig>,
    ) -> Result<()> {
        let region = self
            .region(region_id)
            .ok_or_else(|| Error::invalid_request("unknown region"))?;
        if !region.state().region_type.is_closed() {
            return Err(Error::invalid_request(
                "stats requirements need a closed region",
            ));
        }
        self.stats_requirements
            .lock()
            .expect("requirements")
            .insert((file_id, region_id), configs);
        Ok(())
    }

    /// Whether a spatial config (by coordinate and width) is still
    /// required; polled by the line engine as a cancellation source.
    pub fn has_spatial_requirement(
        &self,
        region_id: i32,
        file_id: i32,
        coordinate: &str,
        width: usize,
    ) -> bool {
        self.spatial_requirements
            .lock()
            .expect("requirements")
            .get(&(file_id, region_id))
            .is_some_and(|configs| {
                configs
                    .iter()
                    .any(|c| c.coordinate == coordinate && c.width == width)
            })
    }

    pub(crate) fn spatial_configs(&self, region_id: i32, file_id: i32) -> Vec<SpatialConfig> {
        self.spatial_requirements
            .lock()
            .expect("requirements")
            .get(&(file_id, region_id))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn spectral_configs(&self, region_id: i32, file_id: i32) -> Vec<SpectralConfig> {
        self.spectral_requirements
            .lock()
            .expect("requirements")
            .get(&(file_id, region_id))
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn has_spectral_requirement(
        &self,
        region_id: i32,
        file_id: i32,
        config: &SpectralConfig,
    ) -> bool {
        self.spectral_requirements
            .lock()
            .expect("requirements")
            .get(&(file_id, region_id))
            .is_some_and(|configs| configs.contains(config))
    }

    // ------------------------------------------------------------------
    // Region application

    /// Applies a region's 2-d geometry to a target file.
    ///
    /// `None` when the region or frame no longer exists, the region is
    /// annotation-only, or it lies outside the target image.
    pub fn apply_region_to_file(&self, region_id: i32, file_id: i32) -> Option<RegionMask> {
        let region = self.region(region_id)?;
        let frame = self.frame(file_id)?;
        let state = region.state();
        self.apply_state_to_frame(&state, &frame, file_id)
    }

    /// Applies a raw state to a frame, converting across files when the
    /// state references another image. Used for both owned and ephemeral
    /// regions.
    pub fn apply_state_to_frame(
        &self,
        state: &RegionState,
        frame: &Arc<Frame>,
        file_id: i32,
    ) -> Option<RegionMask> {
        let same_file = state.reference_file_id == file_id;
        let reference_csys = if same_file {
            frame.coordinate_system().clone()
        } else {
            self.frame(state.reference_file_id)?
                .coordinate_system()
                .clone()
        };
        to_lattice_mask_in(
            state,
            &reference_csys,
            frame.coordinate_system(),
            same_file,
            frame.width(),
            frame.height(),
        )
    }

    /// Extends the 2-d application along z and Stokes.
    pub fn apply_region_to_file_3d(
        &self,
        region_id: i32,
        file_id: i32,
        z_range: &AxisRange,
        stokes: i32,
    ) -> Option<StokesRegion> {
        let frame = self.frame(file_id)?;
        let mask = self.apply_region_to_file(region_id, file_id)?;
        let (z_from, z_to) = z_range.resolve(frame.depth(), frame.current_z()).ok()?;
        Some(StokesRegion {
            mask,
            z_from,
            z_to,
            stokes,
        })
    }

    // ------------------------------------------------------------------
    // Histogram / stats data products

    /// Streams region histograms for every requirement of (region, file).
    ///
    /// A region outside the image still terminates the stream with empty
    /// bins and progress 1.0.
    pub fn fill_region_histogram_data(
        &self,
        region_id: i32,
        file_id: i32,
        mut callback: impl FnMut(RegionHistogramData),
    ) -> Result<bool> {
        let configs = self
            .histogram_requirements
            .lock()
            .expect("requirements")
            .get(&(file_id, region_id))
            .cloned()
            .unwrap_or_default();
        if configs.is_empty() {
            return Ok(false);
        }
        let Some(frame) = self.frame(file_id) else {
            return Ok(false);
        };
        let Some(region) = self.region(region_id) else {
            return Ok(false);
        };
        let _task = region.active_task_lock().read().expect("task lock");
        region.clear_changed();
        let start = std::time::Instant::now();

        for config in configs {
            let stokes = frame.get_stokes_type_index(&config.coordinate)?;
            // ALL_Z selects the whole cube through the region
            let (z_from, z_to, channel_label) = if config.channel == cube_core::ALL_Z {
                (0, frame.depth() - 1, cube_core::ALL_Z)
            } else if config.channel == CURRENT_Z {
                let z = frame.current_z();
                (z, z, z as i32)
            } else {
                let z = frame.check_z(config.channel)?;
                (z, z, z as i32)
            };
            let num_bins = if config.num_bins <= 0 {
                frame.auto_bin_count()
            } else {
                config.num_bins as usize
            };

            let Some(mask) = self.apply_region_to_file(region_id, file_id) else {
                // outside the image: empty histogram, stream still ends
                callback(RegionHistogramData {
                    file_id,
                    region_id,
                    channel: channel_label,
                    stokes,
                    progress: 1.0,
                    histogram: HistogramData {
                        num_bins,
                        bin_width: 0.0,
                        first_bin_center: 0.0,
                        bins: vec![0; num_bins],
                        mean: f64::NAN,
                        std_dev: f64::NAN,
                    },
                });
                continue;
            };
            let stokes_region = StokesRegion {
                mask,
                z_from,
                z_to,
                stokes,
            };

            let cache_id: CacheId = (file_id, region_id, stokes, channel_label);
            let data = frame.get_region_data(&stokes_region)?;
            let plane = stokes_region.mask.width * stokes_region.mask.height;
            let masked: Vec<f32> = data
                .iter()
                .enumerate()
                .filter_map(|(i, &v)| stokes_region.mask.mask[i % plane].then_some(v))
                .collect();

            let stats = {
                let cached = self
                    .basic_stats_cache
                    .lock()
                    .expect("cache")
                    .get(&cache_id)
                    .copied();
                match cached {
                    Some(stats) => stats,
                    None => {
                        let stats = cube_stats::calc_basic_stats(&masked);
                        self.basic_stats_cache
                            .lock()
                            .expect("cache")
                            .insert(cache_id, stats);
                        stats
                    }
                }
            };

            let histogram = match config.bounds {
                Some((min, max)) => {
                    cube_stats::Histogram::new(num_bins, min, max, &masked).results(&stats)
                }
                None => {
                    let cached = self
                        .histogram_cache
                        .lock()
                        .expect("cache")
                        .get(&cache_id)
                        .filter(|h| h.num_bins == num_bins)
                        .cloned();
                    match cached {
                        Some(histogram) => histogram,
                        None => {
                            let histogram =
                                cube_stats::calc_histogram(num_bins, &stats, &masked);
                            self.histogram_cache
                                .lock()
                                .expect("cache")
                                .insert(cache_id, histogram.clone());
                            histogram
                        }
                    }
                }
            };

            callback(RegionHistogramData {
                file_id,
                region_id,
                channel: channel_label,
                stokes,
                progress: 1.0,
                histogram,
            });
        }

        tracing::debug!(
            "region {} histograms for file {} in {:.3} ms",
            region_id,
            file_id,
            start.elapsed().as_secs_f64() * 1e3
        );
        Ok(true)
    }

    /// Streams region statistics for every requirement of (region, file).
    pub fn fill_region_stats_data(
        &self,
        region_id: i32,
        file_id: i32,
        mut callback: impl FnMut(RegionStatsData),
    ) -> Result<bool> {
        let configs = self
            .stats_requirements
            .lock()
            .expect("requirements")
            .get(&(file_id, region_id))
            .cloned()
            .unwrap_or_default();
        if configs.is_empty() {
            return Ok(false);
        }
        let Some(frame) = self.frame(file_id) else {
            return Ok(false);
        };
        let Some(region) = self.region(region_id) else {
            return Ok(false);
        };
        let _task = region.active_task_lock().read().expect("task lock");

        for config in configs {
            let stokes = frame.get_stokes_type_index(&config.coordinate)?;
            let z = frame.current_z();
            let cache_id: CacheId = (file_id, region_id, stokes, z as i32);

            let cached = self.stats_cache.lock().expect("cache").get(&cache_id).cloned();
            let statistics = match cached {
                Some(values) => values,
                None => {
                    let values: Vec<StatsValue> = match self.apply_region_to_file(region_id, file_id) {
                        Some(mask) => {
                            let stokes_region = StokesRegion {
                                mask,
                                z_from: z,
                                z_to: z,
                                stokes,
                            };
                            let computed = frame.get_region_stats(
                                &stokes_region,
                                &config.stats_types,
                                false,
                            )?;
                            config
                                .stats_types
                                .iter()
                                .map(|&stats_type| StatsValue {
                                    stats_type,
                                    value: computed
                                        .get(&stats_type)
                                        .and_then(|v| v.first().copied())
                                        .unwrap_or(f64::NAN),
                                })
                                .collect()
                        }
                        // outside the image: a full NaN result
                        None => config
                            .stats_types
                            .iter()
                            .map(|&stats_type| StatsValue {
                                stats_type,
                                value: f64::NAN,
                            })
                            .collect(),
                    };
                    self.stats_cache
                        .lock()
                        .expect("cache")
                        .insert(cache_id, values.clone());
                    values
                }
            };

            callback(RegionStatsData {
                file_id,
                region_id,
                channel: z as i32,
                stokes,
                statistics,
            });
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // PV stop flags

    /// The stop flag for PV generation on a file, creating it on demand.
    pub(crate) fn pv_stop_flag(&self, file_id: i32) -> Arc<AtomicBool> {
        Arc::clone(
            self.pv_stop
                .lock()
                .expect("pv stop")
                .entry(file_id)
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    /// Stops PV generation for a file and clears its temporary spectral
    /// work so in-flight chunk loops unblock.
    pub fn stop_pv(&self, file_id: i32) {
        if let Some(flag) = self.pv_stop.lock().expect("pv stop").get(&file_id) {
            flag.store(true, Ordering::Release);
        }
    }

    // ------------------------------------------------------------------
    // Import / export

    /// Imports a list of regions, assigning fresh ids.
    pub fn import_regions(&self, properties: Vec<RegionProperties>) -> ImportRegionAck {
        let mut regions = Vec::with_capacity(properties.len());
        for props in properties {
            let mut id = 0;
            match self.set_region(&mut id, props.state.clone(), props.style.clone()) {
                Ok(()) => regions.push((id, props)),
                Err(err) => {
                    return ImportRegionAck {
                        success: false,
                        message: err.to_string(),
                        regions,
                    }
                }
            }
        }
        ImportRegionAck {
            success: true,
            message: String::new(),
            regions,
        }
    }

    /// Exports regions by id, in request order.
    pub fn export_regions(&self, region_ids: &[i32]) -> ExportRegionAck {
        let mut exported = Vec::with_capacity(region_ids.len());
        for &id in region_ids {
            match self.region(id) {
                Some(region) => exported.push(RegionProperties {
                    state: region.state(),
                    style: region.style(),
                }),
                None => {
                    return ExportRegionAck {
                        success: false,
                        message: format!("region {id} does not exist"),
                        regions: exported,
                    }
                }
            }
        }
        ExportRegionAck {
            success: true,
            message: String::new(),
            regions: exported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{handler_with_frame, rect_state};
    use cube_core::messages::StatsType;
    use cube_region::RegionType;
    use glam::DVec2;

    #[test]
    fn test_set_region_assigns_ids() {
        let handler = RegionHandler::new();
        let mut id = 0;
        handler
            .set_region(&mut id, rect_state(0, 5.0, 5.0, 4.0, 4.0), RegionStyle::default())
            .unwrap();
        assert_eq!(id, 1);

        let mut id2 = -1;
        handler
            .set_region(&mut id2, rect_state(0, 6.0, 6.0, 2.0, 2.0), RegionStyle::default())
            .unwrap();
        assert_eq!(id2, 2);
        assert_eq!(handler.num_regions(), 2);
    }

    #[test]
    fn test_update_invalidates_caches() {
        let (handler, _frame) = handler_with_frame(16, 16, 4, 1);
        let mut id = 0;
        handler
            .set_region(&mut id, rect_state(0, 5.0, 5.0, 4.0, 4.0), RegionStyle::default())
            .unwrap();
        handler
            .basic_stats_cache
            .lock()
            .unwrap()
            .insert((0, id, 0, 0), cube_stats::calc_basic_stats(&[1.0]));

        // same state: caches stay
        let mut same_id = id;
        handler
            .set_region(&mut same_id, rect_state(0, 5.0, 5.0, 4.0, 4.0), RegionStyle::default())
            .unwrap();
        assert!(!handler.basic_stats_cache.lock().unwrap().is_empty());

        // moved: caches purged
        let mut same_id = id;
        handler
            .set_region(&mut same_id, rect_state(0, 7.0, 5.0, 4.0, 4.0), RegionStyle::default())
            .unwrap();
        assert!(handler.basic_stats_cache.lock().unwrap().is_empty());
    }

    #[test]
    fn test_remove_region_purges() {
        let (handler, _frame) = handler_with_frame(16, 16, 1, 1);
        let mut id = 0;
        handler
            .set_region(&mut id, rect_state(0, 5.0, 5.0, 4.0, 4.0), RegionStyle::default())
            .unwrap();
        handler
            .set_histogram_requirements(id, 0, vec![HistogramConfig::auto("z", CURRENT_Z)])
            .unwrap();
        handler.remove_region(id);
        assert_eq!(handler.num_regions(), 0);
        assert!(handler
            .histogram_requirements
            .lock()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_requirement_type_rules() {
        let (handler, _frame) = handler_with_frame(16, 16, 1, 1);
        let mut rect_id = 0;
        handler
            .set_region(&mut rect_id, rect_state(0, 5.0, 5.0, 4.0, 4.0), RegionStyle::default())
            .unwrap();
        let mut line_id = 0;
        handler
            .set_region(
                &mut line_id,
                RegionState::new(
                    0,
                    RegionType::Line,
                    vec![DVec2::new(1.0, 1.0), DVec2::new(9.0, 9.0)],
                    0.0,
                ),
                RegionStyle::default(),
            )
            .unwrap();

        // histogram / stats: closed only
        assert!(handler
            .set_histogram_requirements(rect_id, 0, vec![])
            .is_ok());
        assert!(handler
            .set_histogram_requirements(line_id, 0, vec![])
            .is_err());
        assert!(handler.set_stats_requirements(line_id, 0, vec![]).is_err());

        // spectral: non-line
        assert!(handler
            .set_spectral_requirements(rect_id, 0, vec![])
            .is_ok());
        assert!(handler
            .set_spectral_requirements(line_id, 0, vec![])
            .is_err());

        // spatial: line / point only
        assert!(handler.set_spatial_requirements(line_id, 0, vec![]).is_ok());
        assert!(handler
            .set_spatial_requirements(rect_id, 0, vec![])
            .is_err());
    }

    #[test]
    fn test_apply_region_weak_frame() {
        let handler = RegionHandler::new();
        let mut id = 0;
        handler
            .set_region(&mut id, rect_state(0, 5.0, 5.0, 4.0, 4.0), RegionStyle::default())
            .unwrap();
        // no frame registered: no-op
        assert!(handler.apply_region_to_file(id, 0).is_none());
    }

    #[test]
    fn test_region_histogram_stream() {
        let (handler, _frame) = handler_with_frame(16, 16, 2, 1);
        let mut id = 0;
        handler
            .set_region(&mut id, rect_state(0, 8.0, 8.0, 6.0, 6.0), RegionStyle::default())
            .unwrap();
        handler
            .set_histogram_requirements(
                id,
                0,
                vec![HistogramConfig {
                    coordinate: "z".to_string(),
                    channel: CURRENT_Z,
                    num_bins: 4,
                    bounds: None,
                }],
            )
            .unwrap();

        let mut messages = Vec::new();
        assert!(handler
            .fill_region_histogram_data(id, 0, |m| messages.push(m))
            .unwrap());
        assert_eq!(messages.len(), 1);
        let histogram = &messages[0].histogram;
        assert_eq!(histogram.num_bins, 4);
        assert!(histogram.bins.iter().sum::<i64>() > 0);
        assert_eq!(messages[0].progress, 1.0);
    }

    #[test]
    fn test_region_outside_image_still_terminates() {
        let (handler, _frame) = handler_with_frame(16, 16, 1, 1);
        let mut id = 0;
        handler
            .set_region(
                &mut id,
                rect_state(0, 100.0, 100.0, 4.0, 4.0),
                RegionStyle::default(),
            )
            .unwrap();
        handler
            .set_histogram_requirements(id, 0, vec![HistogramConfig::auto("z", CURRENT_Z)])
            .unwrap();

        let mut messages = Vec::new();
        handler
            .fill_region_histogram_data(id, 0, |m| messages.push(m))
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].progress, 1.0);
        assert!(messages[0].histogram.bins.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_region_stats_stream_and_cache() {
        let (handler, _frame) = handler_with_frame(16, 16, 2, 1);
        let mut id = 0;
        handler
            .set_region(&mut id, rect_state(0, 8.0, 8.0, 4.0, 4.0), RegionStyle::default())
            .unwrap();
        handler
            .set_stats_requirements(
                id,
                0,
                vec![StatsConfig {
                    coordinate: "z".to_string(),
                    stats_types: vec![StatsType::NumPixels, StatsType::Mean],
                }],
            )
            .unwrap();

        let mut messages = Vec::new();
        handler
            .fill_region_stats_data(id, 0, |m| messages.push(m))
            .unwrap();
        assert_eq!(messages.len(), 1);
        let num_pixels = messages[0]
            .statistics
            .iter()
            .find(|s| s.stats_type == StatsType::NumPixels)
            .unwrap()
            .value;
        assert!(num_pixels > 0.0);
        assert_eq!(handler.stats_cache.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_import_export_round_trip() {
        let handler = RegionHandler::new();
        let props = RegionProperties {
            state: rect_state(0, 3.0, 3.0, 2.0, 2.0),
            style: RegionStyle {
                color: "#40FF90".to_string(),
                ..Default::default()
            },
        };
        let ack = handler.import_regions(vec![props.clone()]);
        assert!(ack.success);
        let (id, _) = ack.regions[0];

        let exported = handler.export_regions(&[id]);
        assert!(exported.success);
        assert_eq!(exported.regions[0], props);

        let missing = handler.export_regions(&[999]);
        assert!(!missing.success);
    }
}
