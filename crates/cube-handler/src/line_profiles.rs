//! Line and polyline profile decomposition.
//!
//! A line with an averaging width becomes a sequence of overlapping box
//! regions whose mean values form the profile. Two sampling strategies
//! are tried per request; the first whose center spacing is angularly
//! uniform wins:
//!
//! - **Fixed pixel spacing**: centers 1 pixel apart along the line,
//!   boxes 3 pixels long (1 when axis-aligned) by the user width,
//!   rotated with the line. Uniformity is checked against
//!   `0.01 · |CDELT2|`.
//! - **Fixed angular spacing**: centers found by bisection so successive
//!   separations equal `|CDELT2|` within `0.1 · |CDELT2|`; boxes become
//!   polygons whose corners sit half the angular width off the line.
//!   Polyline segments drop their first center when it would sit closer
//!   than half the spacing to the previous segment's last.
//!
//! Every box is an ephemeral state applied directly to the target frame:
//! nothing enters the handler's public region id namespace.

use crate::handler::RegionHandler;
use cube_core::messages::StatsType;
use cube_core::{CoordinateSystem, Error, Result, LINE_PROFILE_PROGRESS_INTERVAL_MS};
use cube_frame::Frame;
use cube_region::{RegionState, RegionType, StokesRegion};
use glam::DVec2;
use std::sync::Arc;

/// Profiles produced by the line engine: one row of means per box.
#[derive(Debug, Clone)]
pub struct LineProfiles {
    /// `num_boxes × profile_length` matrix, row-major.
    pub rows: Vec<Vec<f64>>,
    /// Angular spacing between box centers, arcsec.
    pub increment_arcsec: f64,
    /// Largest count of finite pixels any box contributed to a channel.
    pub max_num_pixels: f64,
}

/// Everything the engine needs to cancel and report.
pub(crate) struct LineProfileContext<'a> {
    pub handler: &'a RegionHandler,
    pub frame: &'a Arc<Frame>,
    pub file_id: i32,
    pub region_id: i32,
    pub region_state: RegionState,
    pub width: usize,
    /// Per-channel (PV) rather than current-channel profiles.
    pub per_z: bool,
    pub stokes: i32,
    pub coordinate: String,
}

impl LineProfileContext<'_> {
    /// True when the operation must stop.
    fn cancelled(&self, start_generation: Option<u64>) -> bool {
        if !self.frame.is_connected() {
            return true;
        }
        if self.per_z {
            if self
                .handler
                .pv_stop_flag(self.file_id)
                .load(std::sync::atomic::Ordering::Acquire)
            {
                return true;
            }
        } else if self.region_id > 0
            && !self.handler.has_spatial_requirement(
                self.region_id,
                self.file_id,
                &self.coordinate,
                self.width,
            )
        {
            return true;
        }
        match (start_generation, self.handler.region(self.region_id)) {
            (Some(generation), Some(region)) => {
                !region.is_connected() || region.generation() != generation
            }
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Rotation of a line in degrees, measured like the box rotation.
fn line_rotation(start: DVec2, end: DVec2) -> f64 {
    (start.y - end.y).atan2(start.x - end.x).to_degrees()
}

fn is_axis_aligned(rotation: f64) -> bool {
    (rotation % 90.0).abs() < 1e-9 || ((rotation % 90.0).abs() - 90.0).abs() < 1e-9
}

/// Checks that successive center separations are angularly uniform within
/// `0.01 · |CDELT2|`, returning the common increment.
fn check_linear_offsets(centers: &[DVec2], csys: &CoordinateSystem) -> Option<f64> {
    if centers.len() < 2 {
        return None;
    }
    let tolerance = csys.cdelt2_arcsec() * 0.01;
    let mut total = 0.0;
    let mut first: Option<f64> = None;
    for pair in centers.windows(2) {
        let separation =
            csys.angular_separation((pair[0].x, pair[0].y), (pair[1].x, pair[1].y));
        match first {
            None => first = Some(separation),
            Some(reference) => {
                if (separation - reference).abs() > tolerance {
                    return None;
                }
            }
        }
        total += separation;
    }
    Some(total / (centers.len() - 1) as f64)
}

impl RegionHandler {
    /// Computes mean profiles along a line or polyline.
    ///
    /// Tries fixed-pixel spacing first, falling back to fixed-angular
    /// spacing when pixel centers are not angularly uniform. Progress is
    /// reported per finished box at a bounded cadence.
    pub(crate) fn get_line_profiles(
        &self,
        context: &LineProfileContext<'_>,
        mut progress: impl FnMut(f64),
    ) -> Result<LineProfiles> {
        // serialize the ephemeral-box machinery across line requests
        let _engine = self.line_profile_mutex.lock().expect("line engine");
        let csys = context.frame.coordinate_system();
        let start_generation = self.region(context.region_id).map(|r| r.generation());

        if let Some(profiles) =
            self.fixed_pixel_profiles(context, csys, start_generation, &mut progress)?
        {
            tracing::debug!(
                "region {}: fixed pixel spacing for line profiles",
                context.region_id
            );
            return Ok(profiles);
        }
        tracing::debug!(
            "region {}: falling back to fixed angular spacing",
            context.region_id
        );
        self.fixed_angular_profiles(context, csys, start_generation, &mut progress)
    }

    /// Fixed-pixel strategy; `Ok(None)` when offsets are not uniform.
    fn fixed_pixel_profiles(
        &self,
        context: &LineProfileContext<'_>,
        csys: &CoordinateSystem,
        start_generation: Option<u64>,
        progress: &mut impl FnMut(f64),
    ) -> Result<Option<LineProfiles>> {
        let points = &context.region_state.control_points;
        let num_lines = points.len() - 1;
        let mut all_centers: Vec<(DVec2, f64)> = Vec::new(); // center, rotation
        let mut increment = 0.0f64;

        if num_lines == 1 {
            let (start, end) = (points[0], points[1]);
            let pixel_length = (end - start).length();
            let num_offsets = (((pixel_length - 1.0) / 2.0).round() as i64).max(0);
            let rotation = line_rotation(start, end);
            let (sin, cos) = rotation.to_radians().sin_cos();
            let center = (start + end) / 2.0;

            let mut centers = vec![DVec2::ZERO; (num_offsets * 2 + 1) as usize];
            let center_idx = num_offsets as usize;
            centers[center_idx] = center;
            for offset in 1..=num_offsets {
                let delta = DVec2::new(offset as f64 * cos, offset as f64 * sin);
                centers[center_idx + offset as usize] = center + delta;
                centers[center_idx - offset as usize] = center - delta;
            }

            if centers.len() == 1 {
                let dx = csys.to_world_length(cos, 0);
                let dy = csys.to_world_length(sin, 1);
                increment = (dx * dx + dy * dy).sqrt();
            } else {
                match check_linear_offsets(&centers, csys) {
                    Some(inc) => increment = inc,
                    None => return Ok(None),
                }
            }
            all_centers.extend(centers.into_iter().map(|c| (c, rotation)));
        } else {
            // polyline: walk each segment from its start, trimming the
            // first box after a vertex when segments overlap
            let mut trim = false;
            for segment in points.windows(2) {
                let (start, end) = (segment[0], segment[1]);
                let pixel_length = (end - start).length();
                let num_regions = pixel_length as i64 + 1;
                let rotation = line_rotation(start, end);
                let (sin, cos) = rotation.to_radians().sin_cos();

                let from = if trim { 1 } else { 0 };
                let centers: Vec<DVec2> = (from..num_regions)
                    .map(|i| start - DVec2::new(i as f64 * cos, i as f64 * sin))
                    .collect();
                if centers.is_empty() {
                    continue;
                }
                if centers.len() == 1 {
                    let dx = csys.to_world_length(cos, 0);
                    let dy = csys.to_world_length(sin, 1);
                    increment = (dx * dx + dy * dy).sqrt();
                } else {
                    match check_linear_offsets(&centers, csys) {
                        Some(inc) => increment = inc,
                        None => return Ok(None),
                    }
                }
                trim = true;
                all_centers.extend(centers.into_iter().map(|c| (c, rotation)));
            }
        }

        let mut profiles = LineProfiles {
            rows: Vec::with_capacity(all_centers.len()),
            increment_arcsec: increment,
            max_num_pixels: 0.0,
        };
        let num_regions = all_centers.len();
        let mut last_report = std::time::Instant::now();

        for (index, (center, rotation)) in all_centers.iter().enumerate() {
            if context.cancelled(start_generation) {
                return Err(Error::cancelled("line profiles"));
            }
            // overlap boxes along the line unless it is axis-aligned
            let along = if is_axis_aligned(*rotation) { 1.0 } else { 3.0 };
            let box_state = RegionState::new(
                context.region_state.reference_file_id,
                RegionType::Rectangle,
                vec![*center, DVec2::new(along, context.width as f64)],
                *rotation,
            );
            let (row, num_pixels) = self.temporary_region_profile(context, &box_state)?;
            profiles.max_num_pixels = profiles.max_num_pixels.max(num_pixels);
            profiles.rows.push(row);

            let fraction = (index + 1) as f64 / num_regions as f64;
            if context.per_z
                && (fraction >= 1.0
                    || last_report.elapsed().as_secs_f64() * 1e3
                        > LINE_PROFILE_PROGRESS_INTERVAL_MS)
            {
                last_report = std::time::Instant::now();
                progress(fraction);
            }
        }
        Ok(Some(profiles))
    }

    /// Fixed-angular strategy: bisection along the line for uniformly
    /// separated centers, polygon boxes across the line.
    fn fixed_angular_profiles(
        &self,
        context: &LineProfileContext<'_>,
        csys: &CoordinateSystem,
        start_generation: Option<u64>,
        progress: &mut impl FnMut(f64),
    ) -> Result<LineProfiles> {
        let target = csys.cdelt2_arcsec();
        if target <= 0.0 {
            return Err(Error::invalid_request(
                "image has no angular pixel scale for line profiles",
            ));
        }
        let tolerance = target * 0.1;
        let angular_width = context.width as f64 * target;
        let points = &context.region_state.control_points;

        let mut centers: Vec<DVec2> = Vec::new();
        for segment in points.windows(2) {
            let (start, end) = (segment[0], segment[1]);
            let mut segment_centers = vec![start];
            loop {
                let previous = *segment_centers.last().expect("non-empty");
                match next_point_at_separation(csys, previous, end, target, tolerance) {
                    Some(next) => segment_centers.push(next),
                    None => break,
                }
            }
            // drop the vertex duplicate when the previous segment ended
            // within half a spacing of this segment's start
            if let Some(&last) = centers.last() {
                let gap = csys.angular_separation(
                    (last.x, last.y),
                    (segment_centers[0].x, segment_centers[0].y),
                );
                if gap < target / 2.0 {
                    segment_centers.remove(0);
                }
            }
            centers.extend(segment_centers);
        }
        if centers.len() < 2 {
            return Err(Error::invalid_request("line shorter than one spacing"));
        }

        let mut profiles = LineProfiles {
            rows: Vec::with_capacity(centers.len()),
            increment_arcsec: target,
            max_num_pixels: 0.0,
        };
        let num_regions = centers.len();
        let mut last_report = std::time::Instant::now();

        for index in 0..num_regions {
            if context.cancelled(start_generation) {
                return Err(Error::cancelled("line profiles"));
            }
            // polygon corners half the angular width off the segment
            let (a, b) = if index + 1 < num_regions {
                (centers[index], centers[index + 1])
            } else {
                (centers[index - 1], centers[index])
            };
            let direction = (b - a).normalize_or_zero();
            let perpendicular = DVec2::new(-direction.y, direction.x);
            let half_width_pixels = (angular_width / 2.0) / target; // 1 pixel per target spacing
            let offset = perpendicular * half_width_pixels;
            let center = centers[index];
            let half_step = direction / 2.0;

            let box_state = RegionState::new(
                context.region_state.reference_file_id,
                RegionType::Polygon,
                vec![
                    center - half_step + offset,
                    center + half_step + offset,
                    center + half_step - offset,
                    center - half_step - offset,
                ],
                0.0,
            );
            let (row, num_pixels) = self.temporary_region_profile(context, &box_state)?;
            profiles.max_num_pixels = profiles.max_num_pixels.max(num_pixels);
            profiles.rows.push(row);

            let fraction = (index + 1) as f64 / num_regions as f64;
            if context.per_z
                && (fraction >= 1.0
                    || last_report.elapsed().as_secs_f64() * 1e3
                        > LINE_PROFILE_PROGRESS_INTERVAL_MS)
            {
                last_report = std::time::Instant::now();
                progress(fraction);
            }
        }
        Ok(profiles)
    }

    /// Mean profile of one ephemeral box applied to the target frame.
    ///
    /// Returns `(profile, max finite pixels per channel)`; a box outside
    /// the image yields NaN rows.
    fn temporary_region_profile(
        &self,
        context: &LineProfileContext<'_>,
        box_state: &RegionState,
    ) -> Result<(Vec<f64>, f64)> {
        let profile_length = if context.per_z {
            context.frame.depth()
        } else {
            1
        };
        let Some(mask) =
            self.apply_state_to_frame(box_state, context.frame, context.file_id)
        else {
            return Ok((vec![f64::NAN; profile_length], 0.0));
        };
        let (z_from, z_to) = if context.per_z {
            (0, context.frame.depth() - 1)
        } else {
            (context.frame.current_z(), context.frame.current_z())
        };
        let region = StokesRegion {
            mask,
            z_from,
            z_to,
            stokes: context.stokes,
        };
        let stats = context.frame.get_region_stats(
            &region,
            &[StatsType::Mean, StatsType::NumPixels],
            true,
        )?;
        let mean = stats
            .get(&StatsType::Mean)
            .cloned()
            .unwrap_or_else(|| vec![f64::NAN; profile_length]);
        let num_pixels = stats
            .get(&StatsType::NumPixels)
            .map(|counts| counts.iter().fold(0.0f64, |m, &v| m.max(v)))
            .unwrap_or(0.0);
        Ok((mean, num_pixels))
    }
}

/// Bisection along `start -> end` for the next point whose angular
/// separation from `start` equals `target` within `tolerance`. `None`
/// when the remaining segment is shorter than the target.
fn next_point_at_separation(
    csys: &CoordinateSystem,
    start: DVec2,
    end: DVec2,
    target: f64,
    tolerance: f64,
) -> Option<DVec2> {
    let full = csys.angular_separation((start.x, start.y), (end.x, end.y));
    if full < target {
        return None;
    }
    let mut lo = 0.0f64;
    let mut hi = 1.0f64;
    for _ in 0..64 {
        let mid = (lo + hi) / 2.0;
        let candidate = start + (end - start) * mid;
        let separation =
            csys.angular_separation((start.x, start.y), (candidate.x, candidate.y));
        if (separation - target).abs() <= tolerance {
            return Some(candidate);
        }
        if separation < target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    None
}

/// Scales an arcsec increment to the display unit of the offset axis:
/// mas below 2 mas total, arcmin above 2 arcmin, degrees above 2 degrees.
pub fn adjust_increment_unit(increment_arcsec: f64, num_offsets: usize) -> (f64, String) {
    let total = increment_arcsec * num_offsets as f64;
    if total < 2e-3 {
        (increment_arcsec * 1e3, "mas".to_string())
    } else if total < 2.0 * 60.0 {
        (increment_arcsec, "arcsec".to_string())
    } else if total < 2.0 * 3600.0 {
        (increment_arcsec / 60.0, "arcmin".to_string())
    } else {
        (increment_arcsec / 3600.0, "deg".to_string())
    }
}
