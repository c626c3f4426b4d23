//! Per-axis statistics over an n-d region sub-lattice.
//!
//! Input is a dense `width × height × num_z` buffer (x fastest) cut out of
//! the image around a region's bounding box, plus an optional per-plane
//! mask selecting the pixels inside the region. Statistics are computed
//! either over the whole sub-lattice or per z-plane.
//!
//! A statistic whose pixel count is zero reports NaN, so a region outside
//! the image or fully blanked still produces a complete result vector.

use crate::basic::{calc_basic_stats, BasicStats};
use cube_core::messages::StatsType;
use rayon::prelude::*;
use std::collections::HashMap;

/// The statistics carried by spectral profiles, in wire order.
pub const SPECTRAL_STATS: [StatsType; 10] = [
    StatsType::NumPixels,
    StatsType::Sum,
    StatsType::FluxDensity,
    StatsType::Mean,
    StatsType::Rms,
    StatsType::Sigma,
    StatsType::SumSq,
    StatsType::Min,
    StatsType::Max,
    StatsType::Extrema,
];

/// Masked sub-lattice handed to the statistics kernels.
#[derive(Debug, Clone)]
pub struct RegionLattice<'a> {
    /// Dense pixel data, `width * height * num_z` long, x fastest.
    pub data: &'a [f32],
    /// Sub-lattice width.
    pub width: usize,
    /// Sub-lattice height.
    pub height: usize,
    /// Number of z planes in the buffer.
    pub num_z: usize,
    /// Per-plane mask (`width * height`); `None` selects every pixel.
    pub mask: Option<&'a [bool]>,
    /// Bottom-left corner of the sub-lattice in image coordinates.
    pub origin: (usize, usize),
    /// Beam area in pixels, when the image has a restoring beam.
    pub beam_area: Option<f64>,
}

impl RegionLattice<'_> {
    fn plane(&self, z: usize) -> &[f32] {
        let plane_size = self.width * self.height;
        &self.data[z * plane_size..(z + 1) * plane_size]
    }

    /// Collects the masked finite-or-not values of one plane.
    fn masked_plane(&self, z: usize) -> Vec<f32> {
        let plane = self.plane(z);
        match self.mask {
            None => plane.to_vec(),
            Some(mask) => plane
                .iter()
                .zip(mask)
                .filter_map(|(&v, &keep)| keep.then_some(v))
                .collect(),
        }
    }
}

fn stat_from_basic(
    stats_type: StatsType,
    stats: &BasicStats,
    beam_area: Option<f64>,
) -> f64 {
    let n = stats.num_pixels as f64;
    match stats_type {
        StatsType::NumPixels => n,
        StatsType::Sum => nan_if_empty(stats, stats.sum),
        StatsType::FluxDensity => match beam_area {
            Some(area) if stats.num_pixels > 0 => stats.sum / area,
            _ => f64::NAN,
        },
        StatsType::Mean => stats.mean,
        StatsType::Rms => nan_if_empty(stats, (stats.sum_sq / n).sqrt()),
        StatsType::Sigma => stats.std_dev,
        StatsType::SumSq => nan_if_empty(stats, stats.sum_sq),
        StatsType::Min => stats.min_val,
        StatsType::Max => stats.max_val,
        StatsType::Extrema => {
            if stats.num_pixels == 0 {
                f64::NAN
            } else if stats.min_val.abs() > stats.max_val.abs() {
                stats.min_val
            } else {
                stats.max_val
            }
        }
        // position stats are handled by the caller
        _ => f64::NAN,
    }
}

#[inline]
fn nan_if_empty(stats: &BasicStats, value: f64) -> f64 {
    if stats.num_pixels == 0 {
        f64::NAN
    } else {
        value
    }
}

/// Computes the requested statistics over the sub-lattice.
///
/// With `per_z` each statistic is a vector of length `num_z`; otherwise a
/// single value (position statistics report `[x, y]` pairs and are only
/// available when `per_z` is false, matching the per-region stats stream).
pub fn calc_stats_values(
    lattice: &RegionLattice<'_>,
    requested: &[StatsType],
    per_z: bool,
) -> HashMap<StatsType, Vec<f64>> {
    let mut results = HashMap::with_capacity(requested.len());

    if per_z {
        let per_plane: Vec<BasicStats> = (0..lattice.num_z)
            .into_par_iter()
            .map(|z| calc_basic_stats(&lattice.masked_plane(z)))
            .collect();

        for &stats_type in requested {
            let values: Vec<f64> = per_plane
                .iter()
                .map(|s| stat_from_basic(stats_type, s, lattice.beam_area))
                .collect();
            results.insert(stats_type, values);
        }
        return results;
    }

    let all: Vec<f32> = (0..lattice.num_z)
        .flat_map(|z| lattice.masked_plane(z))
        .collect();
    let stats = calc_basic_stats(&all);

    for &stats_type in requested {
        let values = match stats_type {
            StatsType::Blc => {
                vec![lattice.origin.0 as f64, lattice.origin.1 as f64]
            }
            StatsType::Trc => vec![
                (lattice.origin.0 + lattice.width.saturating_sub(1)) as f64,
                (lattice.origin.1 + lattice.height.saturating_sub(1)) as f64,
            ],
            StatsType::MinPos => position_of(lattice, stats.min_val),
            StatsType::MaxPos => position_of(lattice, stats.max_val),
            other => vec![stat_from_basic(other, &stats, lattice.beam_area)],
        };
        results.insert(stats_type, values);
    }
    results
}

/// Image coordinates of the first masked pixel equal to `target`.
fn position_of(lattice: &RegionLattice<'_>, target: f64) -> Vec<f64> {
    if !target.is_finite() {
        return vec![f64::NAN, f64::NAN];
    }
    let plane_size = lattice.width * lattice.height;
    for z in 0..lattice.num_z {
        let plane = &lattice.data[z * plane_size..(z + 1) * plane_size];
        for (i, &v) in plane.iter().enumerate() {
            if let Some(mask) = lattice.mask {
                if !mask[i] {
                    continue;
                }
            }
            if v as f64 == target {
                let x = i % lattice.width + lattice.origin.0;
                let y = i / lattice.width + lattice.origin.1;
                return vec![x as f64, y as f64];
            }
        }
    }
    vec![f64::NAN, f64::NAN]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn lattice<'a>(data: &'a [f32], w: usize, h: usize, nz: usize) -> RegionLattice<'a> {
        RegionLattice {
            data,
            width: w,
            height: h,
            num_z: nz,
            mask: None,
            origin: (0, 0),
            beam_area: None,
        }
    }

    #[test]
    fn test_whole_lattice_stats() {
        let data = [1.0f32, 2.0, 3.0, 4.0];
        let l = lattice(&data, 2, 2, 1);
        let stats = calc_stats_values(&l, &[StatsType::Sum, StatsType::Mean], false);
        assert_relative_eq!(stats[&StatsType::Sum][0], 10.0);
        assert_relative_eq!(stats[&StatsType::Mean][0], 2.5);
    }

    #[test]
    fn test_per_z_stats() {
        // two planes: [1, 1] and [3, 5]
        let data = [1.0f32, 1.0, 3.0, 5.0];
        let l = lattice(&data, 2, 1, 2);
        let stats = calc_stats_values(&l, &[StatsType::Mean, StatsType::NumPixels], true);
        assert_eq!(stats[&StatsType::Mean].len(), 2);
        assert_relative_eq!(stats[&StatsType::Mean][0], 1.0);
        assert_relative_eq!(stats[&StatsType::Mean][1], 4.0);
        assert_relative_eq!(stats[&StatsType::NumPixels][1], 2.0);
    }

    #[test]
    fn test_mask_excludes_pixels() {
        let data = [1.0f32, 100.0, 2.0, 100.0];
        let mask = [true, false, true, false];
        let l = RegionLattice {
            mask: Some(&mask),
            ..lattice(&data, 2, 2, 1)
        };
        let stats = calc_stats_values(&l, &[StatsType::Max, StatsType::NumPixels], false);
        assert_relative_eq!(stats[&StatsType::Max][0], 2.0);
        assert_relative_eq!(stats[&StatsType::NumPixels][0], 2.0);
    }

    #[test]
    fn test_empty_region_is_nan() {
        let data = [f32::NAN; 4];
        let l = lattice(&data, 2, 2, 1);
        let stats = calc_stats_values(&l, &SPECTRAL_STATS, false);
        assert_relative_eq!(stats[&StatsType::NumPixels][0], 0.0);
        assert!(stats[&StatsType::Mean][0].is_nan());
        assert!(stats[&StatsType::Sum][0].is_nan());
        assert!(stats[&StatsType::Extrema][0].is_nan());
    }

    #[test]
    fn test_rms_and_extrema() {
        let data = [-4.0f32, 3.0];
        let l = lattice(&data, 2, 1, 1);
        let stats = calc_stats_values(&l, &[StatsType::Rms, StatsType::Extrema], false);
        assert_relative_eq!(stats[&StatsType::Rms][0], (25.0f64 / 2.0).sqrt());
        assert_relative_eq!(stats[&StatsType::Extrema][0], -4.0);
    }

    #[test]
    fn test_flux_density_requires_beam() {
        let data = [2.0f32, 2.0];
        let mut l = lattice(&data, 2, 1, 1);
        let no_beam = calc_stats_values(&l, &[StatsType::FluxDensity], false);
        assert!(no_beam[&StatsType::FluxDensity][0].is_nan());

        l.beam_area = Some(4.0);
        let with_beam = calc_stats_values(&l, &[StatsType::FluxDensity], false);
        assert_relative_eq!(with_beam[&StatsType::FluxDensity][0], 1.0);
    }

    #[test]
    fn test_positions() {
        let data = [5.0f32, 1.0, 9.0, 2.0];
        let l = RegionLattice {
            origin: (10, 20),
            ..lattice(&data, 2, 2, 1)
        };
        let stats = calc_stats_values(
            &l,
            &[StatsType::MinPos, StatsType::MaxPos, StatsType::Blc, StatsType::Trc],
            false,
        );
        assert_eq!(stats[&StatsType::MinPos], vec![11.0, 20.0]);
        assert_eq!(stats[&StatsType::MaxPos], vec![10.0, 21.0]);
        assert_eq!(stats[&StatsType::Blc], vec![10.0, 20.0]);
        assert_eq!(stats[&StatsType::Trc], vec![11.0, 21.0]);
    }
}
