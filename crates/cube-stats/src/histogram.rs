//! Fixed-width binning histograms.
//!
//! Bins span `[min, max]` with `bin_width = (max - min) / num_bins`; a
//! value's bin index is clamped into `[0, num_bins - 1]` so `max` itself
//! lands in the last bin. NaN and ±Inf values are skipped, which is why
//! `sum(bins) ≤ num_pixels` rather than equality against the raw length.

use crate::basic::BasicStats;
use cube_core::messages::HistogramData;
use rayon::prelude::*;

/// Minimum chunk length worth a rayon task.
const PAR_CHUNK: usize = 64 * 1024;

/// Histogram bin count for automatic sizing: `max(2, ceil(sqrt(w * h)))`.
pub fn auto_bin_size(width: usize, height: usize) -> usize {
    (((width * height) as f64).sqrt().ceil() as usize).max(2)
}

/// A filled fixed-width histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    num_bins: usize,
    bin_width: f64,
    min_val: f64,
    bins: Vec<i64>,
}

impl Histogram {
    /// Bins `data` into `num_bins` bins over `[min, max]`.
    ///
    /// Degenerate bounds (NaN, or an empty value range with no finite
    /// pixels) produce all-zero bins with `bin_width = 0`.
    pub fn new(num_bins: usize, min: f64, max: f64, data: &[f32]) -> Self {
        let num_bins = num_bins.max(1);
        if !min.is_finite() || !max.is_finite() || data.is_empty() {
            return Self {
                num_bins,
                bin_width: 0.0,
                min_val: if min.is_finite() { min } else { 0.0 },
                bins: vec![0; num_bins],
            };
        }

        let bin_width = (max - min) / num_bins as f64;
        let bins = if data.len() < PAR_CHUNK {
            Self::fill(num_bins, min, bin_width, data)
        } else {
            data.par_chunks(PAR_CHUNK)
                .map(|chunk| Self::fill(num_bins, min, bin_width, chunk))
                .reduce(
                    || vec![0i64; num_bins],
                    |mut a, b| {
                        for (dst, src) in a.iter_mut().zip(b) {
                            *dst += src;
                        }
                        a
                    },
                )
        };

        Self {
            num_bins,
            bin_width,
            min_val: min,
            bins,
        }
    }

    fn fill(num_bins: usize, min: f64, bin_width: f64, data: &[f32]) -> Vec<i64> {
        let mut bins = vec![0i64; num_bins];
        for &v in data {
            if !v.is_finite() {
                continue;
            }
            let bin = if bin_width > 0.0 {
                (((v as f64 - min) / bin_width) as i64).clamp(0, num_bins as i64 - 1) as usize
            } else {
                // constant-valued data collapses into the first bin
                0
            };
            bins[bin] += 1;
        }
        bins
    }

    /// Number of bins.
    #[inline]
    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    /// Bin width.
    #[inline]
    pub fn bin_width(&self) -> f64 {
        self.bin_width
    }

    /// Bin counts.
    #[inline]
    pub fn bins(&self) -> &[i64] {
        &self.bins
    }

    /// Packages the histogram with its source statistics into the output
    /// message payload.
    pub fn results(&self, stats: &BasicStats) -> HistogramData {
        HistogramData {
            num_bins: self.num_bins,
            bin_width: self.bin_width,
            first_bin_center: self.min_val + self.bin_width * 0.5,
            bins: self.bins.clone(),
            mean: stats.mean,
            std_dev: stats.std_dev,
        }
    }
}

/// Computes a histogram from precomputed [`BasicStats`] bounds.
pub fn calc_histogram(num_bins: usize, stats: &BasicStats, data: &[f32]) -> HistogramData {
    Histogram::new(num_bins, stats.min_val, stats.max_val, data).results(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::calc_basic_stats;
    use approx::assert_relative_eq;

    #[test]
    fn test_two_bins_with_nan_and_inf() {
        // count 2 (Inf is missing), min 1, max 2, width 0.5, one value per bin
        let data = [1.0f32, 2.0, f32::NAN, f32::INFINITY];
        let stats = calc_basic_stats(&data);
        let result = calc_histogram(2, &stats, &data);

        assert_eq!(stats.num_pixels, 2);
        assert_relative_eq!(result.bin_width, 0.5);
        assert_eq!(result.bins, vec![1, 1]);
        assert_relative_eq!(result.first_bin_center, 1.25);
    }

    #[test]
    fn test_constant_data_single_bin() {
        let data = [7.5f32; 42];
        let stats = calc_basic_stats(&data);
        let result = calc_histogram(8, &stats, &data);

        assert_eq!(result.bins.iter().sum::<i64>(), 42);
        assert_eq!(result.bins[0], 42);
        assert_relative_eq!(result.bin_width, 0.0);
        assert_relative_eq!(result.mean, 7.5);
        assert_relative_eq!(result.std_dev, 0.0);
    }

    #[test]
    fn test_all_nan_zero_bins() {
        let data = [f32::NAN; 16];
        let stats = calc_basic_stats(&data);
        let result = calc_histogram(4, &stats, &data);

        assert_eq!(result.bins, vec![0, 0, 0, 0]);
        assert_relative_eq!(result.bin_width, 0.0);
    }

    #[test]
    fn test_bin_sum_bounded_by_count() {
        let data: Vec<f32> = (0..1000)
            .map(|i| if i % 3 == 0 { f32::NAN } else { i as f32 })
            .collect();
        let stats = calc_basic_stats(&data);
        let result = calc_histogram(16, &stats, &data);
        assert!(result.bins.iter().sum::<i64>() as u64 <= stats.num_pixels);
    }

    #[test]
    fn test_max_lands_in_last_bin() {
        let data = [0.0f32, 10.0];
        let stats = calc_basic_stats(&data);
        let hist = Histogram::new(5, stats.min_val, stats.max_val, &data);
        assert_eq!(hist.bins()[4], 1);
        assert_eq!(hist.bins()[0], 1);
    }

    #[test]
    fn test_parallel_matches_serial() {
        let data: Vec<f32> = (0..300_000).map(|i| ((i * 31) % 977) as f32).collect();
        let stats = calc_basic_stats(&data);
        let par = Histogram::new(64, stats.min_val, stats.max_val, &data);
        let ser = Histogram::fill(64, stats.min_val, par.bin_width(), &data);
        assert_eq!(par.bins(), &ser[..]);
    }

    #[test]
    fn test_auto_bin_size() {
        assert_eq!(auto_bin_size(4, 4), 4);
        assert_eq!(auto_bin_size(1, 1), 2);
        assert_eq!(auto_bin_size(1110, 1110), 1110);
    }
}
