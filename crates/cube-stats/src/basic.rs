//! Basic statistics over contiguous float buffers.
//!
//! NaN and ±Inf cells are treated as missing everywhere in the compute
//! core; [`calc_basic_stats`] therefore counts only finite pixels and
//! reports NaN aggregates for an empty (or all-blank) buffer.

use rayon::prelude::*;

/// Minimum chunk length worth a rayon task.
const PAR_CHUNK: usize = 64 * 1024;

/// Compact statistics tuple over one buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasicStats {
    /// Count of finite pixels.
    pub num_pixels: u64,
    /// Minimum finite value; NaN when `num_pixels == 0`.
    pub min_val: f64,
    /// Maximum finite value; NaN when `num_pixels == 0`.
    pub max_val: f64,
    /// Sum of finite values.
    pub sum: f64,
    /// Sum of squared finite values.
    pub sum_sq: f64,
    /// Arithmetic mean; NaN when `num_pixels == 0`.
    pub mean: f64,
    /// Sample standard deviation; NaN when `num_pixels < 2`.
    pub std_dev: f64,
}

impl BasicStats {
    fn empty() -> Self {
        Self {
            num_pixels: 0,
            min_val: f64::NAN,
            max_val: f64::NAN,
            sum: 0.0,
            sum_sq: 0.0,
            mean: f64::NAN,
            std_dev: f64::NAN,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    count: u64,
    min: f64,
    max: f64,
    sum: f64,
    sum_sq: f64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    #[inline]
    fn push(&mut self, value: f32) {
        if !value.is_finite() {
            return;
        }
        let v = value as f64;
        self.count += 1;
        self.sum += v;
        self.sum_sq += v * v;
        if v < self.min {
            self.min = v;
        }
        if v > self.max {
            self.max = v;
        }
    }

    fn join(mut self, other: Self) -> Self {
        self.count += other.count;
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self
    }

    fn finish(self) -> BasicStats {
        if self.count == 0 {
            return BasicStats::empty();
        }
        let n = self.count as f64;
        let mean = self.sum / n;
        let std_dev = if self.count > 1 {
            ((self.sum_sq - self.sum * self.sum / n) / (n - 1.0)).max(0.0).sqrt()
        } else {
            f64::NAN
        };
        BasicStats {
            num_pixels: self.count,
            min_val: self.min,
            max_val: self.max,
            sum: self.sum,
            sum_sq: self.sum_sq,
            mean,
            std_dev,
        }
    }
}

/// Computes [`BasicStats`] over a buffer, in parallel for large inputs.
pub fn calc_basic_stats(data: &[f32]) -> BasicStats {
    if data.len() < PAR_CHUNK {
        let mut acc = Accumulator::new();
        for &v in data {
            acc.push(v);
        }
        return acc.finish();
    }

    data.par_chunks(PAR_CHUNK)
        .map(|chunk| {
            let mut acc = Accumulator::new();
            for &v in chunk {
                acc.push(v);
            }
            acc
        })
        .reduce(Accumulator::new, Accumulator::join)
        .finish()
}

/// Min/max of the finite values, NaN pair when there are none.
pub fn min_max(data: &[f32]) -> (f64, f64) {
    let stats = calc_basic_stats(data);
    (stats.min_val, stats.max_val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_simple_stats() {
        let data = [1.0f32, 2.0, 3.0, 4.0];
        let stats = calc_basic_stats(&data);
        assert_eq!(stats.num_pixels, 4);
        assert_relative_eq!(stats.min_val, 1.0);
        assert_relative_eq!(stats.max_val, 4.0);
        assert_relative_eq!(stats.sum, 10.0);
        assert_relative_eq!(stats.sum_sq, 30.0);
        assert_relative_eq!(stats.mean, 2.5);
        // sample std dev of 1..4
        assert_relative_eq!(stats.std_dev, (5.0f64 / 3.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_nan_and_inf_are_missing() {
        let data = [1.0f32, f32::NAN, 2.0, f32::INFINITY, f32::NEG_INFINITY];
        let stats = calc_basic_stats(&data);
        assert_eq!(stats.num_pixels, 2);
        assert_relative_eq!(stats.min_val, 1.0);
        assert_relative_eq!(stats.max_val, 2.0);
    }

    #[test]
    fn test_empty_is_nan() {
        let stats = calc_basic_stats(&[]);
        assert_eq!(stats.num_pixels, 0);
        assert!(stats.min_val.is_nan());
        assert!(stats.max_val.is_nan());
        assert!(stats.mean.is_nan());
        assert!(stats.std_dev.is_nan());
    }

    #[test]
    fn test_all_nan_is_empty() {
        let stats = calc_basic_stats(&[f32::NAN; 100]);
        assert_eq!(stats.num_pixels, 0);
        assert!(stats.mean.is_nan());
    }

    #[test]
    fn test_parallel_matches_serial() {
        let data: Vec<f32> = (0..200_000)
            .map(|i| if i % 17 == 0 { f32::NAN } else { (i % 101) as f32 })
            .collect();
        let par = calc_basic_stats(&data);

        let mut acc = Accumulator::new();
        for &v in &data {
            acc.push(v);
        }
        let ser = acc.finish();

        assert_eq!(par.num_pixels, ser.num_pixels);
        assert_relative_eq!(par.sum, ser.sum, epsilon = 1e-6);
        assert_relative_eq!(par.min_val, ser.min_val);
        assert_relative_eq!(par.max_val, ser.max_val);
    }

    #[test]
    fn test_single_value_std_dev_nan() {
        let stats = calc_basic_stats(&[5.0f32]);
        assert_eq!(stats.num_pixels, 1);
        assert_relative_eq!(stats.mean, 5.0);
        assert!(stats.std_dev.is_nan());
    }
}
