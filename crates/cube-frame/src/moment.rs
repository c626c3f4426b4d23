//! Moment image generation.
//!
//! Collapses a channel range into per-pixel moments over the spectral
//! axis, inside an optional region mask and pixel-value range. The
//! generator reports progress per processed strip, polls the stop flag
//! between strips, and emits the results as in-memory images tagged with
//! stable synthetic file ids.

use crate::frame::Frame;
use cube_core::messages::{GeneratedImage, MomentResponse};
use cube_core::requests::{Moment, MomentRequest};
use cube_core::{CoordinateSystem, ImageShape, Result};
use cube_region::StokesRegion;
use rayon::prelude::*;
use std::sync::atomic::Ordering;

/// Synthetic file id block per source file: moment k of file f gets
/// `(f + 1) * MOMENT_ID_MULTIPLIER + k`.
pub const MOMENT_ID_MULTIPLIER: i32 = 1000;

/// Spectral world coordinate of a channel.
fn channel_world(csys: &CoordinateSystem, z: usize) -> f64 {
    match &csys.spectral {
        Some(desc) => desc.pixel_to_world(z as f64),
        None => z as f64,
    }
}

struct PixelSpectrum<'a> {
    values: &'a [f32],
    coords: &'a [f64],
    range: Option<(f32, f32)>,
}

impl PixelSpectrum<'_> {
    fn samples(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.values
            .iter()
            .zip(self.coords)
            .filter_map(move |(&f, &v)| {
                if !f.is_finite() {
                    return None;
                }
                if let Some((lo, hi)) = self.range {
                    if f < lo || f > hi {
                        return None;
                    }
                }
                Some((f as f64, v))
            })
    }

    fn moment(&self, moment: Moment, delta_v: f64) -> f64 {
        let mut n = 0usize;
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut sum_fv = 0.0f64;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut min_v = f64::NAN;
        let mut max_v = f64::NAN;
        for (f, v) in self.samples() {
            n += 1;
            sum += f;
            sum_sq += f * f;
            sum_fv += f * v;
            if f < min {
                min = f;
                min_v = v;
            }
            if f > max {
                max = f;
                max_v = v;
            }
        }
        if n == 0 {
            return f64::NAN;
        }
        let nf = n as f64;
        let mean = sum / nf;

        match moment {
            Moment::Mean => mean,
            Moment::Integrated => sum * delta_v,
            Moment::WeightedCoord => sum_fv / sum,
            Moment::WeightedDispersionCoord => {
                let centroid = sum_fv / sum;
                let weighted: f64 = self
                    .samples()
                    .map(|(f, v)| f * (v - centroid) * (v - centroid))
                    .sum();
                (weighted / sum).max(0.0).sqrt()
            }
            Moment::Median => {
                let mut values: Vec<f64> = self.samples().map(|(f, _)| f).collect();
                values.sort_by(|a, b| a.total_cmp(b));
                let mid = values.len() / 2;
                if values.len() % 2 == 0 {
                    (values[mid - 1] + values[mid]) / 2.0
                } else {
                    values[mid]
                }
            }
            Moment::StdAboutMean => {
                if n < 2 {
                    f64::NAN
                } else {
                    ((sum_sq - sum * sum / nf) / (nf - 1.0)).max(0.0).sqrt()
                }
            }
            Moment::Rms => (sum_sq / nf).sqrt(),
            Moment::AbsMeanDev => {
                self.samples().map(|(f, _)| (f - mean).abs()).sum::<f64>() / nf
            }
            Moment::Max => max,
            Moment::MaxCoord => max_v,
            Moment::Min => min,
            Moment::MinCoord => min_v,
        }
    }
}

impl Frame {
    /// Produces the requested moment images over a Stokes region.
    ///
    /// Progress is reported in `[0, 1]` per strip of rows; setting the
    /// stop flag between strips yields a cancelled response with no
    /// images.
    pub fn calculate_moments(
        &self,
        region: &StokesRegion,
        request: &MomentRequest,
        mut progress: impl FnMut(f64),
    ) -> MomentResponse {
        self.moment_stop.store(false, Ordering::Release);
        if request.moments.is_empty() {
            return MomentResponse {
                success: false,
                cancelled: false,
                message: "no moments requested".to_string(),
                images: vec![],
            };
        }

        match self.calculate_moments_inner(region, request, &mut progress) {
            Ok(Some(images)) => MomentResponse {
                success: true,
                cancelled: false,
                message: String::new(),
                images,
            },
            Ok(None) => MomentResponse {
                success: false,
                cancelled: true,
                message: "moment generator cancelled".to_string(),
                images: vec![],
            },
            Err(err) => MomentResponse {
                success: false,
                cancelled: false,
                message: err.to_string(),
                images: vec![],
            },
        }
    }

    fn calculate_moments_inner(
        &self,
        region: &StokesRegion,
        request: &MomentRequest,
        progress: &mut impl FnMut(f64),
    ) -> Result<Option<Vec<GeneratedImage>>> {
        let _task = self.active_task_lock().read().expect("active task lock");
        let start = std::time::Instant::now();

        // one bulk read of the region sub-lattice for the whole run
        let data = self.get_region_data(region)?;
        let (width, height) = (region.mask.width, region.mask.height);
        let num_z = region.z_to - region.z_from + 1;
        let plane = width * height;

        let csys = self.coordinate_system();
        let coords: Vec<f64> = (region.z_from..=region.z_to)
            .map(|z| channel_world(csys, z))
            .collect();
        let delta_v = csys
            .spectral
            .as_ref()
            .map(|d| d.cdelt.abs())
            .unwrap_or(1.0);

        // spectra in pixel-major order so each output pixel reads one run
        let mut spectra = vec![0.0f32; data.len()];
        for z in 0..num_z {
            for p in 0..plane {
                spectra[p * num_z + z] = data[z * plane + p];
            }
        }

        let mut images = Vec::with_capacity(request.moments.len());
        let strip = (height / 16).max(1);
        for (moment_idx, &moment) in request.moments.iter().enumerate() {
            let mut out = vec![f32::NAN; plane];

            let mut row = 0usize;
            while row < height {
                if self.moment_stop.load(Ordering::Acquire) || !self.is_connected() {
                    return Ok(None);
                }
                let rows = strip.min(height - row);
                let base = row * width;
                out[base..base + rows * width]
                    .par_iter_mut()
                    .enumerate()
                    .for_each(|(offset, cell)| {
                        let p = base + offset;
                        if !region.mask.mask[p] {
                            return;
                        }
                        let spectrum = PixelSpectrum {
                            values: &spectra[p * num_z..(p + 1) * num_z],
                            coords: &coords,
                            range: request.pixel_range,
                        };
                        *cell = spectrum.moment(moment, delta_v) as f32;
                    });
                row += rows;

                let done = moment_idx as f64 + row as f64 / height as f64;
                progress(done / request.moments.len() as f64);
            }

            let shape = ImageShape::plane(width, height)?;
            images.push(GeneratedImage {
                file_id: (self.file_id() + 1) * MOMENT_ID_MULTIPLIER + moment_idx as i32,
                name: format!(
                    "{}.{}",
                    self.with_loader(|loader| loader.file_name().to_string()),
                    moment.suffix()
                ),
                shape,
                csys: CoordinateSystem {
                    x: csys.x.clone(),
                    y: csys.y.clone(),
                    spectral: None,
                    radesys: csys.radesys.clone(),
                },
                data: out,
            });
        }

        progress(1.0);
        tracing::debug!(
            "computed {} moments over {}x{}x{} in {:.3} ms",
            request.moments.len(),
            width,
            height,
            num_z,
            start.elapsed().as_secs_f64() * 1e3
        );
        Ok(Some(images))
    }
}
