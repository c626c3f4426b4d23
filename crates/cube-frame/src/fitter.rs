//! Multi-component 2-d Gaussian image fitting.
//!
//! Damped Gauss-Newton over the finite pixels of a region (or the whole
//! current plane): residuals are linearized with a numerical Jacobian and
//! the normal equations are solved with a Levenberg damping term that
//! grows on rejected steps. Parameter uncertainties come from the
//! residual variance through the normal matrix diagonal.
//!
//! Each component carries (amplitude, center, FWHM major/minor, position
//! angle); integrated flux is `A · π · fwhm_x · fwhm_y / (4 ln 2)`.

use crate::frame::Frame;
use cube_core::messages::{FittingResponse, GaussianComponent, GeneratedImage};
use cube_core::requests::FittingRequest;
use cube_core::{CoordinateSystem, Error, ImageShape, Result};
use cube_region::StokesRegion;
use std::sync::atomic::Ordering;

/// Parameters per Gaussian component.
const PARAMS: usize = 6;

const FOUR_LN2: f64 = 4.0 * std::f64::consts::LN_2;

/// Synthetic file id offsets of the fit products.
pub const MODEL_ID_MULTIPLIER: i32 = 100_000;

fn evaluate(params: &[f64], x: f64, y: f64) -> f64 {
    params
        .chunks_exact(PARAMS)
        .map(|p| {
            let (amp, x0, y0, fwhm_x, fwhm_y, pa) = (p[0], p[1], p[2], p[3], p[4], p[5]);
            let theta = pa.to_radians();
            let (sin, cos) = theta.sin_cos();
            let dx = (x - x0) * cos + (y - y0) * sin;
            let dy = -(x - x0) * sin + (y - y0) * cos;
            let fx = fwhm_x.abs().max(1e-6);
            let fy = fwhm_y.abs().max(1e-6);
            amp * (-FOUR_LN2 * ((dx / fx).powi(2) + (dy / fy).powi(2))).exp()
        })
        .sum()
}

/// Gaussian elimination with partial pivoting.
fn solve_linear(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for col in row + 1..n {
            sum -= a[row][col] * x[col];
        }
        x[row] = sum / a[row][row];
    }
    Some(x)
}

struct FitData {
    xs: Vec<f64>,
    ys: Vec<f64>,
    values: Vec<f64>,
}

impl FitData {
    fn residuals(&self, params: &[f64]) -> Vec<f64> {
        self.xs
            .iter()
            .zip(&self.ys)
            .zip(&self.values)
            .map(|((&x, &y), &v)| v - evaluate(params, x, y))
            .collect()
    }

    fn chi_sq(&self, params: &[f64]) -> f64 {
        self.residuals(params).iter().map(|r| r * r).sum()
    }
}

impl Frame {
    /// Fits Gaussian components to a region of the current plane.
    pub fn fit_image(
        &self,
        request: &FittingRequest,
        region: Option<&StokesRegion>,
    ) -> FittingResponse {
        self.fitting_stop.store(false, Ordering::Release);
        match self.fit_image_inner(request, region) {
            Ok(response) => response,
            Err(err) => FittingResponse {
                success: false,
                message: err.to_string(),
                components: vec![],
                errors: vec![],
                integrated_flux: vec![],
                log: String::new(),
                model: None,
                residual: None,
            },
        }
    }

    fn fit_image_inner(
        &self,
        request: &FittingRequest,
        region: Option<&StokesRegion>,
    ) -> Result<FittingResponse> {
        if request.initial_values.is_empty() {
            return Err(Error::invalid_request("no initial components"));
        }
        let _task = self.active_task_lock().read().expect("active task lock");
        let start = std::time::Instant::now();
        let z = self.current_z();
        let stokes = self.current_stokes();

        // gather finite (x, y, value) samples
        let (data, origin, width, height) = match region {
            Some(region) => (
                self.get_region_data(region)?,
                region.mask.origin,
                region.mask.width,
                region.mask.height,
            ),
            None => (
                self.channel_data_or_slice(z, stokes)?,
                (0, 0),
                self.width(),
                self.height(),
            ),
        };
        let mut fit_data = FitData {
            xs: Vec::new(),
            ys: Vec::new(),
            values: Vec::new(),
        };
        for (i, &v) in data.iter().take(width * height).enumerate() {
            if let Some(region) = region {
                if !region.mask.mask[i] {
                    continue;
                }
            }
            if v.is_finite() {
                fit_data.xs.push((origin.0 + i % width) as f64);
                fit_data.ys.push((origin.1 + i / width) as f64);
                fit_data.values.push(v as f64);
            }
        }

        let num_params = request.initial_values.len() * PARAMS;
        if fit_data.values.len() <= num_params {
            return Err(Error::invalid_request(
                "not enough finite pixels for the requested components",
            ));
        }

        let mut params: Vec<f64> = request
            .initial_values
            .iter()
            .flat_map(|c| {
                [c.amplitude, c.center_x, c.center_y, c.fwhm_x, c.fwhm_y, c.pa]
            })
            .collect();

        let max_iterations = request.max_iterations.max(1).min(200);
        let mut lambda = 1e-3;
        let mut chi_sq = fit_data.chi_sq(&params);
        let mut log = format!("initial chi^2 = {chi_sq:.6e}\n");
        let mut converged = false;

        for iteration in 0..max_iterations {
            if self.fitting_stop.load(Ordering::Acquire) || !self.is_connected() {
                return Err(Error::cancelled("image fitting"));
            }

            // numerical Jacobian about the current parameters
            let residuals = fit_data.residuals(&params);
            let mut jacobian = vec![vec![0.0f64; num_params]; fit_data.values.len()];
            for p in 0..num_params {
                let step = (params[p].abs() * 1e-6).max(1e-8);
                let mut bumped = params.clone();
                bumped[p] += step;
                for (row, ((&x, &y), jac_row)) in fit_data
                    .xs
                    .iter()
                    .zip(&fit_data.ys)
                    .zip(jacobian.iter_mut())
                    .enumerate()
                {
                    let f0 = fit_data.values[row] - residuals[row];
                    jac_row[p] = (evaluate(&bumped, x, y) - f0) / step;
                }
            }

            // normal equations with Levenberg damping
            let mut normal = vec![vec![0.0f64; num_params]; num_params];
            let mut gradient = vec![0.0f64; num_params];
            for (row, residual) in residuals.iter().enumerate() {
                for a in 0..num_params {
                    gradient[a] += jacobian[row][a] * residual;
                    for b in a..num_params {
                        normal[a][b] += jacobian[row][a] * jacobian[row][b];
                    }
                }
            }
            for a in 0..num_params {
                for b in 0..a {
                    normal[a][b] = normal[b][a];
                }
            }
            let mut damped = normal.clone();
            for (i, row) in damped.iter_mut().enumerate() {
                row[i] += lambda * row[i].max(1e-12);
            }

            let Some(delta) = solve_linear(damped, gradient.clone()) else {
                log.push_str("singular normal matrix\n");
                break;
            };
            let trial: Vec<f64> = params.iter().zip(&delta).map(|(p, d)| p + d).collect();
            let trial_chi_sq = fit_data.chi_sq(&trial);

            if trial_chi_sq < chi_sq {
                let improvement = (chi_sq - trial_chi_sq) / chi_sq.max(1e-30);
                params = trial;
                chi_sq = trial_chi_sq;
                lambda = (lambda * 0.3).max(1e-12);
                log.push_str(&format!(
                    "iteration {iteration}: chi^2 = {chi_sq:.6e}\n"
                ));
                if improvement < 1e-8 {
                    converged = true;
                    break;
                }
            } else {
                lambda *= 10.0;
                if lambda > 1e12 {
                    converged = true; // flat; accept the current solution
                    break;
                }
            }
        }

        // uncertainties from the unweighted normal matrix diagonal
        let dof = (fit_data.values.len() - num_params).max(1) as f64;
        let variance = chi_sq / dof;
        let errors = self.parameter_errors(&fit_data, &params, num_params, variance);

        let components: Vec<GaussianComponent> = params
            .chunks_exact(PARAMS)
            .map(|p| GaussianComponent {
                amplitude: p[0],
                center_x: p[1],
                center_y: p[2],
                fwhm_x: p[3].abs(),
                fwhm_y: p[4].abs(),
                pa: p[5],
            })
            .collect();
        let integrated_flux = components
            .iter()
            .map(|c| c.amplitude * std::f64::consts::PI * c.fwhm_x * c.fwhm_y / FOUR_LN2)
            .collect();

        let (model, residual) = self.fit_product_images(request, &params, width, height, origin)?;

        log.push_str(&format!(
            "final chi^2 = {chi_sq:.6e} over {} pixels\n",
            fit_data.values.len()
        ));
        tracing::debug!(
            "fit {} components over {} pixels in {:.3} ms",
            components.len(),
            fit_data.values.len(),
            start.elapsed().as_secs_f64() * 1e3
        );

        Ok(FittingResponse {
            success: converged,
            message: if converged {
                String::new()
            } else {
                "fit did not converge".to_string()
            },
            components,
            errors,
            integrated_flux,
            log,
            model,
            residual,
        })
    }

    fn parameter_errors(
        &self,
        fit_data: &FitData,
        params: &[f64],
        num_params: usize,
        variance: f64,
    ) -> Vec<GaussianComponent> {
        // diag of (J^T J)^-1 via one solve per basis vector
        let mut normal = vec![vec![0.0f64; num_params]; num_params];
        for (&x, &y) in fit_data.xs.iter().zip(&fit_data.ys) {
            let mut row_grad = vec![0.0f64; num_params];
            for p in 0..num_params {
                let step = (params[p].abs() * 1e-6).max(1e-8);
                let mut bumped = params.to_vec();
                bumped[p] += step;
                row_grad[p] = (evaluate(&bumped, x, y) - evaluate(params, x, y)) / step;
            }
            for a in 0..num_params {
                for b in a..num_params {
                    normal[a][b] += row_grad[a] * row_grad[b];
                }
            }
        }
        for a in 0..num_params {
            for b in 0..a {
                normal[a][b] = normal[b][a];
            }
        }

        let mut sigmas = vec![f64::NAN; num_params];
        for p in 0..num_params {
            let mut e = vec![0.0f64; num_params];
            e[p] = 1.0;
            if let Some(col) = solve_linear(normal.clone(), e) {
                if col[p] > 0.0 {
                    sigmas[p] = (col[p] * variance).sqrt();
                }
            }
        }
        sigmas
            .chunks_exact(PARAMS)
            .map(|s| GaussianComponent {
                amplitude: s[0],
                center_x: s[1],
                center_y: s[2],
                fwhm_x: s[3],
                fwhm_y: s[4],
                pa: s[5],
            })
            .collect()
    }

    fn fit_product_images(
        &self,
        request: &FittingRequest,
        params: &[f64],
        width: usize,
        height: usize,
        origin: (usize, usize),
    ) -> Result<(Option<GeneratedImage>, Option<GeneratedImage>)> {
        if !request.create_model_image && !request.create_residual_image {
            return Ok((None, None));
        }
        let shape = ImageShape::plane(width, height)?;
        let csys = CoordinateSystem {
            x: self.coordinate_system().x.clone(),
            y: self.coordinate_system().y.clone(),
            spectral: None,
            radesys: self.coordinate_system().radesys.clone(),
        };
        let model_data: Vec<f32> = (0..width * height)
            .map(|i| {
                let x = (origin.0 + i % width) as f64;
                let y = (origin.1 + i / width) as f64;
                evaluate(params, x, y) as f32
            })
            .collect();

        let model = request.create_model_image.then(|| GeneratedImage {
            file_id: (self.file_id() + 1) * MODEL_ID_MULTIPLIER,
            name: "fit.model".to_string(),
            shape: shape.clone(),
            csys: csys.clone(),
            data: model_data.clone(),
        });
        let residual = if request.create_residual_image {
            let observed = self.channel_data_or_slice(self.current_z(), self.current_stokes())?;
            let data: Vec<f32> = (0..width * height)
                .map(|i| {
                    let x = origin.0 + i % width;
                    let y = origin.1 + i / width;
                    observed[y * self.width() + x] - model_data[i]
                })
                .collect();
            Some(GeneratedImage {
                file_id: (self.file_id() + 1) * MODEL_ID_MULTIPLIER + 1,
                name: "fit.residual".to_string(),
                shape,
                csys,
                data,
            })
        } else {
            None
        };
        Ok((model, residual))
    }
}
