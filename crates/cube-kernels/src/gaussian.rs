//! NaN-aware separable Gaussian smoothing.
//!
//! The kernel half-width is `smoothing_factor - 1` with
//! `σ = (smoothing_factor - 1) / 2`, and only the valid inner region is
//! produced: the destination is `(sw - 2·hw) × (sh - 2·hw)`.
//!
//! Missing cells (NaN or ±Inf) contribute neither value nor weight; each
//! output tap renormalizes by the weight mass of its finite inputs, and a
//! tap with no finite input yields NaN. The two passes are row-parallel
//! and the intermediate buffer is processed in strips so its footprint
//! never exceeds [`SMOOTHING_TEMP_BUFFER_SIZE_MB`].

use cube_core::{Error, Result};
use rayon::prelude::*;
use wide::{f32x8, CmpEq, CmpGt, CmpNe};

/// Cap on the separable-pass intermediate buffer.
pub const SMOOTHING_TEMP_BUFFER_SIZE_MB: usize = 200;

/// Builds the normalized 1-d Gaussian kernel for a smoothing factor.
pub fn make_kernel(smoothing_factor: usize) -> Vec<f32> {
    let half_width = smoothing_factor.saturating_sub(1).max(1);
    let sigma = half_width as f64 / 2.0;
    let mut kernel = Vec::with_capacity(2 * half_width + 1);
    let mut sum = 0.0f64;
    for i in 0..=(2 * half_width) {
        let d = i as f64 - half_width as f64;
        let w = (-0.5 * (d / sigma) * (d / sigma)).exp();
        kernel.push(w as f32);
        sum += w;
    }
    for w in &mut kernel {
        *w = (*w as f64 / sum) as f32;
    }
    kernel
}

/// One separable convolution pass over the valid region.
///
/// `vertical` taps run down the rows (`dst` is `sw × (sh - 2·hw)`),
/// otherwise along them (`dst` is `(sw - 2·hw) × sh`).
fn run_kernel(
    kernel: &[f32],
    src: &[f32],
    dst: &mut [f32],
    src_width: usize,
    dst_width: usize,
    dst_height: usize,
    vertical: bool,
) {
    let taps = kernel.len();
    let zero = f32x8::splat(0.0);
    let inf = f32x8::splat(f32::INFINITY);

    dst[..dst_width * dst_height]
        .par_chunks_mut(dst_width)
        .enumerate()
        .for_each(|(j, row)| {
            let mut x = 0;
            while x + 8 <= dst_width {
                let mut sum = f32x8::splat(0.0);
                let mut weight = f32x8::splat(0.0);
                for (t, &k) in kernel.iter().enumerate() {
                    let base = if vertical {
                        (j + t) * src_width + x
                    } else {
                        j * src_width + x + t
                    };
                    let v = f32x8::from(
                        <[f32; 8]>::try_from(&src[base..base + 8]).unwrap(),
                    );
                    let kv = f32x8::splat(k);
                    let missing = v.cmp_ne(v) | v.abs().cmp_eq(inf);
                    sum += missing.blend(zero, v * kv);
                    weight += missing.blend(zero, kv);
                }
                let mask = weight.cmp_gt(zero);
                let out = mask.blend(sum / weight, f32x8::splat(f32::NAN));
                row[x..x + 8].copy_from_slice(&out.to_array());
                x += 8;
            }
            for x in x..dst_width {
                let mut sum = 0.0f32;
                let mut weight = 0.0f32;
                for t in 0..taps {
                    let v = if vertical {
                        src[(j + t) * src_width + x]
                    } else {
                        src[j * src_width + x + t]
                    };
                    if v.is_finite() {
                        sum += v * kernel[t];
                        weight += kernel[t];
                    }
                }
                row[x] = if weight > 0.0 { sum / weight } else { f32::NAN };
            }
        });
}

/// Smooths `src` with a separable discrete Gaussian.
///
/// Destination dimensions must be `sw - 2·hw` by `sh - 2·hw` where
/// `hw = smoothing_factor - 1`.
pub fn gaussian_smooth(
    src: &[f32],
    dst: &mut [f32],
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
    smoothing_factor: usize,
) -> Result<()> {
    if smoothing_factor < 2 {
        return Err(Error::invalid_request("smoothing factor must be at least 2"));
    }
    let half_width = smoothing_factor - 1;
    if dst_width + 2 * half_width != src_width || dst_height + 2 * half_width != src_height {
        return Err(Error::invalid_request(format!(
            "gaussian destination {dst_width}x{dst_height} does not match source \
             {src_width}x{src_height} at factor {smoothing_factor}"
        )));
    }
    if src.len() < src_width * src_height || dst.len() < dst_width * dst_height {
        return Err(Error::invalid_request("smoothing buffer too small"));
    }

    let kernel = make_kernel(smoothing_factor);
    let start = std::time::Instant::now();

    // strip the vertical pass so the temp buffer stays under the cap
    let cap_rows = (SMOOTHING_TEMP_BUFFER_SIZE_MB * 1024 * 1024)
        / (src_width * std::mem::size_of::<f32>());
    let strip_rows = cap_rows.saturating_sub(2 * half_width).clamp(1, dst_height);
    let mut temp = vec![0.0f32; src_width * strip_rows];

    let mut row = 0;
    while row < dst_height {
        let rows = strip_rows.min(dst_height - row);

        // vertical taps for output rows [row, row + rows) read source rows
        // [row, row + rows + 2*hw)
        let src_strip = &src[row * src_width..(row + rows + 2 * half_width) * src_width];
        run_kernel(&kernel, src_strip, &mut temp, src_width, src_width, rows, true);

        let dst_strip = &mut dst[row * dst_width..(row + rows) * dst_width];
        run_kernel(&kernel, &temp, dst_strip, src_width, dst_width, rows, false);

        row += rows;
    }

    tracing::debug!(
        "gaussian smooth {}x{} -> {}x{} (factor {}) in {:.3} ms",
        src_width,
        src_height,
        dst_width,
        dst_height,
        smoothing_factor,
        start.elapsed().as_secs_f64() * 1e3
    );
    Ok(())
}
