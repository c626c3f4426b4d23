//! Block-mean and nearest-neighbour down-sampling.
//!
//! [`block_smooth`] replaces each `mip × mip` block by the mean of its
//! finite cells; a block with no finite cell yields NaN. The vector
//! variants accumulate whole source rows with masked lane arithmetic and
//! must agree with the scalar reference within `|Δ| ≤ 1e-3` per cell.
//!
//! [`nearest_neighbor`] picks the top-left cell of each block and
//! preserves NaN.

use crate::dispatch::{simd_level, SimdLevel};
use rayon::prelude::*;
use wide::{f32x4, f32x8, CmpEq, CmpNe};

/// Mean-downsamples a block of `src` starting at `(x_offset, y_offset)`
/// into `dst`, dispatching to the widest available vector variant.
///
/// `dst` must hold `dst_width * dst_height` cells with
/// `dst_width = ceil(span_x / mip)` for the x span being covered.
#[allow(clippy::too_many_arguments)]
pub fn block_smooth(
    src: &[f32],
    dst: &mut [f32],
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
    x_offset: usize,
    y_offset: usize,
    mip: usize,
) {
    match simd_level() {
        SimdLevel::Wide8 => block_smooth_wide8(
            src, dst, src_width, src_height, dst_width, dst_height, x_offset, y_offset, mip,
        ),
        SimdLevel::Wide4 => block_smooth_wide4(
            src, dst, src_width, src_height, dst_width, dst_height, x_offset, y_offset, mip,
        ),
        SimdLevel::Scalar => block_smooth_scalar(
            src, dst, src_width, src_height, dst_width, dst_height, x_offset, y_offset, mip,
        ),
    }
}

/// Scalar reference implementation of [`block_smooth`].
#[allow(clippy::too_many_arguments)]
pub fn block_smooth_scalar(
    src: &[f32],
    dst: &mut [f32],
    src_width: usize,
    src_height: usize,
    dst_width: usize,
    dst_height: usize,
    x_offset: usize,
    y_offset: usize,
    mip: usize,
) {
    dst[..dst_width * dst_height]
        .par_chunks_mut(dst_width)
        .enumerate()
        .for_each(|(j, row)| {
            let y_start = y_offset + j * mip;
            let y_end = (y_start + mip).min(src_height);
            for (i, out) in row.iter_mut().enumerate() {
                let x_start = x_offset + i * mip;
                let x_end = (x_start + mip).min(src_width);

                let mut sum = 0.0f64;
                let mut count = 0u32;
                for y in y_start..y_end {
                    for x in x_start..x_end {
                        let pix = src[y * src_width + x];
                        if pix.is_finite() {
                            sum += pix as f64;
                            count += 1;
                        }
                    }
                }
                *out = if count > 0 {
                    (sum / count as f64) as f32
                } else {
                    f32::NAN
                };
            }
        });
}

macro_rules! block_smooth_wide {
    ($name:ident, $vec:ty, $lanes:expr, $doc:literal) => {
        #[doc = $doc]
        #[allow(clippy::too_many_arguments)]
        pub fn $name(
            src: &[f32],
            dst: &mut [f32],
            src_width: usize,
            src_height: usize,
            dst_width: usize,
            dst_height: usize,
            x_offset: usize,
            y_offset: usize,
            mip: usize,
        ) {
            let inf = <$vec>::splat(f32::INFINITY);
            let zero = <$vec>::splat(0.0);
            let one = <$vec>::splat(1.0);

            dst[..dst_width * dst_height]
                .par_chunks_mut(dst_width)
                .enumerate()
                .for_each(|(j, row)| {
                    let y_start = y_offset + j * mip;
                    let y_end = (y_start + mip).min(src_height);
                    let x_end = (x_offset + dst_width * mip).min(src_width);
                    let span = x_end - x_offset;

                    // masked row accumulation: sums and finite counts per column
                    let mut sum_row = vec![0.0f32; span];
                    let mut cnt_row = vec![0.0f32; span];
                    for y in y_start..y_end {
                        let src_row = &src[y * src_width + x_offset..y * src_width + x_end];
                        let mut col = 0;
                        while col + $lanes <= span {
                            let v = <$vec>::from(
                                <[f32; $lanes]>::try_from(&src_row[col..col + $lanes]).unwrap(),
                            );
                            let missing = v.cmp_ne(v) | v.abs().cmp_eq(inf);
                            let vv = missing.blend(zero, v);
                            let cc = missing.blend(zero, one);

                            let s = <$vec>::from(
                                <[f32; $lanes]>::try_from(&sum_row[col..col + $lanes]).unwrap(),
                            );
                            let c = <$vec>::from(
                                <[f32; $lanes]>::try_from(&cnt_row[col..col + $lanes]).unwrap(),
                            );
                            sum_row[col..col + $lanes].copy_from_slice(&(s + vv).to_array());
                            cnt_row[col..col + $lanes].copy_from_slice(&(c + cc).to_array());
                            col += $lanes;
                        }
                        for x in col..span {
                            let pix = src_row[x];
                            if pix.is_finite() {
                                sum_row[x] += pix;
                                cnt_row[x] += 1.0;
                            }
                        }
                    }

                    // horizontal reduction per mip group
                    for (i, out) in row.iter_mut().enumerate() {
                        let g_start = i * mip;
                        let g_end = ((i + 1) * mip).min(span);
                        let sum: f32 = sum_row[g_start..g_end].iter().sum();
                        let count: f32 = cnt_row[g_start..g_end].iter().sum();
                        *out = if count > 0.0 { sum / count } else { f32::NAN };
                    }
                });
        }
    };
}

block_smooth_wide!(
    block_smooth_wide8,
    f32x8,
    8,
    "8-lane vector variant of [`block_smooth`]."
);
block_smooth_wide!(
    block_smooth_wide4,
    f32x4,
    4,
    "4-lane vector variant of [`block_smooth`]."
);

/// Nearest-neighbour down-sampling: `dst[i, j] = src[x + i·mip, y + j·mip]`.
/// NaN cells pass through unchanged.
#[allow(clippy::too_many_arguments)]
pub fn nearest_neighbor(
    src: &[f32],
    dst: &mut [f32],
    src_width: usize,
    dst_width: usize,
    dst_height: usize,
    x_offset: usize,
    y_offset: usize,
    mip: usize,
) {
    dst[..dst_width * dst_height]
        .par_chunks_mut(dst_width)
        .enumerate()
        .for_each(|(j, row)| {
            let y = y_offset + j * mip;
            for (i, out) in row.iter_mut().enumerate() {
                *out = src[y * src_width + x_offset + i * mip];
            }
        });
}
