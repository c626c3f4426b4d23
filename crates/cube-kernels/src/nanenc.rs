//! Run-length encoding of blank (NaN) pixels.
//!
//! Lossy tile compression cannot represent NaN, so the blank mask travels
//! as a side-car: alternating run lengths of finite and NaN cells,
//! starting with a finite run (which may be zero). Before compression the
//! blanks are replaced in place by the mean of their 4×4 block's finite
//! cells so the codec sees smooth data; the client restores them from the
//! encodings after decompression.

/// Encodes the NaN runs of `data[offset..offset + width * height]` and
/// blanks the NaN cells with their block means.
///
/// Returns alternating `[finite, nan, finite, ...]` run lengths.
pub fn encode_nans_block(
    data: &mut [f32],
    offset: usize,
    width: usize,
    height: usize,
) -> Vec<i32> {
    let tile = &mut data[offset..offset + width * height];

    // run-length encode before the blanks are overwritten
    let mut encodings = Vec::new();
    let mut current_finite = true;
    let mut run = 0i32;
    for v in tile.iter() {
        let finite = !v.is_nan();
        if finite == current_finite {
            run += 1;
        } else {
            encodings.push(run);
            current_finite = finite;
            run = 1;
        }
    }
    encodings.push(run);

    // fill blanks with 4x4 block means so the compressor sees smooth data
    for block_y in (0..height).step_by(4) {
        for block_x in (0..width).step_by(4) {
            let y_end = (block_y + 4).min(height);
            let x_end = (block_x + 4).min(width);

            let mut sum = 0.0f64;
            let mut count = 0u32;
            for y in block_y..y_end {
                for x in block_x..x_end {
                    let v = tile[y * width + x];
                    if v.is_finite() {
                        sum += v as f64;
                        count += 1;
                    }
                }
            }
            let fill = if count > 0 {
                (sum / count as f64) as f32
            } else {
                0.0
            };
            for y in block_y..y_end {
                for x in block_x..x_end {
                    let v = &mut tile[y * width + x];
                    if !v.is_finite() {
                        *v = fill;
                    }
                }
            }
        }
    }

    encodings
}

/// Reconstructs the blank mask from run-length encodings.
///
/// `mask[i]` is `true` where the original cell was NaN.
pub fn decode_nans(encodings: &[i32], len: usize) -> Vec<bool> {
    let mut mask = vec![false; len];
    let mut pos = 0usize;
    let mut is_nan = false;
    for &run in encodings {
        let run = run.max(0) as usize;
        let end = (pos + run).min(len);
        if is_nan {
            for m in &mut mask[pos..end] {
                *m = true;
            }
        }
        pos = end;
        is_nan = !is_nan;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_nans_single_run() {
        let mut data = vec![1.0f32; 16];
        let enc = encode_nans_block(&mut data, 0, 4, 4);
        assert_eq!(enc, vec![16]);
    }

    #[test]
    fn test_leading_nan_starts_with_zero_run() {
        let mut data = vec![f32::NAN, 1.0, 2.0, 3.0];
        let enc = encode_nans_block(&mut data, 0, 4, 1);
        assert_eq!(enc, vec![0, 1, 3]);
    }

    #[test]
    fn test_round_trip_mask() {
        let mut data: Vec<f32> = (0..64)
            .map(|i| if i % 7 == 0 { f32::NAN } else { i as f32 })
            .collect();
        let original_mask: Vec<bool> = data.iter().map(|v| v.is_nan()).collect();

        let enc = encode_nans_block(&mut data, 0, 8, 8);
        assert_eq!(decode_nans(&enc, 64), original_mask);
    }

    #[test]
    fn test_blanks_filled_with_block_mean() {
        let mut data = vec![2.0f32; 16];
        data[5] = f32::NAN;
        encode_nans_block(&mut data, 0, 4, 4);
        assert_eq!(data[5], 2.0);
        assert!(data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_all_nan_block_fills_zero() {
        let mut data = vec![f32::NAN; 16];
        let enc = encode_nans_block(&mut data, 0, 4, 4);
        assert_eq!(enc, vec![0, 16]);
        assert!(data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_offset_window() {
        let mut data = vec![1.0f32; 8];
        data[4] = f32::NAN;
        let enc = encode_nans_block(&mut data, 4, 4, 1);
        assert_eq!(enc, vec![0, 1, 3]);
        assert!(data[4].is_finite());
    }
}
