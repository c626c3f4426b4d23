//! Fixed-precision lossy tile compression.
//!
//! Transform codec over 4×4 blocks: block-floating-point scaling, an
//! integer lifting transform to decorrelate, negabinary mapping, and
//! embedded bit-plane coding with group testing so smooth blocks collapse
//! to a few bits per plane. `precision` is the number of bit planes kept
//! (out of 30); higher precision means lower error and a lower ratio.
//!
//! The codec handles finite data only. Blank cells must be pre-filled via
//! [`crate::nanenc::encode_nans_block`], which also produces the side-car
//! mask the client restores from.

/// Negabinary conversion mask.
const NBMASK: u32 = 0xaaaa_aaaa;

/// Coefficient count per block.
const BLOCK: usize = 16;

/// Scan order of transformed coefficients, by total sequency.
const PERM: [usize; BLOCK] = [0, 1, 4, 2, 5, 8, 3, 6, 9, 12, 7, 10, 13, 11, 14, 15];

/// Integer bits used below the block exponent. Leaves headroom so the
/// lifting transform's intermediate sums stay inside i32.
const INT_BITS: i32 = 28;

struct BitWriter {
    bytes: Vec<u8>,
    bit: u8,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            bit: 0,
        }
    }

    #[inline]
    fn write_bit(&mut self, value: bool) {
        if self.bit == 0 {
            self.bytes.push(0);
        }
        if value {
            let last = self.bytes.len() - 1;
            self.bytes[last] |= 1 << self.bit;
        }
        self.bit = (self.bit + 1) % 8;
    }

    #[inline]
    fn write_bits(&mut self, value: u32, count: u8) {
        for i in 0..count {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    #[inline]
    fn read_bit(&mut self) -> bool {
        let byte = self.pos / 8;
        let bit = self.pos % 8;
        self.pos += 1;
        byte < self.bytes.len() && (self.bytes[byte] >> bit) & 1 == 1
    }

    #[inline]
    fn read_bits(&mut self, count: u8) -> u32 {
        let mut value = 0u32;
        for i in 0..count {
            if self.read_bit() {
                value |= 1 << i;
            }
        }
        value
    }
}

/// Forward lifting transform of 4 coefficients at stride `s`.
fn fwd_lift(p: &mut [i32], base: usize, s: usize) {
    let (mut x, mut y, mut z, mut w) = (p[base], p[base + s], p[base + 2 * s], p[base + 3 * s]);
    x = x.wrapping_add(w);
    x >>= 1;
    w = w.wrapping_sub(x);
    z = z.wrapping_add(y);
    z >>= 1;
    y = y.wrapping_sub(z);
    x = x.wrapping_add(z);
    x >>= 1;
    z = z.wrapping_sub(x);
    w = w.wrapping_add(y);
    w >>= 1;
    y = y.wrapping_sub(w);
    w = w.wrapping_add(y >> 1);
    y = y.wrapping_sub(w >> 1);
    p[base] = x;
    p[base + s] = y;
    p[base + 2 * s] = z;
    p[base + 3 * s] = w;
}

/// Inverse lifting transform of 4 coefficients at stride `s`.
fn inv_lift(p: &mut [i32], base: usize, s: usize) {
    let (mut x, mut y, mut z, mut w) = (p[base], p[base + s], p[base + 2 * s], p[base + 3 * s]);
    y = y.wrapping_add(w >> 1);
    w = w.wrapping_sub(y >> 1);
    y = y.wrapping_add(w);
    w <<= 1;
    w = w.wrapping_sub(y);
    z = z.wrapping_add(x);
    x <<= 1;
    x = x.wrapping_sub(z);
    y = y.wrapping_add(z);
    z <<= 1;
    z = z.wrapping_sub(y);
    w = w.wrapping_add(x);
    x <<= 1;
    x = x.wrapping_sub(w);
    p[base] = x;
    p[base + s] = y;
    p[base + 2 * s] = z;
    p[base + 3 * s] = w;
}

#[inline]
fn to_negabinary(v: i32) -> u32 {
    (v as u32).wrapping_add(NBMASK) ^ NBMASK
}

#[inline]
fn from_negabinary(u: u32) -> i32 {
    (u ^ NBMASK).wrapping_sub(NBMASK) as i32
}

/// Biased exponent byte of the largest magnitude, such that every block
/// value satisfies `|v| < 2^(exp - 126)`.
fn block_exponent(values: &[f32; BLOCK]) -> u8 {
    let max_abs = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    if max_abs == 0.0 {
        return 0;
    }
    ((max_abs.to_bits() >> 23) & 0xff) as u8
}

fn encode_block(writer: &mut BitWriter, values: &[f32; BLOCK], precision: u32) {
    let exp_byte = block_exponent(values);
    if exp_byte == 0 {
        writer.write_bit(false);
        return;
    }
    writer.write_bit(true);
    writer.write_bits(exp_byte as u32, 8);

    // block-floating-point quantization: |v| < 2^e, q = v * 2^(INT_BITS - e)
    let e = exp_byte as i32 - 126;
    let scale = ((INT_BITS - e) as f64).exp2();
    let mut q = [0i32; BLOCK];
    for (dst, &v) in q.iter_mut().zip(values) {
        *dst = (v as f64 * scale) as i32;
    }

    for row in 0..4 {
        fwd_lift(&mut q, row * 4, 1);
    }
    for col in 0..4 {
        fwd_lift(&mut q, col, 4);
    }

    let coeffs: Vec<u32> = PERM.iter().map(|&i| to_negabinary(q[i])).collect();

    // embedded coding: MSB planes first, group testing past the known
    // significant prefix
    let planes = precision.min(32);
    let mut significant = 0usize;
    for plane in (32 - planes..32).rev() {
        let bit = |i: usize| (coeffs[i] >> plane) & 1 == 1;
        for i in 0..significant {
            writer.write_bit(bit(i));
        }
        while significant < BLOCK {
            let any = (significant..BLOCK).any(bit);
            writer.write_bit(any);
            if !any {
                break;
            }
            loop {
                let b = bit(significant);
                writer.write_bit(b);
                significant += 1;
                if b || significant == BLOCK {
                    break;
                }
            }
        }
    }
}

fn decode_block(reader: &mut BitReader<'_>, precision: u32) -> [f32; BLOCK] {
    if !reader.read_bit() {
        return [0.0; BLOCK];
    }
    let exp_byte = reader.read_bits(8) as i32;
    let e = exp_byte - 126;

    let planes = precision.min(32);
    let mut coeffs = [0u32; BLOCK];
    let mut significant = 0usize;
    for plane in (32 - planes..32).rev() {
        for coeff in coeffs.iter_mut().take(significant) {
            if reader.read_bit() {
                *coeff |= 1 << plane;
            }
        }
        while significant < BLOCK {
            if !reader.read_bit() {
                break;
            }
            loop {
                let b = reader.read_bit();
                if b {
                    coeffs[significant] |= 1 << plane;
                }
                significant += 1;
                if b || significant == BLOCK {
                    break;
                }
            }
        }
    }

    let mut q = [0i32; BLOCK];
    for (pos, &src) in PERM.iter().zip(&coeffs) {
        q[*pos] = from_negabinary(src);
    }

    for col in 0..4 {
        inv_lift(&mut q, col, 4);
    }
    for row in 0..4 {
        inv_lift(&mut q, row * 4, 1);
    }

    let scale = ((e - INT_BITS) as f64).exp2();
    let mut out = [0.0f32; BLOCK];
    for (dst, &v) in out.iter_mut().zip(&q) {
        *dst = (v as f64 * scale) as f32;
    }
    out
}

/// Compresses a `width × height` tile at the given precision.
///
/// Non-finite cells are encoded as zero; callers blank them beforehand and
/// ship the NaN mask separately.
pub fn compress(data: &[f32], width: usize, height: usize, precision: u32) -> Vec<u8> {
    let precision = precision.clamp(1, 32);
    let mut writer = BitWriter::new();

    for block_y in (0..height).step_by(4) {
        for block_x in (0..width).step_by(4) {
            let mut values = [0.0f32; BLOCK];
            for dy in 0..4 {
                for dx in 0..4 {
                    // clamp partial edge blocks to their last row/column
                    let y = (block_y + dy).min(height - 1);
                    let x = (block_x + dx).min(width - 1);
                    let v = data[y * width + x];
                    values[dy * 4 + dx] = if v.is_finite() { v } else { 0.0 };
                }
            }
            encode_block(&mut writer, &values, precision);
        }
    }
    writer.finish()
}

/// Decompresses a tile produced by [`compress`] with the same dimensions
/// and precision.
pub fn decompress(buf: &[u8], width: usize, height: usize, precision: u32) -> Vec<f32> {
    let precision = precision.clamp(1, 32);
    let mut reader = BitReader::new(buf);
    let mut out = vec![0.0f32; width * height];

    for block_y in (0..height).step_by(4) {
        for block_x in (0..width).step_by(4) {
            let values = decode_block(&mut reader, precision);
            for dy in 0..4 {
                for dx in 0..4 {
                    let y = block_y + dy;
                    let x = block_x + dx;
                    if y < height && x < width {
                        out[y * width + x] = values[dy * 4 + dx];
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_error(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_lift_round_trip() {
        let mut q = [3, -7, 12, 900, 5, 0, -1, 44, 8, 8, 8, 8, -100, 7, 2, 1];
        let original = q;
        for row in 0..4 {
            fwd_lift(&mut q, row * 4, 1);
        }
        for col in 0..4 {
            fwd_lift(&mut q, col, 4);
        }
        for col in 0..4 {
            inv_lift(&mut q, col, 4);
        }
        for row in 0..4 {
            inv_lift(&mut q, row * 4, 1);
        }
        assert_eq!(q, original);
    }

    #[test]
    fn test_negabinary_round_trip() {
        for v in [-1_000_000, -1, 0, 1, 12345, i32::MAX / 4] {
            assert_eq!(from_negabinary(to_negabinary(v)), v);
        }
    }

    #[test]
    fn test_zero_tile_compresses_to_flags() {
        let data = vec![0.0f32; 64 * 64];
        let buf = compress(&data, 64, 64, 16);
        // one flag bit per block
        assert!(buf.len() <= 64 * 64 / 16 / 8 + 1);
        let back = decompress(&buf, 64, 64, 16);
        assert!(back.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_smooth_tile_high_precision() {
        let (w, h) = (64, 48);
        let data: Vec<f32> = (0..w * h)
            .map(|i| {
                let x = (i % w) as f32 / w as f32;
                let y = (i / w) as f32 / h as f32;
                (x * 3.1).sin() * 0.5 + y * 0.25
            })
            .collect();
        let buf = compress(&data, w, h, 24);
        let back = decompress(&buf, w, h, 24);
        assert!(max_error(&data, &back) < 1e-4);
        // smooth data must actually compress
        assert!(buf.len() < w * h * 4 / 2);
    }

    #[test]
    fn test_lower_precision_smaller_and_coarser() {
        let (w, h) = (32, 32);
        let data: Vec<f32> = (0..w * h).map(|i| ((i * 37) % 113) as f32 / 113.0).collect();

        let hq = compress(&data, w, h, 24);
        let lq = compress(&data, w, h, 8);
        assert!(lq.len() < hq.len());

        let back_hq = decompress(&hq, w, h, 24);
        let back_lq = decompress(&lq, w, h, 8);
        assert!(max_error(&data, &back_hq) < max_error(&data, &back_lq) + 1e-6);
        // 8 planes of a unit-range tile keep roughly 2 decimal digits
        assert!(max_error(&data, &back_lq) < 0.25);
    }

    #[test]
    fn test_partial_edge_blocks() {
        let (w, h) = (10, 7);
        let data: Vec<f32> = (0..w * h).map(|i| i as f32 * 0.1).collect();
        let buf = compress(&data, w, h, 20);
        let back = decompress(&buf, w, h, 20);
        assert_eq!(back.len(), data.len());
        assert!(max_error(&data, &back) < 1e-2);
    }

    #[test]
    fn test_non_finite_encoded_as_zero() {
        let mut data = vec![1.0f32; 16];
        data[3] = f32::NAN;
        let buf = compress(&data, 4, 4, 16);
        let back = decompress(&buf, 4, 4, 16);
        assert!(back.iter().all(|v| v.is_finite()));
    }
}
