//! Runtime CPU dispatch for the pixel kernels.
//!
//! The vector width is chosen once at startup from CPU feature detection;
//! every kernel entry point routes through [`simd_level`]. The scalar
//! variants are always available and are the reference semantics the
//! vector variants must agree with.

use lazy_static::lazy_static;

/// Vector width selected for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdLevel {
    /// 8-wide f32 lanes (AVX2 on x86-64).
    Wide8,
    /// 4-wide f32 lanes (SSE4.1 on x86-64, NEON elsewhere).
    Wide4,
    /// Scalar reference path.
    Scalar,
}

fn detect() -> SimdLevel {
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("avx2") {
            return SimdLevel::Wide8;
        }
        if std::arch::is_x86_feature_detected!("sse4.1") {
            return SimdLevel::Wide4;
        }
        SimdLevel::Scalar
    }
    #[cfg(all(target_arch = "aarch64", not(target_arch = "x86_64")))]
    {
        SimdLevel::Wide4
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        SimdLevel::Scalar
    }
}

lazy_static! {
    static ref LEVEL: SimdLevel = {
        let level = detect();
        tracing::debug!("pixel kernels dispatching at {:?}", level);
        level
    };
}

/// The vector width the kernels run at in this process.
#[inline]
pub fn simd_level() -> SimdLevel {
    *LEVEL
}
