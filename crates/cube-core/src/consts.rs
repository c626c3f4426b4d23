//! Shared protocol constants.

/// Region id addressing the frame cursor.
pub const CURSOR_REGION_ID: i32 = 0;

/// Region id addressing the whole image (per-channel products).
pub const IMAGE_REGION_ID: i32 = -1;

/// Region id addressing the whole cube (all-channel products).
pub const CUBE_REGION_ID: i32 = -2;

/// Region id wildcard for removal of every region.
pub const ALL_REGIONS: i32 = -100;

/// Bin-count sentinel requesting `max(2, ceil(sqrt(width * height)))`.
pub const AUTO_BIN_SIZE: i32 = -1;

/// Initial channel increment of adaptive spectral chunking.
pub const INIT_DELTA_Z: usize = 10;

/// Target wall time per spectral chunk, milliseconds. Bounds cancellation
/// latency regardless of image depth.
pub const TARGET_DELTA_TIME_MS: f64 = 50.0;

/// Minimum interval between partial cursor-profile messages, milliseconds.
pub const TARGET_PARTIAL_CURSOR_TIME_MS: f64 = 500.0;

/// Minimum interval between partial region-profile messages, milliseconds.
pub const TARGET_PARTIAL_REGION_TIME_MS: f64 = 1000.0;

/// Minimum interval between line-profile progress reports, milliseconds.
pub const LINE_PROFILE_PROGRESS_INTERVAL_MS: f64 = 500.0;

/// Upper bound on tile-cache capacity, in tiles.
pub const MAX_TILE_CACHE_CAPACITY: usize = 4096;

/// Precision the tile compressor escalates to when the requested quality
/// over-compresses (ratio above 20×).
pub const HIGH_COMPRESSION_QUALITY: i32 = 32;
