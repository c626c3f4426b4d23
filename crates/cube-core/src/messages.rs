//! Output messages produced by the compute core.
//!
//! Plain-data mirrors of the wire messages the session layer serializes.
//! The core fills these and hands them to caller-supplied callbacks; it
//! never frames or routes them. Long-running producers emit a message per
//! partial result with monotonically non-decreasing `progress`, terminating
//! at exactly `1.0`.

use crate::coord::CoordinateSystem;
use crate::shape::ImageShape;

/// Compression applied to raster tile payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionType {
    /// Raw little-endian float32.
    #[default]
    None,
    /// Lossy fixed-precision float compression with a side-car NaN mask.
    Zfp,
}

/// Pixel payload of one tile.
#[derive(Debug, Clone, PartialEq)]
pub enum TilePayload {
    /// Uncompressed row-major float32.
    Raw(Vec<f32>),
    /// Compressed bytes plus the RLE NaN mask needed to restore blanks.
    Compressed {
        /// Codec output.
        data: Vec<u8>,
        /// Alternating finite/NaN run lengths.
        nan_encodings: Vec<i32>,
    },
}

/// One raster tile of downsampled image data.
#[derive(Debug, Clone, PartialEq)]
pub struct TileData {
    /// Pyramid layer of the tile address.
    pub layer: i32,
    /// Tile column.
    pub x: i32,
    /// Tile row.
    pub y: i32,
    /// Downsampled width of this tile's grid.
    pub width: usize,
    /// Downsampled height of this tile's grid.
    pub height: usize,
    /// Mip factor the tile was rendered at.
    pub mip: i32,
    /// The pixels.
    pub payload: TilePayload,
}

/// Raster tiles for one (channel, stokes) at one compression setting.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterTileData {
    /// Source file id.
    pub file_id: i32,
    /// Channel the tiles were cut from.
    pub channel: usize,
    /// Stokes index the tiles were cut from.
    pub stokes: i32,
    /// Applied compression.
    pub compression_type: CompressionType,
    /// Quality actually used (may be escalated above the request).
    pub compression_quality: f32,
    /// The tiles.
    pub tiles: Vec<TileData>,
}

/// Values carried by a profile: the cursor paths keep the loader's float32,
/// region statistics are double precision.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileValues {
    /// Raw float32 samples.
    F32(Vec<f32>),
    /// Double-precision statistics.
    F64(Vec<f64>),
}

impl ProfileValues {
    /// Number of samples.
    pub fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    /// Returns `true` when the profile is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One spatial profile (a row or column cut, possibly decimated).
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialProfile {
    /// Coordinate string the profile answers (`"Ix"`, `"Qy"`, ...).
    pub coordinate: String,
    /// First image pixel index covered, inclusive.
    pub start: usize,
    /// Last image pixel index covered, exclusive.
    pub end: usize,
    /// Mip the profile was decimated to (1 = full resolution).
    pub mip: i32,
    /// Profile samples.
    pub values: Vec<f32>,
    /// Reference pixel of the profile axis (for world labelling).
    pub crpix: f64,
    /// World value at the reference pixel.
    pub crval: f64,
    /// World increment per pixel.
    pub cdelt: f64,
    /// Unit of `crval`/`cdelt`.
    pub unit: String,
}

/// Spatial profiles at one cursor or point region position.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialProfileData {
    /// Source file id.
    pub file_id: i32,
    /// Region id (`CURSOR_REGION_ID` for the cursor).
    pub region_id: i32,
    /// Cursor x in image pixels.
    pub x: f64,
    /// Cursor y in image pixels.
    pub y: f64,
    /// Channel sampled.
    pub channel: usize,
    /// Stokes sampled.
    pub stokes: i32,
    /// Image value under the cursor.
    pub value: f32,
    /// The requested profiles.
    pub profiles: Vec<SpatialProfile>,
}

/// One spectral profile for a coordinate and statistic.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralProfile {
    /// Coordinate string (`"z"`, `"Iz"`, `"Ptotalz"`, ...).
    pub coordinate: String,
    /// Statistic the values represent.
    pub stats_type: StatsType,
    /// Per-channel values, length = depth.
    pub values: ProfileValues,
}

/// Spectral profiles with streaming progress.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralProfileData {
    /// Source file id.
    pub file_id: i32,
    /// Region id the profile integrates over.
    pub region_id: i32,
    /// Stokes of the frame when the stream started.
    pub stokes: i32,
    /// Monotone progress in `[0, 1]`; `1.0` terminates the stream.
    pub progress: f64,
    /// The profiles accumulated so far.
    pub profiles: Vec<SpectralProfile>,
}

/// Histogram payload.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramData {
    /// Number of bins.
    pub num_bins: usize,
    /// Bin width in image units.
    pub bin_width: f64,
    /// Center of the first bin.
    pub first_bin_center: f64,
    /// Bin counts.
    pub bins: Vec<i64>,
    /// Mean of the binned data.
    pub mean: f64,
    /// Standard deviation of the binned data.
    pub std_dev: f64,
}

/// Region (or whole-image) histogram stream message.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionHistogramData {
    /// Source file id.
    pub file_id: i32,
    /// Region id (`IMAGE_REGION_ID` for the whole image).
    pub region_id: i32,
    /// Channel the histogram covers (or the resolved selector).
    pub channel: i32,
    /// Stokes the histogram covers.
    pub stokes: i32,
    /// Monotone progress; `1.0` terminates.
    pub progress: f64,
    /// The histogram.
    pub histogram: HistogramData,
}

/// Statistic kinds a stats requirement may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatsType {
    /// Count of finite pixels.
    NumPixels,
    /// Sum of finite pixels.
    Sum,
    /// Flux density (sum / beam area).
    FluxDensity,
    /// Arithmetic mean.
    Mean,
    /// Root mean square.
    Rms,
    /// Standard deviation about the mean.
    Sigma,
    /// Sum of squares.
    SumSq,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
    /// Larger magnitude of min/max.
    Extrema,
    /// Bottom-left corner of the region bounding box.
    Blc,
    /// Top-right corner of the region bounding box.
    Trc,
    /// Position of the minimum.
    MinPos,
    /// Position of the maximum.
    MaxPos,
}

/// One computed statistic value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsValue {
    /// Which statistic.
    pub stats_type: StatsType,
    /// Its value; NaN when the region holds no finite pixels.
    pub value: f64,
}

/// Region statistics message.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionStatsData {
    /// Source file id.
    pub file_id: i32,
    /// Region id.
    pub region_id: i32,
    /// Channel the statistics cover.
    pub channel: i32,
    /// Stokes the statistics cover.
    pub stokes: i32,
    /// The values, one per requested statistic.
    pub statistics: Vec<StatsValue>,
}

/// Vertices of one contour level, accumulated chunk by chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ContourSet {
    /// The level traced.
    pub level: f64,
    /// Decimation factor applied to coordinates.
    pub decimation_factor: i32,
    /// Interleaved x/y vertex coordinates in source pixels.
    pub vertices: Vec<f32>,
    /// Start offsets of the polyline runs inside `vertices`.
    pub start_indices: Vec<i32>,
}

/// Chunked contour stream message.
#[derive(Debug, Clone, PartialEq)]
pub struct ContourImageData {
    /// Source file id.
    pub file_id: i32,
    /// Channel traced.
    pub channel: usize,
    /// Stokes traced.
    pub stokes: i32,
    /// Monotone progress; `1.0` terminates.
    pub progress: f64,
    /// Contour chunks completed since the previous message.
    pub contour_sets: Vec<ContourSet>,
}

/// Paired intensity/angle tiles of the polarization vector overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorOverlayTileData {
    /// Source file id.
    pub file_id: i32,
    /// Channel computed.
    pub channel: usize,
    /// Stokes index used for intensity (or a computed index).
    pub stokes_intensity: i32,
    /// Stokes index used for angle.
    pub stokes_angle: i32,
    /// Compression applied to both tile sets.
    pub compression_type: CompressionType,
    /// Compression quality.
    pub compression_quality: f32,
    /// Monotone progress; `1.0` terminates.
    pub progress: f64,
    /// Polarized-intensity tiles.
    pub intensity_tiles: Vec<TileData>,
    /// Polarization-angle tiles.
    pub angle_tiles: Vec<TileData>,
}

/// An in-memory derived image tagged with a synthetic file id.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    /// Stable synthetic file id.
    pub file_id: i32,
    /// Display name.
    pub name: String,
    /// Shape of the derived image.
    pub shape: ImageShape,
    /// Coordinate system of the derived image.
    pub csys: CoordinateSystem,
    /// Row-major pixels (x fastest).
    pub data: Vec<f32>,
}

/// Moment generator response.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentResponse {
    /// Whether all requested moments were produced.
    pub success: bool,
    /// Whether the generator was cancelled; never set together with success.
    pub cancelled: bool,
    /// Failure detail when unsuccessful.
    pub message: String,
    /// The derived moment images.
    pub images: Vec<GeneratedImage>,
}

/// PV generator response.
#[derive(Debug, Clone, PartialEq)]
pub struct PvResponse {
    /// Whether the PV image was produced.
    pub success: bool,
    /// Whether the generator was cancelled.
    pub cancelled: bool,
    /// Failure detail when unsuccessful.
    pub message: String,
    /// The derived position-velocity image.
    pub image: Option<GeneratedImage>,
}

/// One fitted 2-d Gaussian component (values or uncertainties).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GaussianComponent {
    /// Center x in image pixels.
    pub center_x: f64,
    /// Center y in image pixels.
    pub center_y: f64,
    /// Peak amplitude.
    pub amplitude: f64,
    /// Full width at half maximum along the major axis, pixels.
    pub fwhm_x: f64,
    /// Full width at half maximum along the minor axis, pixels.
    pub fwhm_y: f64,
    /// Position angle in degrees.
    pub pa: f64,
}

/// Image fitting response.
#[derive(Debug, Clone, PartialEq)]
pub struct FittingResponse {
    /// Whether the fit converged.
    pub success: bool,
    /// Failure detail when unsuccessful.
    pub message: String,
    /// Fitted components.
    pub components: Vec<GaussianComponent>,
    /// Per-parameter uncertainties, one entry per component.
    pub errors: Vec<GaussianComponent>,
    /// Integrated flux per component.
    pub integrated_flux: Vec<f64>,
    /// Human-readable fit log.
    pub log: String,
    /// Model image, when requested.
    pub model: Option<GeneratedImage>,
    /// Residual image, when requested.
    pub residual: Option<GeneratedImage>,
}

/// Acknowledgement of a save-file request.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveFileAck {
    /// Whether the file was written.
    pub success: bool,
    /// Failure detail when unsuccessful.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_values_len() {
        assert_eq!(ProfileValues::F32(vec![1.0, 2.0]).len(), 2);
        assert_eq!(ProfileValues::F64(vec![]).len(), 0);
        assert!(ProfileValues::F64(vec![]).is_empty());
    }

    #[test]
    fn test_success_and_cancelled_exclusive() {
        // The invariant callers rely on: a cancelled response is never
        // simultaneously successful.
        let resp = MomentResponse {
            success: false,
            cancelled: true,
            message: String::new(),
            images: vec![],
        };
        assert!(!(resp.success && resp.cancelled));
    }
}
