//! Request messages consumed by the compute core.
//!
//! Plain-data mirrors of the wire requirements and generator requests the
//! session layer decodes. Settings types implement structural equality;
//! the vector-overlay and contour pipelines use it for cache
//! invalidation.

use crate::consts::AUTO_BIN_SIZE;
use crate::messages::{GaussianComponent, StatsType};
use crate::range::AxisRange;
use serde::{Deserialize, Serialize};

/// One histogram requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramConfig {
    /// Coordinate string selecting the Stokes ("z" = current).
    pub coordinate: String,
    /// Channel selector: a concrete z, `CURRENT_Z` or `ALL_Z`.
    pub channel: i32,
    /// Bin count, or [`AUTO_BIN_SIZE`].
    pub num_bins: i32,
    /// Fixed bounds; `None` uses the data min/max.
    pub bounds: Option<(f64, f64)>,
}

impl HistogramConfig {
    /// The default per-channel histogram: current channel, AUTO bins.
    pub fn auto(coordinate: impl Into<String>, channel: i32) -> Self {
        Self {
            coordinate: coordinate.into(),
            channel,
            num_bins: AUTO_BIN_SIZE,
            bounds: None,
        }
    }
}

/// One spatial profile requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialConfig {
    /// Coordinate string ("x", "y", "Ix", "Qy", ...).
    pub coordinate: String,
    /// First pixel of the requested window, inclusive.
    pub start: usize,
    /// Last pixel of the requested window, exclusive; 0 = image edge.
    pub end: usize,
    /// Decimation factor requested by the client (1 = full resolution).
    pub mip: i32,
    /// Width in pixels for line regions (box-averaged cuts).
    pub width: usize,
}

/// One spectral profile requirement: a coordinate plus requested stats.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralConfig {
    /// Coordinate string ("z", "Iz", "Ptotalz", ...).
    pub coordinate: String,
    /// Statistics requested for the profile.
    pub stats_types: Vec<StatsType>,
}

impl SpectralConfig {
    /// Creates a config.
    pub fn new(coordinate: impl Into<String>, stats_types: Vec<StatsType>) -> Self {
        Self {
            coordinate: coordinate.into(),
            stats_types,
        }
    }

    /// The statistics in `self` not already present in `current`: the
    /// diff an update actually needs to compute.
    pub fn diff_stats(&self, current: &SpectralConfig) -> Vec<StatsType> {
        self.stats_types
            .iter()
            .filter(|s| !current.stats_types.contains(s))
            .copied()
            .collect()
    }
}

/// Region statistics requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsConfig {
    /// Coordinate string selecting the Stokes ("z" = current).
    pub coordinate: String,
    /// Statistics requested.
    pub stats_types: Vec<StatsType>,
}

/// Contour smoothing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SmoothingMode {
    /// Trace the raw grid.
    #[default]
    None,
    /// Gaussian-smooth before tracing.
    Gaussian,
    /// Block-average before tracing.
    BlockAverage,
}

/// Contour request settings. Structural equality gates retraces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContourSettings {
    /// Levels to trace.
    pub levels: Vec<f64>,
    /// Pre-trace smoothing.
    pub smoothing_mode: SmoothingMode,
    /// Smoothing factor (Gaussian factor or block mip).
    pub smoothing_factor: i32,
    /// Client-side coordinate decimation factor.
    pub decimation_factor: i32,
    /// Compression level for the vertex stream.
    pub compression_level: i32,
    /// Vertices per emitted chunk.
    pub chunk_size: usize,
}

impl Default for ContourSettings {
    fn default() -> Self {
        Self {
            levels: Vec::new(),
            smoothing_mode: SmoothingMode::None,
            smoothing_factor: 1,
            decimation_factor: 4,
            compression_level: 8,
            chunk_size: 100_000,
        }
    }
}

/// Polarization vector-overlay settings. Structural equality is the
/// cache key: identical settings at an unchanged channel early-return the
/// cached tiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorFieldSettings {
    /// Downsampling factor of the overlay grid.
    pub mip: i32,
    /// Divide polarized intensity by Stokes I.
    pub fractional: bool,
    /// Intensity threshold below which cells blank to NaN.
    pub threshold: f64,
    /// Apply error debiasing.
    pub debiasing: bool,
    /// Stokes Q error used by debiasing.
    pub q_error: f64,
    /// Stokes U error used by debiasing.
    pub u_error: f64,
    /// Stokes index for the intensity channel; negative = computed PI.
    pub stokes_intensity: i32,
    /// Stokes index for the angle channel; negative = computed PA.
    pub stokes_angle: i32,
    /// Tile compression.
    pub compression_quality: f32,
}

impl Default for VectorFieldSettings {
    fn default() -> Self {
        Self {
            mip: 1,
            fractional: false,
            threshold: f64::NAN,
            debiasing: false,
            q_error: 0.0,
            u_error: 0.0,
            stokes_intensity: -1,
            stokes_angle: -1,
            compression_quality: 8.0,
        }
    }
}

impl VectorFieldSettings {
    /// Structural equality including NaN threshold (NaN == NaN here, so an
    /// unchanged request is recognized as unchanged).
    pub fn same_as(&self, other: &Self) -> bool {
        let threshold_eq = (self.threshold.is_nan() && other.threshold.is_nan())
            || self.threshold == other.threshold;
        self.mip == other.mip
            && self.fractional == other.fractional
            && threshold_eq
            && self.debiasing == other.debiasing
            && self.q_error == other.q_error
            && self.u_error == other.u_error
            && self.stokes_intensity == other.stokes_intensity
            && self.stokes_angle == other.stokes_angle
            && self.compression_quality == other.compression_quality
    }
}

/// Moment image kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Moment {
    /// Mean intensity.
    Mean,
    /// Integrated intensity (moment 0).
    Integrated,
    /// Intensity-weighted coordinate (moment 1).
    WeightedCoord,
    /// Intensity-weighted dispersion of the coordinate (moment 2).
    WeightedDispersionCoord,
    /// Per-pixel median over channels.
    Median,
    /// Standard deviation about the mean.
    StdAboutMean,
    /// Root mean square.
    Rms,
    /// Mean absolute deviation.
    AbsMeanDev,
    /// Per-pixel maximum.
    Max,
    /// Channel coordinate of the maximum.
    MaxCoord,
    /// Per-pixel minimum.
    Min,
    /// Channel coordinate of the minimum.
    MinCoord,
}

impl Moment {
    /// Display suffix of the generated image name.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Mean => "moment.average",
            Self::Integrated => "moment.integrated",
            Self::WeightedCoord => "moment.weighted_coord",
            Self::WeightedDispersionCoord => "moment.weighted_dispersion_coord",
            Self::Median => "moment.median",
            Self::StdAboutMean => "moment.std_about_mean",
            Self::Rms => "moment.rms",
            Self::AbsMeanDev => "moment.abs_mean_dev",
            Self::Max => "moment.maximum",
            Self::MaxCoord => "moment.maximum_coord",
            Self::Min => "moment.minimum",
            Self::MinCoord => "moment.minimum_coord",
        }
    }
}

/// Moment generator request.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentRequest {
    /// Target file.
    pub file_id: i32,
    /// Region to integrate over; `IMAGE_REGION_ID` for the whole image.
    pub region_id: i32,
    /// Moments to produce.
    pub moments: Vec<Moment>,
    /// Channel range to integrate.
    pub spectral_range: AxisRange,
    /// Pixel value range mask; values outside are excluded.
    pub pixel_range: Option<(f32, f32)>,
}

/// PV generator request.
#[derive(Debug, Clone, PartialEq)]
pub struct PvRequest {
    /// Target file.
    pub file_id: i32,
    /// Line or polyline region id.
    pub region_id: i32,
    /// Averaging width across the line, pixels.
    pub width: usize,
    /// Channel range of the output spectral axis.
    pub spectral_range: AxisRange,
    /// Swap the offset and spectral axes of the output.
    pub reverse: bool,
    /// Keep the generated image open after responding.
    pub keep: bool,
}

/// Image fitting request.
#[derive(Debug, Clone, PartialEq)]
pub struct FittingRequest {
    /// Target file.
    pub file_id: i32,
    /// Region bounding the fit; 0 selects the client field of view.
    pub region_id: i32,
    /// Initial component guesses.
    pub initial_values: Vec<GaussianComponent>,
    /// Maximum solver iterations.
    pub max_iterations: usize,
    /// Produce a model image.
    pub create_model_image: bool,
    /// Produce a residual image.
    pub create_residual_image: bool,
}

/// Output format of a save-file request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveFileFormat {
    /// FITS primary HDU.
    Fits,
}

/// Save-file request.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveFileRequest {
    /// Target file.
    pub file_id: i32,
    /// Output path.
    pub output_file_name: String,
    /// Output format.
    pub output_format: SaveFileFormat,
    /// Channels to keep.
    pub channels: AxisRange,
    /// Stokes plane to keep.
    pub stokes: i32,
}
