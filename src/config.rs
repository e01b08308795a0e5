//! Sampling configuration.
//!
//! [`SamplingConfig`] carries the request-level knobs of the engine:
//! resampling algorithm and radius, zonal statistics, temporal and
//! path filters, band selection. It deserializes from JSON request
//! bodies with every field optional; unset fields keep their
//! defaults.

use anyhow::{ensure, Result};
use serde_derive::Deserialize;

use crate::time::{DayRange, IsoTime, TimeRange};

/// Pixel resampling kernels, named as GDAL's RasterIO understands
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ResampleKernel {
    NearestNeighbour,
    Bilinear,
    Cubic,
    CubicSpline,
    Lanczos,
    Average,
    Mode,
    Gauss,
}

impl ResampleKernel {
    /// Kernel size in pixels when no explicit sampling radius is
    /// given.
    pub fn kernel_size(&self) -> usize {
        use ResampleKernel::*;
        match self {
            NearestNeighbour => 0,
            Bilinear => 2,
            Cubic | CubicSpline => 4,
            Lanczos | Average | Mode | Gauss => 6,
        }
    }

    #[inline]
    pub fn is_nearest(&self) -> bool {
        *self == ResampleKernel::NearestNeighbour
    }
}

impl Default for ResampleKernel {
    fn default() -> Self {
        ResampleKernel::NearestNeighbour
    }
}

/// Per-request sampling parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Resampling algorithm applied around the query pixel.
    pub algorithm: ResampleKernel,
    /// Sampling radius in meters; 0 samples the single pixel under
    /// the point.
    pub radius: f64,
    /// Compute zonal statistics over the radius window.
    pub zonal_stats: bool,
    /// Look up quality flags from each group's flags raster.
    pub with_flags: bool,
    /// Keep only rasters whose path contains this substring.
    pub substr: Option<String>,
    /// Keep only groups acquired at or after this time.
    pub t0: Option<IsoTime>,
    /// Keep only groups acquired at or before this time.
    pub t1: Option<IsoTime>,
    /// Keep only the groups acquired closest to this time.
    pub closest_time: Option<IsoTime>,
    /// Let a per-point timestamp override `closest_time`.
    pub use_poi_time: bool,
    /// Keep only groups whose acquisition day-of-year passes this
    /// test.
    pub doy_range: Option<DayRange>,
    /// Return samples ordered by index-file position instead of
    /// spatial-query order.
    pub sort_by_index: bool,
    /// PROJ pipeline overriding the default point transform.
    pub proj_pipeline: Option<String>,
    /// Area of interest limiting the transform's validity extent:
    /// `[lon_min, lat_min, lon_max, lat_max]`.
    pub aoi_bbox: Option<[f64; 4]>,
    /// Band names to sample; empty samples the first band.
    pub bands: Vec<String>,
    /// CRS of incoming query coordinates.
    pub input_crs: String,
    /// High bits of the file-dictionary ids minted by the engine.
    pub key_space: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            algorithm: ResampleKernel::default(),
            radius: 0.,
            zonal_stats: false,
            with_flags: false,
            substr: None,
            t0: None,
            t1: None,
            closest_time: None,
            use_poi_time: false,
            doy_range: None,
            sort_by_index: false,
            proj_pipeline: None,
            aoi_bbox: None,
            bands: Vec::new(),
            input_crs: "EPSG:7912".to_string(),
            key_space: 0,
        }
    }
}

impl SamplingConfig {
    /// The `t0..t1` acquisition window; unbounded ends when unset.
    pub fn time_range(&self) -> TimeRange {
        TimeRange {
            start: self.t0.map(|t| t.0),
            stop: self.t1.map(|t| t.0),
        }
    }

    /// True when an acquisition-window test is configured.
    pub fn filters_time(&self) -> bool {
        self.t0.is_some() || self.t1.is_some()
    }

    /// Check cross-field constraints not expressible in the types.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.radius >= 0., "invalid sampling radius: {}", self.radius);
        ensure!(
            self.key_space <= u32::MAX as u64,
            "key space does not fit in 32 bits: {}",
            self.key_space
        );
        Ok(())
    }
}
