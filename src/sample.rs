//! Sample result types shared by the serial and batch pipelines.

use ndarray::Array2;
use serde_derive::Serialize;
use std::ops::{BitOr, BitOrAssign};

use crate::geometry::{Point3, RasterWindow};
use crate::time::GpsTime;

/// Non-fatal error conditions accumulated during a sampling call and
/// returned alongside the (possibly partial) results. Callers inspect
/// these to distinguish "no raster overlaps the query" from "a
/// resource limit was hit".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ErrorFlags(u32);

impl ErrorFlags {
    pub const NONE: ErrorFlags = ErrorFlags(0);
    /// The vector index for the query could not be opened.
    pub const INDEX_FILE: ErrorFlags = ErrorFlags(1);
    /// Reader threads could not be created or dispatched to.
    pub const RESOURCE_LIMIT: ErrorFlags = ErrorFlags(1 << 1);
    /// More distinct rasters were needed this round than the reader
    /// ceiling allows; sampling was skipped for the round.
    pub const THREADS_LIMIT: ErrorFlags = ErrorFlags(1 << 2);
    /// A query point fell outside a candidate raster's bounds.
    pub const OUT_OF_BOUNDS: ErrorFlags = ErrorFlags(1 << 3);
    /// A raster read failed after retry.
    pub const READ: ErrorFlags = ErrorFlags(1 << 4);

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(&self, other: ErrorFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for ErrorFlags {
    type Output = ErrorFlags;

    fn bitor(self, rhs: ErrorFlags) -> ErrorFlags {
        ErrorFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrorFlags {
    fn bitor_assign(&mut self, rhs: ErrorFlags) {
        self.0 |= rhs.0;
    }
}

/// Statistics over the valid pixels of a circular window centered on
/// the query point.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ZonalStats {
    pub count: u32,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub stdev: f64,
    pub mad: f64,
}

impl ZonalStats {
    /// Compute statistics over a set of valid pixel values. Sorts the
    /// slice to extract the median; even-length sets average the two
    /// middle values. Empty input yields `None`.
    pub fn over(values: &mut [f64]) -> Option<ZonalStats> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let n = values.len();
        let mean = values.iter().sum::<f64>() / n as f64;
        let mut sq_dev = 0.;
        let mut abs_dev = 0.;
        for v in values.iter() {
            let d = v - mean;
            sq_dev += d * d;
            abs_dev += d.abs();
        }
        let median = if n % 2 == 0 {
            (values[n / 2] + values[n / 2 - 1]) / 2.
        } else {
            values[n / 2]
        };
        Some(ZonalStats {
            count: n as u32,
            min: values[0],
            max: values[n - 1],
            mean,
            median,
            stdev: (sq_dev / n as f64).sqrt(),
            mad: abs_dev / n as f64,
        })
    }
}

/// One sampled value from one raster band.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RasterSample {
    /// Pixel value; NaN when the pixel holds the band's nodata value.
    pub value: f64,
    /// Acquisition time of the sample's group, in GPS seconds.
    pub time: f64,
    /// Id of the source file in the engine's file dictionary.
    pub file_id: u64,
    /// Quality flags looked up from the group's flags raster.
    pub flags: u32,
    /// Band description as reported by the raster.
    pub band: String,
    /// Present when zonal statistics were requested.
    pub stats: Option<ZonalStats>,
}

impl RasterSample {
    pub fn new(file_id: u64) -> Self {
        RasterSample {
            value: f64::NAN,
            time: 0.,
            file_id,
            flags: 0,
            band: String::new(),
            stats: None,
        }
    }
}

/// A window of raw pixels cut from one raster band.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSubset {
    pub file_id: u64,
    pub band: String,
    /// Acquisition time of the subset's group, in GPS seconds.
    pub time: f64,
    /// The source-raster window the data was read from.
    pub window: RasterWindow,
    pub data: Array2<f64>,
}

/// Samples for one query, ordered by group.
pub type SampleList = Vec<RasterSample>;

/// Subsets for one query, ordered by group.
pub type SubsetList = Vec<RasterSubset>;

/// A batch query point: coordinates plus an optional per-point
/// timestamp driving closest-time filtering.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointRecord {
    pub point: Point3,
    pub gps: GpsTime,
}

impl PointRecord {
    pub fn new(point: Point3, gps: GpsTime) -> Self {
        PointRecord { point, gps }
    }
}
