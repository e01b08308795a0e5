//! Raster backend abstraction.
//!
//! Opening and reading rasters goes through two seams: a
//! [`RasterOpener`] turns an [`OpenRequest`] into a live
//! [`RasterSource`], and the source answers point samples and window
//! subsets per band. The GDAL-backed implementation lives in
//! [`crate::gdal`]; tests substitute in-memory sources.

use anyhow::Result;
use geo::Rect;
use log::warn;

use crate::config::SamplingConfig;
use crate::geometry::Point3;
use crate::groups::RasterRole;
use crate::sample::{ErrorFlags, RasterSample, RasterSubset};
use crate::time::GpsTime;

/// Everything needed to open one raster for sampling.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub path: String,
    pub role: RasterRole,
    /// Id of `path` in the engine's file dictionary, stamped into
    /// samples.
    pub file_id: u64,
    /// Acquisition time of the raster's group.
    pub gps: GpsTime,
    /// Bound on reads, typically the index file's overall extent.
    pub read_bbox: Option<Rect<f64>>,
}

/// A live raster handle.
///
/// Sources accumulate per-raster error conditions instead of failing
/// the round: a read that yields nothing returns `None` and sets a
/// bit retrievable through [`RasterSource::errors`].
pub trait RasterSource: Send {
    /// Resolve configured band names to 1-based band indices. An
    /// empty list selects the first band.
    fn resolve_bands(&mut self, names: &[String]) -> Result<Vec<usize>>;

    /// Sample one band under a point.
    fn sample(&mut self, point: Point3, band: usize) -> Option<RasterSample>;

    /// Cut a window of one band covering `extent`.
    fn subset(&mut self, extent: &Rect<f64>, band: usize) -> Option<RasterSubset>;

    /// Error conditions accumulated so far.
    fn errors(&self) -> ErrorFlags;
}

/// Opens rasters on behalf of the engine.
pub trait RasterOpener: Send + Sync {
    fn open(&self, request: &OpenRequest, config: &SamplingConfig)
        -> Result<Box<dyn RasterSource>>;
}

/// A raster that opens on first use. Open failures are logged,
/// flagged and retried on the next use.
pub struct LazyRaster {
    request: OpenRequest,
    source: Option<Box<dyn RasterSource>>,
    errors: ErrorFlags,
}

impl LazyRaster {
    pub fn new(request: OpenRequest) -> Self {
        LazyRaster {
            request,
            source: None,
            errors: ErrorFlags::NONE,
        }
    }

    #[inline]
    pub fn request(&self) -> &OpenRequest {
        &self.request
    }

    /// The live source, opening it on first call.
    pub fn open(
        &mut self,
        opener: &dyn RasterOpener,
        config: &SamplingConfig,
    ) -> Option<&mut (dyn RasterSource + '_)> {
        if self.source.is_none() {
            match opener.open(&self.request, config) {
                Ok(source) => self.source = Some(source),
                Err(err) => {
                    warn!("failed to open raster {}: {:#}", self.request.path, err);
                    self.errors |= ErrorFlags::READ;
                    return None;
                }
            }
        }
        self.source
            .as_mut()
            .map(|source| &mut **source as &mut dyn RasterSource)
    }

    /// Errors from this wrapper and the opened source.
    pub fn errors(&self) -> ErrorFlags {
        match &self.source {
            Some(source) => self.errors | source.errors(),
            None => self.errors,
        }
    }

    /// Drop the underlying handle, keeping accumulated errors.
    pub fn close(&mut self) {
        if let Some(source) = &self.source {
            self.errors |= source.errors();
        }
        self.source = None;
    }
}

/// Sample every configured band of a raster under one point. Returns
/// one slot per band (`None` where the raster yielded nothing) plus
/// the raster's accumulated errors.
pub fn sample_bands(
    raster: &mut LazyRaster,
    opener: &dyn RasterOpener,
    config: &SamplingConfig,
    point: Point3,
) -> (Vec<Option<RasterSample>>, ErrorFlags) {
    let path = raster.request().path.clone();
    let mut slots = Vec::new();
    if let Some(source) = raster.open(opener, config) {
        match source.resolve_bands(&config.bands) {
            Ok(bands) => {
                for band in bands {
                    slots.push(source.sample(point, band));
                }
            }
            Err(err) => warn!("resolving bands of {}: {:#}", path, err),
        }
    }
    (slots, raster.errors())
}

/// Subset every configured band of a raster over one extent.
pub fn subset_bands(
    raster: &mut LazyRaster,
    opener: &dyn RasterOpener,
    config: &SamplingConfig,
    extent: &Rect<f64>,
) -> (Vec<Option<RasterSubset>>, ErrorFlags) {
    let path = raster.request().path.clone();
    let mut slots = Vec::new();
    if let Some(source) = raster.open(opener, config) {
        match source.resolve_bands(&config.bands) {
            Ok(bands) => {
                for band in bands {
                    slots.push(source.subset(extent, band));
                }
            }
            Err(err) => warn!("resolving bands of {}: {:#}", path, err),
        }
    }
    (slots, raster.errors())
}
