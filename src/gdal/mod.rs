//! GDAL-backed raster reading.
//!
//! [`GdalOpener`] implements the [`RasterOpener`] seam over GDAL
//! datasets: query points are transformed into the raster CRS with an
//! OGR coordinate transformation (optionally overridden by a PROJ
//! pipeline), located through the dataset's geo-transform, and read
//! per band with `RasterIO`, including decimated reads for the
//! resampling kernels. Index files are read by [`GdalIndexSource`]
//! from the [`vector`] submodule.

use anyhow::{bail, ensure, Context, Result};
use gdal::raster::{Buffer, RasterBand, ResampleAlg};
use gdal::spatial_ref::{CoordTransform, CoordTransformOptions, SpatialRef};
use gdal::{Dataset, Metadata};
use gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER;
use geo::Rect;
use log::warn;
use ndarray::Array2;
use std::path::Path;
use std::time::Duration;

use crate::config::{ResampleKernel, SamplingConfig};
use crate::geometry::{
    invert_transform, map_to_pixel, radius_in_pixels, transform_from_raw, window_within,
    BoundsExt, PixelTransform, Point3, RasterDims,
};
use crate::groups::RasterRole;
use crate::raster::{OpenRequest, RasterOpener, RasterSource};
use crate::sample::{ErrorFlags, RasterSample, RasterSubset, ZonalStats};

mod vector;
pub use vector::GdalIndexSource;

/// Opens rasters with [`Dataset::open`].
pub struct GdalOpener;

impl RasterOpener for GdalOpener {
    fn open(
        &self,
        request: &OpenRequest,
        config: &SamplingConfig,
    ) -> Result<Box<dyn RasterSource>> {
        Ok(Box::new(GdalRasterSource::open(request, config)?))
    }
}

/// Parse a CRS definition as it appears in configuration: an
/// `EPSG:nnnn` code, a PROJ string or WKT.
pub fn spatial_ref_from(definition: &str) -> Result<SpatialRef> {
    let definition = definition.trim();
    if let Some(code) = definition.strip_prefix("EPSG:") {
        let code: u32 = code
            .parse()
            .with_context(|| format!("invalid EPSG code: {:?}", definition))?;
        return Ok(SpatialRef::from_epsg(code)?);
    }
    if definition.starts_with('+') {
        return Ok(SpatialRef::from_proj4(definition)?);
    }
    Ok(SpatialRef::from_wkt(definition)?)
}

/// The transform from query coordinates into one raster's CRS.
///
/// OGRCoordinateTransformationH is not re-entrant but may move
/// between threads; the reader pools hand a source to one worker at
/// a time, which is the only user of its transform.
struct PointTransform(CoordTransform);

unsafe impl Send for PointTransform {}

impl PointTransform {
    fn build(dataset: &Dataset, config: &SamplingConfig) -> Result<Option<PointTransform>> {
        let target = match dataset.spatial_ref() {
            Ok(srs) => srs,
            // a raster without a CRS is sampled in query coordinates
            Err(_) => return Ok(None),
        };
        let source = spatial_ref_from(&config.input_crs)?;
        source.set_axis_mapping_strategy(OAMS_TRADITIONAL_GIS_ORDER);
        target.set_axis_mapping_strategy(OAMS_TRADITIONAL_GIS_ORDER);

        let transform = if config.proj_pipeline.is_none() && config.aoi_bbox.is_none() {
            CoordTransform::new(&source, &target)?
        } else {
            let mut options = CoordTransformOptions::new()?;
            if let Some(pipeline) = &config.proj_pipeline {
                options.set_coordinate_operation(pipeline, false)?;
            }
            if let Some([west, south, east, north]) = config.aoi_bbox {
                options.set_area_of_interest(west, south, east, north)?;
            }
            CoordTransform::new_with_options(&source, &target, &options)?
        };
        Ok(Some(PointTransform(transform)))
    }

    fn apply(&self, point: Point3) -> Result<Point3> {
        let mut x = [point.x];
        let mut y = [point.y];
        let mut z = [point.z];
        self.0.transform_coords(&mut x, &mut y, &mut z)?;
        Ok(Point3::new(x[0], y[0], z[0]))
    }
}

/// One opened GDAL raster.
pub struct GdalRasterSource {
    dataset: Dataset,
    request: OpenRequest,
    dims: RasterDims,
    to_map: PixelTransform,
    to_pixel: PixelTransform,
    transform: Option<PointTransform>,
    algorithm: ResampleKernel,
    radius: f64,
    zonal_stats: bool,
    errors: ErrorFlags,
}

impl GdalRasterSource {
    pub fn open(request: &OpenRequest, config: &SamplingConfig) -> Result<Self> {
        let dataset = Dataset::open(Path::new(&request.path))
            .with_context(|| format!("opening raster {:?}", request.path))?;
        let dims = dataset.raster_size();
        ensure!(dims.0 > 0 && dims.1 > 0, "raster {:?} is empty", request.path);

        let gt = dataset
            .geo_transform()
            .with_context(|| format!("raster {:?} has no geo-transform", request.path))?;
        let to_map = transform_from_raw(&gt);
        let to_pixel = invert_transform(&to_map)?;
        let transform = PointTransform::build(&dataset, config)?;

        Ok(GdalRasterSource {
            dataset,
            request: request.clone(),
            dims,
            to_map,
            to_pixel,
            transform,
            algorithm: config.algorithm,
            radius: config.radius,
            zonal_stats: config.zonal_stats,
            errors: ErrorFlags::NONE,
        })
    }

    /// Transform the query point into the raster CRS and locate its
    /// pixel. `None` marks the point out of bounds.
    fn locate(&mut self, point: Point3) -> Option<(Point3, (isize, isize))> {
        let mapped = match &self.transform {
            Some(t) => match t.apply(point) {
                Ok(p) => p,
                Err(err) => {
                    warn!("transforming point into {:?}: {}", self.request.path, err);
                    self.errors |= ErrorFlags::OUT_OF_BOUNDS;
                    return None;
                }
            },
            None => point,
        };
        if let Some(bbox) = &self.request.read_bbox {
            if !bbox.contains_xy(mapped.x, mapped.y) {
                self.errors |= ErrorFlags::OUT_OF_BOUNDS;
                return None;
            }
        }
        let (col, row) = map_to_pixel(&self.to_pixel, mapped.x, mapped.y);
        let (cols, rows) = (self.dims.0 as isize, self.dims.1 as isize);
        if col < 0 || row < 0 || col >= cols || row >= rows {
            self.errors |= ErrorFlags::OUT_OF_BOUNDS;
            return None;
        }
        Some((mapped, (col, row)))
    }

    /// Read the value under `(col, row)`, resampled over the
    /// configured kernel when it fits inside the raster.
    fn read_value(&mut self, band: usize, (col, row): (isize, isize)) -> Option<f64> {
        let rb = match self.dataset.rasterband(band as isize) {
            Ok(rb) => rb,
            Err(err) => {
                warn!("band {} of {:?}: {}", band, self.request.path, err);
                self.errors |= ErrorFlags::READ;
                return None;
            }
        };
        let kernel = self.algorithm.kernel_size();
        let half = (kernel / 2) as isize;
        let read = if kernel > 1 && window_within((col - half, row - half), kernel, self.dims) {
            read_retry(
                &rb,
                (col - half, row - half),
                (kernel, kernel),
                (1, 1),
                Some(resample_alg(self.algorithm)),
            )
        } else {
            read_retry(&rb, (col, row), (1, 1), (1, 1), None)
        };
        match read {
            Ok(buffer) => {
                let value = buffer.data[0];
                match rb.no_data_value() {
                    Some(nodata) if value == nodata => Some(f64::NAN),
                    _ => Some(value),
                }
            }
            Err(err) => {
                warn!("reading {:?}: {}", self.request.path, err);
                self.errors |= ErrorFlags::READ;
                None
            }
        }
    }

    /// Statistics over the valid pixels within `radius_px` of the
    /// query pixel.
    fn read_stats(
        &mut self,
        band: usize,
        (col, row): (isize, isize),
        radius_px: usize,
    ) -> Option<ZonalStats> {
        let rb = self.dataset.rasterband(band as isize).ok()?;
        let r = radius_px as isize;
        let bounds = Rect::new(
            ((col - r) as f64, (row - r) as f64),
            ((col + r + 1) as f64, (row + r + 1) as f64),
        );
        let ((left, top), (width, height)) = bounds.window_from_bounds(self.dims);
        if width == 0 || height == 0 {
            return None;
        }
        let buffer = match read_retry(&rb, (left, top), (width, height), (width, height), None) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!("reading stats window of {:?}: {}", self.request.path, err);
                self.errors |= ErrorFlags::READ;
                return None;
            }
        };
        let nodata = rb.no_data_value();
        let r2 = (radius_px * radius_px) as isize;
        let mut values = Vec::new();
        for (i, value) in buffer.data.iter().enumerate() {
            if nodata.map_or(false, |nd| *value == nd) || value.is_nan() {
                continue;
            }
            let dc = left + (i % width) as isize - col;
            let dr = top + (i / width) as isize - row;
            if dc * dc + dr * dr <= r2 {
                values.push(*value);
            }
        }
        ZonalStats::over(&mut values)
    }

    fn band_name(&self, band: usize) -> String {
        self.dataset
            .rasterband(band as isize)
            .ok()
            .and_then(|rb| rb.description().ok())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("b{}", band))
    }
}

impl RasterSource for GdalRasterSource {
    fn resolve_bands(&mut self, names: &[String]) -> Result<Vec<usize>> {
        let count = self.dataset.raster_count() as usize;
        if names.is_empty() {
            return Ok(vec![1]);
        }
        names
            .iter()
            .map(|name| {
                for band in 1..=count {
                    if self.band_name(band) == *name {
                        return Ok(band);
                    }
                }
                // numeric names address bands directly
                if let Ok(band) = name.parse::<usize>() {
                    if (1..=count).contains(&band) {
                        return Ok(band);
                    }
                }
                bail!("no band {:?} in {:?}", name, self.request.path)
            })
            .collect()
    }

    fn sample(&mut self, point: Point3, band: usize) -> Option<RasterSample> {
        let (mapped, pixel) = self.locate(point)?;
        let mut value = self.read_value(band, pixel)?;

        // elevation rasters take the vertical shift of the transform
        if let RasterRole::Value { elevation: true } = self.request.role {
            if value.is_finite() && self.transform.is_some() {
                value += mapped.z - point.z;
            }
        }

        let mut sample = RasterSample::new(self.request.file_id);
        sample.value = value;
        sample.time = self.request.gps.seconds();
        sample.band = self.band_name(band);
        if self.zonal_stats {
            let radius_px = radius_in_pixels(self.radius, self.to_map[(0, 0)], point.y);
            if radius_px > 0 {
                sample.stats = self.read_stats(band, pixel, radius_px);
            }
        }
        Some(sample)
    }

    fn subset(&mut self, extent: &Rect<f64>, band: usize) -> Option<RasterSubset> {
        let corners = [
            (extent.min().x, extent.min().y),
            (extent.min().x, extent.max().y),
            (extent.max().x, extent.min().y),
            (extent.max().x, extent.max().y),
        ];
        let mut pixel_bounds: Option<Rect<f64>> = None;
        for (x, y) in corners {
            let mapped = match &self.transform {
                Some(t) => match t.apply(Point3::xy(x, y)) {
                    Ok(p) => p,
                    Err(err) => {
                        warn!("transforming extent into {:?}: {}", self.request.path, err);
                        self.errors |= ErrorFlags::OUT_OF_BOUNDS;
                        return None;
                    }
                },
                None => Point3::xy(x, y),
            };
            let px = self
                .to_pixel
                .transform_point(&nalgebra::Point2::new(mapped.x, mapped.y));
            pixel_bounds = Some(match pixel_bounds {
                None => Rect::new((px.x, px.y), (px.x, px.y)),
                Some(r) => Rect::new(
                    (r.min().x.min(px.x), r.min().y.min(px.y)),
                    (r.max().x.max(px.x), r.max().y.max(px.y)),
                ),
            });
        }

        let window = pixel_bounds?.window_from_bounds(self.dims);
        let ((left, top), (width, height)) = window;
        if width == 0 || height == 0 {
            self.errors |= ErrorFlags::OUT_OF_BOUNDS;
            return None;
        }

        let rb = match self.dataset.rasterband(band as isize) {
            Ok(rb) => rb,
            Err(err) => {
                warn!("band {} of {:?}: {}", band, self.request.path, err);
                self.errors |= ErrorFlags::READ;
                return None;
            }
        };
        let buffer = match read_retry(&rb, (left, top), (width, height), (width, height), None) {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!("subsetting {:?}: {}", self.request.path, err);
                self.errors |= ErrorFlags::READ;
                return None;
            }
        };
        let mut data = match Array2::from_shape_vec((height, width), buffer.data) {
            Ok(data) => data,
            Err(err) => {
                warn!("subset of {:?} has a bad shape: {}", self.request.path, err);
                self.errors |= ErrorFlags::READ;
                return None;
            }
        };
        if let Some(nodata) = rb.no_data_value() {
            data.mapv_inplace(|v| if v == nodata { f64::NAN } else { v });
        }

        Some(RasterSubset {
            file_id: self.request.file_id,
            band: self.band_name(band),
            time: self.request.gps.seconds(),
            window,
            data,
        })
    }

    fn errors(&self) -> ErrorFlags {
        self.errors
    }
}

fn resample_alg(kernel: ResampleKernel) -> ResampleAlg {
    match kernel {
        ResampleKernel::NearestNeighbour => ResampleAlg::NearestNeighbour,
        ResampleKernel::Bilinear => ResampleAlg::Bilinear,
        ResampleKernel::Cubic => ResampleAlg::Cubic,
        ResampleKernel::CubicSpline => ResampleAlg::CubicSpline,
        ResampleKernel::Lanczos => ResampleAlg::Lanczos,
        ResampleKernel::Average => ResampleAlg::Average,
        ResampleKernel::Mode => ResampleAlg::Mode,
        ResampleKernel::Gauss => ResampleAlg::Gauss,
    }
}

const RETRY_PAUSE: Duration = Duration::from_millis(50);

/// One `RasterIO` call, retried once after a pause on a transient
/// failure.
fn read_retry(
    band: &RasterBand,
    window: (isize, isize),
    window_size: (usize, usize),
    size: (usize, usize),
    alg: Option<ResampleAlg>,
) -> gdal::errors::Result<Buffer<f64>> {
    band.read_as::<f64>(window, window_size, size, alg)
        .or_else(|err| {
            warn!(
                "retrying read @ ({},{}) of dimension ({}x{}): {}",
                window.0, window.1, window_size.0, window_size.1, err
            );
            std::thread::sleep(RETRY_PAUSE);
            band.read_as::<f64>(window, window_size, size, alg)
        })
}
