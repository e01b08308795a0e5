//! In-memory doubles shared by the unit tests: a raster backend with
//! constant-valued bands, a fixed-feature index source, and a catalog
//! over `value_url`/`flags_url` attributes.

use anyhow::{anyhow, bail, Result};
use geo::Rect;
use ndarray::Array2;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::catalog::{GroupFinder, QueryGeometry, RasterCatalog, DATE_FIELD};
use crate::config::SamplingConfig;
use crate::geometry::{BoundsExt, Point3};
use crate::groups::{RasterGroup, RasterInfo};
use crate::index::{FieldValue, IndexData, IndexFeature, IndexSource, SpatialFilter};
use crate::raster::{OpenRequest, RasterOpener, RasterSource};
use crate::sample::{ErrorFlags, RasterSample, RasterSubset};

/// An in-memory raster: one constant value per band.
#[derive(Debug, Clone)]
pub struct MockRaster {
    pub band_names: Vec<String>,
    pub values: Vec<f64>,
    pub bbox: Rect<f64>,
}

impl MockRaster {
    pub fn constant(value: f64) -> Self {
        MockRaster {
            band_names: vec!["b1".to_string()],
            values: vec![value],
            bbox: Rect::new((0., 0.), (10., 10.)),
        }
    }

    pub fn with_bands(bands: &[(&str, f64)]) -> Self {
        MockRaster {
            band_names: bands.iter().map(|(n, _)| n.to_string()).collect(),
            values: bands.iter().map(|(_, v)| *v).collect(),
            bbox: Rect::new((0., 0.), (10., 10.)),
        }
    }

    pub fn with_bounds(mut self, bbox: Rect<f64>) -> Self {
        self.bbox = bbox;
        self
    }
}

struct MockSource {
    raster: MockRaster,
    request: OpenRequest,
    errors: ErrorFlags,
}

impl RasterSource for MockSource {
    fn resolve_bands(&mut self, names: &[String]) -> Result<Vec<usize>> {
        if names.is_empty() {
            return Ok(vec![1]);
        }
        names
            .iter()
            .map(|name| {
                self.raster
                    .band_names
                    .iter()
                    .position(|b| b == name)
                    .map(|i| i + 1)
                    .ok_or_else(|| anyhow!("unknown band: {:?}", name))
            })
            .collect()
    }

    fn sample(&mut self, point: Point3, band: usize) -> Option<RasterSample> {
        if !self.raster.bbox.contains_xy(point.x, point.y) {
            self.errors |= ErrorFlags::OUT_OF_BOUNDS;
            return None;
        }
        let mut sample = RasterSample::new(self.request.file_id);
        sample.value = self.raster.values[band - 1];
        sample.time = self.request.gps.seconds();
        sample.band = self.raster.band_names[band - 1].clone();
        Some(sample)
    }

    fn subset(&mut self, extent: &Rect<f64>, band: usize) -> Option<RasterSubset> {
        let overlap = Rect::new(
            (
                extent.min().x.max(self.raster.bbox.min().x),
                extent.min().y.max(self.raster.bbox.min().y),
            ),
            (
                extent.max().x.min(self.raster.bbox.max().x),
                extent.max().y.min(self.raster.bbox.max().y),
            ),
        );
        if overlap.width() <= 0. || overlap.height() <= 0. {
            self.errors |= ErrorFlags::OUT_OF_BOUNDS;
            return None;
        }
        // one pixel per CRS unit
        let cols = (overlap.width().ceil() as usize).max(1);
        let rows = (overlap.height().ceil() as usize).max(1);
        let off_x = (overlap.min().x - self.raster.bbox.min().x).floor() as isize;
        let off_y = (overlap.min().y - self.raster.bbox.min().y).floor() as isize;
        Some(RasterSubset {
            file_id: self.request.file_id,
            band: self.raster.band_names[band - 1].clone(),
            time: self.request.gps.seconds(),
            window: ((off_x, off_y), (cols, rows)),
            data: Array2::from_elem((rows, cols), self.raster.values[band - 1]),
        })
    }

    fn errors(&self) -> ErrorFlags {
        self.errors
    }
}

/// A registry of [`MockRaster`]s keyed by path, counting opens.
#[derive(Default)]
pub struct MockOpener {
    rasters: Mutex<HashMap<String, MockRaster>>,
    failing: Mutex<HashSet<String>>,
    opens: Mutex<HashMap<String, usize>>,
    open_delay: Mutex<Option<Duration>>,
}

impl MockOpener {
    pub fn new() -> Self {
        MockOpener::default()
    }

    pub fn add(&self, path: &str, raster: MockRaster) {
        self.rasters
            .lock()
            .unwrap()
            .insert(path.to_string(), raster);
    }

    /// Make opening `path` fail.
    pub fn fail(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    /// Make every open take `delay`, simulating slow raster I/O.
    pub fn delay_opens(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }

    /// Number of times `path` was opened.
    pub fn opens(&self, path: &str) -> usize {
        self.opens.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.opens.lock().unwrap().values().sum()
    }
}

impl RasterOpener for MockOpener {
    fn open(
        &self,
        request: &OpenRequest,
        _config: &SamplingConfig,
    ) -> Result<Box<dyn RasterSource>> {
        *self
            .opens
            .lock()
            .unwrap()
            .entry(request.path.clone())
            .or_insert(0) += 1;
        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.failing.lock().unwrap().contains(&request.path) {
            bail!("cannot open {:?}", request.path);
        }
        let raster = self
            .rasters
            .lock()
            .unwrap()
            .get(&request.path)
            .cloned()
            .ok_or_else(|| anyhow!("no such raster: {:?}", request.path))?;
        Ok(Box::new(MockSource {
            raster,
            request: request.clone(),
            errors: ErrorFlags::NONE,
        }))
    }
}

/// Build a scene feature the [`MockCatalog`] understands.
pub fn scene_feature(
    fid: u64,
    footprint: Rect<f64>,
    datetime: Option<&str>,
    value_url: &str,
    flags_url: Option<&str>,
) -> IndexFeature {
    let mut fields = HashMap::new();
    if let Some(dt) = datetime {
        fields.insert(DATE_FIELD.to_string(), FieldValue::String(dt.to_string()));
    }
    fields.insert(
        "value_url".to_string(),
        FieldValue::String(value_url.to_string()),
    );
    if let Some(url) = flags_url {
        fields.insert("flags_url".to_string(), FieldValue::String(url.to_string()));
    }
    IndexFeature::new(fid, footprint.to_polygon().into(), fields)
        .expect("footprint has an extent")
}

/// A fixed set of features behind the [`IndexSource`] seam.
pub struct MockIndexSource {
    data: IndexData,
    pub reads: AtomicUsize,
}

impl MockIndexSource {
    pub fn new(features: Vec<IndexFeature>) -> Self {
        let bbox = features
            .iter()
            .map(|f| *f.envelope())
            .reduce(|a, b| {
                Rect::new(
                    (a.min().x.min(b.min().x), a.min().y.min(b.min().y)),
                    (a.max().x.max(b.max().x), a.max().y.max(b.max().y)),
                )
            });
        MockIndexSource {
            data: IndexData {
                features,
                bbox,
                dims: (0, 0),
            },
            reads: AtomicUsize::new(0),
        }
    }
}

impl IndexSource for MockIndexSource {
    fn read(&self, _path: &str, filter: Option<&SpatialFilter>) -> Result<IndexData> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.clone();
        if let Some(filter) = filter {
            data.features.retain(|f| filter.accepts(f.envelope()));
        }
        Ok(data)
    }
}

/// A catalog over [`scene_feature`]s: one group per intersecting
/// feature, a value raster from `value_url` and an optional flags
/// raster from `flags_url`.
pub struct MockCatalog {
    pub index: String,
}

impl MockCatalog {
    pub fn new() -> Self {
        MockCatalog {
            index: "index.geojson".to_string(),
        }
    }
}

impl RasterCatalog for MockCatalog {
    fn index_path(&self, _query: &QueryGeometry) -> Result<String> {
        Ok(self.index.clone())
    }

    fn find_groups(&self, finder: &mut GroupFinder<'_>) -> Result<()> {
        for feature in finder.features {
            if !finder.geometry.intersects(feature) {
                continue;
            }
            let id = format!("scene-{}", feature.fid);
            let mut group = match self.feature_date(feature) {
                Some(date) => RasterGroup::with_date(&id, date),
                None => RasterGroup::new(&id),
            };
            if let Some(url) = feature.field_str("value_url") {
                let file_id = finder.dictionary.insert(url);
                group.rasters.push(RasterInfo::value(file_id));
            }
            if let Some(url) = feature.field_str("flags_url") {
                let file_id = finder.dictionary.insert(url);
                group.rasters.push(RasterInfo::flags(file_id));
            }
            finder.push(group);
        }
        Ok(())
    }
}
