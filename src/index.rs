//! Spatial index over a vector index file.
//!
//! A raster collection is described by a vector dataset with one
//! feature per scene; the feature geometry is the scene footprint and
//! its attributes name the scene's raster files and acquisition time.
//! [`SpatialIndex`] loads those features through an [`IndexSource`]
//! and answers point and envelope queries from an in-memory R-tree.
//!
//! The index applies two pre-filters while loading: a spatial filter
//! (pushed down to the source, which typically maps it onto a layer
//! filter) and an acquisition-time window applied per feature. A
//! feature with no parseable date always passes the time window.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use geo::{BoundingRect, ConvexHull, Intersects, MultiPoint, Point, Polygon, Rect};
use rstar::{RTree, RTreeObject, AABB};
use std::collections::HashMap;

use crate::geometry::{BoundsExt, RasterDims};
use crate::sample::PointRecord;
use crate::time::TimeRange;

/// Buffer applied around spatial-filter hulls, in CRS units.
pub const FILTER_TOLERANCE: f64 = 0.01;

/// An attribute value carried by an index feature.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Real(f64),
    StringList(Vec<String>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str_list(&self) -> Option<&[String]> {
        match self {
            FieldValue::StringList(v) => Some(v),
            _ => None,
        }
    }
}

/// One feature of the vector index: a scene footprint plus its
/// attributes.
#[derive(Debug, Clone)]
pub struct IndexFeature {
    pub fid: u64,
    geometry: geo::Geometry<f64>,
    envelope: Rect<f64>,
    fields: HashMap<String, FieldValue>,
}

impl IndexFeature {
    /// Build a feature; yields `None` for geometries with no extent.
    pub fn new(
        fid: u64,
        geometry: geo::Geometry<f64>,
        fields: HashMap<String, FieldValue>,
    ) -> Option<Self> {
        let envelope = geometry.bounding_rect()?;
        Some(IndexFeature {
            fid,
            geometry,
            envelope,
            fields,
        })
    }

    #[inline]
    pub fn envelope(&self) -> &Rect<f64> {
        &self.envelope
    }

    #[inline]
    pub fn geometry(&self) -> &geo::Geometry<f64> {
        &self.geometry
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|f| f.as_str())
    }

    /// Precise intersection test against the feature geometry.
    pub fn intersects(&self, other: &geo::Geometry<f64>) -> bool {
        self.geometry.intersects(other)
    }
}

/// Spatial pre-filter for index reads: the buffered convex hull of a
/// batch's query points.
#[derive(Debug, Clone)]
pub struct SpatialFilter {
    hull: Polygon<f64>,
    tolerance: f64,
}

impl SpatialFilter {
    /// Convex hull over a batch of query points. `None` for an empty
    /// batch.
    pub fn over_points(points: &[PointRecord]) -> Option<SpatialFilter> {
        if points.is_empty() {
            return None;
        }
        let hull = MultiPoint::new(
            points
                .iter()
                .map(|r| Point::new(r.point.x, r.point.y))
                .collect(),
        )
        .convex_hull();
        Some(SpatialFilter {
            hull,
            tolerance: FILTER_TOLERANCE,
        })
    }

    #[inline]
    pub fn hull(&self) -> &Polygon<f64> {
        &self.hull
    }

    #[inline]
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Envelope-level acceptance test for sources without their own
    /// layer filtering.
    pub fn accepts(&self, envelope: &Rect<f64>) -> bool {
        self.hull
            .intersects(&envelope.expanded(self.tolerance).to_polygon())
    }
}

/// The features read from one vector index.
#[derive(Debug, Clone, Default)]
pub struct IndexData {
    pub features: Vec<IndexFeature>,
    /// Overall extent the source reports for the (spatially filtered)
    /// layer.
    pub bbox: Option<Rect<f64>>,
    /// Raster dimensions of the index dataset; `(0, 0)` for plain
    /// vector formats.
    pub dims: RasterDims,
}

/// Reads vector index files into [`IndexData`].
pub trait IndexSource: Send + Sync {
    fn read(&self, path: &str, filter: Option<&SpatialFilter>) -> Result<IndexData>;
}

#[derive(Debug, Clone)]
struct TreeEntry {
    envelope: AABB<[f64; 2]>,
    slot: usize,
}

impl RTreeObject for TreeEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// An R-tree over the features of one loaded index file.
#[derive(Debug)]
pub struct SpatialIndex {
    path: String,
    features: Vec<IndexFeature>,
    tree: RTree<TreeEntry>,
    bbox: Option<Rect<f64>>,
    dims: RasterDims,
    sorted: bool,
}

impl SpatialIndex {
    /// An empty index. With `sort_by_index`, queries return features
    /// in file order rather than tree order.
    pub fn new(sort_by_index: bool) -> Self {
        SpatialIndex {
            path: String::new(),
            features: Vec::new(),
            tree: RTree::new(),
            bbox: None,
            dims: (0, 0),
            sorted: sort_by_index,
        }
    }

    /// True when the index already holds features loaded from `path`.
    pub fn is_loaded_from(&self, path: &str) -> bool {
        self.path == path && !self.features.is_empty()
    }

    /// Load the index at `path` unless it is already loaded. `date_of`
    /// extracts a feature's acquisition date for the `time` window;
    /// dateless features always pass. On failure the index is left
    /// cleared.
    pub fn load(
        &mut self,
        source: &dyn IndexSource,
        path: &str,
        filter: Option<&SpatialFilter>,
        time: &TimeRange,
        date_of: &dyn Fn(&IndexFeature) -> Option<DateTime<Utc>>,
    ) -> Result<()> {
        if self.is_loaded_from(path) {
            return Ok(());
        }
        self.clear();

        let data = source
            .read(path, filter)
            .with_context(|| format!("opening vector index {:?}", path))?;

        let mut features = data.features;
        if time.is_bounded() {
            features.retain(|f| match date_of(f) {
                Some(date) => time.contains(&date),
                None => true,
            });
        }

        let entries = features
            .iter()
            .enumerate()
            .map(|(slot, f)| TreeEntry {
                envelope: AABB::from_corners(
                    [f.envelope.min().x, f.envelope.min().y],
                    [f.envelope.max().x, f.envelope.max().y],
                ),
                slot,
            })
            .collect();
        self.tree = RTree::bulk_load(entries);
        self.features = features;
        self.bbox = data.bbox;
        self.dims = data.dims;
        self.path = path.to_string();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.path.clear();
        self.features.clear();
        self.tree = RTree::new();
        self.bbox = None;
        self.dims = (0, 0);
    }

    /// Features whose envelope intersects `envelope`. Candidates
    /// only: callers wanting exact containment re-test against the
    /// feature geometry.
    pub fn query(&self, envelope: &Rect<f64>) -> Vec<&IndexFeature> {
        let aabb = AABB::from_corners(
            [envelope.min().x, envelope.min().y],
            [envelope.max().x, envelope.max().y],
        );
        let mut slots: Vec<_> = self
            .tree
            .locate_in_envelope_intersecting(&aabb)
            .map(|e| e.slot)
            .collect();
        if self.sorted {
            slots.sort_unstable();
        }
        slots.into_iter().map(|s| &self.features[s]).collect()
    }

    pub fn query_point(&self, x: f64, y: f64) -> Vec<&IndexFeature> {
        self.query(&Rect::new((x, y), (x, y)))
    }

    #[inline]
    pub fn bbox(&self) -> Option<&Rect<f64>> {
        self.bbox.as_ref()
    }

    #[inline]
    pub fn dims(&self) -> RasterDims {
        self.dims
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
