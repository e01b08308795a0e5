//! Catalog abstraction: how a dataset describes its index.
//!
//! A [`RasterCatalog`] knows where the vector index for a query
//! lives, how to date index features, and how to turn the features
//! covering a query into role-tagged raster groups. The engine is
//! generic over this trait; adding a dataset means implementing it
//! and handing it to the engine at construction.
//!
//! Group aggregation assumes at most one value raster per group. A
//! catalog whose groups carry several must say so in its
//! [`CatalogCapabilities`] and override
//! [`RasterCatalog::collect_group`]; the engine refuses the
//! combination of multi-value groups and default collection up front
//! rather than silently sampling the first match.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use geo::Rect;

use crate::dictionary::FileDictionary;
use crate::geometry::Point3;
use crate::groups::{GroupList, RasterGroup, RasterInfo};
use crate::index::IndexFeature;
use crate::sample::{PointRecord, SampleList};

/// Attribute carrying a feature's acquisition time.
pub const DATE_FIELD: &str = "datetime";

/// What a catalog's group model supports. Checked once at engine
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CatalogCapabilities {
    /// Groups may carry more than one value-role raster.
    pub multi_value_groups: bool,
    /// The catalog overrides [`RasterCatalog::collect_group`] with an
    /// aggregation aware of its group model.
    pub custom_collection: bool,
}

/// The geometry of one query.
#[derive(Debug, Clone)]
pub enum QueryGeometry {
    Point(Point3),
    Extent(Rect<f64>),
}

impl QueryGeometry {
    pub fn envelope(&self) -> Rect<f64> {
        match self {
            QueryGeometry::Point(p) => Rect::new((p.x, p.y), (p.x, p.y)),
            QueryGeometry::Extent(r) => *r,
        }
    }

    pub fn point(&self) -> Option<Point3> {
        match self {
            QueryGeometry::Point(p) => Some(*p),
            QueryGeometry::Extent(_) => None,
        }
    }

    /// Precise intersection against an index feature's geometry.
    pub fn intersects(&self, feature: &IndexFeature) -> bool {
        match self {
            QueryGeometry::Point(p) => {
                feature.intersects(&geo::Point::new(p.x, p.y).into())
            }
            QueryGeometry::Extent(r) => feature.intersects(&r.to_polygon().into()),
        }
    }
}

/// Working state handed to [`RasterCatalog::find_groups`]: the query,
/// its candidate features, and the dictionary interning raster paths.
pub struct GroupFinder<'a> {
    pub geometry: &'a QueryGeometry,
    pub features: &'a [&'a IndexFeature],
    pub dictionary: &'a mut FileDictionary,
    groups: GroupList,
}

impl<'a> GroupFinder<'a> {
    pub fn new(
        geometry: &'a QueryGeometry,
        features: &'a [&'a IndexFeature],
        dictionary: &'a mut FileDictionary,
    ) -> Self {
        GroupFinder {
            geometry,
            features,
            dictionary,
            groups: GroupList::new(),
        }
    }

    /// Append a finished group, returning its key.
    pub fn push(&mut self, group: RasterGroup) -> u64 {
        self.groups.push(group)
    }

    pub fn into_groups(self) -> GroupList {
        self.groups
    }
}

/// Access to the per-raster results of a sampling round while a
/// group's sample list is assembled. Claiming takes the results out
/// of the round's storage; the flags lookup peeks without claiming.
pub trait GroupClaims {
    /// Take the per-band samples of `info`'s raster for this query.
    fn claim(&mut self, info: &RasterInfo) -> SampleList;

    /// Peek at the first-band value of `info`'s raster as a flags
    /// word.
    fn flags_value(&self, info: &RasterInfo) -> Option<u32>;
}

/// Assemble one group's samples: claim every band of the group's
/// value raster, stamping each sample with the group's acquisition
/// time and the supplied flags word.
pub fn default_collect_group(
    group: &RasterGroup,
    flags: u32,
    claims: &mut dyn GroupClaims,
) -> SampleList {
    let mut samples = SampleList::new();
    if let Some(value) = group.rasters.iter().find(|r| r.role.is_value()) {
        for mut sample in claims.claim(value) {
            sample.time = group.gps.seconds();
            sample.flags = flags;
            samples.push(sample);
        }
    }
    samples
}

/// A dataset's index layout and group model.
pub trait RasterCatalog: Send + Sync {
    /// What the catalog's group model supports.
    fn capabilities(&self) -> CatalogCapabilities {
        CatalogCapabilities::default()
    }

    /// Path of the vector index covering a query.
    fn index_path(&self, query: &QueryGeometry) -> Result<String>;

    /// Path of the vector index covering a whole batch. Defaults to
    /// the index of the first point.
    fn index_path_for_points(&self, points: &[PointRecord]) -> Result<String> {
        let first = points
            .first()
            .ok_or_else(|| anyhow!("empty point batch"))?;
        self.index_path(&QueryGeometry::Point(first.point))
    }

    /// Acquisition date of an index feature. The default reads an ISO
    /// timestamp from the feature's `datetime` attribute.
    fn feature_date(&self, feature: &IndexFeature) -> Option<DateTime<Utc>> {
        feature
            .field_str(DATE_FIELD)
            .and_then(|s| crate::time::parse_iso(s).ok())
    }

    /// Convert the query's candidate features into raster groups.
    fn find_groups(&self, finder: &mut GroupFinder<'_>) -> Result<()>;

    /// Assemble one group's sample list from the round's claims.
    fn collect_group(
        &self,
        group: &RasterGroup,
        flags: u32,
        claims: &mut dyn GroupClaims,
    ) -> SampleList {
        default_collect_group(group, flags, claims)
    }
}
