//! Raster groups.
//!
//! One *group* collects the rasters of a single observation: the
//! value raster carrying the measurement, optionally a quality-mask
//! raster and auxiliary rasters, all sharing one acquisition time.
//! Groups preserve the order they were found in, and survive the
//! filtering passes keyed so that individual groups can be removed
//! without disturbing the order of the rest.

use chrono::{DateTime, Utc};

use crate::time::GpsTime;

/// The role a raster plays within its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RasterRole {
    /// The measurement raster. `elevation` marks rasters whose values
    /// receive the vertical datum shift of the point transform.
    Value { elevation: bool },
    /// The quality-mask raster.
    Flags,
    /// An auxiliary raster sampled alongside the value raster.
    Extra(String),
}

impl RasterRole {
    #[inline]
    pub fn is_value(&self) -> bool {
        matches!(self, RasterRole::Value { .. })
    }

    #[inline]
    pub fn is_flags(&self) -> bool {
        matches!(self, RasterRole::Flags)
    }
}

/// One raster within a group.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    pub role: RasterRole,
    /// 1-based band to read; `None` reads the configured band list.
    pub band: Option<usize>,
    /// Id of the raster's path in the engine's file dictionary.
    pub file_id: u64,
    /// Slot of the raster in the batch unique-raster table; assigned
    /// during unique-raster resolution.
    pub unique: Option<usize>,
}

impl RasterInfo {
    fn with_role(role: RasterRole, file_id: u64) -> Self {
        RasterInfo {
            role,
            band: None,
            file_id,
            unique: None,
        }
    }

    pub fn value(file_id: u64) -> Self {
        Self::with_role(RasterRole::Value { elevation: false }, file_id)
    }

    pub fn elevation(file_id: u64) -> Self {
        Self::with_role(RasterRole::Value { elevation: true }, file_id)
    }

    pub fn flags(file_id: u64) -> Self {
        Self::with_role(RasterRole::Flags, file_id)
    }

    pub fn extra(tag: &str, file_id: u64) -> Self {
        Self::with_role(RasterRole::Extra(tag.to_string()), file_id)
    }
}

/// The rasters of one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterGroup {
    /// Id of the index feature the group came from.
    pub id: String,
    pub rasters: Vec<RasterInfo>,
    /// Acquisition date parsed from the index feature.
    pub date: Option<DateTime<Utc>>,
    /// `date` on the GPS time scale; zero when the feature carried no
    /// datetime.
    pub gps: GpsTime,
}

impl RasterGroup {
    pub fn new(id: &str) -> Self {
        RasterGroup {
            id: id.to_string(),
            rasters: Vec::new(),
            date: None,
            gps: GpsTime::ZERO,
        }
    }

    pub fn with_date(id: &str, date: DateTime<Utc>) -> Self {
        RasterGroup {
            id: id.to_string(),
            rasters: Vec::new(),
            date: Some(date),
            gps: GpsTime::from_utc(&date),
        }
    }

    /// Number of value-role rasters in the group.
    pub fn value_count(&self) -> usize {
        self.rasters.iter().filter(|r| r.role.is_value()).count()
    }

    /// The group's flags raster, if any.
    pub fn flags_raster(&self) -> Option<&RasterInfo> {
        self.rasters.iter().find(|r| r.role.is_flags())
    }
}

/// An insertion-ordered collection of groups. Keys are stable across
/// removals, so filters can snapshot the key list and remove groups
/// while walking it.
#[derive(Debug, Clone, Default)]
pub struct GroupList {
    next_key: u64,
    entries: Vec<(u64, RasterGroup)>,
}

impl GroupList {
    pub fn new() -> Self {
        GroupList::default()
    }

    /// Append a group, returning its key.
    pub fn push(&mut self, group: RasterGroup) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        self.entries.push((key, group));
        key
    }

    pub fn remove(&mut self, key: u64) -> Option<RasterGroup> {
        let pos = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn get(&self, key: u64) -> Option<&RasterGroup> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, g)| g)
    }

    /// Snapshot of the keys in iteration order.
    pub fn keys(&self) -> Vec<u64> {
        self.entries.iter().map(|(k, _)| *k).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RasterGroup> + '_ {
        self.entries.iter().map(|(_, g)| g)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RasterGroup> + '_ {
        self.entries.iter_mut().map(|(_, g)| g)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
