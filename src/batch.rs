//! Many-point sampling.
//!
//! A batch query inverts the serial loop: instead of walking points
//! and opening whatever rasters each one needs, the batch path first
//! finds the raster groups of every point, reduces them to the
//! distinct rasters involved, reads each raster exactly once for all
//! of its points, and finally reassembles per-point sample lists in
//! input order. The stages live in the submodules; this module holds
//! the data they hand to each other.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

use crate::dictionary::FileDictionary;
use crate::geometry::Point3;
use crate::groups::{GroupList, RasterInfo};
use crate::sample::{ErrorFlags, PointRecord, RasterSample};

mod collector;
mod finder;
mod pool;

pub use collector::collect_samples;
pub use finder::find_all_groups;
pub use pool::sample_unique_rasters;

/// Raster path to the indices of the points needing it.
pub type RasterPointsMap = HashMap<String, BTreeSet<usize>>;

/// One input point with the groups that cover it. `point_index` is
/// the point's position in the batch and keys everything downstream.
pub struct PointGroups {
    pub record: PointRecord,
    pub point_index: usize,
    pub groups: GroupList,
}

/// One point's results from one raster: a slot per configured band.
pub struct PointSample {
    pub point: Point3,
    pub point_index: usize,
    pub slots: Vec<Option<RasterSample>>,
    pub errors: ErrorFlags,
}

/// A distinct raster of the batch and every point sampled from it.
/// `samples` stays sorted by point index.
pub struct UniqueRaster {
    pub info: RasterInfo,
    pub path: String,
    pub samples: Vec<PointSample>,
}

impl UniqueRaster {
    pub fn sample_for(&self, point_index: usize) -> Option<&PointSample> {
        self.samples
            .binary_search_by_key(&point_index, |ps| ps.point_index)
            .ok()
            .map(|i| &self.samples[i])
    }
}

/// Threads usable for fanning work out.
pub fn available_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Split `num` work items into contiguous ranges of at least
/// `min_per_thread` each, capped at `max_threads` ranges. Work just
/// over the minimum still fans out to two ranges.
pub fn split_ranges(num: usize, min_per_thread: usize, max_threads: usize) -> Vec<Range<usize>> {
    if num <= min_per_thread {
        return vec![0..num];
    }

    let mut threads = max_threads.min(num / min_per_thread).max(1);
    if threads == 1 && max_threads > 1 {
        threads = 2;
    }

    let per_thread = num / threads;
    let mut remaining = num % threads;
    let mut ranges = Vec::with_capacity(threads);
    let mut start = 0;
    for _ in 0..threads {
        let end = start + per_thread + usize::from(remaining > 0);
        ranges.push(start..end);
        start = end;
        remaining = remaining.saturating_sub(1);
    }
    ranges
}

/// Reduce the groups of all points to the distinct rasters involved.
/// Every raster reference is wired to its slot in the returned table,
/// and each table entry gets one [`PointSample`] per point needing
/// that raster, in point order.
pub fn find_unique_rasters(
    points_groups: &mut [PointGroups],
    raster_points: &RasterPointsMap,
    dict: &FileDictionary,
) -> Vec<UniqueRaster> {
    let mut uniques: Vec<UniqueRaster> = Vec::new();
    let mut slot_of: HashMap<String, usize> = HashMap::new();

    for pg in points_groups.iter_mut() {
        for group in pg.groups.iter_mut() {
            for rinfo in &mut group.rasters {
                let path = match dict.path(rinfo.file_id) {
                    Some(path) => path.to_string(),
                    None => continue,
                };
                let slot = match slot_of.get(&path) {
                    Some(slot) => *slot,
                    None => {
                        uniques.push(UniqueRaster {
                            info: rinfo.clone(),
                            path: path.clone(),
                            samples: Vec::new(),
                        });
                        let slot = uniques.len() - 1;
                        slot_of.insert(path, slot);
                        slot
                    }
                };
                rinfo.unique = Some(slot);
            }
        }
    }

    for ur in uniques.iter_mut() {
        if let Some(indices) = raster_points.get(&ur.path) {
            ur.samples.reserve_exact(indices.len());
            for &point_index in indices {
                let pg = &points_groups[point_index];
                ur.samples.push(PointSample {
                    point: pg.record.point,
                    point_index,
                    slots: Vec::new(),
                    errors: ErrorFlags::NONE,
                });
            }
        }
    }

    uniques
}
