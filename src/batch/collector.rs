//! Stage three of a batch: reassemble per-point sample lists.
//!
//! Every point walks its groups in order and claims the matching
//! results from the unique-raster table, so the output is one sample
//! list per input point regardless of how the reads were scheduled.
//! Claims clone the stored slots; a raster shared by several groups
//! hands each group an independent copy.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};

use super::{available_threads, split_ranges, PointGroups, UniqueRaster};
use crate::catalog::{GroupClaims, RasterCatalog};
use crate::config::SamplingConfig;
use crate::groups::RasterInfo;
use crate::sample::{ErrorFlags, SampleList};

const MIN_GROUPS_PER_THREAD: usize = 100;

/// Claims backed by the batch's unique-raster table.
struct BatchClaims<'a> {
    uniques: &'a [UniqueRaster],
    point_index: usize,
    errors: ErrorFlags,
}

impl GroupClaims for BatchClaims<'_> {
    fn claim(&mut self, info: &RasterInfo) -> SampleList {
        let mut samples = SampleList::new();
        if let Some(ur) = info.unique.and_then(|slot| self.uniques.get(slot)) {
            if let Some(ps) = ur.sample_for(self.point_index) {
                samples.extend(ps.slots.iter().flatten().cloned());
                self.errors |= ps.errors;
            }
        }
        samples
    }

    fn flags_value(&self, info: &RasterInfo) -> Option<u32> {
        let ur = info.unique.and_then(|slot| self.uniques.get(slot))?;
        let ps = ur.sample_for(self.point_index)?;
        let first = ps.slots.first()?.as_ref()?;
        Some(first.value as u32)
    }
}

/// Build one [`SampleList`] per point, in point order. Group
/// aggregation goes through the catalog, so datasets with richer
/// group models stay in charge of their own assembly.
pub fn collect_samples(
    points_groups: &[PointGroups],
    uniques: &[UniqueRaster],
    catalog: &dyn RasterCatalog,
    config: &SamplingConfig,
    active: &AtomicBool,
) -> (Vec<SampleList>, ErrorFlags) {
    let ranges = split_ranges(
        points_groups.len(),
        MIN_GROUPS_PER_THREAD,
        available_threads(),
    );
    info!(
        "collecting samples for {} points with {} threads",
        points_groups.len(),
        ranges.len()
    );

    let parts: Vec<(Range<usize>, Vec<SampleList>, ErrorFlags)> = std::thread::scope(|scope| {
        let handles: Vec<_> = ranges
            .into_iter()
            .map(|range| {
                scope.spawn(move || {
                    collect_range(range, points_groups, uniques, catalog, config, active)
                })
            })
            .collect();
        handles.into_iter().filter_map(|h| h.join().ok()).collect()
    });

    // a stopped collector leaves its remaining points as empty lists,
    // keeping the output aligned with the input
    let mut lists = vec![SampleList::new(); points_groups.len()];
    let mut errors = ErrorFlags::NONE;
    for (range, part_lists, part_errors) in parts {
        for (i, list) in range.zip(part_lists) {
            lists[i] = list;
        }
        errors |= part_errors;
    }
    (lists, errors)
}

fn collect_range(
    range: Range<usize>,
    points_groups: &[PointGroups],
    uniques: &[UniqueRaster],
    catalog: &dyn RasterCatalog,
    config: &SamplingConfig,
    active: &AtomicBool,
) -> (Range<usize>, Vec<SampleList>, ErrorFlags) {
    debug!("collecting samples for points {}..{}", range.start, range.end);
    let mut lists = Vec::with_capacity(range.len());
    let mut errors = ErrorFlags::NONE;

    for point_index in range.clone() {
        if !active.load(Ordering::Relaxed) {
            warn!("sampling stopped, exiting sample collector");
            break;
        }

        let pg = &points_groups[point_index];
        debug_assert_eq!(pg.point_index, point_index);

        let mut list = SampleList::new();
        for group in pg.groups.iter() {
            let mut claims = BatchClaims {
                uniques,
                point_index,
                errors: ErrorFlags::NONE,
            };
            let flags = if config.with_flags {
                group
                    .flags_raster()
                    .and_then(|info| claims.flags_value(info))
                    .unwrap_or(0)
            } else {
                0
            };
            list.extend(catalog.collect_group(group, flags, &mut claims));
            errors |= claims.errors;
        }
        lists.push(list);
    }
    (range, lists, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{find_unique_rasters, RasterPointsMap};
    use crate::dictionary::FileDictionary;
    use crate::geometry::Point3;
    use crate::groups::{GroupList, RasterGroup};
    use crate::mock::MockCatalog;
    use crate::sample::{PointRecord, RasterSample};
    use crate::time::{parse_iso, GpsTime};

    /// Two points over two scenes; the second scene covers both
    /// points and carries a flags raster.
    fn collected_batch(config: &SamplingConfig) -> (Vec<SampleList>, ErrorFlags) {
        let mut dict = FileDictionary::new(0);
        let date_a = parse_iso("2020-06-01T00:00:00Z").unwrap();
        let date_b = parse_iso("2020-06-03T00:00:00Z").unwrap();

        let mut map = RasterPointsMap::new();
        let mut pgs = Vec::new();
        for point_index in 0..2usize {
            let mut groups = GroupList::new();

            let mut a = RasterGroup::with_date("scene-a", date_a);
            a.rasters.push(crate::groups::RasterInfo::value(dict.insert("/a.tif")));
            map.entry("/a.tif".into()).or_default().insert(point_index);

            let mut b = RasterGroup::with_date("scene-b", date_b);
            b.rasters.push(crate::groups::RasterInfo::value(dict.insert("/b.tif")));
            b.rasters.push(crate::groups::RasterInfo::flags(dict.insert("/b-flags.tif")));
            map.entry("/b.tif".into()).or_default().insert(point_index);
            map.entry("/b-flags.tif".into()).or_default().insert(point_index);

            groups.push(a);
            groups.push(b);
            pgs.push(PointGroups {
                record: PointRecord::new(Point3::new(point_index as f64, 0.0, 0.0), GpsTime::ZERO),
                point_index,
                groups,
            });
        }

        let mut uniques = find_unique_rasters(&mut pgs, &map, &dict);
        for ur in uniques.iter_mut() {
            let base = match ur.path.as_str() {
                "/a.tif" => 10.0,
                "/b.tif" => 20.0,
                _ => 5.0, // flags word
            };
            for ps in ur.samples.iter_mut() {
                let mut sample = RasterSample::new(ur.info.file_id);
                sample.value = base + ps.point_index as f64;
                ps.slots.push(Some(sample));
            }
        }

        let catalog = MockCatalog::new();
        let active = AtomicBool::new(true);
        collect_samples(&pgs, &uniques, &catalog, config, &active)
    }

    #[test]
    fn lists_follow_point_and_group_order() {
        let (lists, errors) = collected_batch(&SamplingConfig::default());
        assert!(errors.is_empty());
        assert_eq!(lists.len(), 2);

        for (i, list) in lists.iter().enumerate() {
            // one sample per group, in group order
            assert_eq!(list.len(), 2);
            assert_eq!(list[0].value, 10.0 + i as f64);
            assert_eq!(list[1].value, 20.0 + i as f64);
            // stamped with each group's acquisition time
            assert!(list[0].time < list[1].time);
        }
    }

    #[test]
    fn flags_raster_is_looked_up_per_group() {
        let config = SamplingConfig {
            with_flags: true,
            ..SamplingConfig::default()
        };
        let (lists, _) = collected_batch(&config);

        // scene-a has no flags raster, scene-b's flags word is 5+index
        assert_eq!(lists[0][0].flags, 0);
        assert_eq!(lists[0][1].flags, 5);
        assert_eq!(lists[1][1].flags, 6);

        let unflagged = collected_batch(&SamplingConfig::default()).0;
        assert_eq!(unflagged[0][1].flags, 0);
    }

    #[test]
    fn shared_raster_claims_stay_independent() {
        let mut dict = FileDictionary::new(0);
        let shared = dict.insert("/shared.tif");

        let mut groups = GroupList::new();
        let mut g1 = RasterGroup::with_date("g1", parse_iso("2020-01-01T00:00:00Z").unwrap());
        g1.rasters.push(crate::groups::RasterInfo::value(shared));
        let mut g2 = RasterGroup::with_date("g2", parse_iso("2020-02-01T00:00:00Z").unwrap());
        g2.rasters.push(crate::groups::RasterInfo::value(shared));
        groups.push(g1);
        groups.push(g2);

        let mut pgs = vec![PointGroups {
            record: PointRecord::new(Point3::new(0.0, 0.0, 0.0), GpsTime::ZERO),
            point_index: 0,
            groups,
        }];
        let mut map = RasterPointsMap::new();
        map.entry("/shared.tif".into()).or_default().insert(0);

        let mut uniques = find_unique_rasters(&mut pgs, &map, &dict);
        let mut sample = RasterSample::new(shared);
        sample.value = 42.0;
        uniques[0].samples[0].slots.push(Some(sample));

        let catalog = MockCatalog::new();
        let active = AtomicBool::new(true);
        let (lists, _) = collect_samples(&pgs, &uniques, &catalog, &SamplingConfig::default(), &active);

        // both groups got the value, each stamped with its own time
        assert_eq!(lists[0].len(), 2);
        assert_eq!(lists[0][0].value, 42.0);
        assert_eq!(lists[0][1].value, 42.0);
        assert!(lists[0][0].time < lists[0][1].time);
    }

    #[test]
    fn stopping_leaves_aligned_empty_lists() {
        let mut dict = FileDictionary::new(0);
        let mut pgs = Vec::new();
        for point_index in 0..3usize {
            let mut groups = GroupList::new();
            let mut g = RasterGroup::new("g");
            g.rasters.push(crate::groups::RasterInfo::value(dict.insert("/a.tif")));
            groups.push(g);
            pgs.push(PointGroups {
                record: PointRecord::new(Point3::new(0.0, 0.0, 0.0), GpsTime::ZERO),
                point_index,
                groups,
            });
        }
        let uniques = Vec::new();

        let catalog = MockCatalog::new();
        let active = AtomicBool::new(false);
        let (lists, _) = collect_samples(&pgs, &uniques, &catalog, &SamplingConfig::default(), &active);
        assert_eq!(lists.len(), 3);
        assert!(lists.iter().all(|l| l.is_empty()));
    }
}
