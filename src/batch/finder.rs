//! Stage one of a batch: per-point raster groups.
//!
//! Points are split into ranges and searched concurrently against the
//! shared spatial index. Each thread works with its own file
//! dictionary so no locking happens inside the loop; the per-thread
//! dictionaries are merged into the engine's afterwards with the
//! group file ids rewritten through the merge's id translation.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{ensure, Result};
use log::{debug, info, warn};

use super::{available_threads, split_ranges, PointGroups, RasterPointsMap};
use crate::catalog::{GroupFinder, QueryGeometry, RasterCatalog};
use crate::config::SamplingConfig;
use crate::dictionary::FileDictionary;
use crate::filter;
use crate::index::SpatialIndex;
use crate::sample::PointRecord;
use crate::time::GpsTime;

const MIN_POINTS_PER_THREAD: usize = 100;

struct FinderPart {
    points_groups: Vec<PointGroups>,
    raster_points: RasterPointsMap,
    dict: FileDictionary,
}

/// Find the raster groups of every point. Returns one
/// [`PointGroups`] per point, in input order, plus the map from
/// raster path to the points needing it; `dict` absorbs the paths of
/// every surviving group.
pub fn find_all_groups(
    points: &[PointRecord],
    index: &SpatialIndex,
    catalog: &dyn RasterCatalog,
    config: &SamplingConfig,
    dict: &mut FileDictionary,
    active: &AtomicBool,
) -> Result<(Vec<PointGroups>, RasterPointsMap)> {
    let ranges = split_ranges(points.len(), MIN_POINTS_PER_THREAD, available_threads());
    info!(
        "finding raster groups for {} points with {} threads",
        points.len(),
        ranges.len()
    );

    let key_space = dict.key_space();
    let parts: Vec<FinderPart> = std::thread::scope(|scope| {
        let handles: Vec<_> = ranges
            .into_iter()
            .map(|range| {
                scope.spawn(move || {
                    find_groups_range(range, points, index, catalog, config, key_space, active)
                })
            })
            .collect();
        handles.into_iter().filter_map(|h| h.join().ok()).collect()
    });

    let mut points_groups = Vec::with_capacity(points.len());
    let mut raster_points = RasterPointsMap::new();
    for part in parts {
        let remap = dict.merge(&part.dict);
        for mut pg in part.points_groups {
            for group in pg.groups.iter_mut() {
                for rinfo in &mut group.rasters {
                    if let Some(id) = remap.translate(rinfo.file_id) {
                        rinfo.file_id = id;
                    }
                }
            }
            points_groups.push(pg);
        }
        for (path, indices) in part.raster_points {
            raster_points.entry(path).or_default().extend(indices);
        }
    }

    ensure!(
        points_groups.len() == points.len(),
        "found groups for {} of {} points",
        points_groups.len(),
        points.len()
    );
    Ok((points_groups, raster_points))
}

fn find_groups_range(
    range: Range<usize>,
    points: &[PointRecord],
    index: &SpatialIndex,
    catalog: &dyn RasterCatalog,
    config: &SamplingConfig,
    key_space: u64,
    active: &AtomicBool,
) -> FinderPart {
    debug!("finding groups for points {}..{}", range.start, range.end);
    let mut part = FinderPart {
        points_groups: Vec::with_capacity(range.len()),
        raster_points: RasterPointsMap::new(),
        dict: FileDictionary::new(key_space),
    };

    for point_index in range {
        if !active.load(Ordering::Relaxed) {
            warn!("sampling stopped, exiting groups finder");
            break;
        }

        let record = points[point_index];
        let query = QueryGeometry::Point(record.point);
        let features = index.query_point(record.point.x, record.point.y);

        let mut finder = GroupFinder::new(&query, &features, &mut part.dict);
        if let Err(err) = catalog.find_groups(&mut finder) {
            warn!("finding rasters for point {}: {:#}", point_index, err);
        }
        let mut groups = finder.into_groups();

        let gps = if config.use_poi_time {
            record.gps
        } else {
            GpsTime::ZERO
        };
        filter::apply(config, gps, &mut groups, &part.dict);

        for group in groups.iter() {
            for rinfo in &group.rasters {
                if let Some(path) = part.dict.path(rinfo.file_id) {
                    part.raster_points
                        .entry(path.to_string())
                        .or_default()
                        .insert(point_index);
                }
            }
        }

        // every point gets an entry, groups or not
        part.points_groups.push(PointGroups {
            record,
            point_index,
            groups,
        });
    }
    part
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point3;
    use crate::mock::{scene_feature, MockCatalog, MockIndexSource};
    use crate::time::TimeRange;
    use geo::Rect;

    fn loaded_index(source: &MockIndexSource) -> SpatialIndex {
        let mut index = SpatialIndex::new(false);
        let catalog = MockCatalog::new();
        index
            .load(source, "index.geojson", None, &TimeRange::default(), &|f| {
                catalog.feature_date(f)
            })
            .unwrap();
        index
    }

    fn west_east_source() -> MockIndexSource {
        MockIndexSource::new(vec![
            scene_feature(
                1,
                Rect::new((0.0, 0.0), (10.0, 10.0)),
                Some("2020-06-01T00:00:00Z"),
                "/west.tif",
                None,
            ),
            scene_feature(
                2,
                Rect::new((10.0, 0.0), (20.0, 10.0)),
                Some("2020-06-02T00:00:00Z"),
                "/east.tif",
                None,
            ),
        ])
    }

    #[test]
    fn groups_line_up_with_points() {
        let source = west_east_source();
        let index = loaded_index(&source);
        let catalog = MockCatalog::new();
        let config = SamplingConfig::default();
        let mut dict = FileDictionary::new(0);
        let active = AtomicBool::new(true);

        let points = vec![
            PointRecord::new(Point3::new(5.0, 5.0, 0.0), GpsTime::ZERO),
            PointRecord::new(Point3::new(15.0, 5.0, 0.0), GpsTime::ZERO),
            PointRecord::new(Point3::new(50.0, 50.0, 0.0), GpsTime::ZERO),
        ];
        let (pgs, raster_points) =
            find_all_groups(&points, &index, &catalog, &config, &mut dict, &active).unwrap();

        assert_eq!(pgs.len(), 3);
        for (i, pg) in pgs.iter().enumerate() {
            assert_eq!(pg.point_index, i);
        }
        assert_eq!(pgs[0].groups.len(), 1);
        assert_eq!(pgs[1].groups.len(), 1);
        // a point outside every footprint still gets its entry
        assert!(pgs[2].groups.is_empty());

        let west = raster_points.get("/west.tif").unwrap();
        assert!(west.contains(&0) && !west.contains(&1));
        assert_eq!(raster_points.get("/east.tif").unwrap().len(), 1);
        assert!(raster_points.get("/missing.tif").is_none());
    }

    #[test]
    fn merged_ids_resolve_through_engine_dictionary() {
        let source = west_east_source();
        let index = loaded_index(&source);
        let catalog = MockCatalog::new();
        let config = SamplingConfig::default();
        let active = AtomicBool::new(true);

        // pre-populated dictionary forces non-identity id translation
        let mut dict = FileDictionary::new(7);
        dict.insert("/warmup.tif");

        let points = vec![
            PointRecord::new(Point3::new(5.0, 5.0, 0.0), GpsTime::ZERO),
            PointRecord::new(Point3::new(15.0, 5.0, 0.0), GpsTime::ZERO),
        ];
        let (pgs, _) =
            find_all_groups(&points, &index, &catalog, &config, &mut dict, &active).unwrap();

        for (pg, path) in pgs.iter().zip(["/west.tif", "/east.tif"]) {
            let group = pg.groups.iter().next().unwrap();
            assert_eq!(dict.path(group.rasters[0].file_id), Some(path));
        }
    }

    #[test]
    fn point_time_is_forwarded_when_configured() {
        let catalog = MockCatalog::new();
        let active = AtomicBool::new(true);
        let mut dict = FileDictionary::new(0);

        let config = SamplingConfig {
            use_poi_time: true,
            closest_time: Some(crate::time::IsoTime(
                crate::time::parse_iso("2020-06-02T00:00:00Z").unwrap(),
            )),
            ..SamplingConfig::default()
        };

        // both features cover this point
        let source = MockIndexSource::new(vec![
            scene_feature(
                1,
                Rect::new((0.0, 0.0), (10.0, 10.0)),
                Some("2020-06-01T00:00:00Z"),
                "/old.tif",
                None,
            ),
            scene_feature(
                2,
                Rect::new((0.0, 0.0), (10.0, 10.0)),
                Some("2020-06-02T00:00:00Z"),
                "/new.tif",
                None,
            ),
        ]);
        let index = loaded_index(&source);

        // the per-point time picks the older scene despite closest_time
        let gps = GpsTime::from_utc(&crate::time::parse_iso("2020-06-01T01:00:00Z").unwrap());
        let points = vec![PointRecord::new(Point3::new(5.0, 5.0, 0.0), gps)];
        let (pgs, _) =
            find_all_groups(&points, &index, &catalog, &config, &mut dict, &active).unwrap();

        let group = pgs[0].groups.iter().next().unwrap();
        assert_eq!(dict.path(group.rasters[0].file_id), Some("/old.tif"));
    }

    #[test]
    fn stopped_sampling_reports_the_shortfall() {
        let source = west_east_source();
        let index = loaded_index(&source);
        let catalog = MockCatalog::new();
        let config = SamplingConfig::default();
        let mut dict = FileDictionary::new(0);
        let active = AtomicBool::new(false);

        let points = vec![PointRecord::new(Point3::new(5.0, 5.0, 0.0), GpsTime::ZERO)];
        let result = find_all_groups(&points, &index, &catalog, &config, &mut dict, &active);
        assert!(result.is_err());
    }
}
