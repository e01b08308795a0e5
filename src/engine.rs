//! Sampling orchestration.
//!
//! A [`SamplingEngine`] owns the per-dataset state (spatial index,
//! raster cache, file dictionary, reader pool) behind one lock and
//! drives the two pipelines over it: the serial path samples or
//! subsets one query at a time through the cache and reader pool,
//! the batch path resolves a whole point list to unique rasters and
//! reads each exactly once. Datasets plug in through the
//! [`RasterCatalog`], [`RasterOpener`] and [`IndexSource`] seams.

use anyhow::{ensure, Result};
use geo::Rect;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::batch::{
    available_threads, collect_samples, find_all_groups, find_unique_rasters,
    sample_unique_rasters, split_ranges,
};
use crate::cache::RasterCache;
use crate::catalog::{GroupClaims, GroupFinder, QueryGeometry, RasterCatalog};
use crate::config::SamplingConfig;
use crate::dictionary::FileDictionary;
use crate::filter;
use crate::groups::{GroupList, RasterInfo};
use crate::index::{IndexSource, SpatialFilter, SpatialIndex};
use crate::raster::RasterOpener;
use crate::readers::ReaderPool;
use crate::sample::{ErrorFlags, PointRecord, SampleList, SubsetList};
use crate::time::GpsTime;

/// Threads a default [`RasterSampler::sample_points`] fans out over.
pub const MAX_FANOUT_THREADS: usize = 16;

/// Fewest points worth a fan-out thread of their own.
pub const MIN_FANOUT_POINTS: usize = 5;

/// Result of one point query: the samples of every surviving group,
/// plus the error conditions met along the way.
#[derive(Debug, Clone, Default)]
pub struct SampleOutcome {
    pub samples: SampleList,
    pub errors: ErrorFlags,
}

/// Result of one extent query.
#[derive(Debug, Default)]
pub struct SubsetOutcome {
    pub subsets: SubsetList,
    pub errors: ErrorFlags,
}

/// Result of a batch query: one sample list per input point, in
/// input order. A point without coverage gets an empty list.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub lists: Vec<SampleList>,
    pub errors: ErrorFlags,
}

/// The sampling surface callers program against.
///
/// `sample_points` ships with a fan-out over `sample_point`;
/// implementations with a cheaper whole-batch strategy (like
/// [`SamplingEngine`]) override it.
pub trait RasterSampler: Send + Sync {
    /// Sample every raster group covering one point.
    fn sample_point(&self, record: PointRecord) -> SampleOutcome;

    /// Cut windows from every raster group covering one extent.
    /// Samplers without subset support return nothing.
    fn subset_extent(&self, _extent: &Rect<f64>, _gps: GpsTime) -> SubsetOutcome {
        SubsetOutcome::default()
    }

    /// False once sampling has been stopped.
    fn is_sampling(&self) -> bool {
        true
    }

    /// Ask running sampling loops to wind down. One-way: a stopped
    /// sampler stays stopped.
    fn stop_sampling(&self) {}

    /// Sample a whole batch, one list per point in input order.
    fn sample_points(&self, points: &[PointRecord]) -> BatchOutcome {
        fan_out(self, points)
    }
}

/// Default batch strategy: split the points over worker threads and
/// run the serial path per point.
fn fan_out<S: RasterSampler + ?Sized>(sampler: &S, points: &[PointRecord]) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    if points.is_empty() {
        return outcome;
    }

    let threads = available_threads().min(MAX_FANOUT_THREADS);
    let ranges = split_ranges(points.len(), MIN_FANOUT_POINTS, threads);
    if ranges.len() == 1 {
        let (lists, errors) = sample_range(sampler, points);
        outcome.lists = lists;
        outcome.errors = errors;
        return outcome;
    }

    let lens: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
    let parts: Vec<Option<(Vec<SampleList>, ErrorFlags)>> = std::thread::scope(|scope| {
        let handles: Vec<_> = ranges
            .into_iter()
            .map(|range| scope.spawn(move || sample_range(sampler, &points[range])))
            .collect();
        handles.into_iter().map(|h| h.join().ok()).collect()
    });

    for (len, part) in lens.into_iter().zip(parts) {
        match part {
            Some((lists, errors)) => {
                outcome.lists.extend(lists);
                outcome.errors |= errors;
            }
            // a lost worker leaves its points as empty lists so the
            // output stays aligned with the input
            None => outcome
                .lists
                .extend(std::iter::repeat_with(SampleList::new).take(len)),
        }
    }
    outcome
}

fn sample_range<S: RasterSampler + ?Sized>(
    sampler: &S,
    points: &[PointRecord],
) -> (Vec<SampleList>, ErrorFlags) {
    let mut lists = Vec::with_capacity(points.len());
    let mut errors = ErrorFlags::NONE;
    for record in points {
        if !sampler.is_sampling() {
            debug!("sampling stopped");
            lists.clear();
            break;
        }
        let outcome = sampler.sample_point(*record);
        errors |= outcome.errors;
        let mut samples = outcome.samples;
        if outcome.errors.contains(ErrorFlags::THREADS_LIMIT) {
            warn!("too many rasters to sample, point dropped");
            samples.clear();
        }
        lists.push(samples);
    }
    // a stopped range reports all its points as empty
    lists.resize(points.len(), SampleList::new());
    (lists, errors)
}

/// Wall time of each batch phase, logged after every batch call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfStats {
    pub spatial_filter: Duration,
    pub find_groups: Duration,
    pub find_unique: Duration,
    pub sample: Duration,
    pub collect: Duration,
}

impl PerfStats {
    pub fn clear(&mut self) {
        *self = PerfStats::default();
    }

    fn log(&self, points: usize) {
        info!(
            "batch of {} points: index {:.3}s, groups {:.3}s, unique rasters {:.3}s, sampling {:.3}s, collection {:.3}s",
            points,
            self.spatial_filter.as_secs_f64(),
            self.find_groups.as_secs_f64(),
            self.find_unique.as_secs_f64(),
            self.sample.as_secs_f64(),
            self.collect.as_secs_f64(),
        );
    }
}

struct EngineState {
    index: SpatialIndex,
    cache: RasterCache,
    dict: FileDictionary,
    readers: ReaderPool,
    perf: PerfStats,
}

/// Claims over the serial cache: taking a raster's samples empties
/// its cache slots, peeking at flags leaves them in place.
struct SerialClaims<'a> {
    cache: &'a mut RasterCache,
    dict: &'a FileDictionary,
}

impl GroupClaims for SerialClaims<'_> {
    fn claim(&mut self, info: &RasterInfo) -> SampleList {
        let path = match self.dict.path(info.file_id) {
            Some(path) => path,
            None => return SampleList::new(),
        };
        match self.cache.get_mut(path) {
            Some(item) => std::mem::take(&mut item.band_samples)
                .into_iter()
                .flatten()
                .collect(),
            None => SampleList::new(),
        }
    }

    fn flags_value(&self, info: &RasterInfo) -> Option<u32> {
        let path = self.dict.path(info.file_id)?;
        let item = self.cache.get(path)?;
        let first = item.band_samples.first()?.as_ref()?;
        Some(first.value as u32)
    }
}

/// A sampler over one spatially indexed raster dataset.
pub struct SamplingEngine {
    config: Arc<SamplingConfig>,
    catalog: Arc<dyn RasterCatalog>,
    opener: Arc<dyn RasterOpener>,
    index_source: Arc<dyn IndexSource>,
    state: Mutex<EngineState>,
    active: AtomicBool,
}

impl SamplingEngine {
    /// Build an engine over a dataset. Fails on an invalid
    /// configuration, or when the catalog's group model needs a
    /// collection override it does not provide.
    pub fn new(
        config: SamplingConfig,
        catalog: Arc<dyn RasterCatalog>,
        opener: Arc<dyn RasterOpener>,
        index_source: Arc<dyn IndexSource>,
    ) -> Result<Self> {
        config.validate()?;
        let caps = catalog.capabilities();
        ensure!(
            caps.custom_collection || !caps.multi_value_groups,
            "catalog groups carry multiple value rasters but rely on the default collection"
        );

        let config = Arc::new(config);
        let state = EngineState {
            index: SpatialIndex::new(config.sort_by_index),
            cache: RasterCache::new(),
            dict: FileDictionary::new(config.key_space),
            readers: ReaderPool::new(opener.clone(), config.clone()),
            perf: PerfStats::default(),
        };
        Ok(SamplingEngine {
            config,
            catalog,
            opener,
            index_source,
            state: Mutex::new(state),
            active: AtomicBool::new(true),
        })
    }

    #[inline]
    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Files that contributed at least one returned sample, for
    /// provenance reporting.
    pub fn contributed_files(&self) -> Vec<(u64, String)> {
        self.state()
            .dict
            .contributed()
            .map(|(id, path)| (id, path.to_string()))
            .collect()
    }

    /// Phase timings of the most recent batch call.
    pub fn perf_stats(&self) -> PerfStats {
        self.state().perf
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn with_cache_bounds(self, max_size: usize, max_readers: usize) -> Self {
        self.state().cache = RasterCache::with_bounds(max_size, max_readers);
        self
    }

    /// Load the query's index and reduce its features to filtered
    /// raster groups. `None` when nothing survives; index failures
    /// are flagged in `errors`.
    fn build_groups(
        &self,
        state: &mut EngineState,
        query: &QueryGeometry,
        gps: GpsTime,
        errors: &mut ErrorFlags,
    ) -> Option<GroupList> {
        let path = match self.catalog.index_path(query) {
            Ok(path) => path,
            Err(err) => {
                warn!("no index for query: {:#}", err);
                *errors |= ErrorFlags::INDEX_FILE;
                return None;
            }
        };
        let loaded = state.index.load(
            self.index_source.as_ref(),
            &path,
            None,
            &self.config.time_range(),
            &|f| self.catalog.feature_date(f),
        );
        if let Err(err) = loaded {
            warn!("{:#}", err);
            *errors |= ErrorFlags::INDEX_FILE;
            return None;
        }

        let envelope = query.envelope();
        let features = state.index.query(&envelope);
        let mut finder = GroupFinder::new(query, &features, &mut state.dict);
        if let Err(err) = self.catalog.find_groups(&mut finder) {
            warn!("building raster groups failed: {:#}", err);
            return None;
        }
        let mut groups = finder.into_groups();
        if !filter::apply(&self.config, gps, &mut groups, &state.dict) {
            return None;
        }
        Some(groups)
    }

    /// Run one reader round over the groups' rasters, folding every
    /// raster's errors into `errors`. False when the round could not
    /// run at all.
    fn read_groups(
        &self,
        state: &mut EngineState,
        query: &QueryGeometry,
        groups: &GroupList,
        errors: &mut ErrorFlags,
    ) -> bool {
        let (_, limit) = state.cache.update(groups, &state.dict, None);
        if !limit.is_empty() {
            *errors |= limit;
            return false;
        }

        let entries = state.cache.take_enabled();
        let (dispatched, leftover) = state.readers.dispatch(entries, query);
        if !leftover.is_empty() {
            warn!("no reader for {} rasters this round", leftover.len());
            *errors |= ErrorFlags::RESOURCE_LIMIT;
            for (key, item) in leftover {
                state.cache.reinsert(key, item);
            }
        }
        for (key, item) in state.readers.drain(dispatched) {
            *errors |= item.raster.errors();
            state.cache.reinsert(key, item);
        }
        true
    }

    fn point_round(&self, record: PointRecord) -> SampleOutcome {
        let mut outcome = SampleOutcome::default();
        let mut guard = self.state();
        let state = &mut *guard;

        let query = QueryGeometry::Point(record.point);
        let groups = match self.build_groups(state, &query, record.gps, &mut outcome.errors) {
            Some(groups) => groups,
            None => return outcome,
        };
        if !self.read_groups(state, &query, &groups, &mut outcome.errors) {
            return outcome;
        }

        {
            let mut claims = SerialClaims {
                cache: &mut state.cache,
                dict: &state.dict,
            };
            for group in groups.iter() {
                let flags = if self.config.with_flags {
                    group
                        .flags_raster()
                        .and_then(|ri| claims.flags_value(ri))
                        .unwrap_or(0)
                } else {
                    0
                };
                outcome
                    .samples
                    .extend(self.catalog.collect_group(group, flags, &mut claims));
            }
        }
        if self.config.sort_by_index {
            outcome.samples.sort_by_key(|s| s.file_id);
        }
        for sample in &outcome.samples {
            state.dict.mark_contributed(sample.file_id);
        }
        state.cache.drop_unclaimed();
        outcome
    }

    fn extent_round(&self, extent: &Rect<f64>, gps: GpsTime) -> SubsetOutcome {
        let mut outcome = SubsetOutcome::default();
        let mut guard = self.state();
        let state = &mut *guard;

        let query = QueryGeometry::Extent(*extent);
        let groups = match self.build_groups(state, &query, gps, &mut outcome.errors) {
            Some(groups) => groups,
            None => return outcome,
        };
        if !self.read_groups(state, &query, &groups, &mut outcome.errors) {
            return outcome;
        }

        // unlike point collection, every role's windows are returned
        for group in groups.iter() {
            for rinfo in &group.rasters {
                let item = state
                    .dict
                    .path(rinfo.file_id)
                    .and_then(|path| state.cache.get_mut(path));
                if let Some(item) = item {
                    outcome
                        .subsets
                        .extend(std::mem::take(&mut item.band_subsets).into_iter().flatten());
                }
            }
        }
        state.cache.drop_unclaimed();
        outcome
    }

    /// The batch pipeline: index with hull pre-filter, group finding,
    /// unique-raster resolution, sampling, collection.
    fn batch_rounds(
        &self,
        state: &mut EngineState,
        points: &[PointRecord],
        errors: &mut ErrorFlags,
    ) -> Result<Vec<SampleList>> {
        let started = Instant::now();
        let path = match self.catalog.index_path_for_points(points) {
            Ok(path) => path,
            Err(err) => {
                *errors |= ErrorFlags::INDEX_FILE;
                return Err(err);
            }
        };
        let filter = SpatialFilter::over_points(points);
        let loaded = state.index.load(
            self.index_source.as_ref(),
            &path,
            filter.as_ref(),
            &self.config.time_range(),
            &|f| self.catalog.feature_date(f),
        );
        if let Err(err) = loaded {
            *errors |= ErrorFlags::INDEX_FILE;
            return Err(err);
        }
        state.perf.spatial_filter = started.elapsed();

        let started = Instant::now();
        let (mut points_groups, raster_points) = find_all_groups(
            points,
            &state.index,
            self.catalog.as_ref(),
            &self.config,
            &mut state.dict,
            &self.active,
        )?;
        state.perf.find_groups = started.elapsed();

        let started = Instant::now();
        let mut uniques = find_unique_rasters(&mut points_groups, &raster_points, &state.dict);
        state.perf.find_unique = started.elapsed();

        let started = Instant::now();
        sample_unique_rasters(
            &mut uniques,
            self.opener.as_ref(),
            &self.config,
            state.index.bbox(),
            &self.active,
        );
        state.perf.sample = started.elapsed();

        let started = Instant::now();
        let (mut lists, flags) = collect_samples(
            &points_groups,
            &uniques,
            self.catalog.as_ref(),
            &self.config,
            &self.active,
        );
        *errors |= flags;
        if self.config.sort_by_index {
            for list in &mut lists {
                list.sort_by_key(|s| s.file_id);
            }
        }
        for list in &lists {
            for sample in list {
                state.dict.mark_contributed(sample.file_id);
            }
        }
        state.perf.collect = started.elapsed();
        Ok(lists)
    }
}

impl RasterSampler for SamplingEngine {
    fn sample_point(&self, record: PointRecord) -> SampleOutcome {
        self.point_round(record)
    }

    fn subset_extent(&self, extent: &Rect<f64>, gps: GpsTime) -> SubsetOutcome {
        self.extent_round(extent, gps)
    }

    fn is_sampling(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn stop_sampling(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// The whole-batch pipeline; serial state is cleared first, so
    /// batch and serial calls can be interleaved but not shared.
    fn sample_points(&self, points: &[PointRecord]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if points.is_empty() {
            return outcome;
        }

        let mut guard = self.state();
        let state = &mut *guard;
        state.cache.clear();
        state.dict.clear();
        state.perf.clear();

        match self.batch_rounds(state, points, &mut outcome.errors) {
            Ok(lists) => outcome.lists = lists,
            Err(err) => {
                error!("batch sampling failed: {:#}", err);
                outcome.lists = vec![SampleList::new(); points.len()];
            }
        }
        state.perf.log(points.len());
        outcome
    }
}
