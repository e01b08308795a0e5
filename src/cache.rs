//! Bounded raster cache for the single-query path.
//!
//! Consecutive queries tend to hit the same rasters, so opened
//! handles are kept between rounds keyed by path. Every round marks
//! the whole cache disabled, re-enables (or creates) the entries the
//! round's groups reference, then evicts disabled entries until the
//! cache is back under its size bound. Enabled entries are never
//! evicted, so the bound can be exceeded transiently when one round
//! references more rasters than the bound.

use geo::Rect;
use log::error;
use std::collections::HashMap;

use crate::dictionary::FileDictionary;
use crate::groups::GroupList;
use crate::raster::{LazyRaster, OpenRequest};
use crate::sample::{ErrorFlags, RasterSample, RasterSubset};

/// Cache entries kept across rounds.
pub const MAX_CACHE_SIZE: usize = 20;

/// Hard ceiling on rasters sampled concurrently in one round.
pub const MAX_READER_THREADS: usize = 200;

/// One cached raster handle plus the transient results of the
/// current round.
pub struct CacheItem {
    pub enabled: bool,
    pub raster: LazyRaster,
    /// Per-band point samples, filled by a reader, claimed during
    /// aggregation.
    pub band_samples: Vec<Option<RasterSample>>,
    /// Per-band subsets for extent queries.
    pub band_subsets: Vec<Option<RasterSubset>>,
}

/// A bounded path-keyed cache of raster handles.
pub struct RasterCache {
    items: HashMap<String, CacheItem>,
    max_size: usize,
    max_readers: usize,
}

impl Default for RasterCache {
    fn default() -> Self {
        RasterCache::new()
    }
}

impl RasterCache {
    pub fn new() -> Self {
        RasterCache::with_bounds(MAX_CACHE_SIZE, MAX_READER_THREADS)
    }

    /// A cache with explicit bounds; the defaults are
    /// [`MAX_CACHE_SIZE`] and [`MAX_READER_THREADS`].
    pub fn with_bounds(max_size: usize, max_readers: usize) -> Self {
        RasterCache {
            items: HashMap::new(),
            max_size,
            max_readers,
        }
    }

    /// Sync the cache with one round's groups: every referenced
    /// raster is re-enabled or newly created (reads bounded by
    /// `read_bbox`), transient buffers are cleared, and disabled
    /// entries are evicted down to the size bound. Returns the number
    /// of distinct rasters to sample, with
    /// [`ErrorFlags::THREADS_LIMIT`] set when it exceeds the reader
    /// ceiling.
    pub fn update(
        &mut self,
        groups: &GroupList,
        dict: &FileDictionary,
        read_bbox: Option<&Rect<f64>>,
    ) -> (usize, ErrorFlags) {
        for item in self.items.values_mut() {
            item.enabled = false;
        }

        for group in groups.iter() {
            for rinfo in &group.rasters {
                let path = match dict.path(rinfo.file_id) {
                    Some(path) => path,
                    None => continue,
                };
                let item = self
                    .items
                    .entry(path.to_string())
                    .or_insert_with(|| CacheItem {
                        enabled: false,
                        raster: LazyRaster::new(OpenRequest {
                            path: path.to_string(),
                            role: rinfo.role.clone(),
                            file_id: rinfo.file_id,
                            gps: group.gps,
                            read_bbox: read_bbox.copied(),
                        }),
                        band_samples: Vec::new(),
                        band_subsets: Vec::new(),
                    });
                item.enabled = true;
                item.band_samples.clear();
                item.band_subsets.clear();
            }
        }

        let live = self.items.values().filter(|i| i.enabled).count();

        if self.items.len() > self.max_size {
            let disabled: Vec<String> = self
                .items
                .iter()
                .filter(|(_, item)| !item.enabled)
                .map(|(key, _)| key.clone())
                .collect();
            for key in disabled {
                if self.items.len() <= self.max_size {
                    break;
                }
                self.items.remove(&key);
            }
        }

        if live > self.max_readers {
            error!(
                "too many rasters to sample: {}, max allowed: {}",
                live, self.max_readers
            );
            return (live, ErrorFlags::THREADS_LIMIT);
        }
        (live, ErrorFlags::NONE)
    }

    /// Remove the enabled entries for dispatch to reader threads.
    pub fn take_enabled(&mut self) -> Vec<(String, CacheItem)> {
        let keys: Vec<String> = self
            .items
            .iter()
            .filter(|(_, item)| item.enabled)
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.items.remove(&key).map(|item| (key, item)))
            .collect()
    }

    /// Put a dispatched entry back after its reader finished.
    pub fn reinsert(&mut self, key: String, item: CacheItem) {
        self.items.insert(key, item);
    }

    pub fn get(&self, path: &str) -> Option<&CacheItem> {
        self.items.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut CacheItem> {
        self.items.get_mut(path)
    }

    /// Drop transient results never claimed this round.
    pub fn drop_unclaimed(&mut self) {
        for item in self.items.values_mut() {
            item.band_samples.clear();
            item.band_subsets.clear();
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
