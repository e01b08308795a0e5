//! Reader threads for the single-query path.
//!
//! Each enabled cache entry is read on its own worker so GDAL waits
//! overlap. Workers persist across rounds: a worker owns a 1-slot
//! task channel, and all workers share one completion channel back to
//! the pool. Dropping the pool closes the task channels and joins the
//! workers.

use log::error;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cache::CacheItem;
use crate::catalog::QueryGeometry;
use crate::config::SamplingConfig;
use crate::raster::{sample_bands, subset_bands, RasterOpener};

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// One dispatched read: the cache entry travels to the worker and
/// comes back with its result slots filled.
struct ReadTask {
    key: String,
    item: CacheItem,
    query: QueryGeometry,
}

struct Worker {
    tx: SyncSender<ReadTask>,
    handle: JoinHandle<()>,
}

/// A persistent pool of raster readers, grown on demand.
pub struct ReaderPool {
    opener: Arc<dyn RasterOpener>,
    config: Arc<SamplingConfig>,
    workers: Vec<Worker>,
    done_tx: Sender<(String, CacheItem)>,
    done_rx: Receiver<(String, CacheItem)>,
}

impl ReaderPool {
    pub fn new(opener: Arc<dyn RasterOpener>, config: Arc<SamplingConfig>) -> Self {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        ReaderPool {
            opener,
            config,
            workers: Vec::new(),
            done_tx,
            done_rx,
        }
    }

    #[inline]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn ensure_workers(&mut self, count: usize) {
        while self.workers.len() < count {
            let (tx, rx) = sync_channel(1);
            let done = self.done_tx.clone();
            let opener = self.opener.clone();
            let config = self.config.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("raster-reader-{}", self.workers.len()))
                .spawn(move || reader_loop(rx, done, opener, config));
            match spawned {
                Ok(handle) => self.workers.push(Worker { tx, handle }),
                Err(err) => {
                    error!(
                        "failed to create reader thread {}: {}",
                        self.workers.len(),
                        err
                    );
                    break;
                }
            }
        }
    }

    /// Hand one round's cache entries to the workers, one entry per
    /// worker. Returns the number dispatched plus the entries no
    /// worker could take, so the caller can put them back.
    pub fn dispatch(
        &mut self,
        entries: Vec<(String, CacheItem)>,
        query: &QueryGeometry,
    ) -> (usize, Vec<(String, CacheItem)>) {
        self.ensure_workers(entries.len());
        let mut dispatched = 0;
        let mut leftover = Vec::new();
        for (i, (key, item)) in entries.into_iter().enumerate() {
            if i >= self.workers.len() {
                leftover.push((key, item));
                continue;
            }
            let task = ReadTask {
                key,
                item,
                query: query.clone(),
            };
            match self.workers[i].tx.send(task) {
                Ok(()) => dispatched += 1,
                Err(err) => leftover.push((err.0.key, err.0.item)),
            }
        }
        (dispatched, leftover)
    }

    /// Collect `expected` finished entries. Stops short only if the
    /// workers holding the missing entries are gone.
    pub fn drain(&mut self, expected: usize) -> Vec<(String, CacheItem)> {
        let mut finished = Vec::with_capacity(expected);
        while finished.len() < expected {
            match self.done_rx.recv_timeout(DRAIN_POLL) {
                Ok(done) => finished.push(done),
                Err(RecvTimeoutError::Timeout) => {
                    let dead = self.workers[..expected.min(self.workers.len())]
                        .iter()
                        .filter(|w| w.handle.is_finished())
                        .count();
                    if finished.len() >= expected.saturating_sub(dead) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        finished
    }
}

impl Drop for ReaderPool {
    fn drop(&mut self) {
        for worker in self.workers.drain(..) {
            drop(worker.tx);
            let _ = worker.handle.join();
        }
    }
}

fn reader_loop(
    rx: Receiver<ReadTask>,
    done: Sender<(String, CacheItem)>,
    opener: Arc<dyn RasterOpener>,
    config: Arc<SamplingConfig>,
) {
    while let Ok(task) = rx.recv() {
        let ReadTask {
            key,
            mut item,
            query,
        } = task;
        match &query {
            QueryGeometry::Point(point) => {
                let (slots, _) = sample_bands(&mut item.raster, opener.as_ref(), &config, *point);
                item.band_samples = slots;
            }
            QueryGeometry::Extent(extent) => {
                let (slots, _) = subset_bands(&mut item.raster, opener.as_ref(), &config, extent);
                item.band_subsets = slots;
            }
        }
        if done.send((key, item)).is_err() {
            break;
        }
    }
}
