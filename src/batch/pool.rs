//! Stage two of a batch: read the distinct rasters.
//!
//! A bounded pool of readers takes one raster at a time and samples
//! every point recorded for it. Workers announce themselves on a
//! shared free-list channel and receive work on a 1-slot channel
//! each; the assignment loop re-checks the stop flag between polls,
//! so stopping takes effect within one poll interval. All readers
//! are joined before this returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, sync_channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use geo::Rect;
use log::{info, warn};

use super::UniqueRaster;
use crate::config::SamplingConfig;
use crate::raster::{LazyRaster, OpenRequest, RasterOpener};
use crate::time::GpsTime;

/// Pool bound; larger pools contend on the GDAL dataset lock.
const MAX_BATCH_READERS: usize = 20;

const ASSIGN_POLL: Duration = Duration::from_millis(10);

/// Sample every point of every distinct raster, filling the
/// [`PointSample`](super::PointSample) slots in place. Reads are
/// bounded by `read_bbox` when given.
pub fn sample_unique_rasters(
    uniques: &mut [UniqueRaster],
    opener: &dyn RasterOpener,
    config: &SamplingConfig,
    read_bbox: Option<&Rect<f64>>,
    active: &AtomicBool,
) {
    if uniques.is_empty() {
        return;
    }
    let workers = uniques.len().min(MAX_BATCH_READERS);
    info!(
        "sampling {} rasters with {} threads",
        uniques.len(),
        workers
    );

    std::thread::scope(|scope| {
        let (free_tx, free_rx) = channel::<usize>();
        let mut task_txs = Vec::with_capacity(workers);
        for idx in 0..workers {
            let (tx, rx) = sync_channel::<&mut UniqueRaster>(1);
            let free = free_tx.clone();
            scope.spawn(move || batch_reader(idx, rx, free, opener, config, read_bbox));
            task_txs.push(tx);
        }
        drop(free_tx);

        'assign: for mut raster in uniques.iter_mut() {
            loop {
                if !active.load(Ordering::Relaxed) {
                    warn!("sampling stopped, leaving remaining rasters unread");
                    break 'assign;
                }
                match free_rx.recv_timeout(ASSIGN_POLL) {
                    Ok(idx) => match task_txs[idx].send(raster) {
                        Ok(()) => break,
                        // that worker is gone, wait for another
                        Err(err) => raster = err.0,
                    },
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break 'assign,
                }
            }
        }
        // closing the task channels winds the workers down; the scope
        // joins them
        drop(task_txs);
    });
}

fn batch_reader(
    idx: usize,
    rx: Receiver<&mut UniqueRaster>,
    free: Sender<usize>,
    opener: &dyn RasterOpener,
    config: &SamplingConfig,
    read_bbox: Option<&Rect<f64>>,
) {
    if free.send(idx).is_err() {
        return;
    }
    while let Ok(raster) = rx.recv() {
        read_raster_points(raster, opener, config, read_bbox);
        if free.send(idx).is_err() {
            return;
        }
    }
}

/// One raster, all of its points. The group time is stamped later at
/// collection, so the open request carries no time of its own.
fn read_raster_points(
    raster: &mut UniqueRaster,
    opener: &dyn RasterOpener,
    config: &SamplingConfig,
    read_bbox: Option<&Rect<f64>>,
) {
    let mut lazy = LazyRaster::new(OpenRequest {
        path: raster.path.clone(),
        role: raster.info.role.clone(),
        file_id: raster.info.file_id,
        gps: GpsTime::ZERO,
        read_bbox: read_bbox.copied(),
    });

    if let Some(source) = lazy.open(opener, config) {
        match source.resolve_bands(&config.bands) {
            Ok(bands) => {
                for ps in raster.samples.iter_mut() {
                    for band in &bands {
                        ps.slots.push(source.sample(ps.point, *band));
                    }
                    ps.errors |= source.errors();
                }
            }
            Err(err) => warn!("resolving bands of {}: {:#}", raster.path, err),
        }
    }

    let errors = lazy.errors();
    if !errors.is_empty() {
        for ps in raster.samples.iter_mut() {
            ps.errors |= errors;
        }
    }
    lazy.close();
}
