//! Tile scheduling.
//!
//! A [`TileScheduler`] turns tile requests into calls to
//! [`ComputeTarget::compute_tile`]. Synchronous calls block the caller;
//! asynchronous calls return a [`TileRequest`] immediately and report every
//! outcome through the request's listeners.
//!
//! [`ThreadPoolScheduler`] runs batch and asynchronous work on a rayon pool
//! and feeds prefetches through a crossbeam channel to a small set of
//! low-priority worker threads.

use crate::config::SchedulerConfig;
use crate::core::error::{ConfigError, ConfigResult, ImageId, TileResult};
use crate::core::geometry::TileIndex;
use crate::core::raster::Raster;
use crate::execution::request::{SharedTileListener, TileRequest, TileStatus};
use crossbeam::channel::{self, Sender};
use log::{debug, trace, warn};
use rayon::prelude::*;
use std::sync::{Arc, OnceLock};
use std::thread;

/// Something whose tiles a scheduler can compute.
pub trait ComputeTarget: Send + Sync {
    /// Identity of the image.
    fn target_id(&self) -> ImageId;

    /// Compute a tile unconditionally.
    fn compute_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Raster>;

    /// Fetch a tile through the image's cache, computing it on a miss.
    /// Used for prefetching.
    fn fetch_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Option<Raster>>;
}

/// Computes tiles on behalf of images.
pub trait TileScheduler: Send + Sync {
    /// Compute one tile, blocking until it is ready.
    fn schedule_tile(&self, target: &dyn ComputeTarget, tile_x: i32, tile_y: i32) -> TileResult<Raster>;

    /// Compute several tiles, blocking until all are ready. Results are in
    /// input order.
    fn schedule_tiles(&self, target: &dyn ComputeTarget, indices: &[TileIndex]) -> TileResult<Vec<Raster>>;

    /// Queue tiles for computation and return at once. Every tile is
    /// reported to `listeners` as computed, cancelled or failed.
    fn schedule_tiles_async(
        &self,
        target: Arc<dyn ComputeTarget>,
        indices: &[TileIndex],
        listeners: Vec<SharedTileListener>,
    ) -> TileRequest;

    /// Advise that tiles of a request are no longer needed. Tiles already
    /// being computed are not interrupted. `None` cancels the whole request.
    fn cancel_tiles(&self, request: &TileRequest, indices: Option<&[TileIndex]>);

    /// Compute tiles in the background so later requests hit the cache.
    fn prefetch_tiles(&self, target: Arc<dyn ComputeTarget>, indices: &[TileIndex]);

    /// Whether completed asynchronous tiles are stored in the image's cache
    /// by the scheduler itself.
    fn caches_tiles(&self) -> bool {
        false
    }

    /// Number of threads computing tiles.
    fn parallelism(&self) -> usize;
}

/// A shared scheduler.
pub type SharedScheduler = Arc<dyn TileScheduler>;

/// The process-wide scheduler used by images configured without one.
pub fn default_scheduler() -> SharedScheduler {
    static DEFAULT: OnceLock<SharedScheduler> = OnceLock::new();
    DEFAULT
        .get_or_init(|| Arc::new(ThreadPoolScheduler::with_fallback(SchedulerConfig::default())))
        .clone()
}

struct PrefetchJob {
    target: Arc<dyn ComputeTarget>,
    index: TileIndex,
}

/// Thread-pool backed scheduler.
pub struct ThreadPoolScheduler {
    /// `None` when the dedicated pool could not be built; rayon's global
    /// pool is used instead.
    pool: Option<rayon::ThreadPool>,
    prefetch: Sender<PrefetchJob>,
    config: SchedulerConfig,
}

impl ThreadPoolScheduler {
    /// Create a scheduler with a dedicated pool.
    pub fn new(config: SchedulerConfig) -> ConfigResult<Self> {
        let prefix = config.thread_name_prefix.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallelism)
            .thread_name(move |i| format!("{}-{}", prefix, i))
            .build()
            .map_err(|e| ConfigError::ThreadPool(e.to_string()))?;
        Ok(Self::assemble(Some(pool), config))
    }

    /// Create a scheduler, falling back to rayon's global pool if the
    /// dedicated pool cannot be started.
    pub fn with_fallback(config: SchedulerConfig) -> Self {
        match Self::new(config.clone()) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                warn!("Falling back to the global thread pool: {}", e);
                Self::assemble(None, config)
            }
        }
    }

    fn assemble(pool: Option<rayon::ThreadPool>, config: SchedulerConfig) -> Self {
        let (sender, receiver) = channel::unbounded::<PrefetchJob>();
        for i in 0..config.prefetch_parallelism {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-prefetch-{}", config.thread_name_prefix, i))
                .spawn(move || {
                    for job in receiver.iter() {
                        let PrefetchJob { target, index } = job;
                        if let Err(e) = target.fetch_tile(index.x, index.y) {
                            warn!(
                                "Prefetch of tile {} of image {} failed: {}",
                                index,
                                target.target_id(),
                                e
                            );
                        }
                    }
                });
            if let Err(e) = spawned {
                warn!("Could not start prefetch worker {}: {}", i, e);
            }
        }
        Self {
            pool,
            prefetch: sender,
            config,
        }
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }

    fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        match &self.pool {
            Some(pool) => pool.spawn(job),
            None => rayon::spawn(job),
        }
    }
}

/// Compute one tile of an asynchronous request. Listeners run before the
/// tile is marked finished, so waiters observe their effects.
pub(crate) fn run_request_tile(target: &dyn ComputeTarget, request: &TileRequest, index: TileIndex) {
    if !request.begin(index) {
        return;
    }
    let image = target.target_id();
    match target.compute_tile(index.x, index.y) {
        Ok(tile) => {
            for listener in request.listeners() {
                listener.tile_computed(request, image, index, &tile);
            }
            request.finish(index, TileStatus::Computed);
        }
        Err(e) => {
            warn!("Tile {} of image {} failed: {}", index, image, e);
            for listener in request.listeners() {
                listener.tile_computation_failure(request, image, index, &e);
            }
            request.finish(index, TileStatus::Failed);
        }
    }
}

impl TileScheduler for ThreadPoolScheduler {
    fn schedule_tile(&self, target: &dyn ComputeTarget, tile_x: i32, tile_y: i32) -> TileResult<Raster> {
        trace!("Computing tile ({}, {}) of image {}", tile_x, tile_y, target.target_id());
        target.compute_tile(tile_x, tile_y)
    }

    fn schedule_tiles(&self, target: &dyn ComputeTarget, indices: &[TileIndex]) -> TileResult<Vec<Raster>> {
        trace!("Computing {} tiles of image {}", indices.len(), target.target_id());
        self.install(|| {
            indices
                .par_iter()
                .map(|index| target.compute_tile(index.x, index.y))
                .collect()
        })
    }

    fn schedule_tiles_async(
        &self,
        target: Arc<dyn ComputeTarget>,
        indices: &[TileIndex],
        listeners: Vec<SharedTileListener>,
    ) -> TileRequest {
        let request = TileRequest::new(target.target_id(), indices.to_vec(), listeners);
        debug!(
            "Queued request {} for {} tiles of image {}",
            request.id(),
            indices.len(),
            request.image()
        );
        for index in request.unique_indices() {
            let target = Arc::clone(&target);
            let request = request.clone();
            self.spawn(move || run_request_tile(target.as_ref(), &request, index));
        }
        request
    }

    fn cancel_tiles(&self, request: &TileRequest, indices: Option<&[TileIndex]>) {
        let cancelled = request.cancel(indices);
        if cancelled.is_empty() {
            return;
        }
        debug!("Cancelled {} tiles of request {}", cancelled.len(), request.id());
        for index in cancelled {
            for listener in request.listeners() {
                listener.tile_cancelled(request, request.image(), index);
            }
        }
    }

    fn prefetch_tiles(&self, target: Arc<dyn ComputeTarget>, indices: &[TileIndex]) {
        if self.config.prefetch_parallelism == 0 {
            return;
        }
        for &index in indices {
            let job = PrefetchJob {
                target: Arc::clone(&target),
                index,
            };
            if self.prefetch.send(job).is_err() {
                warn!("Prefetch queue closed; dropping remaining prefetches");
                return;
            }
        }
    }

    fn parallelism(&self) -> usize {
        self.config.parallelism
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::TileError;
    use crate::core::geometry::Rectangle;
    use crate::core::raster::PixelFormat;
    use crate::execution::request::{CallbackListener, TileEvent};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Computes tiles filled with `x + 10 * y`; tile (9, 9) always fails.
    struct Target {
        id: ImageId,
        computed: AtomicUsize,
    }

    impl Target {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: ImageId::new(),
                computed: AtomicUsize::new(0),
            })
        }
    }

    impl ComputeTarget for Target {
        fn target_id(&self) -> ImageId {
            self.id
        }

        fn compute_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Raster> {
            if (tile_x, tile_y) == (9, 9) {
                return Err(TileError::computation_failed(self.id, tile_x, tile_y, "unlucky tile"));
            }
            self.computed.fetch_add(1, Ordering::SeqCst);
            Raster::filled(
                Rectangle::new(tile_x * 4, tile_y * 4, 4, 4),
                PixelFormat::gray(),
                (tile_x + 10 * tile_y) as f32,
            )
        }

        fn fetch_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Option<Raster>> {
            self.compute_tile(tile_x, tile_y).map(Some)
        }
    }

    fn scheduler() -> ThreadPoolScheduler {
        ThreadPoolScheduler::new(SchedulerConfig::default().with_parallelism(2)).unwrap()
    }

    #[test]
    fn test_schedule_tiles_preserves_order() {
        let target = Target::new();
        let indices = [TileIndex::new(2, 3), TileIndex::new(0, 0), TileIndex::new(1, 0)];
        let tiles = scheduler().schedule_tiles(target.as_ref(), &indices).unwrap();

        let values: Vec<f32> = tiles.iter().map(|t| t.sample(t.min_x(), t.min_y(), 0)).collect();
        assert_eq!(values, vec![32.0, 0.0, 1.0]);
    }

    #[test]
    fn test_schedule_tiles_propagates_failure() {
        let target = Target::new();
        let result = scheduler().schedule_tiles(target.as_ref(), &[TileIndex::new(0, 0), TileIndex::new(9, 9)]);
        assert!(matches!(result, Err(TileError::ComputationFailed { .. })));
    }

    #[test]
    fn test_async_reports_every_outcome() {
        let target = Target::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener = CallbackListener::shared(move |event| sink.lock().push(event));

        let request = scheduler().schedule_tiles_async(
            target.clone(),
            &[TileIndex::new(0, 0), TileIndex::new(9, 9), TileIndex::new(0, 0)],
            vec![listener],
        );
        assert!(request.wait_timeout(Duration::from_secs(10)));

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| matches!(e, TileEvent::Failed { index, .. } if *index == TileIndex::new(9, 9))));
        assert!(events.iter().any(|e| matches!(e, TileEvent::Computed { index, .. } if *index == TileIndex::new(0, 0))));
        assert_eq!(request.tile_status(TileIndex::new(9, 9)), Some(TileStatus::Failed));
        assert_eq!(target.computed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_notifies_pending_tiles() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener = CallbackListener::shared(move |event| sink.lock().push(event));
        let index = TileIndex::new(4, 4);
        let request = TileRequest::new(ImageId::new(), vec![index], vec![listener]);

        let scheduler = scheduler();
        scheduler.cancel_tiles(&request, None);
        scheduler.cancel_tiles(&request, None);

        assert_eq!(request.tile_status(index), Some(TileStatus::Cancelled));
        assert_eq!(events.lock().len(), 1);
        assert!(request.is_done());
    }

    #[test]
    fn test_prefetch_runs_in_background() {
        let target = Target::new();
        let scheduler = scheduler();
        scheduler.prefetch_tiles(target.clone(), &[TileIndex::new(0, 0), TileIndex::new(1, 1)]);

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while target.computed.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(target.computed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_default_scheduler_is_shared() {
        let a = default_scheduler();
        let b = default_scheduler();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.parallelism() > 0);
    }
}
