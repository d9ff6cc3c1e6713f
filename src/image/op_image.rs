//! Tile-computing images.
//!
//! An [`OpImage`] computes its tiles on demand from its sources through an
//! [`Operation`] (region mapping) and a [`ComputeStrategy`] (pixel math),
//! keeps them in a tile cache and delegates computation to a scheduler.
//!
//! Tile lifecycle: a tile is either found in the cache, or scheduled,
//! computed and then stored in the cache.

use crate::core::error::{ImageId, TileError, TileResult};
use crate::core::geometry::{Rectangle, TileIndex};
use crate::core::hints::{keys, HintValue, RenderingHints};
use crate::core::layout::Layout;
use crate::core::raster::Raster;
use crate::execution::cache::{SharedTileCache, TileMetric};
use crate::execution::recycler::SharedRecycler;
use crate::execution::request::{SharedTileListener, TileComputationListener, TileRequest};
use crate::execution::scheduler::{default_scheduler, ComputeTarget, SharedScheduler};
use crate::image::{ImageCore, PlanarImage, SharedImage};
use log::{debug, trace, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

// ============================================================================
// Operation contracts
// ============================================================================

/// Region mapping between an operation's destination and its sources.
///
/// Both mappings must over-approximate. They are used for computing tiles
/// and for deciding which cached tiles survive an upstream change.
pub trait Operation: Send + Sync {
    /// Operation name, for logging.
    fn name(&self) -> &str;

    /// Source region needed to compute `dest_rect`. An empty rectangle means
    /// the source contributes nothing to that region.
    fn map_dest_rect(&self, dest_rect: &Rectangle, source_index: usize) -> Rectangle;

    /// Destination region affected by `source_rect`. `None` means it cannot
    /// be determined and the whole destination must be assumed affected.
    fn map_source_rect(&self, source_rect: &Rectangle, source_index: usize) -> Option<Rectangle>;
}

/// Pixel computation over materialized source regions.
pub trait CobbledKernel: Send + Sync {
    /// Fill `dest_rect` of `dest`. `sources[i]` holds the region reported by
    /// `map_dest_rect` for source `i`, or `None` if that region was empty.
    fn compute_rect(&self, sources: &[Option<Raster>], dest: &mut Raster, dest_rect: &Rectangle) -> TileResult<()>;
}

/// Pixel computation that reads the source images directly.
pub trait UncobbledKernel: Send + Sync {
    /// Fill `dest_rect` of `dest` from `sources`.
    fn compute_rect(&self, sources: &[SharedImage], dest: &mut Raster, dest_rect: &Rectangle) -> TileResult<()>;
}

/// How an image computes its tiles. Fixed at construction.
#[derive(Clone)]
pub enum ComputeStrategy {
    /// Sources are extracted into rasters before the kernel runs.
    Cobbled(Arc<dyn CobbledKernel>),
    /// The kernel receives the source images.
    Uncobbled(Arc<dyn UncobbledKernel>),
}

impl ComputeStrategy {
    /// Whether sources are cobbled before computation.
    pub fn is_cobbled(&self) -> bool {
        matches!(self, ComputeStrategy::Cobbled(_))
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Collaborators of an [`OpImage`].
#[derive(Clone, Default)]
pub struct OpImageConfig {
    /// Cache for computed tiles; `None` disables caching.
    pub cache: Option<SharedTileCache>,
    /// Scheduler; `None` selects the process-wide default.
    pub scheduler: Option<SharedScheduler>,
    /// Eviction metric attached to cached tiles.
    pub tile_cache_metric: Option<TileMetric>,
    /// Recycler for tile buffers.
    pub recycler: Option<SharedRecycler>,
    /// Whether disposal hands cached tiles to the recycler.
    pub recycle_cached_tiles: bool,
}

impl OpImageConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tile cache.
    pub fn with_cache(mut self, cache: SharedTileCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the scheduler.
    pub fn with_scheduler(mut self, scheduler: SharedScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set the tile cache metric.
    pub fn with_metric(mut self, metric: TileMetric) -> Self {
        self.tile_cache_metric = Some(metric);
        self
    }

    /// Set the recycler and whether disposal recycles cached tiles.
    pub fn with_recycler(mut self, recycler: SharedRecycler, recycle_cached_tiles: bool) -> Self {
        self.recycler = Some(recycler);
        self.recycle_cached_tiles = recycle_cached_tiles;
        self
    }

    /// Read the configuration from rendering hints. Values of the wrong kind
    /// are ignored and the corresponding default is kept.
    pub fn from_hints(hints: &RenderingHints) -> Self {
        let mut config = Self::default();

        match hints.get(keys::TILE_CACHE) {
            Some(HintValue::TileCache(cache)) => config.cache = Some(cache.clone()),
            Some(other) => debug!("Ignoring {} supplied as the tile cache hint", other.kind()),
            None => {}
        }
        match hints.get(keys::TILE_SCHEDULER) {
            Some(HintValue::Scheduler(scheduler)) => config.scheduler = Some(scheduler.clone()),
            Some(other) => debug!("Ignoring {} supplied as the scheduler hint", other.kind()),
            None => {}
        }
        match hints.get(keys::TILE_CACHE_METRIC) {
            Some(HintValue::Metric(metric)) => config.tile_cache_metric = Some(*metric),
            Some(other) => debug!("Ignoring {} supplied as the tile metric hint", other.kind()),
            None => {}
        }
        match hints.get(keys::TILE_RECYCLER) {
            Some(HintValue::Recycler(recycler)) => config.recycler = Some(recycler.clone()),
            Some(other) => debug!("Ignoring {} supplied as the recycler hint", other.kind()),
            None => {}
        }
        if let Some(enabled) = hints
            .value(keys::CACHED_TILE_RECYCLING_ENABLED)
            .and_then(|v| v.as_bool())
        {
            config.recycle_cached_tiles = enabled;
        }

        config
    }
}

// ============================================================================
// OpImage
// ============================================================================

/// An image whose tiles are computed from its sources.
pub struct OpImage {
    core: ImageCore,
    operation: Arc<dyn Operation>,
    strategy: ComputeStrategy,
    cache: RwLock<Option<SharedTileCache>>,
    scheduler: SharedScheduler,
    metric: Option<TileMetric>,
    recycler: Option<SharedRecycler>,
    recycle_cached_tiles: bool,
    listeners: RwLock<Vec<SharedTileListener>>,
    this: Weak<OpImage>,
}

impl OpImage {
    /// Create an image computing tiles with `operation` and `strategy`.
    pub fn new(
        sources: Vec<SharedImage>,
        layout: Layout,
        config: OpImageConfig,
        operation: Arc<dyn Operation>,
        strategy: ComputeStrategy,
    ) -> Arc<Self> {
        let scheduler = config.scheduler.unwrap_or_else(default_scheduler);
        Arc::new_cyclic(|this: &Weak<OpImage>| {
            let weak: Weak<dyn PlanarImage> = this.clone();
            Self {
                core: ImageCore::new(weak, layout, sources),
                operation,
                strategy,
                cache: RwLock::new(config.cache),
                scheduler,
                metric: config.tile_cache_metric,
                recycler: config.recycler,
                recycle_cached_tiles: config.recycle_cached_tiles,
                listeners: RwLock::new(Vec::new()),
                this: this.clone(),
            }
        })
    }

    /// Create an image whose operation cobbles its sources.
    pub fn cobbled<T>(sources: Vec<SharedImage>, layout: Layout, config: OpImageConfig, operation: T) -> Arc<Self>
    where
        T: Operation + CobbledKernel + 'static,
    {
        let operation = Arc::new(operation);
        Self::new(
            sources,
            layout,
            config,
            operation.clone(),
            ComputeStrategy::Cobbled(operation),
        )
    }

    /// Create an image whose operation reads its source images directly.
    pub fn uncobbled<T>(sources: Vec<SharedImage>, layout: Layout, config: OpImageConfig, operation: T) -> Arc<Self>
    where
        T: Operation + UncobbledKernel + 'static,
    {
        let operation = Arc::new(operation);
        Self::new(
            sources,
            layout,
            config,
            operation.clone(),
            ComputeStrategy::Uncobbled(operation),
        )
    }

    /// The operation's name.
    pub fn operation_name(&self) -> &str {
        self.operation.name()
    }

    /// The computation strategy.
    pub fn strategy(&self) -> &ComputeStrategy {
        &self.strategy
    }

    /// The scheduler computing this image's tiles.
    pub fn scheduler(&self) -> &SharedScheduler {
        &self.scheduler
    }

    /// The tile cache, if any.
    pub fn tile_cache(&self) -> Option<SharedTileCache> {
        self.cache.read().clone()
    }

    /// Switch to another tile cache. Tiles held in the previous cache are dropped.
    pub fn set_tile_cache(&self, cache: Option<SharedTileCache>) {
        let previous = std::mem::replace(&mut *self.cache.write(), cache);
        if let Some(previous) = previous {
            previous.remove_tiles(self.id());
        }
    }

    /// Eviction metric attached to cached tiles.
    pub fn tile_cache_metric(&self) -> Option<TileMetric> {
        self.metric
    }

    // ------------------------------------------------------------------------
    // Cache access
    // ------------------------------------------------------------------------

    /// Look up a tile in the cache.
    pub fn get_tile_from_cache(&self, tile_x: i32, tile_y: i32) -> Option<Raster> {
        self.tile_cache()?.get_tile(self.id(), tile_x, tile_y)
    }

    /// Store a tile in the cache, if one is configured.
    pub fn add_tile_to_cache(&self, tile_x: i32, tile_y: i32, tile: Raster) {
        if let Some(cache) = self.tile_cache() {
            cache.add(self.id(), tile_x, tile_y, tile, self.metric);
        }
    }

    // ------------------------------------------------------------------------
    // Region mapping
    // ------------------------------------------------------------------------

    fn check_source_index(&self, source_index: usize) -> TileResult<()> {
        let count = self.num_sources();
        if source_index >= count {
            return Err(TileError::SourceIndexOutOfRange {
                image: self.id(),
                index: source_index,
                count,
            });
        }
        Ok(())
    }

    /// Source region of `source_index` needed to compute `dest_rect`.
    pub fn map_dest_rect(&self, dest_rect: &Rectangle, source_index: usize) -> TileResult<Rectangle> {
        self.check_source_index(source_index)?;
        Ok(self.operation.map_dest_rect(dest_rect, source_index))
    }

    /// Destination region affected by `source_rect` of source `source_index`.
    pub fn map_source_rect(&self, source_rect: &Rectangle, source_index: usize) -> TileResult<Option<Rectangle>> {
        self.check_source_index(source_index)?;
        Ok(self.operation.map_source_rect(source_rect, source_index))
    }

    /// Tiles of source `source_index` needed to compute tile `(tile_x, tile_y)`.
    pub fn tile_dependencies(&self, tile_x: i32, tile_y: i32, source_index: usize) -> TileResult<Vec<TileIndex>> {
        let rect = self.map_dest_rect(&self.tile_rect(tile_x, tile_y), source_index)?;
        Ok(self.source(source_index)?.tile_indices(&rect))
    }

    // ------------------------------------------------------------------------
    // Computation
    // ------------------------------------------------------------------------

    fn create_tile(&self, bounds: Rectangle) -> TileResult<Raster> {
        let format = self.format();
        if let Some(tile) = self.recycler.as_ref().and_then(|r| r.reclaim(bounds, format)) {
            return Ok(tile);
        }
        Raster::new(bounds, format)
    }

    /// Compute a tile without consulting the cache. The tile covers the full
    /// nominal tile rectangle; only the part inside the image is computed.
    pub fn compute_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Raster> {
        let layout = self.layout();
        let nominal = layout.grid.nominal_tile_rect(tile_x, tile_y);
        let dest_rect = nominal.intersection(&layout.bounds);
        let mut dest = self.create_tile(nominal)?;
        let sources = self.sources();

        match &self.strategy {
            ComputeStrategy::Cobbled(kernel) => {
                let mut rasters = Vec::with_capacity(sources.len());
                for (index, source) in sources.iter().enumerate() {
                    let src_rect = self.operation.map_dest_rect(&dest_rect, index);
                    if src_rect.is_empty() || !src_rect.intersects(&source.bounds()) {
                        rasters.push(None);
                    } else {
                        rasters.push(Some(source.get_data(Some(&src_rect))?));
                    }
                }
                kernel.compute_rect(&rasters, &mut dest, &dest_rect)?;

                if let Some(recycler) = &self.recycler {
                    for (source, raster) in sources.iter().zip(rasters) {
                        if let Some(raster) = raster {
                            if source.overlaps_multiple_tiles(&raster.bounds()) {
                                recycler.recycle(raster);
                            }
                        }
                    }
                }
            }
            ComputeStrategy::Uncobbled(kernel) => {
                kernel.compute_rect(&sources, &mut dest, &dest_rect)?;
            }
        }
        Ok(dest)
    }

    /// Schedule a missing tile, applying the memory-pressure policy: on
    /// resource exhaustion drop this image's cached tiles and retry, then
    /// flush the whole cache and retry a last time.
    fn schedule_with_recovery(&self, tile_x: i32, tile_y: i32) -> TileResult<Raster> {
        let first = match self.scheduler.schedule_tile(self, tile_x, tile_y) {
            Err(e) if e.is_resource_exhausted() => e,
            other => return other,
        };
        let cache = self.tile_cache();

        warn!(
            "Tile ({}, {}) of image {} exhausted resources ({}); dropping its cached tiles",
            tile_x,
            tile_y,
            self.id(),
            first
        );
        if let Some(cache) = &cache {
            cache.remove_tiles(self.id());
        }
        let second = match self.scheduler.schedule_tile(self, tile_x, tile_y) {
            Err(e) if e.is_resource_exhausted() => e,
            other => return other,
        };

        warn!(
            "Tile ({}, {}) of image {} still exhausted resources ({}); flushing the tile cache",
            tile_x,
            tile_y,
            self.id(),
            second
        );
        if let Some(cache) = &cache {
            cache.flush();
        }
        self.scheduler.schedule_tile(self, tile_x, tile_y)
    }

    // ------------------------------------------------------------------------
    // Asynchronous access
    // ------------------------------------------------------------------------

    /// Register a listener notified about every queued tile.
    pub fn add_tile_computation_listener(&self, listener: SharedTileListener) {
        self.listeners.write().push(listener);
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_tile_computation_listener(&self, listener: &SharedTileListener) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Compute tiles in the background. Computed tiles are cached and
    /// reported to the registered listeners. Indices outside the tile
    /// range are ignored.
    pub fn queue_tiles(&self, indices: &[TileIndex]) -> TileRequest {
        let indices: Vec<TileIndex> = indices
            .iter()
            .copied()
            .filter(|i| self.contains_tile(i.x, i.y))
            .collect();

        let mut listeners: Vec<SharedTileListener> = Vec::new();
        if !self.scheduler.caches_tiles() && self.tile_cache().is_some() {
            listeners.push(Arc::new(CachingListener {
                image: self.this.clone(),
            }));
        }
        listeners.extend(self.listeners.read().iter().cloned());

        match self.this.upgrade() {
            Some(this) => self.scheduler.schedule_tiles_async(this, &indices, listeners),
            None => {
                let request = TileRequest::new(self.id(), indices, listeners);
                self.scheduler.cancel_tiles(&request, None);
                request
            }
        }
    }

    /// Advise the scheduler that tiles of `request` are no longer needed.
    pub fn cancel_tiles(&self, request: &TileRequest, indices: Option<&[TileIndex]>) {
        self.scheduler.cancel_tiles(request, indices);
    }

    /// Warm the cache with tiles that are likely to be requested soon.
    pub fn prefetch_tiles(&self, indices: &[TileIndex]) {
        let wanted: Vec<TileIndex> = indices
            .iter()
            .copied()
            .filter(|i| self.contains_tile(i.x, i.y) && self.get_tile_from_cache(i.x, i.y).is_none())
            .collect();
        if wanted.is_empty() {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            self.scheduler.prefetch_tiles(this, &wanted);
        }
    }
}

impl PlanarImage for OpImage {
    fn core(&self) -> &ImageCore {
        &self.core
    }

    fn get_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Option<Raster>> {
        if !self.contains_tile(tile_x, tile_y) {
            return Ok(None);
        }
        if let Some(tile) = self.get_tile_from_cache(tile_x, tile_y) {
            return Ok(Some(tile));
        }
        let tile = self.schedule_with_recovery(tile_x, tile_y)?;
        self.add_tile_to_cache(tile_x, tile_y, tile.clone());
        Ok(Some(tile))
    }

    /// Cached tiles are taken from the cache; the rest are computed with a
    /// single scheduler call. Each distinct tile is computed once.
    fn get_tiles(&self, indices: &[TileIndex]) -> TileResult<Vec<Option<Raster>>> {
        let mut tiles: Vec<Option<Raster>> = vec![None; indices.len()];
        let mut pending = Vec::new();
        for (position, index) in indices.iter().enumerate() {
            if !self.contains_tile(index.x, index.y) {
                continue;
            }
            match self.get_tile_from_cache(index.x, index.y) {
                Some(tile) => tiles[position] = Some(tile),
                None => pending.push(position),
            }
        }
        if pending.is_empty() {
            return Ok(tiles);
        }

        let mut slots: HashMap<TileIndex, usize> = HashMap::new();
        let mut unique = Vec::new();
        for &position in &pending {
            slots.entry(indices[position]).or_insert_with(|| {
                unique.push(indices[position]);
                unique.len() - 1
            });
        }

        trace!("Scheduling {} of {} tiles of image {}", unique.len(), indices.len(), self.id());
        let computed = self.scheduler.schedule_tiles(self, &unique)?;
        for (index, tile) in unique.iter().zip(&computed) {
            self.add_tile_to_cache(index.x, index.y, tile.clone());
        }
        for position in pending {
            let slot = slots[&indices[position]];
            tiles[position] = Some(computed[slot].clone());
        }
        Ok(tiles)
    }

    fn as_op_image(&self) -> Option<&OpImage> {
        Some(self)
    }

    fn dispose(&self) {
        if !self.core.mark_disposed() {
            return;
        }
        if let Some(cache) = self.tile_cache() {
            if self.recycle_cached_tiles {
                if let Some(recycler) = &self.recycler {
                    for (_, tile) in cache.tiles(self.id()) {
                        recycler.recycle(tile);
                    }
                }
            }
            cache.remove_tiles(self.id());
        }
        self.core.detach_from_sources();
        debug!("Disposed image {} ({})", self.id(), self.operation.name());
    }
}

impl ComputeTarget for OpImage {
    fn target_id(&self) -> ImageId {
        self.id()
    }

    fn compute_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Raster> {
        OpImage::compute_tile(self, tile_x, tile_y)
    }

    fn fetch_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Option<Raster>> {
        self.get_tile(tile_x, tile_y)
    }
}

impl Drop for OpImage {
    fn drop(&mut self) {
        if self.core.is_disposed() {
            return;
        }
        if let Some(cache) = self.cache.get_mut().take() {
            cache.remove_tiles(self.core.id());
        }
    }
}

impl fmt::Debug for OpImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpImage")
            .field("id", &self.id())
            .field("operation", &self.operation.name())
            .field("bounds", &self.bounds())
            .field("cobbled", &self.strategy.is_cobbled())
            .finish()
    }
}

/// Stores asynchronously computed tiles in the image's cache.
struct CachingListener {
    image: Weak<OpImage>,
}

impl TileComputationListener for CachingListener {
    fn tile_computed(&self, _request: &TileRequest, _image: ImageId, index: TileIndex, tile: &Raster) {
        if let Some(image) = self.image.upgrade() {
            image.add_tile_to_cache(index.x, index.y, tile.clone());
        }
    }

    fn tile_computation_failure(&self, _request: &TileRequest, _image: ImageId, _index: TileIndex, _error: &TileError) {}
}
