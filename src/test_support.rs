//! Stub images, operations and collaborators shared by the unit tests.

use crate::core::error::{GraphResult, ImageId, TileError, TileResult};
use crate::core::geometry::{Rectangle, Region, TileIndex};
use crate::core::hints::{keys, HintValue, RenderingHints};
use crate::core::layout::{ImageLayout, Layout};
use crate::core::raster::{PixelFormat, Raster};
use crate::core::types::Value;
use crate::execution::cache::MemoryTileCache;
use crate::execution::request::{SharedTileListener, TileRequest};
use crate::execution::scheduler::{run_request_tile, ComputeTarget, TileScheduler};
use crate::graph::{ParameterBlock, RenderedOp, ResolvedParameters};
use crate::image::{CobbledKernel, ImageCore, OpImage, OpImageConfig, Operation, PlanarImage, SharedImage};
use crate::operations::{
    hinted_layout, unchanged_or_everything, Category, InvalidRegionQuery, OperationDescriptor, OperationMetadata,
    OperationRegistry, ParameterSpec,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Route `log` output through the test harness.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Sample value of [`PatternImage`] at `(x, y)`.
pub fn pattern_value(x: i32, y: i32) -> f32 {
    (x * 1000 + y) as f32
}

/// Fill value of tile `(tile_x, tile_y)` computed by [`TileOriginOp`].
pub fn tile_origin_value(tile_x: i32, tile_y: i32) -> f32 {
    (tile_x * 100 + tile_y + 1) as f32
}

// ============================================================================
// Images
// ============================================================================

/// Immutable single-band image with `pattern_value` samples. Tiles are
/// built once and handed out as shared buffers afterwards.
pub struct PatternImage {
    core: ImageCore,
    tiles: Mutex<HashMap<TileIndex, Raster>>,
}

impl PatternImage {
    pub fn new(bounds: Rectangle, tile_width: i32, tile_height: i32) -> Arc<Self> {
        Self::with_sources(bounds, tile_width, tile_height, Vec::new())
    }

    pub fn with_sources(
        bounds: Rectangle,
        tile_width: i32,
        tile_height: i32,
        sources: Vec<SharedImage>,
    ) -> Arc<Self> {
        let layout = Layout::new(bounds, tile_width, tile_height, PixelFormat::gray()).unwrap();
        Arc::new_cyclic(|this: &Weak<Self>| {
            let weak: Weak<dyn PlanarImage> = this.clone();
            Self {
                core: ImageCore::new(weak, layout, sources),
                tiles: Mutex::new(HashMap::new()),
            }
        })
    }
}

impl PlanarImage for PatternImage {
    fn core(&self) -> &ImageCore {
        &self.core
    }

    fn get_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Option<Raster>> {
        if !self.contains_tile(tile_x, tile_y) {
            return Ok(None);
        }
        let index = TileIndex::new(tile_x, tile_y);
        let mut tiles = self.tiles.lock();
        if let Some(tile) = tiles.get(&index) {
            return Ok(Some(tile.clone()));
        }
        let rect = self.tile_rect(tile_x, tile_y);
        let mut tile = Raster::new(rect, PixelFormat::gray())?;
        for y in rect.y..rect.max_y() {
            for x in rect.x..rect.max_x() {
                tile.set_sample(x, y, 0, pattern_value(x, y));
            }
        }
        tiles.insert(index, tile.clone());
        Ok(Some(tile))
    }
}

// ============================================================================
// Operations
// ============================================================================

/// Source-less operation filling every tile with `tile_origin_value`.
/// Tile indices are derived from the destination buffer, so layouts using
/// it must have their grid anchored at the origin.
pub struct TileOriginOp {
    fail_at: Option<TileIndex>,
}

impl TileOriginOp {
    pub fn new() -> Self {
        Self { fail_at: None }
    }

    /// Like [`new`](Self::new), but computing `index` always fails.
    pub fn failing_at(index: TileIndex) -> Self {
        Self { fail_at: Some(index) }
    }
}

impl Operation for TileOriginOp {
    fn name(&self) -> &str {
        "tile_origin"
    }

    fn map_dest_rect(&self, _dest_rect: &Rectangle, _source_index: usize) -> Rectangle {
        Rectangle::empty()
    }

    fn map_source_rect(&self, _source_rect: &Rectangle, _source_index: usize) -> Option<Rectangle> {
        None
    }
}

impl CobbledKernel for TileOriginOp {
    fn compute_rect(&self, _sources: &[Option<Raster>], dest: &mut Raster, dest_rect: &Rectangle) -> TileResult<()> {
        let bounds = dest.bounds();
        let tile_x = bounds.x.div_euclid(bounds.width);
        let tile_y = bounds.y.div_euclid(bounds.height);
        if self.fail_at == Some(TileIndex::new(tile_x, tile_y)) {
            return Err(TileError::computation_failed(
                ImageId::from_uuid(Uuid::nil()),
                tile_x,
                tile_y,
                "injected failure",
            ));
        }
        dest.fill_rect(dest_rect, &[tile_origin_value(tile_x, tile_y)]);
        Ok(())
    }
}

/// Adds a constant to every sample of its single source.
pub struct OffsetOp {
    offset: f32,
}

impl OffsetOp {
    pub fn new(offset: f32) -> Self {
        Self { offset }
    }
}

impl Operation for OffsetOp {
    fn name(&self) -> &str {
        "offset"
    }

    fn map_dest_rect(&self, dest_rect: &Rectangle, _source_index: usize) -> Rectangle {
        *dest_rect
    }

    fn map_source_rect(&self, source_rect: &Rectangle, _source_index: usize) -> Option<Rectangle> {
        Some(*source_rect)
    }
}

impl CobbledKernel for OffsetOp {
    fn compute_rect(&self, sources: &[Option<Raster>], dest: &mut Raster, dest_rect: &Rectangle) -> TileResult<()> {
        let bands = dest.num_bands();
        for y in dest_rect.y..dest_rect.max_y() {
            for x in dest_rect.x..dest_rect.max_x() {
                for band in 0..bands {
                    let base = match &sources[0] {
                        Some(src) if src.bounds().contains_point(x, y) => src.sample(x, y, band),
                        _ => 0.0,
                    };
                    dest.set_sample(x, y, band, base + self.offset);
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Single-threaded scheduler that counts its calls. Asynchronous requests
/// and prefetches run on the calling thread, so tests observe their effects
/// as soon as the call returns.
#[derive(Default)]
pub struct CountingScheduler {
    calls: AtomicUsize,
    batch_calls: AtomicUsize,
    tiles_computed: AtomicUsize,
    fail_remaining: AtomicUsize,
}

impl CountingScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Synchronous scheduling calls, single and batch.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Tiles successfully computed through synchronous calls.
    pub fn tiles_computed(&self) -> usize {
        self.tiles_computed.load(Ordering::SeqCst)
    }

    /// Make the next `count` single-tile calls fail with resource exhaustion.
    pub fn fail_next(&self, count: usize) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl TileScheduler for CountingScheduler {
    fn schedule_tile(&self, target: &dyn ComputeTarget, tile_x: i32, tile_y: i32) -> TileResult<Raster> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            return Err(TileError::ResourceExhausted {
                image: target.target_id(),
                tile_x,
                tile_y,
                detail: "injected".to_string(),
            });
        }
        let tile = target.compute_tile(tile_x, tile_y)?;
        self.tiles_computed.fetch_add(1, Ordering::SeqCst);
        Ok(tile)
    }

    fn schedule_tiles(&self, target: &dyn ComputeTarget, indices: &[TileIndex]) -> TileResult<Vec<Raster>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let tiles = indices
            .iter()
            .map(|i| target.compute_tile(i.x, i.y))
            .collect::<TileResult<Vec<_>>>()?;
        self.tiles_computed.fetch_add(tiles.len(), Ordering::SeqCst);
        Ok(tiles)
    }

    fn schedule_tiles_async(
        &self,
        target: Arc<dyn ComputeTarget>,
        indices: &[TileIndex],
        listeners: Vec<SharedTileListener>,
    ) -> TileRequest {
        let request = TileRequest::new(target.target_id(), indices.to_vec(), listeners);
        for index in request.unique_indices() {
            run_request_tile(target.as_ref(), &request, index);
        }
        request
    }

    fn cancel_tiles(&self, request: &TileRequest, indices: Option<&[TileIndex]>) {
        for index in request.cancel(indices) {
            for listener in request.listeners() {
                listener.tile_cancelled(request, request.image(), index);
            }
        }
    }

    fn prefetch_tiles(&self, target: Arc<dyn ComputeTarget>, indices: &[TileIndex]) {
        for index in indices {
            let _ = target.fetch_tile(index.x, index.y);
        }
    }

    fn parallelism(&self) -> usize {
        1
    }
}

// ============================================================================
// Graph operations
// ============================================================================

/// `stamp(width, height, rect, value)`: single-band generator that is
/// `value` inside `rect` and zero elsewhere. Moving the rectangle or
/// changing the value only invalidates the old and new rectangles.
pub struct StampOp;

impl OperationDescriptor for StampOp {
    fn metadata(&self) -> OperationMetadata {
        OperationMetadata::builder("stamp", "Stamp")
            .category(Category::Generator)
            .parameter(ParameterSpec::new("width", 64))
            .parameter(ParameterSpec::new("height", 64))
            .parameter(ParameterSpec::new("rect", Rectangle::empty()))
            .parameter(ParameterSpec::new("value", 1.0))
            .build()
    }

    fn create(&self, args: &ResolvedParameters, hints: &RenderingHints) -> GraphResult<Option<SharedImage>> {
        let bounds = Rectangle::new(0, 0, args.int32(0)?, args.int32(1)?);
        let stamp = StampKernel {
            rect: args.rectangle(2)?,
            value: args.float(3)? as f32,
        };
        let layout = ImageLayout::new()
            .with_bounds(bounds)
            .with_format(PixelFormat::gray())
            .or(&hinted_layout(hints))
            .resolve(None)?;
        Ok(Some(OpImage::cobbled(Vec::new(), layout, OpImageConfig::from_hints(hints), stamp)))
    }

    fn get_invalid_region(&self, query: &InvalidRegionQuery<'_>) -> Option<Region> {
        if !query.same_sources_and_hints() {
            return None;
        }
        let old = query.old_parameters.parameters();
        let new = query.new_parameters.parameters();
        if old.get(0) != new.get(0) || old.get(1) != new.get(1) {
            return None;
        }
        if old == new {
            return Some(Region::new());
        }
        let old_rect = old.get(2).and_then(Value::as_rectangle)?;
        let new_rect = new.get(2).and_then(Value::as_rectangle)?;
        Some(Region::from_rects([old_rect, new_rect]))
    }
}

struct StampKernel {
    rect: Rectangle,
    value: f32,
}

impl Operation for StampKernel {
    fn name(&self) -> &str {
        "stamp"
    }

    fn map_dest_rect(&self, _dest_rect: &Rectangle, _source_index: usize) -> Rectangle {
        Rectangle::empty()
    }

    fn map_source_rect(&self, _source_rect: &Rectangle, _source_index: usize) -> Option<Rectangle> {
        None
    }
}

impl CobbledKernel for StampKernel {
    fn compute_rect(&self, _sources: &[Option<Raster>], dest: &mut Raster, dest_rect: &Rectangle) -> TileResult<()> {
        dest.fill_rect(dest_rect, &[0.0]);
        dest.fill_rect(&dest_rect.intersection(&self.rect), &[self.value]);
        Ok(())
    }
}

static GENERATIONS: AtomicUsize = AtomicUsize::new(0);

/// `generation(source)`: adds a number unique to each rendering, so a
/// recomputed tile never equals the tile it replaces.
pub struct GenerationOp;

impl OperationDescriptor for GenerationOp {
    fn metadata(&self) -> OperationMetadata {
        OperationMetadata::builder("generation", "Generation")
            .category(Category::Arithmetic)
            .sources(1)
            .build()
    }

    fn create(&self, args: &ResolvedParameters, hints: &RenderingHints) -> GraphResult<Option<SharedImage>> {
        let source = args.source(0)?;
        let layout = source.layout();
        let generation = (GENERATIONS.fetch_add(1, Ordering::SeqCst) + 1) as f32 * 1000.0;
        let kernel = OffsetOp::new(generation);
        Ok(Some(OpImage::cobbled(vec![source], layout, OpImageConfig::from_hints(hints), kernel)))
    }

    fn get_invalid_region(&self, query: &InvalidRegionQuery<'_>) -> Option<Region> {
        unchanged_or_everything(query)
    }
}

/// Built-in operations plus `stamp`, `generation`, `pattern` (a
/// [`PatternImage`] of the given size, not tile-computing) and `null`
/// (never produces a rendering).
pub fn test_registry() -> Arc<OperationRegistry> {
    let mut registry = OperationRegistry::with_builtins();
    registry.register(StampOp);
    registry.register(GenerationOp);
    registry.register_fn(
        OperationMetadata::builder("pattern", "Pattern")
            .category(Category::Generator)
            .parameter(ParameterSpec::new("size", 8))
            .build(),
        |args, _hints| {
            let size = args.int32(0)?;
            let image: SharedImage = PatternImage::new(Rectangle::new(0, 0, size, size), size, size);
            Ok(Some(image))
        },
    );
    registry.register_fn(
        OperationMetadata::builder("null", "Null").build(),
        |_args, _hints| Ok(None),
    );
    Arc::new(registry)
}

/// Registry, shared cache and counting scheduler for graph tests. Nodes
/// created through it use 32 x 32 tiles.
pub struct Harness {
    pub registry: Arc<OperationRegistry>,
    pub cache: Arc<MemoryTileCache>,
    pub scheduler: Arc<CountingScheduler>,
    pub hints: RenderingHints,
}

impl Harness {
    pub fn new() -> Self {
        let cache = Arc::new(MemoryTileCache::default());
        let scheduler = CountingScheduler::new();
        let hints = RenderingHints::new()
            .with(keys::TILE_CACHE, HintValue::TileCache(cache.clone()))
            .with(keys::TILE_SCHEDULER, HintValue::Scheduler(scheduler.clone()))
            .with(keys::IMAGE_LAYOUT, ImageLayout::new().with_tile_size(32, 32));
        Self {
            registry: test_registry(),
            cache,
            scheduler,
            hints,
        }
    }

    /// A `stamp` node with value 1.
    pub fn stamp(&self, width: i32, height: i32, rect: Rectangle) -> Arc<RenderedOp> {
        let block = ParameterBlock::new()
            .with_parameter(width)
            .with_parameter(height)
            .with_parameter(rect)
            .with_parameter(1.0);
        RenderedOp::new(self.registry.clone(), "stamp", block, self.hints.clone())
    }

    /// A `generation` node reading `source`.
    pub fn generation(&self, source: &Arc<RenderedOp>) -> Arc<RenderedOp> {
        let block = ParameterBlock::new().with_source(source.clone());
        RenderedOp::new(self.registry.clone(), "generation", block, self.hints.clone())
    }
}
