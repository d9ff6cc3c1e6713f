//! Rendered images.
//!
//! [`PlanarImage`] is the interface every rendered image implements: a
//! layout, a set of sources, weak back-references to sinks, properties and
//! tile access. Region extraction ([`PlanarImage::get_data`] and
//! [`PlanarImage::copy_data`]) is provided on top of tile access and cobbles
//! the tiles a region touches into one buffer.
//!
//! Concrete images embed an [`ImageCore`] holding the shared state and are
//! always created inside an `Arc` so they can register themselves as sinks
//! of their sources.

mod buffered;
mod op_image;

pub use buffered::BufferedImage;
pub use op_image::{
    CobbledKernel, ComputeStrategy, OpImage, OpImageConfig, Operation, UncobbledKernel,
};

use crate::core::error::{ImageId, TileError, TileResult};
use crate::core::geometry::{Rectangle, TileIndex};
use crate::core::layout::Layout;
use crate::core::properties::PropertyTable;
use crate::core::raster::{PixelFormat, Raster};
use crate::core::tile_grid::{TileGrid, TileRange};
use crate::core::types::Value;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A shared rendered image.
pub type SharedImage = Arc<dyn PlanarImage>;

/// A weak reference to a rendered image.
pub type WeakImage = Weak<dyn PlanarImage>;

// ============================================================================
// Image Core
// ============================================================================

/// State shared by every rendered image.
pub struct ImageCore {
    id: ImageId,
    layout: RwLock<Layout>,
    sources: RwLock<Vec<SharedImage>>,
    sinks: Mutex<Vec<WeakImage>>,
    properties: RwLock<PropertyTable>,
    disposed: AtomicBool,
    this: WeakImage,
}

impl ImageCore {
    /// Create the core of a new image and register `this` as a sink of
    /// every source. `this` is the weak handle of the image being built.
    pub fn new(this: WeakImage, layout: Layout, sources: Vec<SharedImage>) -> Self {
        for source in &sources {
            source.core().add_sink(this.clone());
        }
        Self {
            id: ImageId::new(),
            layout: RwLock::new(layout),
            sources: RwLock::new(sources),
            sinks: Mutex::new(Vec::new()),
            properties: RwLock::new(PropertyTable::new()),
            disposed: AtomicBool::new(false),
            this,
        }
    }

    /// Identity of the image.
    pub fn id(&self) -> ImageId {
        self.id
    }

    /// Current layout.
    pub fn layout(&self) -> Layout {
        *self.layout.read()
    }

    /// Replace the layout. Only resizable images do this.
    pub fn set_layout(&self, layout: Layout) {
        *self.layout.write() = layout;
    }

    // ------------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------------

    /// The sources, in order.
    pub fn sources(&self) -> Vec<SharedImage> {
        self.sources.read().clone()
    }

    /// The source at `index`.
    pub fn source(&self, index: usize) -> TileResult<SharedImage> {
        let sources = self.sources.read();
        sources
            .get(index)
            .cloned()
            .ok_or(TileError::SourceIndexOutOfRange {
                image: self.id,
                index,
                count: sources.len(),
            })
    }

    /// Number of sources.
    pub fn num_sources(&self) -> usize {
        self.sources.read().len()
    }

    /// Append a source and register this image as its sink.
    pub fn add_source(&self, source: SharedImage) {
        source.core().add_sink(self.this.clone());
        self.sources.write().push(source);
    }

    /// Remove a source and deregister this image from it. Returns whether
    /// the source was present.
    pub fn remove_source(&self, source_id: ImageId) -> bool {
        let removed = {
            let mut sources = self.sources.write();
            match sources.iter().position(|s| s.id() == source_id) {
                Some(position) => Some(sources.remove(position)),
                None => None,
            }
        };
        match removed {
            Some(source) => {
                source.core().remove_sink(self.id);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Sinks
    // ------------------------------------------------------------------------

    /// Live sinks. Entries whose image has been dropped are pruned.
    pub fn sinks(&self) -> Vec<SharedImage> {
        let mut sinks = self.sinks.lock();
        let mut live = Vec::with_capacity(sinks.len());
        sinks.retain(|weak| match weak.upgrade() {
            Some(sink) => {
                live.push(sink);
                true
            }
            None => false,
        });
        live
    }

    /// Register a sink.
    pub fn add_sink(&self, sink: WeakImage) {
        self.sinks.lock().push(sink);
    }

    /// Deregister a sink. Returns whether it was registered.
    pub fn remove_sink(&self, sink_id: ImageId) -> bool {
        let mut sinks = self.sinks.lock();
        let before = sinks.len();
        sinks.retain(|weak| weak.upgrade().map_or(true, |s| s.id() != sink_id));
        sinks.len() != before
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    /// Look up an image property.
    pub fn property(&self, name: &str) -> Option<Value> {
        self.properties.read().get(name).cloned()
    }

    /// Set an image property.
    pub fn set_property(&self, name: &str, value: Value) {
        self.properties.write().set(name, value);
    }

    /// Remove an image property.
    pub fn remove_property(&self, name: &str) -> Option<Value> {
        self.properties.write().remove(name)
    }

    /// Names of the image properties.
    pub fn property_names(&self) -> Vec<String> {
        self.properties.read().names()
    }

    // ------------------------------------------------------------------------
    // Disposal
    // ------------------------------------------------------------------------

    /// Whether the image has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Mark the image disposed. Returns true only for the first call.
    pub fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }

    /// Remove this image from the sink lists of its sources.
    pub fn detach_from_sources(&self) {
        for source in self.sources.read().iter() {
            source.core().remove_sink(self.id);
        }
    }
}

// ============================================================================
// PlanarImage Trait
// ============================================================================

/// A rendered image made of tiles.
pub trait PlanarImage: Send + Sync {
    /// Shared image state.
    fn core(&self) -> &ImageCore;

    /// The tile at `(tile_x, tile_y)`; `None` outside the tile range.
    fn get_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Option<Raster>>;

    /// Whether tile contents can change after they were handed out.
    fn is_writable(&self) -> bool {
        false
    }

    /// Downcast to a tile-computing image.
    fn as_op_image(&self) -> Option<&OpImage> {
        None
    }

    /// Several tiles, in input order. Entries outside the tile range are `None`.
    fn get_tiles(&self, indices: &[TileIndex]) -> TileResult<Vec<Option<Raster>>> {
        indices.iter().map(|i| self.get_tile(i.x, i.y)).collect()
    }

    /// Release the image: detach it from its sources. Idempotent.
    fn dispose(&self) {
        if self.core().mark_disposed() {
            self.core().detach_from_sources();
        }
    }

    /// Look up an image property.
    fn get_property(&self, name: &str) -> Option<Value> {
        self.core().property(name)
    }

    // ------------------------------------------------------------------------
    // Layout accessors
    // ------------------------------------------------------------------------

    /// Identity of the image.
    fn id(&self) -> ImageId {
        self.core().id()
    }

    /// Current layout.
    fn layout(&self) -> Layout {
        self.core().layout()
    }

    /// Image bounds.
    fn bounds(&self) -> Rectangle {
        self.layout().bounds
    }

    /// Left edge.
    fn min_x(&self) -> i32 {
        self.bounds().x
    }

    /// Top edge.
    fn min_y(&self) -> i32 {
        self.bounds().y
    }

    /// Width in pixels.
    fn width(&self) -> i32 {
        self.bounds().width
    }

    /// Height in pixels.
    fn height(&self) -> i32 {
        self.bounds().height
    }

    /// Exclusive right edge.
    fn max_x(&self) -> i32 {
        self.bounds().max_x()
    }

    /// Exclusive bottom edge.
    fn max_y(&self) -> i32 {
        self.bounds().max_y()
    }

    /// Tile grid.
    fn tile_grid(&self) -> TileGrid {
        self.layout().grid
    }

    /// Tile width.
    fn tile_width(&self) -> i32 {
        self.tile_grid().tile_width
    }

    /// Tile height.
    fn tile_height(&self) -> i32 {
        self.tile_grid().tile_height
    }

    /// Pixel column where tile column 0 starts.
    fn tile_grid_x_offset(&self) -> i32 {
        self.tile_grid().x_offset
    }

    /// Pixel row where tile row 0 starts.
    fn tile_grid_y_offset(&self) -> i32 {
        self.tile_grid().y_offset
    }

    /// Pixel format.
    fn format(&self) -> PixelFormat {
        self.layout().format
    }

    /// Column of the tile containing pixel column `x`.
    fn x_to_tile_x(&self, x: i32) -> i32 {
        self.tile_grid().x_to_tile_x(x)
    }

    /// Row of the tile containing pixel row `y`.
    fn y_to_tile_y(&self, y: i32) -> i32 {
        self.tile_grid().y_to_tile_y(y)
    }

    /// Left edge of tile column `tile_x`.
    fn tile_x_to_x(&self, tile_x: i32) -> i32 {
        self.tile_grid().tile_x_to_x(tile_x)
    }

    /// Top edge of tile row `tile_y`.
    fn tile_y_to_y(&self, tile_y: i32) -> i32 {
        self.tile_grid().tile_y_to_y(tile_y)
    }

    /// Tiles covering the image.
    fn tile_range(&self) -> TileRange {
        let layout = self.layout();
        layout.grid.tile_range(&layout.bounds)
    }

    /// First tile column.
    fn min_tile_x(&self) -> i32 {
        self.tile_range().min_x
    }

    /// First tile row.
    fn min_tile_y(&self) -> i32 {
        self.tile_range().min_y
    }

    /// Last tile column (inclusive).
    fn max_tile_x(&self) -> i32 {
        self.tile_range().max_x
    }

    /// Last tile row (inclusive).
    fn max_tile_y(&self) -> i32 {
        self.tile_range().max_y
    }

    /// Number of tile columns.
    fn num_x_tiles(&self) -> i32 {
        let range = self.tile_range();
        (range.max_x - range.min_x + 1).max(0)
    }

    /// Number of tile rows.
    fn num_y_tiles(&self) -> i32 {
        let range = self.tile_range();
        (range.max_y - range.min_y + 1).max(0)
    }

    /// Whether `(tile_x, tile_y)` is inside the tile range.
    fn contains_tile(&self, tile_x: i32, tile_y: i32) -> bool {
        self.tile_range().contains(TileIndex::new(tile_x, tile_y))
    }

    /// Tile rectangle clipped to the image bounds. Empty for tiles outside
    /// the image.
    fn tile_rect(&self, tile_x: i32, tile_y: i32) -> Rectangle {
        let layout = self.layout();
        layout
            .grid
            .nominal_tile_rect(tile_x, tile_y)
            .intersection(&layout.bounds)
    }

    /// Tiles of this image overlapping `region`, in row-major order.
    fn tile_indices(&self, region: &Rectangle) -> Vec<TileIndex> {
        let layout = self.layout();
        layout
            .grid
            .tile_range(&region.intersection(&layout.bounds))
            .iter()
            .collect()
    }

    /// Whether `rect` touches more than one tile of the grid.
    fn overlaps_multiple_tiles(&self, rect: &Rectangle) -> bool {
        let range = self.tile_grid().tile_range(rect);
        !range.is_empty() && (range.min_x != range.max_x || range.min_y != range.max_y)
    }

    // ------------------------------------------------------------------------
    // Region extraction
    // ------------------------------------------------------------------------

    /// A tile that must exist because its index is in range.
    fn require_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Raster> {
        self.get_tile(tile_x, tile_y)?.ok_or(TileError::MissingTile {
            image: self.id(),
            tile_x,
            tile_y,
        })
    }

    /// Pixel data of `region` (the whole image for `None`) as one raster.
    ///
    /// A region inside a single tile of an immutable image is returned as a
    /// view of that tile; writable images always return a copy. Parts of the
    /// region outside the image bounds are zero.
    fn get_data(&self, region: Option<&Rectangle>) -> TileResult<Raster> {
        let layout = self.layout();
        let bounds = layout.bounds;
        let region = match region {
            None => bounds,
            Some(region) => {
                if !region.intersects(&bounds) {
                    return Err(TileError::RegionOutsideBounds {
                        region: *region,
                        bounds,
                    });
                }
                *region
            }
        };

        let range = layout.grid.tile_range(&region.intersection(&bounds));
        if range.len() == 1 {
            let tile_rect = layout
                .grid
                .nominal_tile_rect(range.min_x, range.min_y)
                .intersection(&bounds);
            if tile_rect.contains(&region) {
                let tile = self.require_tile(range.min_x, range.min_y)?;
                if !self.is_writable() {
                    if let Some(view) = tile.child(&region) {
                        return Ok(view);
                    }
                }
                return tile.deep_copy(&region);
            }
        }

        let mut dest = Raster::new(region, layout.format)?;
        let indices: Vec<TileIndex> = range.iter().collect();
        let tiles = self.get_tiles(&indices)?;
        for (index, tile) in indices.iter().zip(tiles) {
            let tile = tile.ok_or(TileError::MissingTile {
                image: self.id(),
                tile_x: index.x,
                tile_y: index.y,
            })?;
            dest.copy_rect_from(&tile, &bounds);
        }
        Ok(dest)
    }

    /// Copy the part of the image overlapping `dest` into it.
    fn copy_data(&self, dest: &mut Raster) -> TileResult<()> {
        let layout = self.layout();
        let region = dest.bounds().intersection(&layout.bounds);
        if region.is_empty() {
            return Ok(());
        }
        let indices: Vec<TileIndex> = layout.grid.tile_range(&region).iter().collect();
        let tiles = self.get_tiles(&indices)?;
        for (index, tile) in indices.iter().zip(tiles) {
            let tile = tile.ok_or(TileError::MissingTile {
                image: self.id(),
                tile_x: index.x,
                tile_y: index.y,
            })?;
            dest.copy_rect_from(&tile, &region);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Graph
    // ------------------------------------------------------------------------

    /// The sources, in order.
    fn sources(&self) -> Vec<SharedImage> {
        self.core().sources()
    }

    /// The source at `index`.
    fn source(&self, index: usize) -> TileResult<SharedImage> {
        self.core().source(index)
    }

    /// Number of sources.
    fn num_sources(&self) -> usize {
        self.core().num_sources()
    }

    /// Live sinks.
    fn sinks(&self) -> Vec<SharedImage> {
        self.core().sinks()
    }
}

impl fmt::Debug for dyn PlanarImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanarImage")
            .field("id", &self.id())
            .field("bounds", &self.bounds())
            .field("sources", &self.num_sources())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{pattern_value, PatternImage};

    fn buffered(bounds: Rectangle, tile: i32) -> Arc<BufferedImage> {
        let layout = Layout::new(bounds, tile, tile, PixelFormat::gray()).unwrap();
        let image = BufferedImage::new(layout).unwrap();
        for y in bounds.y..bounds.max_y() {
            for x in bounds.x..bounds.max_x() {
                image.set_sample(x, y, 0, pattern_value(x, y));
            }
        }
        image
    }

    #[test]
    fn test_tile_range_and_rects() {
        let image = buffered(Rectangle::new(0, 0, 100, 70), 64);
        assert_eq!(image.num_x_tiles(), 2);
        assert_eq!(image.num_y_tiles(), 2);
        assert_eq!(image.tile_rect(1, 1), Rectangle::new(64, 64, 36, 6));
        assert!(image.tile_rect(2, 0).is_empty());
        assert!(image.tile_rect(-1, 0).is_empty());
    }

    #[test]
    fn test_out_of_range_tiles_are_absent() {
        let image = buffered(Rectangle::new(0, 0, 100, 70), 64);
        for (tx, ty) in [(-1, 0), (0, -1), (2, 0), (0, 2), (5, 5)] {
            assert!(image.get_tile(tx, ty).unwrap().is_none());
        }
        assert!(image.get_tile(1, 1).unwrap().is_some());
    }

    #[test]
    fn test_copy_data_matches_manual_crop() {
        // 2x2 tiles, the right column and bottom row are partial.
        let image = buffered(Rectangle::new(0, 0, 100, 70), 64);
        let region = Rectangle::new(10, 20, 85, 48);
        let mut dest = Raster::new(region, PixelFormat::gray()).unwrap();
        image.copy_data(&mut dest).unwrap();

        let mut manual = Raster::new(region, PixelFormat::gray()).unwrap();
        for ty in 0..2 {
            for tx in 0..2 {
                let tile = image.get_tile(tx, ty).unwrap().unwrap();
                let crop = tile.bounds().intersection(&region);
                for y in crop.y..crop.max_y() {
                    for x in crop.x..crop.max_x() {
                        manual.set_sample(x, y, 0, tile.sample(x, y, 0));
                    }
                }
            }
        }

        assert_eq!(dest, manual);
        assert_eq!(dest.sample(64, 64, 0), pattern_value(64, 64));
        assert_eq!(dest.sample(63, 63, 0), pattern_value(63, 63));
    }

    #[test]
    fn test_get_data_across_tile_boundaries_is_exact() {
        let image = PatternImage::new(Rectangle::new(-5, -3, 37, 29), 8, 6);
        let region = Rectangle::new(-5, -3, 37, 29);
        let data = image.get_data(Some(&region)).unwrap();
        for y in region.y..region.max_y() {
            for x in region.x..region.max_x() {
                assert_eq!(data.sample(x, y, 0), pattern_value(x, y), "pixel ({}, {})", x, y);
            }
        }
    }

    #[test]
    fn test_get_data_single_tile_view_for_immutable_image() {
        let image = PatternImage::new(Rectangle::new(0, 0, 64, 64), 32, 32);
        let region = Rectangle::new(2, 2, 10, 10);
        let data = image.get_data(Some(&region)).unwrap();
        let tile = image.get_tile(0, 0).unwrap().unwrap();
        assert!(data.shares_buffer_with(&tile));
        assert_eq!(data.bounds(), region);
    }

    #[test]
    fn test_get_data_copies_for_writable_image() {
        let image = buffered(Rectangle::new(0, 0, 64, 64), 32);
        let region = Rectangle::new(2, 2, 10, 10);
        let data = image.get_data(Some(&region)).unwrap();
        let tile = image.get_tile(0, 0).unwrap().unwrap();
        assert!(!data.shares_buffer_with(&tile));

        image.set_sample(3, 3, 0, -1.0);
        assert_eq!(data.sample(3, 3, 0), pattern_value(3, 3));
    }

    #[test]
    fn test_get_data_rejects_disjoint_region() {
        let image = buffered(Rectangle::new(0, 0, 16, 16), 8);
        let err = image.get_data(Some(&Rectangle::new(100, 100, 4, 4))).unwrap_err();
        assert!(matches!(err, TileError::RegionOutsideBounds { .. }));
    }

    #[test]
    fn test_get_data_pads_outside_bounds_with_zero() {
        let image = buffered(Rectangle::new(0, 0, 16, 16), 8);
        let data = image.get_data(Some(&Rectangle::new(12, 12, 8, 8))).unwrap();
        assert_eq!(data.sample(13, 13, 0), pattern_value(13, 13));
        assert_eq!(data.sample(18, 18, 0), 0.0);
    }

    #[test]
    fn test_sources_register_weak_sinks() {
        let source = buffered(Rectangle::new(0, 0, 16, 16), 8);
        let sink = PatternImage::with_sources(Rectangle::new(0, 0, 16, 16), 8, 8, vec![source.clone()]);
        assert_eq!(source.sinks().len(), 1);
        assert_eq!(source.sinks()[0].id(), sink.id());

        drop(sink);
        assert!(source.sinks().is_empty());
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let source = buffered(Rectangle::new(0, 0, 16, 16), 8);
        let sink = PatternImage::with_sources(Rectangle::new(0, 0, 16, 16), 8, 8, vec![source.clone()]);

        sink.dispose();
        let after_first = (source.sinks().len(), sink.core().is_disposed(), sink.num_sources());
        sink.dispose();
        let after_second = (source.sinks().len(), sink.core().is_disposed(), sink.num_sources());

        assert_eq!(after_first, (0, true, 1));
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn test_add_and_remove_source() {
        let a = buffered(Rectangle::new(0, 0, 8, 8), 8);
        let sink = PatternImage::new(Rectangle::new(0, 0, 8, 8), 8, 8);
        sink.core().add_source(a.clone());
        assert_eq!(a.sinks().len(), 1);

        assert!(sink.core().remove_source(a.id()));
        assert!(a.sinks().is_empty());
        assert!(!sink.core().remove_source(a.id()));
        assert!(matches!(sink.source(0), Err(TileError::SourceIndexOutOfRange { .. })));
    }
}
