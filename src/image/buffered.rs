//! In-memory writable image.

use crate::core::error::{Result, TileResult};
use crate::core::geometry::Rectangle;
use crate::core::layout::Layout;
use crate::core::raster::{PixelFormat, Raster};
use crate::image::{ImageCore, PlanarImage, SharedImage};
use image::DynamicImage;
use parking_lot::RwLock;
use std::sync::Arc;

/// A writable image backed by a single in-memory raster and exposed
/// through a tile grid.
///
/// Tiles handed out are snapshots: later writes detach the image's storage
/// and do not show through earlier tiles.
pub struct BufferedImage {
    core: ImageCore,
    data: RwLock<Raster>,
}

impl BufferedImage {
    /// A zero-filled image.
    pub fn new(layout: Layout) -> TileResult<Arc<Self>> {
        let data = Raster::new(layout.bounds, layout.format)?;
        Ok(Self::assemble(layout, data))
    }

    /// Wrap an existing raster, tiled with the given tile size.
    pub fn from_raster(raster: Raster, tile_width: i32, tile_height: i32) -> Result<Arc<Self>> {
        let layout = Layout::new(raster.bounds(), tile_width, tile_height, raster.format())?;
        Ok(Self::assemble(layout, raster))
    }

    /// Convert a decoded image to a four-band image at the origin. Samples
    /// are normalized to `0.0..=1.0`.
    pub fn from_dynamic_image(image: &DynamicImage, tile_width: i32, tile_height: i32) -> Result<Arc<Self>> {
        let rgba = image.to_rgba32f();
        let bounds = Rectangle::new(0, 0, rgba.width() as i32, rgba.height() as i32);
        let raster = Raster::from_samples(bounds, PixelFormat::rgba(), rgba.into_raw())?;
        Self::from_raster(raster, tile_width, tile_height)
    }

    fn assemble(layout: Layout, data: Raster) -> Arc<Self> {
        Arc::new_cyclic(|this: &std::sync::Weak<Self>| {
            let weak: std::sync::Weak<dyn PlanarImage> = this.clone();
            Self {
                core: ImageCore::new(weak, layout, Vec::<SharedImage>::new()),
                data: RwLock::new(data),
            }
        })
    }

    /// Set one sample.
    pub fn set_sample(&self, x: i32, y: i32, band: usize, value: f32) {
        self.data.write().set_sample(x, y, band, value);
    }

    /// Copy the overlapping part of `raster` into the image.
    pub fn set_data(&self, raster: &Raster) {
        self.data.write().copy_from(raster);
    }

    /// A snapshot of the whole image.
    pub fn snapshot(&self) -> Raster {
        self.data.read().clone()
    }
}

impl PlanarImage for BufferedImage {
    fn core(&self) -> &ImageCore {
        &self.core
    }

    fn get_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Option<Raster>> {
        if !self.contains_tile(tile_x, tile_y) {
            return Ok(None);
        }
        let rect = self.tile_rect(tile_x, tile_y);
        let data = self.data.read();
        match data.child(&rect) {
            Some(tile) => Ok(Some(tile)),
            None => data.deep_copy(&rect).map(Some),
        }
    }

    fn is_writable(&self) -> bool {
        true
    }
}
