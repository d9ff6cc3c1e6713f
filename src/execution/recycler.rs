//! Reuse of tile buffers.
//!
//! Disposed images and cobbled source regions hand their buffers to a
//! [`TileRecycler`]; new tiles of the same geometry are then allocated from
//! the pool instead of the allocator.

use crate::core::geometry::Rectangle;
use crate::core::raster::{PixelFormat, Raster};
use log::trace;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A sink and source of reusable tile buffers.
pub trait TileRecycler: Send + Sync {
    /// Offer a raster for reuse. The recycler may drop it.
    fn recycle(&self, tile: Raster);

    /// A zero-filled raster covering `bounds`, built from a recycled buffer
    /// of matching size if one is available.
    fn reclaim(&self, bounds: Rectangle, format: PixelFormat) -> Option<Raster>;
}

/// A shared recycler.
pub type SharedRecycler = Arc<dyn TileRecycler>;

/// Buffers are pooled by sample count.
type PoolKey = usize;

/// A bounded pool of tile buffers.
pub struct TilePool {
    buffers: Mutex<HashMap<PoolKey, Vec<Raster>>>,
    max_per_size: usize,
}

impl TilePool {
    /// Create a pool keeping at most `max_per_size` buffers of each size.
    pub fn new(max_per_size: usize) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            max_per_size,
        }
    }

    /// Number of pooled buffers.
    pub fn len(&self) -> usize {
        self.buffers.lock().values().map(Vec::len).sum()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TilePool {
    fn default() -> Self {
        Self::new(16)
    }
}

fn pool_key(bounds: &Rectangle, format: PixelFormat) -> PoolKey {
    bounds.area().max(0) as usize * format.bands
}

impl TileRecycler for TilePool {
    fn recycle(&self, tile: Raster) {
        if tile.bounds().is_empty() {
            return;
        }
        let key = pool_key(&tile.bounds(), tile.format());
        let mut buffers = self.buffers.lock();
        let bucket = buffers.entry(key).or_default();
        if bucket.len() < self.max_per_size {
            bucket.push(tile);
        }
    }

    fn reclaim(&self, bounds: Rectangle, format: PixelFormat) -> Option<Raster> {
        let key = pool_key(&bounds, format);
        loop {
            let candidate = self.buffers.lock().get_mut(&key)?.pop()?;
            // A buffer still referenced elsewhere cannot be reused; drop it.
            let Some(mut samples) = candidate.into_samples() else {
                continue;
            };
            samples.fill(0.0);
            trace!("Reusing pooled buffer for {}", bounds);
            return Raster::from_samples(bounds, format, samples).ok();
        }
    }
}
