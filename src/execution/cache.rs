//! Tile caching.
//!
//! Images store computed tiles in a [`TileCache`] keyed by the owning image
//! and the tile index, so tiles of different images never collide. The
//! bundled [`MemoryTileCache`] bounds the total bytes held: once an insertion
//! pushes usage over the capacity it evicts down to `capacity * threshold`,
//! choosing victims among the least recently used entries and preferring
//! those with the lowest [`TileMetric`].

use crate::core::error::ImageId;
use crate::core::geometry::TileIndex;
use crate::core::raster::Raster;
use log::debug;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Default cache capacity: 64 MiB.
pub const DEFAULT_MEMORY_CAPACITY: u64 = 64 * 1024 * 1024;

/// Default fraction of the capacity retained after an eviction pass.
pub const DEFAULT_MEMORY_THRESHOLD: f32 = 0.75;

/// Number of least recently used entries considered per eviction.
const EVICTION_WINDOW: usize = 8;

/// Eviction priority of a cached tile. Higher values are kept longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TileMetric(pub i64);

/// A store of computed tiles.
///
/// Implementations must be safe under concurrent calls from threads
/// computing tiles of the same image.
pub trait TileCache: Send + Sync {
    /// Look up a tile.
    fn get_tile(&self, owner: ImageId, tile_x: i32, tile_y: i32) -> Option<Raster>;

    /// Store a tile, replacing any previous entry for the same key.
    fn add(&self, owner: ImageId, tile_x: i32, tile_y: i32, tile: Raster, metric: Option<TileMetric>);

    /// Drop a single tile.
    fn remove(&self, owner: ImageId, tile_x: i32, tile_y: i32);

    /// Drop every tile owned by `owner`.
    fn remove_tiles(&self, owner: ImageId);

    /// Every resident tile owned by `owner`.
    fn tiles(&self, owner: ImageId) -> Vec<(TileIndex, Raster)>;

    /// Drop every tile.
    fn flush(&self);

    /// Capacity in bytes.
    fn memory_capacity(&self) -> u64;
}

/// A shared tile cache.
pub type SharedTileCache = Arc<dyn TileCache>;

/// Key of a cached tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileKey {
    /// Image owning the tile.
    pub owner: ImageId,
    /// Tile index within the owner.
    pub index: TileIndex,
}

impl TileKey {
    /// Create a new cache key.
    pub fn new(owner: ImageId, tile_x: i32, tile_y: i32) -> Self {
        Self {
            owner,
            index: TileIndex::new(tile_x, tile_y),
        }
    }
}

/// Cached tile with metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached tile.
    pub tile: Raster,
    /// Eviction priority.
    pub metric: Option<TileMetric>,
    /// When the entry was created.
    pub created_at: Instant,
    /// Bytes charged against the capacity.
    pub memory_size: usize,
}

impl CacheEntry {
    /// Create a new cache entry.
    pub fn new(tile: Raster, metric: Option<TileMetric>) -> Self {
        let memory_size = tile.memory_size();
        Self {
            tile,
            metric,
            created_at: Instant::now(),
            memory_size,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of tiles added.
    pub additions: u64,
    /// Number of entries evicted to respect the capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate hit ratio.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

struct CacheState {
    lru: LruCache<TileKey, CacheEntry>,
    owners: HashMap<ImageId, HashSet<TileIndex>>,
    current_memory: u64,
    memory_capacity: u64,
    memory_threshold: f32,
}

impl CacheState {
    fn remove(&mut self, key: &TileKey) -> Option<CacheEntry> {
        let entry = self.lru.pop(key)?;
        self.current_memory = self.current_memory.saturating_sub(entry.memory_size as u64);
        if let Some(indices) = self.owners.get_mut(&key.owner) {
            indices.remove(&key.index);
            if indices.is_empty() {
                self.owners.remove(&key.owner);
            }
        }
        Some(entry)
    }

    /// Lowest-metric entry among the least recently used ones. Entries
    /// without a metric rank below every metric.
    fn eviction_candidate(&self) -> Option<TileKey> {
        self.lru
            .iter()
            .rev()
            .take(EVICTION_WINDOW)
            .enumerate()
            .min_by_key(|(age, (_, entry))| (entry.metric, *age))
            .map(|(_, (key, _))| *key)
    }

    /// Evict down to the threshold once over capacity. Returns the number
    /// of evicted entries.
    fn memory_control(&mut self) -> u64 {
        if self.current_memory <= self.memory_capacity {
            return 0;
        }
        let target = (self.memory_capacity as f64 * self.memory_threshold as f64) as u64;
        let mut evicted = 0;
        while self.current_memory > target {
            let Some(key) = self.eviction_candidate() else {
                break;
            };
            self.remove(&key);
            evicted += 1;
        }
        evicted
    }
}

/// Thread-safe, memory-bounded LRU tile cache.
pub struct MemoryTileCache {
    state: Mutex<CacheState>,
    stats: Mutex<CacheStats>,
}

impl MemoryTileCache {
    /// Create a cache holding at most `memory_capacity` bytes.
    pub fn new(memory_capacity: u64) -> Self {
        Self {
            state: Mutex::new(CacheState {
                lru: LruCache::unbounded(),
                owners: HashMap::new(),
                current_memory: 0,
                memory_capacity,
                memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            }),
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// Set the fraction of the capacity kept after eviction, clamped to `0.0..=1.0`.
    pub fn with_memory_threshold(self, threshold: f32) -> Self {
        self.state.lock().memory_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Change the capacity, evicting immediately if usage now exceeds it.
    pub fn set_memory_capacity(&self, memory_capacity: u64) {
        let evicted = {
            let mut state = self.state.lock();
            state.memory_capacity = memory_capacity;
            state.memory_control()
        };
        self.record_evictions(evicted);
    }

    /// Fraction of the capacity kept after eviction.
    pub fn memory_threshold(&self) -> f32 {
        self.state.lock().memory_threshold
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }

    /// Get current memory usage in bytes.
    pub fn memory_usage(&self) -> u64 {
        self.state.lock().current_memory
    }

    /// Get number of cached tiles.
    pub fn len(&self) -> usize {
        self.state.lock().lru.len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a tile is resident, without touching its recency.
    pub fn contains(&self, owner: ImageId, tile_x: i32, tile_y: i32) -> bool {
        self.state
            .lock()
            .lru
            .contains(&TileKey::new(owner, tile_x, tile_y))
    }

    fn record_evictions(&self, evicted: u64) {
        if evicted > 0 {
            debug!("Tile cache evicted {} tiles", evicted);
            self.stats.lock().evictions += evicted;
        }
    }
}

impl Default for MemoryTileCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

impl TileCache for MemoryTileCache {
    fn get_tile(&self, owner: ImageId, tile_x: i32, tile_y: i32) -> Option<Raster> {
        let tile = self
            .state
            .lock()
            .lru
            .get(&TileKey::new(owner, tile_x, tile_y))
            .map(|entry| entry.tile.clone());

        let mut stats = self.stats.lock();
        if tile.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        tile
    }

    fn add(&self, owner: ImageId, tile_x: i32, tile_y: i32, tile: Raster, metric: Option<TileMetric>) {
        let key = TileKey::new(owner, tile_x, tile_y);
        let entry = CacheEntry::new(tile, metric);
        let entry_size = entry.memory_size as u64;

        let evicted = {
            let mut state = self.state.lock();
            state.remove(&key);
            state.current_memory += entry_size;
            state.lru.put(key, entry);
            state.owners.entry(owner).or_default().insert(key.index);
            state.memory_control()
        };

        self.stats.lock().additions += 1;
        self.record_evictions(evicted);
    }

    fn remove(&self, owner: ImageId, tile_x: i32, tile_y: i32) {
        self.state.lock().remove(&TileKey::new(owner, tile_x, tile_y));
    }

    fn remove_tiles(&self, owner: ImageId) {
        let mut state = self.state.lock();
        let Some(indices) = state.owners.remove(&owner) else {
            return;
        };
        let mut freed = 0u64;
        for index in indices {
            if let Some(entry) = state.lru.pop(&TileKey { owner, index }) {
                freed += entry.memory_size as u64;
            }
        }
        state.current_memory = state.current_memory.saturating_sub(freed);
    }

    fn tiles(&self, owner: ImageId) -> Vec<(TileIndex, Raster)> {
        let state = self.state.lock();
        let Some(indices) = state.owners.get(&owner) else {
            return Vec::new();
        };
        let mut tiles: Vec<_> = indices
            .iter()
            .filter_map(|&index| {
                state
                    .lru
                    .peek(&TileKey { owner, index })
                    .map(|entry| (index, entry.tile.clone()))
            })
            .collect();
        tiles.sort_by_key(|(index, _)| (index.y, index.x));
        tiles
    }

    fn flush(&self) {
        let mut state = self.state.lock();
        state.lru.clear();
        state.owners.clear();
        state.current_memory = 0;
    }

    fn memory_capacity(&self) -> u64 {
        self.state.lock().memory_capacity
    }
}
