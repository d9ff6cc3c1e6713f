//! Rendering hints: per-node configuration passed to operation factories.
//!
//! Hints are an ordered map from well-known keys to [`HintValue`]s. A node's
//! own hints are merged over the ambient defaults of its session, local
//! values taking precedence. Consumers read hints leniently: a value of the
//! wrong kind under a well-known key is ignored, not reported.

use crate::core::layout::ImageLayout;
use crate::core::types::Value;
use crate::execution::cache::{SharedTileCache, TileMetric};
use crate::execution::recycler::SharedRecycler;
use crate::execution::scheduler::SharedScheduler;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Well-known hint keys.
pub mod keys {
    /// Tile cache an image stores computed tiles in.
    pub const TILE_CACHE: &str = "tile_cache";
    /// Scheduler that computes tiles.
    pub const TILE_SCHEDULER: &str = "tile_scheduler";
    /// Partial layout an operation should use for its rendering.
    pub const IMAGE_LAYOUT: &str = "image_layout";
    /// Eviction metric attached to every tile an image caches.
    pub const TILE_CACHE_METRIC: &str = "tile_cache_metric";
    /// Recycler for tile buffers.
    pub const TILE_RECYCLER: &str = "tile_recycler";
    /// Whether disposed images hand their cached tiles to the recycler.
    pub const CACHED_TILE_RECYCLING_ENABLED: &str = "cached_tile_recycling_enabled";
}

/// A hint value.
#[derive(Clone)]
pub enum HintValue {
    /// Plain value (numbers, flags, strings).
    Value(Value),
    /// Shared tile cache.
    TileCache(SharedTileCache),
    /// Shared tile scheduler.
    Scheduler(SharedScheduler),
    /// Shared tile recycler.
    Recycler(SharedRecycler),
    /// Partial image layout.
    Layout(ImageLayout),
    /// Tile cache metric.
    Metric(TileMetric),
}

impl HintValue {
    /// Name of the variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            HintValue::Value(_) => "value",
            HintValue::TileCache(_) => "tile cache",
            HintValue::Scheduler(_) => "scheduler",
            HintValue::Recycler(_) => "recycler",
            HintValue::Layout(_) => "layout",
            HintValue::Metric(_) => "metric",
        }
    }
}

fn same_arc<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl PartialEq for HintValue {
    /// Plain values compare by value, shared collaborators by identity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HintValue::Value(a), HintValue::Value(b)) => a == b,
            (HintValue::TileCache(a), HintValue::TileCache(b)) => same_arc(a, b),
            (HintValue::Scheduler(a), HintValue::Scheduler(b)) => same_arc(a, b),
            (HintValue::Recycler(a), HintValue::Recycler(b)) => same_arc(a, b),
            (HintValue::Layout(a), HintValue::Layout(b)) => a == b,
            (HintValue::Metric(a), HintValue::Metric(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for HintValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HintValue::Value(v) => write!(f, "Value({})", v),
            HintValue::Layout(l) => write!(f, "Layout({:?})", l),
            HintValue::Metric(m) => write!(f, "Metric({})", m.0),
            other => write!(f, "{}", other.kind()),
        }
    }
}

impl From<Value> for HintValue {
    fn from(v: Value) -> Self {
        HintValue::Value(v)
    }
}

impl From<SharedTileCache> for HintValue {
    fn from(v: SharedTileCache) -> Self {
        HintValue::TileCache(v)
    }
}

impl From<SharedScheduler> for HintValue {
    fn from(v: SharedScheduler) -> Self {
        HintValue::Scheduler(v)
    }
}

impl From<SharedRecycler> for HintValue {
    fn from(v: SharedRecycler) -> Self {
        HintValue::Recycler(v)
    }
}

impl From<ImageLayout> for HintValue {
    fn from(v: ImageLayout) -> Self {
        HintValue::Layout(v)
    }
}

impl From<TileMetric> for HintValue {
    fn from(v: TileMetric) -> Self {
        HintValue::Metric(v)
    }
}

/// An ordered set of rendering hints.
#[derive(Clone, Default, PartialEq)]
pub struct RenderingHints {
    entries: IndexMap<String, HintValue>,
}

impl RenderingHints {
    /// Create an empty hint set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<HintValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set a hint, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HintValue>) -> Option<HintValue> {
        self.entries.insert(key.into(), value.into())
    }

    /// Look up a hint.
    pub fn get(&self, key: &str) -> Option<&HintValue> {
        self.entries.get(key)
    }

    /// Look up a plain value hint.
    pub fn value(&self, key: &str) -> Option<&Value> {
        match self.entries.get(key) {
            Some(HintValue::Value(v)) => Some(v),
            _ => None,
        }
    }

    /// Remove a hint.
    pub fn remove(&mut self, key: &str) -> Option<HintValue> {
        self.entries.shift_remove(key)
    }

    /// Whether a hint is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of hints.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no hints.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate hints in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HintValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// These hints layered over `defaults`: every default is present unless
    /// a local hint with the same key replaces it.
    pub fn merged_over(&self, defaults: &RenderingHints) -> RenderingHints {
        let mut merged = defaults.clone();
        for (key, value) in &self.entries {
            merged.entries.insert(key.clone(), value.clone());
        }
        merged
    }
}

impl fmt::Debug for RenderingHints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}
