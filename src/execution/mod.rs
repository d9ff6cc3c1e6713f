//! Tile computation services.
//!
//! This module holds the collaborators an image uses to produce tiles: the
//! shared tile cache, the scheduler that computes tiles synchronously or in
//! the background, request handles with their listeners, and tile buffer
//! recycling.

pub mod cache;
pub mod recycler;
pub mod request;
pub mod scheduler;

pub use cache::{CacheStats, MemoryTileCache, SharedTileCache, TileCache, TileMetric};
pub use recycler::{SharedRecycler, TilePool, TileRecycler};
pub use request::{CallbackListener, SharedTileListener, TileComputationListener, TileEvent, TileRequest, TileStatus};
pub use scheduler::{default_scheduler, ComputeTarget, SharedScheduler, ThreadPoolScheduler, TileScheduler};
