//! # Tessera - Deferred Tiled Imaging
//!
//! Tessera evaluates image processing graphs lazily, one tile at a time.
//! Operations are described by deferred nodes and only rendered when pixels
//! are requested; computed tiles are kept in a shared, memory-bounded cache
//! and recomputed only where an edit actually changed them.
//!
//! ## Features
//!
//! - **Tiled images**: every image is split into a grid of fixed-size tiles
//!   that are computed on demand and cached
//! - **Region extraction**: arbitrary rectangles are cobbled from the tiles
//!   they touch
//! - **Parallel scheduling**: tiles are computed on a rayon pool, either
//!   synchronously or as background requests with listeners
//! - **Incremental invalidation**: editing a node keeps every cached tile
//!   outside the changed region, downstream nodes included
//! - **Extensible**: new operations implement [`OperationDescriptor`] or are
//!   registered as factory closures
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tessera::prelude::*;
//!
//! let session = Session::new(&TesseraConfig::default())?;
//!
//! let base = session.create(
//!     "constant",
//!     ParameterBlock::new().with_parameter(1024).with_parameter(768).with_parameter(0.25),
//!     RenderingHints::new(),
//! )?;
//! let blurred = session.create(
//!     "box_filter",
//!     ParameterBlock::new().with_source(base.clone()).with_parameter(2),
//!     RenderingHints::new(),
//! )?;
//!
//! // Renders lazily and computes only the tiles under the region.
//! let pixels = blurred.get_data(Some(&Rectangle::new(100, 100, 64, 64)))?;
//!
//! // Re-renders both nodes; downstream listeners are told what changed.
//! base.set_parameter(2, 0.5)?;
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: geometry, tile grids, layouts, rasters, values and errors
//! - [`image`]: the [`PlanarImage`] interface, in-memory images and
//!   tile-computing [`OpImage`]s
//! - [`execution`]: tile cache, scheduler, requests and tile recycling
//! - [`graph`]: deferred nodes and change propagation
//! - [`operations`]: operation registry and built-in operations
//! - [`config`] and [`session`]: runtime configuration and shared defaults
//!
//! [`OperationDescriptor`]: operations::OperationDescriptor
//! [`PlanarImage`]: image::PlanarImage
//! [`OpImage`]: image::OpImage

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod core;
pub mod execution;
pub mod graph;
pub mod image;
pub mod operations;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```rust,ignore
/// use tessera::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::geometry::{Rectangle, Region, TileIndex};
    pub use crate::core::hints::{keys, HintValue, RenderingHints};
    pub use crate::core::layout::{ImageLayout, Layout};
    pub use crate::core::raster::{PixelFormat, Raster};
    pub use crate::core::tile_grid::{TileGrid, TileRange};
    pub use crate::core::types::Value;

    // Errors
    pub use crate::core::error::{
        ConfigError, GraphError, ImageId, LayoutError, NodeId, TesseraError, TileError,
    };

    // Images
    pub use crate::image::{
        BufferedImage, CobbledKernel, OpImage, OpImageConfig, Operation, PlanarImage, SharedImage,
        UncobbledKernel,
    };

    // Execution
    pub use crate::execution::cache::{CacheStats, MemoryTileCache, SharedTileCache, TileCache, TileMetric};
    pub use crate::execution::recycler::{TilePool, TileRecycler};
    pub use crate::execution::request::{CallbackListener, TileEvent, TileRequest, TileStatus};
    pub use crate::execution::scheduler::{default_scheduler, SharedScheduler, ThreadPoolScheduler, TileScheduler};

    // Graph
    pub use crate::graph::{
        NodeSource, ParameterBlock, RenderedOp, RenderingChangeEvent, RenderingChangeListener,
        ResolvedParameters,
    };

    // Operations
    pub use crate::operations::{
        Category, InvalidRegionQuery, OperationDescriptor, OperationMetadata, OperationRegistry, ParameterSpec,
    };

    // Configuration
    pub use crate::config::{CacheConfig, SchedulerConfig, TesseraConfig};
    pub use crate::session::Session;
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
