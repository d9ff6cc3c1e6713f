//! Core types for the Tessera tiled imaging runtime.
//!
//! This module contains the foundational pieces the rest of the crate is
//! built on:
//! - Geometry (rectangles, tile indices, regions)
//! - Tile grid arithmetic and image layouts
//! - Pixel buffers ([`Raster`])
//! - Parameter values, rendering hints and properties
//! - Error types

pub mod error;
pub mod geometry;
pub mod hints;
pub mod layout;
pub mod properties;
pub mod raster;
pub mod tile_grid;
pub mod types;

// Re-export commonly used types
pub use error::{ConfigError, GraphError, ImageId, LayoutError, NodeId, RequestId, TesseraError, TileError};
pub use geometry::{Rectangle, Region, TileIndex};
pub use hints::{HintValue, RenderingHints};
pub use layout::{ImageLayout, Layout};
pub use properties::PropertyTable;
pub use raster::{PixelFormat, Raster};
pub use tile_grid::{TileGrid, TileRange};
pub use types::Value;
