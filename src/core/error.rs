//! Error types for Tessera.
//!
//! Uses thiserror for structured errors with context. Errors are split by the
//! layer that raises them:
//! - [`TileError`] for tile computation, region extraction and allocation
//! - [`LayoutError`] for image layout resolution
//! - [`GraphError`] for deferred nodes, the operation registry and edits
//! - [`ConfigError`] for loading and validating configuration
//!
//! Precondition violations in pure arithmetic (a zero tile size handed to the
//! tile-grid functions) are not represented here; they panic.

use crate::core::geometry::Rectangle;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create an identifier from a UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.0.to_string()[..8])
            }
        }
    };
}

define_id!(
    /// Identity of a rendered image. Tile cache entries are keyed by it.
    ImageId
);

define_id!(
    /// Identity of a deferred operation node.
    NodeId
);

define_id!(
    /// Identity of an asynchronous tile request.
    RequestId
);

/// Top-level error type for Tessera.
#[derive(Error, Debug)]
pub enum TesseraError {
    #[error("Tile error: {0}")]
    Tile(#[from] TileError),

    #[error("Layout error: {0}")]
    Layout(#[from] LayoutError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while computing or extracting tile data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TileError {
    /// A tile buffer could not be allocated.
    #[error("Out of memory allocating {requested_bytes} bytes for a raster")]
    OutOfMemory { requested_bytes: usize },

    /// An operation ran out of some resource while computing a tile.
    #[error("Resource exhausted computing tile ({tile_x}, {tile_y}) of image {image}: {detail}")]
    ResourceExhausted {
        image: ImageId,
        tile_x: i32,
        tile_y: i32,
        detail: String,
    },

    #[error("Computation of tile ({tile_x}, {tile_y}) of image {image} failed: {reason}")]
    ComputationFailed {
        image: ImageId,
        tile_x: i32,
        tile_y: i32,
        reason: String,
    },

    #[error("Region {region} does not intersect image bounds {bounds}")]
    RegionOutsideBounds { region: Rectangle, bounds: Rectangle },

    #[error("Source index {index} out of range for image {image} with {count} sources")]
    SourceIndexOutOfRange {
        image: ImageId,
        index: usize,
        count: usize,
    },

    /// A tile inside the image's tile range came back absent.
    #[error("Image {image} returned no data for tile ({tile_x}, {tile_y})")]
    MissingTile { image: ImageId, tile_x: i32, tile_y: i32 },

    #[error("Incompatible raster: {0}")]
    IncompatibleRaster(String),
}

impl TileError {
    /// Whether this error is a memory-pressure failure that the
    /// evict-and-retry policy may recover from.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self,
            TileError::OutOfMemory { .. } | TileError::ResourceExhausted { .. }
        )
    }

    /// Shorthand for a computation failure.
    pub fn computation_failed(
        image: ImageId,
        tile_x: i32,
        tile_y: i32,
        reason: impl Into<String>,
    ) -> Self {
        TileError::ComputationFailed {
            image,
            tile_x,
            tile_y,
            reason: reason.into(),
        }
    }
}

/// Errors raised while resolving an image layout.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Tile dimensions must be positive, got {width}x{height}")]
    InvalidTileSize { width: i32, height: i32 },

    #[error("Image dimensions must be non-negative, got {width}x{height}")]
    InvalidImageSize { width: i32, height: i32 },

    #[error("Layout is missing '{0}' and has no source to inherit it from")]
    Incomplete(&'static str),
}

/// Errors related to deferred nodes and the operation registry.
#[derive(Error, Debug, Clone)]
pub enum GraphError {
    #[error("Operation '{0}' is not registered")]
    UnknownOperation(String),

    /// The factory ran but produced no rendering.
    #[error("Operation '{name}' could not be instantiated")]
    NullRendering { name: String },

    #[error("Source index {index} out of range for node {node} with {count} sources")]
    SourceIndexOutOfRange {
        node: NodeId,
        index: usize,
        count: usize,
    },

    #[error("Parameter index {index} out of range ({count} parameters)")]
    ParameterIndexOutOfRange { index: usize, count: usize },

    #[error("Invalid parameter {index} for operation '{operation}': {reason}")]
    InvalidParameter {
        operation: String,
        index: usize,
        reason: String,
    },

    #[error("Using node {source_node} as a source of {sink} would create a cycle")]
    CycleDetected { source_node: NodeId, sink: NodeId },

    #[error("Property '{0}' is derived from the rendering and cannot be set")]
    ReadOnlyProperty(String),

    #[error("Tile error: {0}")]
    Tile(#[from] TileError),

    #[error("Layout error: {0}")]
    Layout(#[from] LayoutError),
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration value '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Could not start thread pool: {0}")]
    ThreadPool(String),

    #[error("Unsupported configuration format: {0}")]
    UnsupportedFormat(String),
}

/// Result type alias for Tessera operations.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Result type alias for tile operations.
pub type TileResult<T> = std::result::Result<T, TileError>;

/// Result type alias for layout resolution.
pub type LayoutResult<T> = std::result::Result<T, LayoutError>;

/// Result type alias for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        let id = ImageId::new();
        let display = format!("{}", id);
        assert_eq!(display.len(), 8);
        assert_ne!(ImageId::new(), id);
    }

    #[test]
    fn test_resource_exhaustion_classification() {
        let oom = TileError::OutOfMemory { requested_bytes: 1024 };
        assert!(oom.is_resource_exhausted());

        let failed = TileError::computation_failed(ImageId::new(), 0, 0, "boom");
        assert!(!failed.is_resource_exhausted());
    }

    #[test]
    fn test_error_conversion() {
        let tile_err = TileError::IncompatibleRaster("band mismatch".to_string());
        let graph_err: GraphError = tile_err.into();
        assert!(matches!(graph_err, GraphError::Tile(_)));

        let top: TesseraError = graph_err.into();
        assert!(top.to_string().contains("band mismatch"));
    }
}
