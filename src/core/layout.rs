//! Image layout: bounds, tile grid and pixel format.
//!
//! [`ImageLayout`] is the partially specified form that operations and hints
//! carry around; [`Layout`] is the resolved form every image holds. Missing
//! fields are inherited from the first source, and only when there is no
//! source do built-in defaults apply.

use crate::core::error::{LayoutError, LayoutResult};
use crate::core::geometry::Rectangle;
use crate::core::raster::PixelFormat;
use crate::core::tile_grid::TileGrid;
use serde::{Deserialize, Serialize};

/// Tile edge used when neither the layout nor a source specifies one.
pub const DEFAULT_TILE_SIZE: i32 = 512;

/// A layout where every field may be left unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageLayout {
    /// Left edge of the image.
    pub min_x: Option<i32>,
    /// Top edge of the image.
    pub min_y: Option<i32>,
    /// Image width.
    pub width: Option<i32>,
    /// Image height.
    pub height: Option<i32>,
    /// Pixel column where tile column 0 starts.
    pub tile_grid_x_offset: Option<i32>,
    /// Pixel row where tile row 0 starts.
    pub tile_grid_y_offset: Option<i32>,
    /// Tile width.
    pub tile_width: Option<i32>,
    /// Tile height.
    pub tile_height: Option<i32>,
    /// Pixel format.
    pub format: Option<PixelFormat>,
}

impl ImageLayout {
    /// Create an empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the image bounds.
    pub fn with_bounds(mut self, bounds: Rectangle) -> Self {
        self.min_x = Some(bounds.x);
        self.min_y = Some(bounds.y);
        self.width = Some(bounds.width);
        self.height = Some(bounds.height);
        self
    }

    /// Set the tile size.
    pub fn with_tile_size(mut self, tile_width: i32, tile_height: i32) -> Self {
        self.tile_width = Some(tile_width);
        self.tile_height = Some(tile_height);
        self
    }

    /// Set the tile grid offset.
    pub fn with_tile_grid_offset(mut self, x_offset: i32, y_offset: i32) -> Self {
        self.tile_grid_x_offset = Some(x_offset);
        self.tile_grid_y_offset = Some(y_offset);
        self
    }

    /// Set the pixel format.
    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = Some(format);
        self
    }

    /// Fill the gaps of `self` from `other`, keeping fields already set.
    pub fn or(self, other: &ImageLayout) -> ImageLayout {
        ImageLayout {
            min_x: self.min_x.or(other.min_x),
            min_y: self.min_y.or(other.min_y),
            width: self.width.or(other.width),
            height: self.height.or(other.height),
            tile_grid_x_offset: self.tile_grid_x_offset.or(other.tile_grid_x_offset),
            tile_grid_y_offset: self.tile_grid_y_offset.or(other.tile_grid_y_offset),
            tile_width: self.tile_width.or(other.tile_width),
            tile_height: self.tile_height.or(other.tile_height),
            format: self.format.or(other.format),
        }
    }

    /// Complete the layout, inheriting missing fields from `source`.
    ///
    /// Without a source the bounds are mandatory, the grid is anchored at the
    /// image origin and tiles default to [`DEFAULT_TILE_SIZE`] clamped to the
    /// image size.
    pub fn resolve(&self, source: Option<&Layout>) -> LayoutResult<Layout> {
        let merged = match source {
            Some(source) => self.or(&source.to_partial()),
            None => *self,
        };

        let min_x = merged.min_x.ok_or(LayoutError::Incomplete("min_x"))?;
        let min_y = merged.min_y.ok_or(LayoutError::Incomplete("min_y"))?;
        let width = merged.width.ok_or(LayoutError::Incomplete("width"))?;
        let height = merged.height.ok_or(LayoutError::Incomplete("height"))?;
        if width < 0 || height < 0 {
            return Err(LayoutError::InvalidImageSize { width, height });
        }

        let tile_width = merged
            .tile_width
            .unwrap_or_else(|| DEFAULT_TILE_SIZE.min(width).max(1));
        let tile_height = merged
            .tile_height
            .unwrap_or_else(|| DEFAULT_TILE_SIZE.min(height).max(1));
        let grid = TileGrid::new(
            merged.tile_grid_x_offset.unwrap_or(min_x),
            merged.tile_grid_y_offset.unwrap_or(min_y),
            tile_width,
            tile_height,
        )?;

        Ok(Layout {
            bounds: Rectangle::new(min_x, min_y, width, height),
            grid,
            format: merged.format.unwrap_or_default(),
        })
    }
}

/// A fully resolved image layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    /// Image bounds.
    pub bounds: Rectangle,
    /// Tile grid. Tile sizes are always positive.
    pub grid: TileGrid,
    /// Pixel format of every tile.
    pub format: PixelFormat,
}

impl Layout {
    /// Create a layout with a tile grid anchored at the image origin.
    pub fn new(bounds: Rectangle, tile_width: i32, tile_height: i32, format: PixelFormat) -> LayoutResult<Self> {
        ImageLayout::new()
            .with_bounds(bounds)
            .with_tile_size(tile_width, tile_height)
            .with_format(format)
            .resolve(None)
    }

    /// The same layout with every field specified.
    pub fn to_partial(&self) -> ImageLayout {
        ImageLayout::new()
            .with_bounds(self.bounds)
            .with_tile_size(self.grid.tile_width, self.grid.tile_height)
            .with_tile_grid_offset(self.grid.x_offset, self.grid.y_offset)
            .with_format(self.format)
    }
}
