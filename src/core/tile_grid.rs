//! Tile grid arithmetic.
//!
//! A tile grid partitions the infinite pixel plane into `tile_width` by
//! `tile_height` cells whose origin is shifted by the grid offset. Pixel
//! coordinates below the offset belong to negative tile indices: the mapping
//! rounds toward negative infinity.
//!
//! The free functions are usable before any image exists, which layout code
//! relies on. A zero or negative tile size is a precondition violation and
//! panics.

use crate::core::error::{LayoutError, LayoutResult};
use crate::core::geometry::{Rectangle, TileIndex};
use serde::{Deserialize, Serialize};

fn to_tile(coord: i32, offset: i32, size: i32, axis: &str) -> i32 {
    assert!(size > 0, "tile {} must be positive, got {}", axis, size);
    (coord as i64 - offset as i64).div_euclid(size as i64) as i32
}

fn to_pixel(tile: i32, offset: i32, size: i32) -> i32 {
    (tile as i64 * size as i64 + offset as i64).clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Column of the tile containing pixel column `x`.
///
/// # Panics
///
/// Panics if `tile_width` is not positive.
pub fn x_to_tile_x(x: i32, tile_grid_x_offset: i32, tile_width: i32) -> i32 {
    to_tile(x, tile_grid_x_offset, tile_width, "width")
}

/// Row of the tile containing pixel row `y`.
///
/// # Panics
///
/// Panics if `tile_height` is not positive.
pub fn y_to_tile_y(y: i32, tile_grid_y_offset: i32, tile_height: i32) -> i32 {
    to_tile(y, tile_grid_y_offset, tile_height, "height")
}

/// Pixel column of the left edge of tile column `tile_x`.
pub fn tile_x_to_x(tile_x: i32, tile_grid_x_offset: i32, tile_width: i32) -> i32 {
    to_pixel(tile_x, tile_grid_x_offset, tile_width)
}

/// Pixel row of the top edge of tile row `tile_y`.
pub fn tile_y_to_y(tile_y: i32, tile_grid_y_offset: i32, tile_height: i32) -> i32 {
    to_pixel(tile_y, tile_grid_y_offset, tile_height)
}

/// Offset and tile size of an image's tile grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileGrid {
    /// Pixel column where tile column 0 starts.
    pub x_offset: i32,
    /// Pixel row where tile row 0 starts.
    pub y_offset: i32,
    /// Tile width in pixels.
    pub tile_width: i32,
    /// Tile height in pixels.
    pub tile_height: i32,
}

impl TileGrid {
    /// Create a grid, rejecting non-positive tile sizes.
    pub fn new(x_offset: i32, y_offset: i32, tile_width: i32, tile_height: i32) -> LayoutResult<Self> {
        if tile_width <= 0 || tile_height <= 0 {
            return Err(LayoutError::InvalidTileSize {
                width: tile_width,
                height: tile_height,
            });
        }
        Ok(Self {
            x_offset,
            y_offset,
            tile_width,
            tile_height,
        })
    }

    /// Column of the tile containing pixel column `x`.
    pub fn x_to_tile_x(&self, x: i32) -> i32 {
        x_to_tile_x(x, self.x_offset, self.tile_width)
    }

    /// Row of the tile containing pixel row `y`.
    pub fn y_to_tile_y(&self, y: i32) -> i32 {
        y_to_tile_y(y, self.y_offset, self.tile_height)
    }

    /// Left edge of tile column `tile_x`.
    pub fn tile_x_to_x(&self, tile_x: i32) -> i32 {
        tile_x_to_x(tile_x, self.x_offset, self.tile_width)
    }

    /// Top edge of tile row `tile_y`.
    pub fn tile_y_to_y(&self, tile_y: i32) -> i32 {
        tile_y_to_y(tile_y, self.y_offset, self.tile_height)
    }

    /// The full, unclipped rectangle of a tile.
    pub fn nominal_tile_rect(&self, tile_x: i32, tile_y: i32) -> Rectangle {
        Rectangle::new(
            self.tile_x_to_x(tile_x),
            self.tile_y_to_y(tile_y),
            self.tile_width,
            self.tile_height,
        )
    }

    /// Range of tiles overlapping `region`. Empty for an empty region.
    pub fn tile_range(&self, region: &Rectangle) -> TileRange {
        if region.is_empty() {
            return TileRange::empty();
        }
        TileRange {
            min_x: self.x_to_tile_x(region.x),
            min_y: self.y_to_tile_y(region.y),
            max_x: self.x_to_tile_x(region.max_x() - 1),
            max_y: self.y_to_tile_y(region.max_y() - 1),
        }
    }
}

/// An inclusive rectangular range of tile indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    /// First tile column.
    pub min_x: i32,
    /// First tile row.
    pub min_y: i32,
    /// Last tile column (inclusive).
    pub max_x: i32,
    /// Last tile row (inclusive).
    pub max_y: i32,
}

impl TileRange {
    /// A range containing no tiles.
    pub const fn empty() -> Self {
        Self {
            min_x: 0,
            min_y: 0,
            max_x: -1,
            max_y: -1,
        }
    }

    /// Whether the range contains no tiles.
    pub fn is_empty(&self) -> bool {
        self.max_x < self.min_x || self.max_y < self.min_y
    }

    /// Whether `index` lies inside the range.
    pub fn contains(&self, index: TileIndex) -> bool {
        index.x >= self.min_x && index.x <= self.max_x && index.y >= self.min_y && index.y <= self.max_y
    }

    /// Number of tiles in the range.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.max_x as i64 - self.min_x as i64 + 1) as usize
                * (self.max_y as i64 - self.min_y as i64 + 1) as usize
        }
    }

    /// Iterate the range in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = TileIndex> {
        let range = *self;
        let rows = if range.is_empty() { 0..=-1 } else { range.min_y..=range.max_y };
        rows.flat_map(move |y| (range.min_x..=range.max_x).map(move |x| TileIndex::new(x, y)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_floor_below_offset() {
        assert_eq!(x_to_tile_x(-1, 0, 64), -1);
        assert_eq!(x_to_tile_x(-64, 0, 64), -1);
        assert_eq!(x_to_tile_x(-65, 0, 64), -2);
        assert_eq!(x_to_tile_x(0, 0, 64), 0);
        assert_eq!(x_to_tile_x(63, 0, 64), 0);
        assert_eq!(x_to_tile_x(64, 0, 64), 1);
        assert_eq!(y_to_tile_y(9, 10, 4), -1);
        assert_eq!(y_to_tile_y(10, 10, 4), 0);
    }

    #[test]
    fn test_tile_origin() {
        assert_eq!(tile_x_to_x(3, 5, 16), 53);
        assert_eq!(tile_y_to_y(-2, 0, 16), -32);
    }

    #[test]
    #[should_panic(expected = "tile width must be positive")]
    fn test_zero_tile_width_panics() {
        x_to_tile_x(10, 0, 0);
    }

    #[test]
    fn test_grid_rejects_zero_size() {
        assert_eq!(
            TileGrid::new(0, 0, 0, 8),
            Err(LayoutError::InvalidTileSize { width: 0, height: 8 })
        );
    }

    #[test]
    fn test_tile_range() {
        let grid = TileGrid::new(0, 0, 64, 64).unwrap();
        let range = grid.tile_range(&Rectangle::new(10, 10, 100, 60));
        assert_eq!(range, TileRange { min_x: 0, min_y: 0, max_x: 1, max_y: 1 });
        assert_eq!(range.len(), 4);

        let tiles: Vec<_> = range.iter().collect();
        assert_eq!(
            tiles,
            vec![
                TileIndex::new(0, 0),
                TileIndex::new(1, 0),
                TileIndex::new(0, 1),
                TileIndex::new(1, 1)
            ]
        );

        assert!(grid.tile_range(&Rectangle::empty()).is_empty());
        assert_eq!(grid.tile_range(&Rectangle::empty()).iter().count(), 0);
    }

    proptest! {
        #[test]
        fn prop_tile_contains_pixel(
            p in -100_000i32..100_000,
            offset in -1_000i32..1_000,
            size in 1i32..512,
        ) {
            let tile = x_to_tile_x(p, offset, size);
            let origin = tile_x_to_x(tile, offset, size);
            prop_assert!(origin <= p);
            prop_assert!(p < origin + size);
        }

        #[test]
        fn prop_adjacent_tiles_do_not_overlap(
            tile in -1_000i32..1_000,
            offset in -1_000i32..1_000,
            size in 1i32..512,
        ) {
            let start = tile_y_to_y(tile, offset, size);
            prop_assert_eq!(y_to_tile_y(start, offset, size), tile);
            prop_assert_eq!(y_to_tile_y(start - 1, offset, size), tile - 1);
            prop_assert_eq!(y_to_tile_y(start + size - 1, offset, size), tile);
        }
    }
}
