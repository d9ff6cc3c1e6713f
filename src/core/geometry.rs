//! Integer pixel geometry: rectangles, tile indices and regions.
//!
//! All coordinates are in pixel units of the image plane. Rectangles are
//! half-open: a rectangle covers `x..x + width` by `y..y + height`. Arithmetic
//! that can overflow `i32` is carried out in `i64` and clamped back.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An axis-aligned integer rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rectangle {
    /// Left edge (inclusive).
    pub x: i32,
    /// Top edge (inclusive).
    pub y: i32,
    /// Width in pixels. Non-positive means empty.
    pub width: i32,
    /// Height in pixels. Non-positive means empty.
    pub height: i32,
}

fn clamp_i32(value: i64) -> i32 {
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

impl Rectangle {
    /// Create a rectangle from its origin and size.
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Create a rectangle from inclusive top-left and exclusive bottom-right corners.
    pub fn from_corners(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self::new(
            x0,
            y0,
            clamp_i32(x1 as i64 - x0 as i64),
            clamp_i32(y1 as i64 - y0 as i64),
        )
    }

    /// The canonical empty rectangle.
    pub const fn empty() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// Exclusive right edge.
    pub fn max_x(&self) -> i32 {
        clamp_i32(self.x as i64 + self.width as i64)
    }

    /// Exclusive bottom edge.
    pub fn max_y(&self) -> i32 {
        clamp_i32(self.y as i64 + self.height as i64)
    }

    /// Whether the rectangle covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Number of pixels covered.
    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width as i64 * self.height as i64
        }
    }

    /// Whether the pixel `(px, py)` lies inside the rectangle.
    pub fn contains_point(&self, px: i32, py: i32) -> bool {
        px >= self.x && py >= self.y && px < self.max_x() && py < self.max_y()
    }

    /// Whether `other` is non-empty and lies entirely inside this rectangle.
    pub fn contains(&self, other: &Rectangle) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && other.x >= self.x
            && other.y >= self.y
            && other.max_x() <= self.max_x()
            && other.max_y() <= self.max_y()
    }

    /// Whether the two rectangles share at least one pixel.
    pub fn intersects(&self, other: &Rectangle) -> bool {
        !self.intersection(other).is_empty()
    }

    /// The overlapping part of two rectangles. Disjoint inputs produce an
    /// empty rectangle with zero width or height.
    pub fn intersection(&self, other: &Rectangle) -> Rectangle {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.max_x().min(other.max_x());
        let y1 = self.max_y().min(other.max_y());
        Rectangle::new(x0, y0, (x1 as i64 - x0 as i64).max(0) as i32, (y1 as i64 - y0 as i64).max(0) as i32)
    }

    /// The smallest rectangle covering both. Empty inputs are ignored.
    pub fn union(&self, other: &Rectangle) -> Rectangle {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Rectangle::from_corners(
            self.x.min(other.x),
            self.y.min(other.y),
            self.max_x().max(other.max_x()),
            self.max_y().max(other.max_y()),
        )
    }

    /// Shift the rectangle by `(dx, dy)`.
    pub fn translate(&self, dx: i32, dy: i32) -> Rectangle {
        Rectangle::new(
            clamp_i32(self.x as i64 + dx as i64),
            clamp_i32(self.y as i64 + dy as i64),
            self.width,
            self.height,
        )
    }

    /// Grow the rectangle by `h` pixels on the left and right and `v` pixels
    /// on the top and bottom.
    pub fn grow(&self, h: i32, v: i32) -> Rectangle {
        Rectangle::from_corners(
            clamp_i32(self.x as i64 - h as i64),
            clamp_i32(self.y as i64 - v as i64),
            clamp_i32(self.max_x() as i64 + h as i64),
            clamp_i32(self.max_y() as i64 + v as i64),
        )
    }

    /// The parts of this rectangle not covered by `other`, as at most four
    /// disjoint rectangles (top band, bottom band, left and right slivers).
    pub fn subtract(&self, other: &Rectangle) -> Vec<Rectangle> {
        if self.is_empty() {
            return Vec::new();
        }
        let cut = self.intersection(other);
        if cut.is_empty() {
            return vec![*self];
        }

        let mut pieces = Vec::with_capacity(4);
        let top = Rectangle::from_corners(self.x, self.y, self.max_x(), cut.y);
        let bottom = Rectangle::from_corners(self.x, cut.max_y(), self.max_x(), self.max_y());
        let left = Rectangle::from_corners(self.x, cut.y, cut.x, cut.max_y());
        let right = Rectangle::from_corners(cut.max_x(), cut.y, self.max_x(), cut.max_y());
        for piece in [top, bottom, left, right] {
            if !piece.is_empty() {
                pieces.push(piece);
            }
        }
        pieces
    }
}

impl fmt::Display for Rectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}x{}]", self.x, self.y, self.width, self.height)
    }
}

/// Identity of a tile within an image: its column and row in the tile grid.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct TileIndex {
    /// Tile column.
    pub x: i32,
    /// Tile row.
    pub y: i32,
}

impl TileIndex {
    /// Create a tile index.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<(i32, i32)> for TileIndex {
    fn from((x, y): (i32, i32)) -> Self {
        Self::new(x, y)
    }
}

impl fmt::Display for TileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// An arbitrary pixel area stored as a union of rectangles.
///
/// Used for invalid regions. A `Region` with no rectangles is still a
/// value distinct from "no region at all" (`Option::None`), which callers use
/// to mean the entire image.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Region {
    rects: Vec<Rectangle>,
}

impl Region {
    /// Create a region covering nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a region covering a single rectangle.
    pub fn from_rect(rect: Rectangle) -> Self {
        let mut region = Self::new();
        region.add(rect);
        region
    }

    /// Create a region from several rectangles. Empty ones are dropped.
    pub fn from_rects(rects: impl IntoIterator<Item = Rectangle>) -> Self {
        let mut region = Self::new();
        for rect in rects {
            region.add(rect);
        }
        region
    }

    /// The part of `outer` that lies outside `inner`.
    pub fn difference(outer: Rectangle, inner: Rectangle) -> Self {
        Self::from_rects(outer.subtract(&inner))
    }

    /// Add a rectangle to the region.
    pub fn add(&mut self, rect: Rectangle) {
        if !rect.is_empty() {
            self.rects.push(rect);
        }
    }

    /// The rectangles making up the region. They may overlap.
    pub fn rects(&self) -> &[Rectangle] {
        &self.rects
    }

    /// Whether the region covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Bounding box of the region; empty for an empty region.
    pub fn bounds(&self) -> Rectangle {
        self.rects
            .iter()
            .fold(Rectangle::empty(), |acc, rect| acc.union(rect))
    }

    /// Whether any part of the region overlaps `rect`.
    pub fn intersects(&self, rect: &Rectangle) -> bool {
        self.rects.iter().any(|r| r.intersects(rect))
    }

    /// Shift every rectangle by `(dx, dy)`.
    pub fn translate(&self, dx: i32, dy: i32) -> Region {
        Region {
            rects: self.rects.iter().map(|r| r.translate(dx, dy)).collect(),
        }
    }
}

impl From<Rectangle> for Region {
    fn from(rect: Rectangle) -> Self {
        Region::from_rect(rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersection() {
        let a = Rectangle::new(0, 0, 10, 10);
        let b = Rectangle::new(5, 5, 10, 10);
        assert_eq!(a.intersection(&b), Rectangle::new(5, 5, 5, 5));

        let c = Rectangle::new(20, 20, 5, 5);
        assert!(a.intersection(&c).is_empty());
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_union_ignores_empty() {
        let a = Rectangle::new(2, 3, 4, 5);
        assert_eq!(Rectangle::empty().union(&a), a);
        assert_eq!(a.union(&Rectangle::new(0, 0, 1, 1)), Rectangle::new(0, 0, 6, 8));
    }

    #[test]
    fn test_contains() {
        let outer = Rectangle::new(0, 0, 10, 10);
        assert!(outer.contains(&Rectangle::new(2, 2, 8, 8)));
        assert!(!outer.contains(&Rectangle::new(2, 2, 9, 8)));
        assert!(!outer.contains(&Rectangle::empty()));
        assert!(outer.contains_point(9, 9));
        assert!(!outer.contains_point(10, 9));
    }

    #[test]
    fn test_subtract_covers_remainder() {
        let outer = Rectangle::new(0, 0, 10, 10);
        let inner = Rectangle::new(3, 3, 4, 4);
        let pieces = outer.subtract(&inner);
        assert_eq!(pieces.len(), 4);

        let area: i64 = pieces.iter().map(|p| p.area()).sum();
        assert_eq!(area, 100 - 16);
        for piece in &pieces {
            assert!(!piece.intersects(&inner));
        }
    }

    #[test]
    fn test_subtract_disjoint_and_covering() {
        let a = Rectangle::new(0, 0, 4, 4);
        assert_eq!(a.subtract(&Rectangle::new(10, 10, 2, 2)), vec![a]);
        assert!(a.subtract(&Rectangle::new(-1, -1, 10, 10)).is_empty());
    }

    #[test]
    fn test_grow_and_translate() {
        let r = Rectangle::new(4, 4, 2, 2);
        assert_eq!(r.grow(1, 2), Rectangle::new(3, 2, 4, 6));
        assert_eq!(r.translate(-4, 3), Rectangle::new(0, 7, 2, 2));
    }

    #[test]
    fn test_region_bounds_and_difference() {
        let empty = Region::new();
        assert!(empty.is_empty());
        assert!(empty.bounds().is_empty());

        let ring = Region::difference(Rectangle::new(0, 0, 8, 8), Rectangle::new(0, 0, 6, 6));
        assert_eq!(ring.bounds(), Rectangle::new(0, 0, 8, 8));
        assert!(ring.intersects(&Rectangle::new(7, 0, 1, 1)));
        assert!(!ring.intersects(&Rectangle::new(1, 1, 2, 2)));
    }
}
