//! Deciding which cached tiles of a replaced rendering are still valid.
//!
//! When a node re-renders after an edit, tiles of the old rendering that
//! the edit did not touch are moved into the new rendering's cache instead
//! of being recomputed. Retention is only attempted between tile-computing
//! images with identical layouts.

use crate::core::geometry::{Rectangle, Region, TileIndex};
use crate::graph::RenderingChangeEvent;
use crate::image::{PlanarImage, SharedImage};
use crate::operations::{InvalidRegionQuery, OperationDescriptor};
use log::debug;
use std::collections::HashSet;

/// Which cached tiles of the old rendering to keep.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Retention {
    Nothing,
    All,
    /// Every tile except these.
    Except(HashSet<TileIndex>),
    /// Tiles whose nominal rectangle does not touch the region.
    OutsideRegion(Region),
}

impl Retention {
    fn keeps(&self, index: TileIndex, nominal: &Rectangle) -> bool {
        match self {
            Retention::Nothing => false,
            Retention::All => true,
            Retention::Except(invalid) => !invalid.contains(&index),
            Retention::OutsideRegion(region) => !region.intersects(nominal),
        }
    }
}

/// Outcome of invalidation planning.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Plan {
    pub retention: Retention,
    /// Invalid region reported downstream; `None` for the whole image.
    pub invalid_region: Option<Region>,
}

impl Plan {
    pub fn full() -> Self {
        Self {
            retention: Retention::Nothing,
            invalid_region: None,
        }
    }

    fn nothing_changed() -> Self {
        Self {
            retention: Retention::All,
            invalid_region: Some(Region::new()),
        }
    }
}

/// The part of the tile-aligned area of `image` that lies outside its
/// bounds. This is what an invalid region with an empty bounding box
/// stands for.
pub(crate) fn degenerate_complement(image: &dyn PlanarImage) -> Region {
    let range = image.tile_range();
    if range.is_empty() {
        return Region::new();
    }
    let grid = image.tile_grid();
    let aligned = Rectangle::from_corners(
        grid.tile_x_to_x(range.min_x),
        grid.tile_y_to_y(range.min_y),
        grid.tile_x_to_x(range.max_x + 1),
        grid.tile_y_to_y(range.max_y + 1),
    );
    Region::difference(aligned, image.bounds())
}

fn resolve_degenerate(region: Region, image: &dyn PlanarImage) -> Region {
    if region.bounds().is_empty() {
        degenerate_complement(image)
    } else {
        region
    }
}

/// Plan for a node whose sources at `source_indices` fired `event`.
pub(crate) fn plan_source_change(
    old: &SharedImage,
    event: &RenderingChangeEvent,
    source_indices: &[usize],
) -> Plan {
    let Some(op) = old.as_op_image() else {
        return Plan::full();
    };
    let Some(source) = &event.old_rendering else {
        return Plan::full();
    };
    let source_region = match &event.invalid_region {
        Some(region) => resolve_degenerate(region.clone(), source.as_ref()),
        None => Region::from_rect(source.bounds()),
    };
    if source_region.is_empty() {
        return Plan::nothing_changed();
    }

    let bounds = old.bounds();
    let mut dest_region = Region::new();
    for &index in source_indices {
        for rect in source_region.rects() {
            match op.map_source_rect(rect, index) {
                Ok(Some(mapped)) => dest_region.add(mapped.intersection(&bounds)),
                // Unknown forward mapping: start from the whole image and let
                // the per-tile check below narrow it down.
                Ok(None) => dest_region.add(bounds),
                Err(_) => return Plan::full(),
            }
        }
    }
    if dest_region.is_empty() {
        return Plan::nothing_changed();
    }

    // Refine with the inverse mapping: a tile is invalid only if the source
    // area it reads overlaps the source's invalid region.
    let mut invalid = HashSet::new();
    for rect in dest_region.rects() {
        for tile in old.tile_indices(rect) {
            if invalid.contains(&tile) {
                continue;
            }
            let tile_rect = old.tile_rect(tile.x, tile.y);
            let reads_invalid = source_indices.iter().any(|&index| {
                op.map_dest_rect(&tile_rect, index)
                    .map_or(true, |src| source_region.intersects(&src))
            });
            if reads_invalid {
                invalid.insert(tile);
            }
        }
    }
    debug!(
        "Source change invalidates {} tiles of image {} in {}",
        invalid.len(),
        old.id(),
        dest_region.bounds()
    );
    Plan {
        retention: Retention::Except(invalid),
        invalid_region: Some(dest_region),
    }
}

/// Plan for a local edit of parameters, sources or hints.
pub(crate) fn plan_edit(descriptor: &dyn OperationDescriptor, query: &InvalidRegionQuery<'_>) -> Plan {
    if query.rendering.as_op_image().is_none() {
        return Plan::full();
    }
    let Some(region) = descriptor.get_invalid_region(query) else {
        return Plan::full();
    };
    let region = resolve_degenerate(region, query.rendering.as_ref());
    if region.is_empty() {
        return Plan::nothing_changed();
    }
    debug!(
        "Edit of node {} invalidates {} of image {}",
        query.node,
        region.bounds(),
        query.rendering.id()
    );
    Plan {
        retention: Retention::OutsideRegion(region.clone()),
        invalid_region: Some(region),
    }
}

fn same_layout(a: &dyn PlanarImage, b: &dyn PlanarImage) -> bool {
    a.layout() == b.layout()
}

/// Move the retained tiles of `old` into the cache of `new`, then drop
/// everything `old` still has cached. Returns the number of tiles moved.
pub(crate) fn transfer_tiles(old: &SharedImage, new: &SharedImage, retention: &Retention) -> usize {
    let (Some(old_op), Some(new_op)) = (old.as_op_image(), new.as_op_image()) else {
        return 0;
    };
    let Some(old_cache) = old_op.tile_cache() else {
        return 0;
    };

    let mut moved = 0;
    if *retention != Retention::Nothing && same_layout(old.as_ref(), new.as_ref()) {
        let grid = old.tile_grid();
        for (index, tile) in old_cache.tiles(old.id()) {
            let nominal = grid.nominal_tile_rect(index.x, index.y);
            if new.contains_tile(index.x, index.y) && retention.keeps(index, &nominal) {
                new_op.add_tile_to_cache(index.x, index.y, tile);
                moved += 1;
            }
        }
    }
    old_cache.remove_tiles(old.id());
    debug!("Moved {} cached tiles from image {} to {}", moved, old.id(), new.id());
    moved
}
