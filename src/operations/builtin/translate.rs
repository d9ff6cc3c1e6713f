//! Integer translation.

use crate::core::error::{GraphResult, TileResult};
use crate::core::geometry::{Rectangle, Region};
use crate::core::hints::RenderingHints;
use crate::core::raster::Raster;
use crate::graph::ResolvedParameters;
use crate::image::{OpImage, OpImageConfig, Operation, PlanarImage, SharedImage, UncobbledKernel};
use crate::operations::{
    hinted_layout, unchanged_or_everything, Category, InvalidRegionQuery, OperationDescriptor, OperationMetadata,
    ParameterSpec,
};

/// `translate(source; dx, dy)`: moves the source by whole pixels. The tile
/// grid moves with the image.
#[derive(Debug, Clone)]
pub struct Translate;

impl OperationDescriptor for Translate {
    fn metadata(&self) -> OperationMetadata {
        OperationMetadata::builder("translate", "Translate")
            .description("Shift an image by whole pixels")
            .category(Category::Geometric)
            .sources(1)
            .parameter(ParameterSpec::new("dx", 0).with_description("Horizontal shift"))
            .parameter(ParameterSpec::new("dy", 0).with_description("Vertical shift"))
            .build()
    }

    fn create(&self, args: &ResolvedParameters, hints: &RenderingHints) -> GraphResult<Option<SharedImage>> {
        let source = args.source(0)?;
        let dx = args.int32(0)?;
        let dy = args.int32(1)?;

        let original = source.layout();
        let shifted = original
            .to_partial()
            .with_bounds(original.bounds.translate(dx, dy))
            .with_tile_grid_offset(original.grid.x_offset + dx, original.grid.y_offset + dy);
        let layout = hinted_layout(hints).or(&shifted).resolve(None)?;
        let image = OpImage::uncobbled(vec![source], layout, OpImageConfig::from_hints(hints), Shift { dx, dy });
        Ok(Some(image))
    }

    fn get_invalid_region(&self, query: &InvalidRegionQuery<'_>) -> Option<Region> {
        unchanged_or_everything(query)
    }
}

struct Shift {
    dx: i32,
    dy: i32,
}

impl Operation for Shift {
    fn name(&self) -> &str {
        "translate"
    }

    fn map_dest_rect(&self, dest_rect: &Rectangle, _source_index: usize) -> Rectangle {
        dest_rect.translate(-self.dx, -self.dy)
    }

    fn map_source_rect(&self, source_rect: &Rectangle, _source_index: usize) -> Option<Rectangle> {
        Some(source_rect.translate(self.dx, self.dy))
    }
}

impl UncobbledKernel for Shift {
    fn compute_rect(&self, sources: &[SharedImage], dest: &mut Raster, dest_rect: &Rectangle) -> TileResult<()> {
        let source = &sources[0];
        let wanted = self.map_dest_rect(dest_rect, 0).intersection(&source.bounds());
        if wanted.is_empty() {
            return Ok(());
        }
        let data = source.get_data(Some(&wanted))?;
        let bands = dest.num_bands().min(data.num_bands());
        for y in wanted.y..wanted.max_y() {
            for x in wanted.x..wanted.max_x() {
                for band in 0..bands {
                    dest.set_sample(x + self.dx, y + self.dy, band, data.sample(x, y, band));
                }
            }
        }
        Ok(())
    }
}
