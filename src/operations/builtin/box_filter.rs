//! Box (mean) filter.

use crate::core::error::{GraphError, GraphResult, TileResult};
use crate::core::geometry::{Rectangle, Region};
use crate::core::hints::RenderingHints;
use crate::core::raster::Raster;
use crate::graph::ResolvedParameters;
use crate::image::{CobbledKernel, OpImage, OpImageConfig, Operation, SharedImage};
use crate::operations::{
    hinted_layout, unchanged_or_everything, Category, InvalidRegionQuery, OperationDescriptor, OperationMetadata,
    ParameterSpec,
};

/// `box_filter(source; radius)`: each pixel becomes the mean of the
/// `(2r+1)` x `(2r+1)` window around it. Near the image edges only the
/// pixels inside the source are averaged.
#[derive(Debug, Clone)]
pub struct BoxFilter;

impl OperationDescriptor for BoxFilter {
    fn metadata(&self) -> OperationMetadata {
        OperationMetadata::builder("box_filter", "Box Filter")
            .description("Mean of a square neighbourhood")
            .category(Category::Filter)
            .sources(1)
            .parameter(ParameterSpec::new("radius", 1).with_description("Window radius in pixels"))
            .build()
    }

    fn create(&self, args: &ResolvedParameters, hints: &RenderingHints) -> GraphResult<Option<SharedImage>> {
        let source = args.source(0)?;
        let radius = args.int32(0)?;
        if radius < 0 {
            return Err(GraphError::InvalidParameter {
                operation: "box_filter".to_string(),
                index: 0,
                reason: format!("radius must not be negative, got {}", radius),
            });
        }
        let layout = hinted_layout(hints).resolve(Some(&source.layout()))?;
        let kernel = MeanKernel {
            radius,
            source_bounds: source.bounds(),
        };
        let image = OpImage::cobbled(vec![source], layout, OpImageConfig::from_hints(hints), kernel);
        Ok(Some(image))
    }

    fn get_invalid_region(&self, query: &InvalidRegionQuery<'_>) -> Option<Region> {
        unchanged_or_everything(query)
    }
}

struct MeanKernel {
    radius: i32,
    /// Cobbled sources are zero padded outside these bounds.
    source_bounds: Rectangle,
}

impl Operation for MeanKernel {
    fn name(&self) -> &str {
        "box_filter"
    }

    fn map_dest_rect(&self, dest_rect: &Rectangle, _source_index: usize) -> Rectangle {
        dest_rect.grow(self.radius, self.radius)
    }

    fn map_source_rect(&self, source_rect: &Rectangle, _source_index: usize) -> Option<Rectangle> {
        Some(source_rect.grow(self.radius, self.radius))
    }
}

impl CobbledKernel for MeanKernel {
    fn compute_rect(&self, sources: &[Option<Raster>], dest: &mut Raster, dest_rect: &Rectangle) -> TileResult<()> {
        let Some(source) = &sources[0] else {
            return Ok(());
        };
        let available = source.bounds().intersection(&self.source_bounds);
        let bands = dest.num_bands().min(source.num_bands());
        let mut sums = vec![0.0f32; bands];
        for y in dest_rect.y..dest_rect.max_y() {
            for x in dest_rect.x..dest_rect.max_x() {
                let window = Rectangle::new(x, y, 1, 1)
                    .grow(self.radius, self.radius)
                    .intersection(&available);
                if window.is_empty() {
                    continue;
                }
                sums.iter_mut().for_each(|s| *s = 0.0);
                for wy in window.y..window.max_y() {
                    for wx in window.x..window.max_x() {
                        for (band, sum) in sums.iter_mut().enumerate() {
                            *sum += source.sample(wx, wy, band);
                        }
                    }
                }
                let count = window.area() as f32;
                for (band, sum) in sums.iter().enumerate() {
                    dest.set_sample(x, y, band, sum / count);
                }
            }
        }
        Ok(())
    }
}
