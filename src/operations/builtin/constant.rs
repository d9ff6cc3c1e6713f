//! Images filled with a constant pixel value.

use crate::core::error::{GraphError, GraphResult, TileResult};
use crate::core::geometry::{Rectangle, Region};
use crate::core::hints::RenderingHints;
use crate::core::layout::ImageLayout;
use crate::core::raster::{PixelFormat, Raster};
use crate::core::types::Value;
use crate::graph::ResolvedParameters;
use crate::image::{CobbledKernel, OpImage, OpImageConfig, Operation, SharedImage};
use crate::operations::{
    hinted_layout, unchanged_or_everything, Category, InvalidRegionQuery, OperationDescriptor, OperationMetadata,
    ParameterSpec,
};

/// `constant(width, height, values)`: a `width` x `height` image at the
/// origin whose pixels all equal `values`, one entry per band.
#[derive(Debug, Clone)]
pub struct Constant;

impl OperationDescriptor for Constant {
    fn metadata(&self) -> OperationMetadata {
        OperationMetadata::builder("constant", "Constant")
            .description("Image filled with a constant pixel value")
            .category(Category::Generator)
            .parameter(ParameterSpec::new("width", Value::None).with_description("Image width"))
            .parameter(ParameterSpec::new("height", Value::None).with_description("Image height"))
            .parameter(ParameterSpec::new("values", vec![0.0]).with_description("One value per band"))
            .build()
    }

    fn create(&self, args: &ResolvedParameters, hints: &RenderingHints) -> GraphResult<Option<SharedImage>> {
        let width = args.int32(0)?;
        let height = args.int32(1)?;
        if width <= 0 || height <= 0 {
            return Err(GraphError::InvalidParameter {
                operation: "constant".to_string(),
                index: if width <= 0 { 0 } else { 1 },
                reason: format!("image size must be positive, got {}x{}", width, height),
            });
        }
        let values: Vec<f32> = args.float_list(2)?.into_iter().map(|v| v as f32).collect();
        if values.is_empty() {
            return Err(GraphError::InvalidParameter {
                operation: "constant".to_string(),
                index: 2,
                reason: "at least one band value is required".to_string(),
            });
        }

        let layout = ImageLayout::new()
            .with_bounds(Rectangle::new(0, 0, width, height))
            .with_format(PixelFormat::new(values.len()))
            .or(&hinted_layout(hints))
            .resolve(None)?;
        let image = OpImage::cobbled(Vec::new(), layout, OpImageConfig::from_hints(hints), Fill { values });
        Ok(Some(image))
    }

    fn get_invalid_region(&self, query: &InvalidRegionQuery<'_>) -> Option<Region> {
        unchanged_or_everything(query)
    }
}

struct Fill {
    values: Vec<f32>,
}

impl Operation for Fill {
    fn name(&self) -> &str {
        "constant"
    }

    fn map_dest_rect(&self, _dest_rect: &Rectangle, _source_index: usize) -> Rectangle {
        Rectangle::empty()
    }

    fn map_source_rect(&self, _source_rect: &Rectangle, _source_index: usize) -> Option<Rectangle> {
        None
    }
}

impl CobbledKernel for Fill {
    fn compute_rect(&self, _sources: &[Option<Raster>], dest: &mut Raster, dest_rect: &Rectangle) -> TileResult<()> {
        dest.fill_rect(dest_rect, &self.values);
        Ok(())
    }
}
