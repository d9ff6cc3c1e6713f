//! Adding a constant to every pixel.

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

/// `add_const(source; constants)`: adds `constants` band by band. A single
/// constant applies to every band.
#[derive(Debug, Clone)]
pub struct AddConst;

impl OperationDescriptor for AddConst {
    fn metadata(&self) -> OperationMetadata {
        OperationMetadata::builder("add_const", "Add Constant")
            .description("Add a constant to every sample")
            .category(Category::Arithmetic)
            .sources(1)
            .parameter(ParameterSpec::new("constants", vec![0.0]).with_description("One value, or one per band"))
            .build()
    }

    fn create(&self, args: &ResolvedParameters, hints: &RenderingHints) -> GraphResult<Option<SharedImage>> {
        let source = args.source(0)?;
        let bands = source.format().bands;
        let constants: Vec<f32> = args.float_list(0)?.into_iter().map(|v| v as f32).collect();
        let constants = match constants.len() {
            1 => vec![constants[0]; bands],
            n if n == bands => constants,
            n => {
                return Err(GraphError::InvalidParameter {
                    operation: "add_const".to_string(),
                    index: 0,
                    reason: format!("{} constants for an image with {} bands", n, bands),
                })
            }
        };

        let layout = hinted_layout(hints).resolve(Some(&source.layout()))?;
        let image = OpImage::cobbled(vec![source], layout, OpImageConfig::from_hints(hints), AddKernel { constants });
        Ok(Some(image))
    }

    fn get_invalid_region(&self, query: &InvalidRegionQuery<'_>) -> Option<Region> {
        unchanged_or_everything(query)
    }
}

struct AddKernel {
    constants: Vec<f32>,
}

impl Operation for AddKernel {
    fn name(&self) -> &str {
        "add_const"
    }

    fn map_dest_rect(&self, dest_rect: &Rectangle, _source_index: usize) -> Rectangle {
        *dest_rect
    }

    fn map_source_rect(&self, source_rect: &Rectangle, _source_index: usize) -> Option<Rectangle> {
        Some(*source_rect)
    }
}

impl CobbledKernel for AddKernel {
    fn compute_rect(&self, sources: &[Option<Raster>], dest: &mut Raster, dest_rect: &Rectangle) -> TileResult<()> {
        let Some(source) = &sources[0] else {
            dest.fill_rect(dest_rect, &self.constants);
            return Ok(());
        };
        dest.copy_rect_from(source, dest_rect);
        let bands = dest.num_bands();
        for y in dest_rect.y..dest_rect.max_y() {
            for chunk in dest.row_mut(y, dest_rect.x, dest_rect.max_x()).chunks_mut(bands) {
                for (sample, constant) in chunk.iter_mut().zip(&self.constants) {
                    *sample += constant;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::NodeId;
    use crate::core::types::Value;
    use crate::test_support::{pattern_value, PatternImage};

    fn create(source: SharedImage, constants: Value) -> GraphResult<Option<SharedImage>> {
        let args = ResolvedParameters::new(NodeId::new(), "add_const", vec![source], vec![constants]);
        AddConst.create(&args, &RenderingHints::new())
    }

    #[test]
    fn test_adds_constant_and_keeps_layout() {
        let source: SharedImage = PatternImage::new(Rectangle::new(-5, 3, 40, 20), 16, 16);
        let image = create(source.clone(), Value::from(0.5)).unwrap().unwrap();
        assert_eq!(image.layout(), source.layout());
        let data = image.get_data(None).unwrap();
        assert_eq!(data.sample(-5, 3, 0), pattern_value(-5, 3) + 0.5);
        assert_eq!(data.sample(34, 22, 0), pattern_value(34, 22) + 0.5);
    }

    #[test]
    fn test_band_count_mismatch_is_rejected() {
        let source: SharedImage = PatternImage::new(Rectangle::new(0, 0, 8, 8), 8, 8);
        let err = create(source, Value::from(vec![1.0, 2.0])).unwrap_err();
        assert!(matches!(err, GraphError::InvalidParameter { index: 0, .. }));
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let args = ResolvedParameters::new(NodeId::new(), "add_const", Vec::new(), vec![Value::from(1.0)]);
        assert!(matches!(
            AddConst.create(&args, &RenderingHints::new()),
            Err(GraphError::SourceIndexOutOfRange { index: 0, .. })
        ));
    }
}
