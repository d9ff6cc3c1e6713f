//! Operations that deferred nodes render through.
//!
//! The [`OperationRegistry`] maps case-insensitive names to
//! [`OperationDescriptor`]s. The [`builtin`] module holds a small set of
//! generators, point operations and area operations.

pub mod builtin;
pub mod registry;

pub use registry::{
    Category, InvalidRegionQuery, OperationDescriptor, OperationMetadata, OperationMetadataBuilder,
    OperationRegistry, ParameterSpec, RegistryEntry, RenderedImageFactory,
};

use crate::core::geometry::Region;
use crate::core::hints::{keys, HintValue, RenderingHints};
use crate::core::layout::ImageLayout;
use log::debug;

/// Partial layout requested through the `image_layout` hint.
pub fn hinted_layout(hints: &RenderingHints) -> ImageLayout {
    match hints.get(keys::IMAGE_LAYOUT) {
        Some(HintValue::Layout(layout)) => *layout,
        Some(other) => {
            debug!("Ignoring {} supplied as the layout hint", other.kind());
            ImageLayout::new()
        }
        None => ImageLayout::new(),
    }
}

/// Invalid region of an operation whose output changes everywhere when
/// anything changes: nothing if the edit left sources, parameters and
/// hints as they were, the whole image otherwise.
pub fn unchanged_or_everything(query: &InvalidRegionQuery<'_>) -> Option<Region> {
    if query.same_sources_and_hints() && query.old_parameters.parameters() == query.new_parameters.parameters() {
        Some(Region::new())
    } else {
        None
    }
}
