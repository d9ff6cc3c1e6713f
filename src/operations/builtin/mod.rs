//! Built-in operations.

mod add_const;
mod box_filter;
mod constant;
mod translate;

use crate::operations::OperationRegistry;

/// Register all built-in operations.
pub fn register_all(registry: &mut OperationRegistry) {
    registry.register_with_tags(constant::Constant, vec!["generator".to_string(), "fill".to_string()]);
    registry.register_with_tags(add_const::AddConst, vec!["arithmetic".to_string(), "offset".to_string()]);
    registry.register_with_tags(translate::Translate, vec!["geometric".to_string(), "shift".to_string()]);
    registry.register_with_tags(box_filter::BoxFilter, vec!["blur".to_string(), "filter".to_string()]);
}

pub use add_const::AddConst;
pub use box_filter::BoxFilter;
pub use constant::Constant;
pub use translate::Translate;
