//! Deferred operation graph.
//!
//! Nodes ([`RenderedOp`]) record an operation name, sources and parameters,
//! and render lazily through an [`OperationRegistry`](crate::operations::OperationRegistry).
//! Editing a node replaces its rendering and propagates a
//! [`RenderingChangeEvent`] to every downstream node.

pub mod events;
mod invalidation;
pub mod parameter_block;
pub mod rendered_op;

pub use events::{RenderingChangeEvent, RenderingChangeListener, SharedChangeListener};
pub use parameter_block::{NodeSource, ParameterBlock, ResolvedParameters};
pub use rendered_op::{RenderedOp, SYNTHETIC_PROPERTIES};
