//! Sources and parameters of a deferred node.

use crate::core::error::{GraphError, GraphResult, NodeId};
use crate::core::geometry::Rectangle;
use crate::core::types::Value;
use crate::graph::RenderedOp;
use crate::image::{PlanarImage, SharedImage};
use crate::operations::OperationMetadata;
use std::fmt;
use std::sync::Arc;

/// A source of a deferred node: another deferred node or a rendered image.
#[derive(Clone)]
pub enum NodeSource {
    /// A deferred node, rendered on demand.
    Node(Arc<RenderedOp>),
    /// An already rendered image.
    Image(SharedImage),
}

impl NodeSource {
    /// Wrap a concrete image.
    pub fn image<I: PlanarImage + 'static>(image: Arc<I>) -> Self {
        NodeSource::Image(image)
    }

    /// The deferred node, if this source is one.
    pub fn as_node(&self) -> Option<&Arc<RenderedOp>> {
        match self {
            NodeSource::Node(node) => Some(node),
            NodeSource::Image(_) => None,
        }
    }

    /// Whether both refer to the same node or image.
    pub fn same_as(&self, other: &NodeSource) -> bool {
        match (self, other) {
            (NodeSource::Node(a), NodeSource::Node(b)) => Arc::ptr_eq(a, b),
            (NodeSource::Image(a), NodeSource::Image(b)) => a.id() == b.id(),
            _ => false,
        }
    }

    /// The rendered image behind this source. Deferred nodes are rendered.
    pub fn render(&self) -> GraphResult<SharedImage> {
        match self {
            NodeSource::Node(node) => node.get_rendering(),
            NodeSource::Image(image) => Ok(image.clone()),
        }
    }
}

impl From<Arc<RenderedOp>> for NodeSource {
    fn from(node: Arc<RenderedOp>) -> Self {
        NodeSource::Node(node)
    }
}

impl From<SharedImage> for NodeSource {
    fn from(image: SharedImage) -> Self {
        NodeSource::Image(image)
    }
}

impl fmt::Debug for NodeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeSource::Node(node) => write!(f, "Node({})", node.id()),
            NodeSource::Image(image) => write!(f, "Image({})", image.id()),
        }
    }
}

/// Ordered sources and parameters of an operation.
#[derive(Clone, Default, Debug)]
pub struct ParameterBlock {
    sources: Vec<NodeSource>,
    parameters: Vec<Value>,
}

impl ParameterBlock {
    /// Create an empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a source.
    pub fn with_source(mut self, source: impl Into<NodeSource>) -> Self {
        self.sources.push(source.into());
        self
    }

    /// Append a parameter.
    pub fn with_parameter(mut self, value: impl Into<Value>) -> Self {
        self.parameters.push(value.into());
        self
    }

    pub fn sources(&self) -> &[NodeSource] {
        &self.sources
    }

    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters.len()
    }

    pub fn source(&self, index: usize) -> Option<&NodeSource> {
        self.sources.get(index)
    }

    pub fn parameter(&self, index: usize) -> Option<&Value> {
        self.parameters.get(index)
    }

    pub fn add_source(&mut self, source: impl Into<NodeSource>) {
        self.sources.push(source.into());
    }

    pub fn add_parameter(&mut self, value: impl Into<Value>) {
        self.parameters.push(value.into());
    }

    /// Replace the source at `index`, returning the previous one.
    pub fn set_source(&mut self, index: usize, source: NodeSource, node: NodeId) -> GraphResult<NodeSource> {
        let count = self.sources.len();
        let slot = self
            .sources
            .get_mut(index)
            .ok_or(GraphError::SourceIndexOutOfRange { node, index, count })?;
        Ok(std::mem::replace(slot, source))
    }

    /// Remove the source at `index`.
    pub fn remove_source(&mut self, index: usize, node: NodeId) -> GraphResult<NodeSource> {
        let count = self.sources.len();
        if index >= count {
            return Err(GraphError::SourceIndexOutOfRange { node, index, count });
        }
        Ok(self.sources.remove(index))
    }

    /// Replace every source.
    pub fn set_sources(&mut self, sources: Vec<NodeSource>) -> Vec<NodeSource> {
        std::mem::replace(&mut self.sources, sources)
    }

    /// Replace the parameter at `index`. Setting the parameter just past
    /// the end appends it.
    pub fn set_parameter(&mut self, index: usize, value: Value) -> GraphResult<()> {
        let count = self.parameters.len();
        match index.cmp(&count) {
            std::cmp::Ordering::Less => self.parameters[index] = value,
            std::cmp::Ordering::Equal => self.parameters.push(value),
            std::cmp::Ordering::Greater => {
                return Err(GraphError::ParameterIndexOutOfRange { index, count })
            }
        }
        Ok(())
    }

    /// Replace every parameter.
    pub fn set_parameters(&mut self, parameters: Vec<Value>) {
        self.parameters = parameters;
    }

    /// Deferred nodes among the sources.
    pub fn source_nodes(&self) -> impl Iterator<Item = &Arc<RenderedOp>> {
        self.sources.iter().filter_map(NodeSource::as_node)
    }
}

impl PartialEq for ParameterBlock {
    fn eq(&self, other: &Self) -> bool {
        self.parameters == other.parameters
            && self.sources.len() == other.sources.len()
            && self.sources.iter().zip(&other.sources).all(|(a, b)| a.same_as(b))
    }
}

// ============================================================================
// Resolved parameters
// ============================================================================

/// Sources rendered and parameters ready for an operation factory.
pub struct ResolvedParameters {
    node: NodeId,
    operation: String,
    sources: Vec<SharedImage>,
    parameters: Vec<Value>,
}

impl ResolvedParameters {
    /// Bundle rendered sources with parameters for `operation`.
    pub fn new(node: NodeId, operation: impl Into<String>, sources: Vec<SharedImage>, parameters: Vec<Value>) -> Self {
        Self {
            node,
            operation: operation.into(),
            sources,
            parameters,
        }
    }

    /// Render every source of `block` and fill omitted trailing parameters
    /// with the defaults from `metadata`.
    pub fn resolve(node: NodeId, metadata: &OperationMetadata, block: &ParameterBlock) -> GraphResult<Self> {
        let sources = block
            .sources()
            .iter()
            .map(NodeSource::render)
            .collect::<GraphResult<Vec<_>>>()?;
        Ok(Self::new(
            node,
            metadata.name.clone(),
            sources,
            metadata.with_defaults(block.parameters()),
        ))
    }

    /// Node being rendered.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn sources(&self) -> &[SharedImage] {
        &self.sources
    }

    pub fn parameters(&self) -> &[Value] {
        &self.parameters
    }

    pub fn source(&self, index: usize) -> GraphResult<SharedImage> {
        self.sources
            .get(index)
            .cloned()
            .ok_or(GraphError::SourceIndexOutOfRange {
                node: self.node,
                index,
                count: self.sources.len(),
            })
    }

    pub fn parameter(&self, index: usize) -> GraphResult<&Value> {
        self.parameters
            .get(index)
            .ok_or(GraphError::ParameterIndexOutOfRange {
                index,
                count: self.parameters.len(),
            })
    }

    fn invalid(&self, index: usize, reason: String) -> GraphError {
        GraphError::InvalidParameter {
            operation: self.operation.clone(),
            index,
            reason,
        }
    }

    /// Integer parameter.
    pub fn integer(&self, index: usize) -> GraphResult<i64> {
        let value = self.parameter(index)?;
        value
            .as_integer()
            .ok_or_else(|| self.invalid(index, format!("expected an integer, got {}", value.type_name())))
    }

    /// Integer parameter that must fit a pixel coordinate.
    pub fn int32(&self, index: usize) -> GraphResult<i32> {
        let value = self.integer(index)?;
        i32::try_from(value).map_err(|_| self.invalid(index, format!("{} does not fit in 32 bits", value)))
    }

    /// Integer parameter, or `default` when absent.
    pub fn integer_or(&self, index: usize, default: i64) -> GraphResult<i64> {
        match self.parameters.get(index) {
            None | Some(Value::None) => Ok(default),
            Some(_) => self.integer(index),
        }
    }

    /// Numeric parameter.
    pub fn float(&self, index: usize) -> GraphResult<f64> {
        let value = self.parameter(index)?;
        value
            .as_float()
            .ok_or_else(|| self.invalid(index, format!("expected a number, got {}", value.type_name())))
    }

    /// Numeric list parameter. A single number is a list of one.
    pub fn float_list(&self, index: usize) -> GraphResult<Vec<f64>> {
        let value = self.parameter(index)?;
        if let Some(number) = value.as_float() {
            return Ok(vec![number]);
        }
        value
            .as_float_list()
            .ok_or_else(|| self.invalid(index, format!("expected a list of numbers, got {}", value.type_name())))
    }

    /// Rectangle parameter.
    pub fn rectangle(&self, index: usize) -> GraphResult<Rectangle> {
        let value = self.parameter(index)?;
        value
            .as_rectangle()
            .ok_or_else(|| self.invalid(index, format!("expected a rectangle, got {}", value.type_name())))
    }
}
