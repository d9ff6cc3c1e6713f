//! Operation registry: resolves operation names to descriptors and factories.

use crate::core::error::{GraphError, GraphResult, NodeId};
use crate::core::geometry::Region;
use crate::core::hints::RenderingHints;
use crate::core::types::Value;
use crate::graph::{ParameterBlock, ResolvedParameters};
use crate::image::SharedImage;
use indexmap::IndexMap;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Operation category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Images computed from parameters alone.
    Generator,
    /// Per-pixel arithmetic.
    Arithmetic,
    /// Coordinate transforms.
    Geometric,
    /// Neighbourhood filters.
    Filter,
    /// Anything else.
    Utility,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Generator => "Generator",
            Category::Arithmetic => "Arithmetic",
            Category::Geometric => "Geometric",
            Category::Filter => "Filter",
            Category::Utility => "Utility",
        };
        write!(f, "{}", name)
    }
}

/// A positional parameter of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub default: Value,
    pub description: String,
}

impl ParameterSpec {
    /// Create a parameter with a default value.
    pub fn new(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: default.into(),
            description: String::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Static description of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMetadata {
    /// Registry key.
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    pub description: String,
    pub category: Category,
    /// Number of sources the operation expects.
    pub num_sources: usize,
    /// Positional parameters, in order.
    pub parameters: Vec<ParameterSpec>,
}

impl OperationMetadata {
    /// Start building metadata.
    pub fn builder(name: impl Into<String>, display_name: impl Into<String>) -> OperationMetadataBuilder {
        OperationMetadataBuilder {
            metadata: OperationMetadata {
                name: name.into(),
                display_name: display_name.into(),
                description: String::new(),
                category: Category::Utility,
                num_sources: 0,
                parameters: Vec::new(),
            },
        }
    }

    /// Fill trailing parameters missing from `parameters` with their defaults.
    pub fn with_defaults(&self, parameters: &[Value]) -> Vec<Value> {
        let mut filled = parameters.to_vec();
        for spec in self.parameters.iter().skip(parameters.len()) {
            filled.push(spec.default.clone());
        }
        filled
    }
}

/// Builder for [`OperationMetadata`].
pub struct OperationMetadataBuilder {
    metadata: OperationMetadata,
}

impl OperationMetadataBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = description.into();
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.metadata.category = category;
        self
    }

    pub fn sources(mut self, num_sources: usize) -> Self {
        self.metadata.num_sources = num_sources;
        self
    }

    pub fn parameter(mut self, parameter: ParameterSpec) -> Self {
        self.metadata.parameters.push(parameter);
        self
    }

    pub fn build(self) -> OperationMetadata {
        self.metadata
    }
}

/// Arguments of [`OperationDescriptor::get_invalid_region`].
pub struct InvalidRegionQuery<'a> {
    /// Node being edited.
    pub node: NodeId,
    /// The node's rendering before the edit.
    pub rendering: &'a SharedImage,
    pub old_parameters: &'a ParameterBlock,
    pub old_hints: &'a RenderingHints,
    pub new_parameters: &'a ParameterBlock,
    pub new_hints: &'a RenderingHints,
}

impl InvalidRegionQuery<'_> {
    /// Whether sources and hints are unchanged by the edit.
    pub fn same_sources_and_hints(&self) -> bool {
        self.old_hints == self.new_hints
            && self.old_parameters.num_sources() == self.new_parameters.num_sources()
            && self
                .old_parameters
                .sources()
                .iter()
                .zip(self.new_parameters.sources())
                .all(|(a, b)| a.same_as(b))
    }
}

/// An operation that deferred nodes can render.
pub trait OperationDescriptor: Send + Sync {
    /// Static description.
    fn metadata(&self) -> OperationMetadata;

    /// Build a rendering. `Ok(None)` means the operation declined to
    /// produce one for these arguments.
    fn create(&self, args: &ResolvedParameters, hints: &RenderingHints) -> GraphResult<Option<SharedImage>>;

    /// Destination region whose pixels change when a node's parameters
    /// and hints are edited. `None` means everything must be recomputed.
    fn get_invalid_region(&self, _query: &InvalidRegionQuery<'_>) -> Option<Region> {
        None
    }
}

/// Factory closure registered with [`OperationRegistry::register_fn`].
pub type RenderedImageFactory =
    Arc<dyn Fn(&ResolvedParameters, &RenderingHints) -> GraphResult<Option<SharedImage>> + Send + Sync>;

/// Descriptor backed by a factory closure. Edits always invalidate the
/// whole rendering.
struct FnOperation {
    metadata: OperationMetadata,
    factory: RenderedImageFactory,
}

impl OperationDescriptor for FnOperation {
    fn metadata(&self) -> OperationMetadata {
        self.metadata.clone()
    }

    fn create(&self, args: &ResolvedParameters, hints: &RenderingHints) -> GraphResult<Option<SharedImage>> {
        (self.factory)(args, hints)
    }
}

/// Registry entry.
#[derive(Clone)]
pub struct RegistryEntry {
    pub descriptor: Arc<dyn OperationDescriptor>,
    /// Cached metadata.
    pub metadata: OperationMetadata,
    /// Disabled operations resolve but produce no rendering.
    pub enabled: bool,
    /// Tags for search.
    pub tags: Vec<String>,
}

/// Registry of operations, keyed by case-insensitive name.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: IndexMap<String, RegistryEntry>,
}

fn key(name: &str) -> String {
    name.to_lowercase()
}

impl OperationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in operations.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::operations::builtin::register_all(&mut registry);
        registry
    }

    /// Register an operation, replacing any operation of the same name.
    pub fn register(&mut self, descriptor: impl OperationDescriptor + 'static) {
        self.register_with_tags(descriptor, Vec::new());
    }

    /// Register an operation with search tags.
    pub fn register_with_tags(&mut self, descriptor: impl OperationDescriptor + 'static, tags: Vec<String>) {
        let metadata = descriptor.metadata();
        debug!("Registering operation '{}'", metadata.name);
        self.operations.insert(
            key(&metadata.name),
            RegistryEntry {
                descriptor: Arc::new(descriptor),
                metadata,
                enabled: true,
                tags,
            },
        );
    }

    /// Register a factory closure under `metadata.name`.
    pub fn register_fn<F>(&mut self, metadata: OperationMetadata, factory: F)
    where
        F: Fn(&ResolvedParameters, &RenderingHints) -> GraphResult<Option<SharedImage>> + Send + Sync + 'static,
    {
        self.register(FnOperation {
            metadata,
            factory: Arc::new(factory),
        });
    }

    /// Remove an operation. Returns whether it was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.operations.shift_remove(&key(name)).is_some()
    }

    /// Look up an operation's descriptor.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn OperationDescriptor>> {
        self.operations.get(&key(name)).map(|e| e.descriptor.clone())
    }

    /// Look up a registry entry.
    pub fn get_entry(&self, name: &str) -> Option<&RegistryEntry> {
        self.operations.get(&key(name))
    }

    /// Metadata of an operation.
    pub fn get_metadata(&self, name: &str) -> Option<&OperationMetadata> {
        self.get_entry(name).map(|e| &e.metadata)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.contains_key(&key(name))
    }

    /// Render `name` with `args`. Disabled operations produce `Ok(None)`.
    pub fn create(
        &self,
        name: &str,
        args: &ResolvedParameters,
        hints: &RenderingHints,
    ) -> GraphResult<Option<SharedImage>> {
        let entry = self
            .get_entry(name)
            .ok_or_else(|| GraphError::UnknownOperation(name.to_string()))?;
        if !entry.enabled {
            debug!("Operation '{}' is disabled", name);
            return Ok(None);
        }
        entry.descriptor.create(args, hints)
    }

    /// Registered operation names.
    pub fn operation_names(&self) -> impl Iterator<Item = &str> {
        self.operations.values().map(|e| e.metadata.name.as_str())
    }

    /// Operations of a category.
    pub fn operations_by_category(&self, category: Category) -> Vec<&str> {
        self.operations
            .values()
            .filter(|e| e.metadata.category == category)
            .map(|e| e.metadata.name.as_str())
            .collect()
    }

    /// Search names, descriptions and tags.
    pub fn search(&self, query: &str) -> Vec<&str> {
        let query = query.to_lowercase();
        self.operations
            .values()
            .filter(|entry| {
                entry.metadata.name.to_lowercase().contains(&query)
                    || entry.metadata.display_name.to_lowercase().contains(&query)
                    || entry.metadata.description.to_lowercase().contains(&query)
                    || entry.tags.iter().any(|t| t.to_lowercase().contains(&query))
            })
            .map(|e| e.metadata.name.as_str())
            .collect()
    }

    /// Enable or disable an operation. Returns whether it is registered.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.operations.get_mut(&key(name)) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Add search tags to an operation.
    pub fn add_tags(&mut self, name: &str, tags: Vec<String>) -> bool {
        match self.operations.get_mut(&key(name)) {
            Some(entry) => {
                entry.tags.extend(tags);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of enabled operations.
    pub fn enabled_count(&self) -> usize {
        self.operations.values().filter(|e| e.enabled).count()
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.operations.keys()).finish()
    }
}
