//! Deferred operation nodes.
//!
//! A [`RenderedOp`] names an operation, its sources and parameters, and
//! renders itself on first use through the operation registry. Edits
//! replace the rendering right away when one exists, moving still-valid
//! cached tiles over to the new rendering, and then notify listeners and
//! downstream nodes.
//!
//! All state changes of a node are serialized by its lock. Rendering a
//! node locks its source nodes while its own lock is held, so locks are
//! always taken from sink to source.

use crate::core::error::{GraphError, GraphResult, ImageId, NodeId, TileResult};
use crate::core::geometry::{Rectangle, TileIndex};
use crate::core::hints::{HintValue, RenderingHints};
use crate::core::layout::Layout;
use crate::core::properties::{normalize_name, PropertyOrigin, PropertyTable};
use crate::core::raster::Raster;
use crate::core::types::Value;
use crate::execution::request::TileRequest;
use crate::execution::scheduler::{default_scheduler, ComputeTarget};
use crate::graph::events::{propagate, RenderingChangeEvent, RenderingChangeListener, SharedChangeListener};
use crate::graph::invalidation::{plan_edit, plan_source_change, transfer_tiles, Plan};
use crate::graph::{NodeSource, ParameterBlock, ResolvedParameters};
use crate::image::SharedImage;
use crate::operations::{InvalidRegionQuery, OperationRegistry};
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

/// Properties computed from the rendering. They cannot be set.
pub const SYNTHETIC_PROPERTIES: [&str; 5] = [
    "image_width",
    "image_height",
    "image_min_x",
    "image_min_y",
    "tile_cache_key",
];

struct NodeState {
    operation_name: String,
    registry: Arc<OperationRegistry>,
    parameters: ParameterBlock,
    hints: RenderingHints,
    rendering: Option<SharedImage>,
    properties: PropertyTable,
    /// Properties read from one specific source instead of the first
    /// source defining them.
    property_sources: HashMap<String, usize>,
    suppressed: HashSet<String>,
}

/// How an edit affects the rendering.
#[derive(Clone, Copy)]
enum EditKind {
    /// Operation or registry changed: nothing can be retained.
    Replace,
    /// Parameters, sources or hints changed: ask the operation.
    Parameters,
}

/// A deferred node of the operation graph.
pub struct RenderedOp {
    id: NodeId,
    state: Mutex<NodeState>,
    sinks: Mutex<Vec<Weak<RenderedOp>>>,
    listeners: RwLock<Vec<SharedChangeListener>>,
    /// Set once the node has been detached from its sources.
    disposed: AtomicBool,
    this: Weak<RenderedOp>,
}

impl RenderedOp {
    /// Create a node. Nothing is rendered until the rendering is requested.
    pub fn new(
        registry: Arc<OperationRegistry>,
        operation_name: impl Into<String>,
        parameters: ParameterBlock,
        hints: RenderingHints,
    ) -> Arc<Self> {
        let source_nodes: Vec<Arc<RenderedOp>> = parameters.source_nodes().cloned().collect();
        let node = Arc::new_cyclic(|this| Self {
            id: NodeId::new(),
            state: Mutex::new(NodeState {
                operation_name: operation_name.into(),
                registry,
                parameters,
                hints,
                rendering: None,
                properties: PropertyTable::new(),
                property_sources: HashMap::new(),
                suppressed: HashSet::new(),
            }),
            sinks: Mutex::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            disposed: AtomicBool::new(false),
            this: this.clone(),
        });
        for source in unique_nodes(source_nodes) {
            source.add_sink(Arc::downgrade(&node));
        }
        node
    }

    /// Identity of the node.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Whether [`RenderedOp::dispose`] has been called. A disposed node can
    /// still render on request but no longer hears from its sources.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(AtomicOrdering::Acquire)
    }

    pub fn operation_name(&self) -> String {
        self.state.lock().operation_name.clone()
    }

    pub fn registry(&self) -> Arc<OperationRegistry> {
        self.state.lock().registry.clone()
    }

    pub fn parameter_block(&self) -> ParameterBlock {
        self.state.lock().parameters.clone()
    }

    pub fn parameters(&self) -> Vec<Value> {
        self.state.lock().parameters.parameters().to_vec()
    }

    pub fn sources(&self) -> Vec<NodeSource> {
        self.state.lock().parameters.sources().to_vec()
    }

    pub fn num_sources(&self) -> usize {
        self.state.lock().parameters.num_sources()
    }

    pub fn rendering_hints(&self) -> RenderingHints {
        self.state.lock().hints.clone()
    }

    /// Deferred nodes among the sources.
    pub fn source_nodes(&self) -> Vec<Arc<RenderedOp>> {
        self.state.lock().parameters.source_nodes().cloned().collect()
    }

    // ------------------------------------------------------------------------
    // Sinks
    // ------------------------------------------------------------------------

    fn add_sink(&self, sink: Weak<RenderedOp>) {
        self.sinks.lock().push(sink);
    }

    fn remove_sink(&self, sink: NodeId) {
        self.sinks
            .lock()
            .retain(|weak| weak.upgrade().map_or(false, |node| node.id != sink));
    }

    /// Live downstream nodes. Dropped nodes are pruned.
    pub fn sink_nodes(&self) -> Vec<Arc<RenderedOp>> {
        let mut sinks = self.sinks.lock();
        let mut live = Vec::with_capacity(sinks.len());
        sinks.retain(|weak| match weak.upgrade() {
            Some(node) => {
                live.push(node);
                true
            }
            None => false,
        });
        live
    }

    fn relink_sources(&self, before: &[Arc<RenderedOp>], after: &ParameterBlock) {
        let after: Vec<Arc<RenderedOp>> = unique_nodes(after.source_nodes().cloned().collect());
        for old in before {
            if !after.iter().any(|n| Arc::ptr_eq(n, old)) {
                old.remove_sink(self.id);
            }
        }
        if self.is_disposed() {
            return;
        }
        for new in &after {
            if !before.iter().any(|n| Arc::ptr_eq(n, new)) {
                new.add_sink(self.this.clone());
            }
        }
    }

    /// Reject `candidate` if this node is reachable from it.
    fn check_acyclic<'a>(&self, candidates: impl IntoIterator<Item = &'a NodeSource>) -> GraphResult<()> {
        for candidate in candidates {
            let Some(start) = candidate.as_node() else {
                continue;
            };
            let mut stack = vec![start.clone()];
            let mut seen = HashSet::new();
            while let Some(node) = stack.pop() {
                if node.id == self.id {
                    return Err(GraphError::CycleDetected {
                        source_node: start.id,
                        sink: self.id,
                    });
                }
                if seen.insert(node.id) {
                    stack.extend(node.source_nodes());
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------------

    fn render_locked(&self, state: &NodeState) -> GraphResult<SharedImage> {
        let name = &state.operation_name;
        let metadata = state
            .registry
            .get_metadata(name)
            .ok_or_else(|| GraphError::UnknownOperation(name.clone()))?;
        let args = ResolvedParameters::resolve(self.id, metadata, &state.parameters)?;
        let rendering = state
            .registry
            .create(name, &args, &state.hints)?
            .ok_or_else(|| GraphError::NullRendering { name: name.clone() })?;
        debug!("Node {} rendered '{}' as image {}", self.id, name, rendering.id());
        Ok(rendering)
    }

    /// Render the node without memoizing the result.
    pub fn create_instance(&self) -> GraphResult<SharedImage> {
        let state = self.state.lock();
        self.render_locked(&state)
    }

    /// The rendering, created on first use and reused until invalidated.
    pub fn get_rendering(&self) -> GraphResult<SharedImage> {
        let mut state = self.state.lock();
        if let Some(rendering) = &state.rendering {
            return Ok(rendering.clone());
        }
        let rendering = self.render_locked(&state)?;
        state.rendering = Some(rendering.clone());
        Ok(rendering)
    }

    /// The rendering if one exists, without creating it.
    pub fn current_rendering(&self) -> Option<SharedImage> {
        self.state.lock().rendering.clone()
    }

    /// Replace the rendering with a fresh one. An existing rendering is
    /// reported as changed in its entirety.
    pub fn get_new_rendering(&self) -> GraphResult<SharedImage> {
        let (old, new) = {
            let mut state = self.state.lock();
            let new = self.render_locked(&state)?;
            state.properties.clear_derived();
            (state.rendering.replace(new.clone()), new)
        };
        if let Some(old) = old {
            let event = self.retire(old, new.clone(), Plan::full());
            self.broadcast(event);
        }
        Ok(new)
    }

    /// Move retained tiles, release the old rendering and describe the change.
    fn retire(&self, old: SharedImage, new: SharedImage, plan: Plan) -> RenderingChangeEvent {
        transfer_tiles(&old, &new, &plan.retention);
        old.dispose();
        RenderingChangeEvent {
            node: self.id,
            old_rendering: Some(old),
            new_rendering: Some(new),
            invalid_region: plan.invalid_region,
        }
    }

    fn broadcast(&self, event: RenderingChangeEvent) {
        if let Some(this) = self.this.upgrade() {
            propagate(this, event);
        }
    }

    // ------------------------------------------------------------------------
    // Edits
    // ------------------------------------------------------------------------

    /// Apply an edit and, if a rendering exists, re-render and notify.
    fn edit<F>(&self, kind: EditKind, apply: F) -> GraphResult<Option<RenderingChangeEvent>>
    where
        F: FnOnce(&mut NodeState) -> GraphResult<()>,
    {
        let (old, new, plan) = {
            let mut state = self.state.lock();
            let old_parameters = state.parameters.clone();
            let old_hints = state.hints.clone();
            let before: Vec<Arc<RenderedOp>> = unique_nodes(old_parameters.source_nodes().cloned().collect());

            apply(&mut *state)?;
            self.relink_sources(&before, &state.parameters);
            state.properties.clear_derived();

            let Some(old) = state.rendering.take() else {
                return Ok(None);
            };
            let plan = match kind {
                EditKind::Replace => Plan::full(),
                EditKind::Parameters => match state.registry.resolve(&state.operation_name) {
                    Some(descriptor) => {
                        let query = InvalidRegionQuery {
                            node: self.id,
                            rendering: &old,
                            old_parameters: &old_parameters,
                            old_hints: &old_hints,
                            new_parameters: &state.parameters,
                            new_hints: &state.hints,
                        };
                        plan_edit(descriptor.as_ref(), &query)
                    }
                    None => Plan::full(),
                },
            };
            let new = match self.render_locked(&state) {
                Ok(new) => new,
                Err(e) => {
                    drop(state);
                    old.dispose();
                    return Err(e);
                }
            };
            state.rendering = Some(new.clone());
            (old, new, plan)
        };

        let event = self.retire(old, new, plan);
        self.broadcast(event.clone());
        Ok(Some(event))
    }

    /// React to a change of a source node's rendering. Returns the event
    /// describing this node's own change, if it re-rendered.
    pub(crate) fn source_changed(&self, event: &RenderingChangeEvent) -> GraphResult<Option<RenderingChangeEvent>> {
        if self.is_disposed() {
            return Ok(None);
        }
        let (old, new, plan) = {
            let mut state = self.state.lock();
            let indices: Vec<usize> = state
                .parameters
                .sources()
                .iter()
                .enumerate()
                .filter(|(_, source)| source.as_node().map_or(false, |n| n.id == event.node))
                .map(|(index, _)| index)
                .collect();
            if indices.is_empty() {
                return Ok(None);
            }
            state.properties.clear_derived();
            let Some(old) = state.rendering.take() else {
                return Ok(None);
            };
            let plan = plan_source_change(&old, event, &indices);
            let new = match self.render_locked(&state) {
                Ok(new) => new,
                Err(e) => {
                    drop(state);
                    old.dispose();
                    return Err(e);
                }
            };
            state.rendering = Some(new.clone());
            (old, new, plan)
        };
        trace!("Node {} re-rendered after source {} changed", self.id, event.node);
        Ok(Some(self.retire(old, new, plan)))
    }

    /// Switch to another operation. The rendering is replaced entirely.
    pub fn set_operation_name(&self, name: impl Into<String>) -> GraphResult<Option<RenderingChangeEvent>> {
        let name = name.into();
        self.edit(EditKind::Replace, move |state| {
            state.operation_name = name;
            Ok(())
        })
    }

    /// Resolve operations through another registry. The rendering is
    /// replaced entirely.
    pub fn set_registry(&self, registry: Arc<OperationRegistry>) -> GraphResult<Option<RenderingChangeEvent>> {
        self.edit(EditKind::Replace, move |state| {
            state.registry = registry;
            Ok(())
        })
    }

    /// Replace sources and parameters.
    pub fn set_parameter_block(&self, parameters: ParameterBlock) -> GraphResult<Option<RenderingChangeEvent>> {
        self.check_acyclic(parameters.sources())?;
        self.edit(EditKind::Parameters, move |state| {
            state.parameters = parameters;
            Ok(())
        })
    }

    /// Replace every parameter, keeping the sources.
    pub fn set_parameters(&self, parameters: Vec<Value>) -> GraphResult<Option<RenderingChangeEvent>> {
        self.edit(EditKind::Parameters, move |state| {
            state.parameters.set_parameters(parameters);
            Ok(())
        })
    }

    /// Replace one parameter.
    pub fn set_parameter(&self, index: usize, value: impl Into<Value>) -> GraphResult<Option<RenderingChangeEvent>> {
        let value = value.into();
        self.edit(EditKind::Parameters, move |state| state.parameters.set_parameter(index, value))
    }

    /// Append a parameter.
    pub fn add_parameter(&self, value: impl Into<Value>) -> GraphResult<Option<RenderingChangeEvent>> {
        let value = value.into();
        self.edit(EditKind::Parameters, move |state| {
            state.parameters.add_parameter(value);
            Ok(())
        })
    }

    /// Replace every source.
    pub fn set_sources(&self, sources: Vec<NodeSource>) -> GraphResult<Option<RenderingChangeEvent>> {
        self.check_acyclic(&sources)?;
        self.edit(EditKind::Parameters, move |state| {
            state.parameters.set_sources(sources);
            Ok(())
        })
    }

    /// Replace one source.
    pub fn set_source(&self, index: usize, source: impl Into<NodeSource>) -> GraphResult<Option<RenderingChangeEvent>> {
        let source = source.into();
        self.check_acyclic([&source])?;
        let id = self.id;
        self.edit(EditKind::Parameters, move |state| {
            state.parameters.set_source(index, source, id).map(|_| ())
        })
    }

    /// Append a source.
    pub fn add_source(&self, source: impl Into<NodeSource>) -> GraphResult<Option<RenderingChangeEvent>> {
        let source = source.into();
        self.check_acyclic([&source])?;
        self.edit(EditKind::Parameters, move |state| {
            state.parameters.add_source(source);
            Ok(())
        })
    }

    /// Remove one source.
    pub fn remove_source(&self, index: usize) -> GraphResult<Option<RenderingChangeEvent>> {
        let id = self.id;
        self.edit(EditKind::Parameters, move |state| {
            state.parameters.remove_source(index, id).map(|_| ())
        })
    }

    /// Replace the rendering hints.
    pub fn set_rendering_hints(&self, hints: RenderingHints) -> GraphResult<Option<RenderingChangeEvent>> {
        self.edit(EditKind::Parameters, move |state| {
            state.hints = hints;
            Ok(())
        })
    }

    /// Set one rendering hint.
    pub fn set_rendering_hint(
        &self,
        key: impl Into<String>,
        value: impl Into<HintValue>,
    ) -> GraphResult<Option<RenderingChangeEvent>> {
        let (key, value) = (key.into(), value.into());
        self.edit(EditKind::Parameters, move |state| {
            state.hints.insert(key, value);
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    /// Register a listener. The returned handle removes it again.
    pub fn add_rendering_change_listener(
        &self,
        listener: impl RenderingChangeListener + 'static,
    ) -> SharedChangeListener {
        let listener: SharedChangeListener = Arc::new(listener);
        self.listeners.write().push(listener.clone());
        listener
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_rendering_change_listener(&self, listener: &SharedChangeListener) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    pub(crate) fn notify_listeners(&self, event: &RenderingChangeEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.rendering_changed(event);
        }
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    fn synthetic_property(&self, name: &str) -> GraphResult<Option<Value>> {
        if !SYNTHETIC_PROPERTIES.contains(&name) {
            return Ok(None);
        }
        let rendering = self.get_rendering()?;
        let bounds = rendering.bounds();
        let value = match name {
            "image_width" => Value::Integer(bounds.width as i64),
            "image_height" => Value::Integer(bounds.height as i64),
            "image_min_x" => Value::Integer(bounds.x as i64),
            "image_min_y" => Value::Integer(bounds.y as i64),
            _ => Value::String(rendering.id().0.to_string()),
        };
        Ok(Some(value))
    }

    /// Look up a property: values derived from the rendering first, then
    /// properties set on the node, then the first source defining it.
    pub fn get_property(&self, name: &str) -> GraphResult<Option<Value>> {
        let name = normalize_name(name);
        if let Some(value) = self.synthetic_property(&name)? {
            return Ok(Some(value));
        }

        let (sources, pinned) = {
            let state = self.state.lock();
            if state.suppressed.contains(&name) {
                return Ok(None);
            }
            if let Some(value) = state.properties.get(&name) {
                return Ok(Some(value.clone()));
            }
            (state.parameters.sources().to_vec(), state.property_sources.get(&name).copied())
        };

        let inherited = match pinned {
            Some(index) => match sources.get(index) {
                Some(source) => source_property(source, &name)?,
                None => None,
            },
            None => {
                let mut found = None;
                for source in &sources {
                    if let Some(value) = source_property(source, &name)? {
                        found = Some(value);
                        break;
                    }
                }
                found
            }
        };

        if let Some(value) = &inherited {
            self.state.lock().properties.cache(&name, value.clone());
        }
        Ok(inherited)
    }

    /// Set a property on the node.
    pub fn set_property(&self, name: &str, value: impl Into<Value>) -> GraphResult<()> {
        let name = normalize_name(name);
        if SYNTHETIC_PROPERTIES.contains(&name.as_str()) {
            return Err(GraphError::ReadOnlyProperty(name));
        }
        let mut state = self.state.lock();
        state.suppressed.remove(&name);
        state.properties.set(&name, value.into());
        Ok(())
    }

    /// Remove a property set on the node.
    pub fn remove_property(&self, name: &str) -> Option<Value> {
        self.state.lock().properties.remove(name)
    }

    /// Hide a property, whether local or inherited.
    pub fn suppress_property(&self, name: &str) -> GraphResult<()> {
        let name = normalize_name(name);
        if SYNTHETIC_PROPERTIES.contains(&name.as_str()) {
            return Err(GraphError::ReadOnlyProperty(name));
        }
        let mut state = self.state.lock();
        state.properties.remove(&name);
        state.suppressed.insert(name);
        Ok(())
    }

    /// Inherit `name` from the source at `source_index` only.
    pub fn copy_property_from_source(&self, name: &str, source_index: usize) -> GraphResult<()> {
        let name = normalize_name(name);
        let mut state = self.state.lock();
        let count = state.parameters.num_sources();
        if source_index >= count {
            return Err(GraphError::SourceIndexOutOfRange {
                node: self.id,
                index: source_index,
                count,
            });
        }
        if state.properties.origin(&name) == Some(PropertyOrigin::Derived) {
            state.properties.remove(&name);
        }
        state.property_sources.insert(name, source_index);
        Ok(())
    }

    /// Names of every visible property.
    pub fn property_names(&self) -> Vec<String> {
        let (mut names, sources, suppressed) = {
            let state = self.state.lock();
            (
                state.properties.names(),
                state.parameters.sources().to_vec(),
                state.suppressed.clone(),
            )
        };
        for source in &sources {
            let inherited = match source {
                NodeSource::Node(node) => node.property_names(),
                NodeSource::Image(image) => image.core().property_names(),
            };
            for name in inherited {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names.retain(|n| !suppressed.contains(n));
        let mut all: Vec<String> = SYNTHETIC_PROPERTIES.iter().map(|s| s.to_string()).collect();
        all.extend(names);
        all
    }

    // ------------------------------------------------------------------------
    // Rendering access
    // ------------------------------------------------------------------------

    pub fn layout(&self) -> GraphResult<Layout> {
        Ok(self.get_rendering()?.layout())
    }

    pub fn bounds(&self) -> GraphResult<Rectangle> {
        Ok(self.get_rendering()?.bounds())
    }

    pub fn get_tile(&self, tile_x: i32, tile_y: i32) -> GraphResult<Option<Raster>> {
        Ok(self.get_rendering()?.get_tile(tile_x, tile_y)?)
    }

    pub fn get_tiles(&self, indices: &[TileIndex]) -> GraphResult<Vec<Option<Raster>>> {
        Ok(self.get_rendering()?.get_tiles(indices)?)
    }

    pub fn get_data(&self, region: Option<&Rectangle>) -> GraphResult<Raster> {
        Ok(self.get_rendering()?.get_data(region)?)
    }

    pub fn copy_data(&self, dest: &mut Raster) -> GraphResult<()> {
        Ok(self.get_rendering()?.copy_data(dest)?)
    }

    /// Compute tiles of the rendering in the background.
    pub fn queue_tiles(&self, indices: &[TileIndex]) -> GraphResult<TileRequest> {
        let rendering = self.get_rendering()?;
        if let Some(op) = rendering.as_op_image() {
            return Ok(op.queue_tiles(indices));
        }
        let in_range: Vec<TileIndex> = indices
            .iter()
            .copied()
            .filter(|i| rendering.contains_tile(i.x, i.y))
            .collect();
        Ok(default_scheduler().schedule_tiles_async(Arc::new(ImageTarget(rendering)), &in_range, Vec::new()))
    }

    /// Advise that queued tiles are no longer needed.
    pub fn cancel_tiles(&self, request: &TileRequest, indices: Option<&[TileIndex]>) {
        let rendering = self.current_rendering();
        match rendering.as_ref().and_then(|r| r.as_op_image()) {
            Some(op) => op.cancel_tiles(request, indices),
            None => default_scheduler().cancel_tiles(request, indices),
        }
    }

    /// Warm the rendering's cache.
    pub fn prefetch_tiles(&self, indices: &[TileIndex]) -> GraphResult<()> {
        let rendering = self.get_rendering()?;
        match rendering.as_op_image() {
            Some(op) => op.prefetch_tiles(indices),
            None => default_scheduler().prefetch_tiles(Arc::new(ImageTarget(rendering.clone())), indices),
        }
        Ok(())
    }

    /// Release the rendering and detach from the source nodes. The node
    /// renders again on demand.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, AtomicOrdering::AcqRel) {
            for source in unique_nodes(self.source_nodes()) {
                source.remove_sink(self.id);
            }
            debug!("Node {} detached from its sources", self.id);
        }
        let rendering = self.state.lock().rendering.take();
        if let Some(rendering) = rendering {
            rendering.dispose();
        }
    }
}

impl fmt::Debug for RenderedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RenderedOp")
            .field("id", &self.id)
            .field("operation", &state.operation_name)
            .field("parameters", &state.parameters)
            .field("rendered", &state.rendering.is_some())
            .finish()
    }
}

fn unique_nodes(nodes: Vec<Arc<RenderedOp>>) -> Vec<Arc<RenderedOp>> {
    let mut unique: Vec<Arc<RenderedOp>> = Vec::with_capacity(nodes.len());
    for node in nodes {
        if !unique.iter().any(|n| Arc::ptr_eq(n, &node)) {
            unique.push(node);
        }
    }
    unique
}

fn source_property(source: &NodeSource, name: &str) -> GraphResult<Option<Value>> {
    match source {
        NodeSource::Node(node) => node.get_property(name),
        NodeSource::Image(image) => Ok(image.get_property(name)),
    }
}

/// Schedules tiles of an image that has no scheduler of its own.
struct ImageTarget(SharedImage);

impl ComputeTarget for ImageTarget {
    fn target_id(&self) -> ImageId {
        self.0.id()
    }

    fn compute_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Raster> {
        self.0.require_tile(tile_x, tile_y)
    }

    fn fetch_tile(&self, tile_x: i32, tile_y: i32) -> TileResult<Option<Raster>> {
        self.0.get_tile(tile_x, tile_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::Region;
    use crate::core::hints::keys;
    use crate::core::layout::ImageLayout;
    use crate::core::raster::PixelFormat;
    use crate::execution::cache::TileCache;
    use crate::test_support::{init_logging, test_registry, Harness};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn all_tiles(node: &RenderedOp) -> Vec<TileIndex> {
        node.get_rendering().unwrap().tile_range().iter().collect()
    }

    fn counter(node: &RenderedOp) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        node.add_rendering_change_listener(move |_: &RenderingChangeEvent| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_rendering_is_memoized() {
        let harness = Harness::new();
        let node = harness.stamp(128, 96, Rectangle::new(0, 0, 4, 4));
        let first = node.get_rendering().unwrap();
        let second = node.get_rendering().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(node.current_rendering().is_some());

        let fresh = node.create_instance().unwrap();
        assert_ne!(fresh.id(), first.id());
    }

    #[test]
    fn test_null_rendering_is_an_error() {
        let node = RenderedOp::new(test_registry(), "null", ParameterBlock::new(), RenderingHints::new());
        let err = node.get_rendering().unwrap_err();
        assert!(matches!(err, GraphError::NullRendering { name } if name == "null"));
    }

    #[test]
    fn test_unknown_operation_is_an_error() {
        let node = RenderedOp::new(test_registry(), "missing", ParameterBlock::new(), RenderingHints::new());
        assert!(matches!(node.get_rendering(), Err(GraphError::UnknownOperation(_))));
    }

    #[test]
    fn test_sources_render_recursively() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let b = harness.generation(&a);
        assert!(a.current_rendering().is_none());

        let rendering = b.get_rendering().unwrap();
        let a_rendering = a.current_rendering().unwrap();
        assert_eq!(rendering.source(0).unwrap().id(), a_rendering.id());
        assert_eq!(a.sink_nodes().len(), 1);
    }

    #[test]
    fn test_edit_without_rendering_emits_nothing() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let events = counter(&a);
        assert!(a.set_parameter(3, 2.0).unwrap().is_none());
        assert_eq!(events.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_one_event_per_edit_after_new_rendering_is_ready() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        a.get_rendering().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let node = Arc::downgrade(&a);
        a.add_rendering_change_listener(move |event: &RenderingChangeEvent| {
            let current = node.upgrade().and_then(|n| n.current_rendering()).map(|r| r.id());
            sink.lock().push((event.new_rendering.as_ref().map(|r| r.id()), current));
        });

        let event = a.set_parameter(3, 5.0).unwrap().unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, seen[0].1);
        assert_eq!(seen[0].0, event.new_rendering.as_ref().map(|r| r.id()));
        assert_ne!(event.old_rendering.unwrap().id(), event.new_rendering.unwrap().id());
    }

    #[test]
    fn test_partial_upstream_edit_retains_unaffected_tiles() {
        init_logging();
        let harness = Harness::new();
        let a = harness.stamp(128, 96, Rectangle::new(10, 10, 5, 5));
        let b = harness.generation(&a);
        let a_events = counter(&a);
        let b_events = counter(&b);

        let indices = all_tiles(&b);
        assert_eq!(indices.len(), 12);
        let before = b.get_tiles(&indices).unwrap();

        let moved = Rectangle::new(70, 40, 10, 10);
        let event = a.set_parameter(2, moved).unwrap().unwrap();
        let invalid = Region::from_rects([Rectangle::new(10, 10, 5, 5), moved]);
        assert_eq!(event.invalid_region.as_ref().unwrap().bounds(), invalid.bounds());

        let computed_before = harness.scheduler.tiles_computed();
        let after = b.get_tiles(&indices).unwrap();
        let b_rendering = b.get_rendering().unwrap();
        for ((index, old), new) in indices.iter().zip(&before).zip(&after) {
            let (old, new) = (old.as_ref().unwrap(), new.as_ref().unwrap());
            let nominal = b_rendering.tile_grid().nominal_tile_rect(index.x, index.y);
            if invalid.intersects(&nominal) {
                assert_ne!(old, new, "tile {} should have been recomputed", index);
            } else {
                assert_eq!(old, new, "tile {} should have been retained", index);
                assert!(old.shares_buffer_with(new));
            }
        }
        // Two tiles of B, plus the two tiles of A they read.
        assert_eq!(harness.scheduler.tiles_computed() - computed_before, 4);
        assert_eq!(a_events.load(Ordering::SeqCst), 1);
        assert_eq!(b_events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_noop_edit_on_aligned_image_retains_everything() {
        let harness = Harness::new();
        let a = harness.stamp(128, 96, Rectangle::new(10, 10, 5, 5));
        let b = harness.generation(&a);
        let indices = all_tiles(&b);
        let before = b.get_tiles(&indices).unwrap();

        let event = a.set_parameter(3, 1.0).unwrap().unwrap();
        assert_eq!(event.invalid_region, Some(Region::new()));

        let computed = harness.scheduler.tiles_computed();
        let after = b.get_tiles(&indices).unwrap();
        assert_eq!(before, after);
        assert_eq!(harness.scheduler.tiles_computed(), computed);
    }

    #[test]
    fn test_degenerate_region_drops_partial_edge_tiles() {
        let harness = Harness::new();
        let a = harness.stamp(100, 70, Rectangle::new(10, 10, 5, 5));
        let indices = all_tiles(&a);
        a.get_tiles(&indices).unwrap();

        let event = a.set_parameter(3, 1.0).unwrap().unwrap();
        let region = event.invalid_region.unwrap();
        assert!(!region.is_empty());
        assert!(!region.intersects(&Rectangle::new(0, 0, 100, 70)));

        let new_id = a.get_rendering().unwrap().id();
        assert!(harness.cache.contains(new_id, 0, 0));
        assert!(harness.cache.contains(new_id, 2, 1));
        assert!(!harness.cache.contains(new_id, 3, 0));
        assert!(!harness.cache.contains(new_id, 0, 2));
    }

    #[test]
    fn test_operation_change_replaces_everything() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let indices = all_tiles(&a);
        a.get_tiles(&indices).unwrap();
        let old_id = a.get_rendering().unwrap().id();

        let event = a.set_operation_name("STAMP").unwrap().unwrap();
        assert!(event.invalid_region.is_none());
        let new_id = a.get_rendering().unwrap().id();
        assert!(harness.cache.tiles(old_id).is_empty());
        assert!(harness.cache.tiles(new_id).is_empty());
    }

    #[test]
    fn test_non_tiled_rendering_is_invalidated_fully() {
        let harness = Harness::new();
        let node = RenderedOp::new(
            harness.registry.clone(),
            "pattern",
            ParameterBlock::new().with_parameter(16),
            RenderingHints::new(),
        );
        node.get_rendering().unwrap();
        let event = node.set_parameter(0, 32).unwrap().unwrap();
        assert!(event.invalid_region.is_none());
        assert_eq!(node.bounds().unwrap(), Rectangle::new(0, 0, 32, 32));
    }

    #[test]
    fn test_failed_re_render_reports_error() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        a.get_rendering().unwrap();
        let err = a.set_parameter(0, "wide").unwrap_err();
        assert!(matches!(err, GraphError::InvalidParameter { index: 0, .. }));
        assert!(a.current_rendering().is_none());
    }

    #[test]
    fn test_changes_propagate_down_a_chain() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let b = harness.generation(&a);
        let c = harness.generation(&b);
        let c_events = counter(&c);
        c.get_rendering().unwrap();
        let old_c = c.current_rendering().unwrap().id();

        a.set_parameter(3, 3.0).unwrap();
        assert_eq!(c_events.load(Ordering::SeqCst), 1);
        assert_ne!(c.current_rendering().unwrap().id(), old_c);
    }

    #[test]
    fn test_get_new_rendering_reports_whole_image() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let events = counter(&a);
        let first = a.get_new_rendering().unwrap();
        assert_eq!(events.load(Ordering::SeqCst), 0);

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        a.add_rendering_change_listener(move |event: &RenderingChangeEvent| {
            *sink.lock() = Some(event.invalid_region.clone());
        });
        let second = a.get_new_rendering().unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), Some(None));
    }

    #[test]
    fn test_listener_removal() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        a.get_rendering().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let sink = count.clone();
        let handle = a.add_rendering_change_listener(move |_: &RenderingChangeEvent| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        assert!(a.remove_rendering_change_listener(&handle));
        a.set_parameter(3, 9.0).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!a.remove_rendering_change_listener(&handle));
    }

    #[test]
    fn test_cycles_are_rejected() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let b = harness.generation(&a);

        let err = a.add_source(b.clone()).unwrap_err();
        assert!(matches!(err, GraphError::CycleDetected { source_node, sink } if source_node == b.id() && sink == a.id()));
        assert!(b.set_source(0, b.clone()).is_err());
        assert_eq!(a.num_sources(), 0);
    }

    #[test]
    fn test_source_edits_update_sinks() {
        let harness = Harness::new();
        let a1 = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let a2 = harness.stamp(64, 64, Rectangle::new(8, 8, 8, 8));
        let b = harness.generation(&a1);
        b.get_rendering().unwrap();

        let event = b.set_source(0, a2.clone()).unwrap().unwrap();
        assert!(event.invalid_region.is_none());
        assert!(a1.sink_nodes().is_empty());
        assert_eq!(a2.sink_nodes().len(), 1);

        let events = counter(&b);
        a1.set_parameter(3, 4.0).unwrap();
        assert_eq!(events.load(Ordering::SeqCst), 0);
        a2.set_parameter(3, 4.0).unwrap();
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_sinks_are_pruned() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let b = harness.generation(&a);
        assert_eq!(a.sink_nodes().len(), 1);
        drop(b);
        assert!(a.sink_nodes().is_empty());
    }

    #[test]
    fn test_synthetic_properties() {
        let harness = Harness::new();
        let a = harness.stamp(64, 48, Rectangle::new(0, 0, 8, 8));
        assert_eq!(a.get_property("IMAGE_WIDTH").unwrap(), Some(Value::Integer(64)));
        assert_eq!(a.get_property("image_height").unwrap(), Some(Value::Integer(48)));
        let key = a.get_property("tile_cache_key").unwrap().unwrap();
        assert_eq!(key, Value::String(a.get_rendering().unwrap().id().0.to_string()));
        assert!(matches!(a.set_property("image_width", 3), Err(GraphError::ReadOnlyProperty(_))));
        assert!(a.property_names().contains(&"image_min_x".to_string()));
    }

    #[test]
    fn test_inherited_properties_are_cleared_on_invalidation() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let b = harness.generation(&a);
        a.set_property("Author", "first").unwrap();
        b.get_rendering().unwrap();

        assert_eq!(b.get_property("author").unwrap(), Some(Value::from("first")));
        a.set_property("author", "second").unwrap();
        assert_eq!(b.get_property("author").unwrap(), Some(Value::from("first")));

        b.set_rendering_hint("note", Value::from("touch")).unwrap();
        assert_eq!(b.get_property("author").unwrap(), Some(Value::from("second")));
    }

    #[test]
    fn test_local_properties_survive_and_win() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let b = harness.generation(&a);
        a.set_property("author", "upstream").unwrap();
        b.set_property("author", "local").unwrap();
        b.get_rendering().unwrap();
        b.set_rendering_hint("note", Value::from("touch")).unwrap();
        assert_eq!(b.get_property("author").unwrap(), Some(Value::from("local")));
        assert_eq!(b.remove_property("author"), Some(Value::from("local")));
        assert_eq!(b.get_property("author").unwrap(), Some(Value::from("upstream")));
    }

    #[test]
    fn test_copy_from_source_and_suppression() {
        let harness = Harness::new();
        let a1 = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let a2 = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        a1.set_property("origin", "a1").unwrap();
        a2.set_property("origin", "a2").unwrap();
        let both = RenderedOp::new(
            harness.registry.clone(),
            "generation",
            ParameterBlock::new().with_source(a1.clone()).with_source(a2.clone()),
            harness.hints.clone(),
        );

        assert_eq!(both.get_property("origin").unwrap(), Some(Value::from("a1")));
        both.copy_property_from_source("origin", 1).unwrap();
        assert_eq!(both.get_property("origin").unwrap(), Some(Value::from("a2")));
        assert!(both.copy_property_from_source("origin", 2).is_err());

        both.suppress_property("origin").unwrap();
        assert_eq!(both.get_property("origin").unwrap(), None);
        assert!(!both.property_names().contains(&"origin".to_string()));
    }

    #[test]
    fn test_forwarded_tile_access() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let tile = a.get_tile(0, 0).unwrap().unwrap();
        assert_eq!(tile.sample(3, 3, 0), 1.0);
        assert!(a.get_tile(5, 5).unwrap().is_none());

        let data = a.get_data(Some(&Rectangle::new(4, 4, 40, 8))).unwrap();
        assert_eq!(data.sample(7, 7, 0), 1.0);
        assert_eq!(data.sample(8, 8, 0), 0.0);

        let mut dest = Raster::new(Rectangle::new(-4, -4, 8, 8), PixelFormat::gray()).unwrap();
        a.copy_data(&mut dest).unwrap();
        assert_eq!(dest.sample(0, 0, 0), 1.0);
        assert_eq!(dest.sample(-1, -1, 0), 0.0);
    }

    #[test]
    fn test_queue_and_prefetch_through_node() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let request = a.queue_tiles(&[TileIndex::new(1, 1), TileIndex::new(7, 7)]).unwrap();
        assert!(request.wait_timeout(Duration::from_secs(10)));
        let id = a.get_rendering().unwrap().id();
        assert!(harness.cache.contains(id, 1, 1));

        a.prefetch_tiles(&[TileIndex::new(0, 1)]).unwrap();
        assert!(harness.cache.contains(id, 0, 1));

        a.cancel_tiles(&request, None);
        assert!(request.is_done());
    }

    #[test]
    fn test_queue_tiles_on_non_tiled_rendering() {
        let harness = Harness::new();
        let node = RenderedOp::new(
            harness.registry.clone(),
            "pattern",
            ParameterBlock::new().with_parameter(16),
            RenderingHints::new(),
        );
        let request = node.queue_tiles(&[TileIndex::new(0, 0), TileIndex::new(3, 3)]).unwrap();
        assert!(request.wait_timeout(Duration::from_secs(10)));
        assert_eq!(request.tile_indices(), &[TileIndex::new(0, 0)]);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let indices = all_tiles(&a);
        a.get_tiles(&indices).unwrap();
        let id = a.current_rendering().unwrap().id();

        a.dispose();
        assert!(harness.cache.tiles(id).is_empty());
        assert!(a.current_rendering().is_none());
        a.dispose();
        assert!(a.current_rendering().is_none());
        assert!(a.get_rendering().is_ok());
    }

    #[test]
    fn test_dispose_detaches_from_sources() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        let b = harness.generation(&a);
        b.get_rendering().unwrap();
        let events = counter(&b);

        b.dispose();
        assert!(b.is_disposed());
        assert!(a.sink_nodes().is_empty());
        assert!(a.set_parameter(3, 2.0).unwrap().is_some());
        assert_eq!(events.load(Ordering::SeqCst), 0);
        assert!(b.current_rendering().is_none());

        b.dispose();
        assert!(a.sink_nodes().is_empty());
    }

    #[test]
    fn test_edits_race_with_tile_reads() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        a.get_rendering().unwrap();
        let last = 20;

        std::thread::scope(|scope| {
            let a = &a;
            scope.spawn(move || {
                for value in 2..=last {
                    a.set_parameter(3, value as f64).unwrap();
                }
            });
            for _ in 0..3 {
                scope.spawn(move || {
                    for _ in 0..50 {
                        assert_eq!(a.get_rendering().unwrap().bounds(), Rectangle::new(0, 0, 64, 64));
                        let tile = a.get_tile(0, 0).unwrap().unwrap();
                        let value = tile.sample(0, 0, 0);
                        assert!((1.0..=last as f32).contains(&value));
                        assert_eq!(tile.sample(7, 7, 0), value);
                        assert_eq!(tile.sample(8, 8, 0), 0.0);
                    }
                });
            }
        });

        let tile = a.get_tile(0, 0).unwrap().unwrap();
        assert_eq!(tile.sample(3, 3, 0), last as f32);
    }

    #[test]
    fn test_layout_hint_changes_tiling() {
        let harness = Harness::new();
        let a = harness.stamp(64, 64, Rectangle::new(0, 0, 8, 8));
        assert_eq!(a.layout().unwrap().grid.tile_width, 32);
        let event = a
            .set_rendering_hint(keys::IMAGE_LAYOUT, ImageLayout::new().with_tile_size(16, 16))
            .unwrap();
        assert!(event.unwrap().invalid_region.is_none());
        assert_eq!(a.layout().unwrap().grid.tile_width, 16);
    }
}
