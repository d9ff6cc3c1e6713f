//! Rendering change events and their propagation through the node graph.

use crate::core::error::NodeId;
use crate::core::geometry::Region;
use crate::graph::RenderedOp;
use crate::image::SharedImage;
use log::{debug, warn};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Emitted after a node replaced its rendering.
#[derive(Clone)]
pub struct RenderingChangeEvent {
    /// Node whose rendering changed.
    pub node: NodeId,
    pub old_rendering: Option<SharedImage>,
    pub new_rendering: Option<SharedImage>,
    /// Pixels of the new rendering that differ from the old one, in its
    /// coordinates. `None` means the whole image.
    pub invalid_region: Option<Region>,
}

impl fmt::Debug for RenderingChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderingChangeEvent")
            .field("node", &self.node)
            .field("old_rendering", &self.old_rendering.as_ref().map(|r| r.id()))
            .field("new_rendering", &self.new_rendering.as_ref().map(|r| r.id()))
            .field("invalid_region", &self.invalid_region)
            .finish()
    }
}

/// Observer of rendering changes.
pub trait RenderingChangeListener: Send + Sync {
    fn rendering_changed(&self, event: &RenderingChangeEvent);
}

impl<F> RenderingChangeListener for F
where
    F: Fn(&RenderingChangeEvent) + Send + Sync,
{
    fn rendering_changed(&self, event: &RenderingChangeEvent) {
        self(event)
    }
}

/// A shared listener.
pub type SharedChangeListener = Arc<dyn RenderingChangeListener>;

/// Deliver `event` to the listeners of `origin`, then let every downstream
/// node react to it. Nodes that re-render emit their own events, which are
/// queued and delivered the same way, breadth first.
pub(crate) fn propagate(origin: Arc<RenderedOp>, event: RenderingChangeEvent) {
    let mut queue = VecDeque::from([(origin, event)]);
    while let Some((node, event)) = queue.pop_front() {
        node.notify_listeners(&event);
        for sink in node.sink_nodes() {
            match sink.source_changed(&event) {
                Ok(Some(next)) => queue.push_back((sink, next)),
                Ok(None) => {}
                Err(e) => warn!("Node {} could not re-render after {} changed: {}", sink.id(), node.id(), e),
            }
        }
    }
    debug!("Change propagation finished");
}
