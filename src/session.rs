//! Sessions: shared defaults for the nodes of one application.
//!
//! A [`Session`] owns an operation registry, a tile cache and a scheduler
//! built from a [`TesseraConfig`], and hands them to every node it creates
//! as default rendering hints. Hints passed to [`Session::create`] take
//! precedence over the defaults.

use crate::config::TesseraConfig;
use crate::core::error::{ConfigResult, GraphError, GraphResult};
use crate::core::hints::{keys, HintValue, RenderingHints};
use crate::execution::cache::MemoryTileCache;
use crate::execution::scheduler::{SharedScheduler, ThreadPoolScheduler};
use crate::graph::{ParameterBlock, RenderedOp};
use crate::operations::OperationRegistry;
use log::info;
use std::fmt;
use std::sync::Arc;

/// Registry, cache and scheduler shared by a family of nodes.
pub struct Session {
    registry: Arc<OperationRegistry>,
    cache: Option<Arc<MemoryTileCache>>,
    scheduler: SharedScheduler,
    default_hints: RenderingHints,
}

impl Session {
    /// Create a session with the built-in operations.
    pub fn new(config: &TesseraConfig) -> ConfigResult<Self> {
        config.validate()?;
        let cache = config.cache.enabled.then(|| {
            Arc::new(
                MemoryTileCache::new(config.cache.memory_capacity)
                    .with_memory_threshold(config.cache.memory_threshold),
            )
        });
        let scheduler: SharedScheduler = Arc::new(ThreadPoolScheduler::new(config.scheduler.clone())?);

        let mut default_hints = RenderingHints::new().with(keys::TILE_SCHEDULER, HintValue::Scheduler(scheduler.clone()));
        if let Some(cache) = &cache {
            default_hints.insert(keys::TILE_CACHE, HintValue::TileCache(cache.clone()));
        }
        info!(
            "Session started: cache {}, {} compute threads",
            if cache.is_some() { "enabled" } else { "disabled" },
            config.scheduler.parallelism
        );

        Ok(Self {
            registry: Arc::new(OperationRegistry::with_builtins()),
            cache,
            scheduler,
            default_hints,
        })
    }

    /// Use another registry for nodes created from now on.
    pub fn with_registry(mut self, registry: Arc<OperationRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Add a default hint.
    pub fn with_default_hint(mut self, key: impl Into<String>, value: impl Into<HintValue>) -> Self {
        self.default_hints.insert(key, value);
        self
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// The session's tile cache, unless caching is disabled.
    pub fn tile_cache(&self) -> Option<&Arc<MemoryTileCache>> {
        self.cache.as_ref()
    }

    pub fn scheduler(&self) -> &SharedScheduler {
        &self.scheduler
    }

    pub fn default_hints(&self) -> &RenderingHints {
        &self.default_hints
    }

    /// Create a deferred node. Nothing is rendered yet, but the operation
    /// must be known to the registry.
    pub fn create(
        &self,
        operation: &str,
        parameters: ParameterBlock,
        hints: RenderingHints,
    ) -> GraphResult<Arc<RenderedOp>> {
        if !self.registry.contains(operation) {
            return Err(GraphError::UnknownOperation(operation.to_string()));
        }
        Ok(RenderedOp::new(
            self.registry.clone(),
            operation,
            parameters,
            hints.merged_over(&self.default_hints),
        ))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("registry", &self.registry)
            .field("cache", &self.cache.as_ref().map(|c| c.stats()))
            .field("default_hints", &self.default_hints)
            .finish()
    }
}
