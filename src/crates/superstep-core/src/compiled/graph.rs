//! CompiledGraph struct and builder methods

use crate::config::EngineConfig;
use crate::graph::Graph;
use crate::store::Store;
use std::sync::Arc;
use superstep_checkpoint::CheckpointSaver;

/// Compiled graph ready for execution
#[derive(Clone)]
pub struct CompiledGraph {
    pub(crate) graph: Arc<Graph>,
    pub(crate) checkpointer: Option<Arc<dyn CheckpointSaver>>,
    pub(crate) store: Option<Arc<dyn Store>>,
    pub(crate) config: EngineConfig,
}

impl CompiledGraph {
    pub(crate) fn new(graph: Graph) -> Self {
        Self {
            graph: Arc::new(graph),
            checkpointer: None,
            store: None,
            config: EngineConfig::default(),
        }
    }

    /// Persist runs with `saver`
    pub fn with_checkpointer<S>(self, saver: S) -> Self
    where
        S: CheckpointSaver + 'static,
    {
        self.with_checkpointer_arc(Arc::new(saver))
    }

    /// Persist runs with a shared saver
    pub fn with_checkpointer_arc(mut self, saver: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpointer = Some(saver);
        self
    }

    /// Make a cross-thread store available to nodes
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the engine settings
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Pause before any of `nodes` runs
    pub fn with_interrupt_before<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config = self.config.with_interrupt_before(nodes);
        self
    }

    /// Pause after any of `nodes` ran
    pub fn with_interrupt_after<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config = self.config.with_interrupt_after(nodes);
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.config = self.config.with_recursion_limit(limit);
        self
    }

    /// Node names in sorted order
    pub fn node_names(&self) -> Vec<&str> {
        self.graph.nodes.keys().map(String::as_str).collect()
    }

    pub fn checkpointer(&self) -> Option<&Arc<dyn CheckpointSaver>> {
        self.checkpointer.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn graph(&self) -> &Graph {
        &self.graph
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("nodes", &self.node_names())
            .field("channels", &self.graph.channels.keys().collect::<Vec<_>>())
            .field("checkpointer", &self.checkpointer.is_some())
            .field("store", &self.store.is_some())
            .field("config", &self.config)
            .finish()
    }
}
