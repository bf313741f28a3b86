//! Graph construction
//!
//! [`StateGraph`] is the builder: declare state channels, register nodes and
//! connect them, then [`compile`](StateGraph::compile) into an executable
//! [`CompiledGraph`].
//!
//! # Graph structure
//!
//! ```text
//!   __start__ ──► plan ──► research ──┐
//!                   │                 ├──(join)──► write ──► __end__
//!                   └────► outline ───┘
//!
//!   channels: {"topic": overwrite, "notes": accumulate(append)}
//! ```
//!
//! | Edge kind | Builder call | Fires |
//! |-----------|--------------|-------|
//! | static | [`add_edge`](StateGraph::add_edge) | target runs in the superstep after the source |
//! | conditional | [`add_conditional_edges`](StateGraph::add_conditional_edges) | router picks targets from the state |
//! | join | [`add_join_edge`](StateGraph::add_join_edge) | target runs once every source has finished |
//!
//! Nodes can also steer execution themselves through
//! [`NodeOutput::with_goto`] and [`NodeOutput::with_send`].
//!
//! # State channels
//!
//! Every key of the state is a channel. Keys declared with
//! [`add_channel`](StateGraph::add_channel) get the declared
//! [`ChannelPolicy`]; any other key a node writes is created on first write
//! with the overwrite policy.
//!
//! # Example
//!
//! ```rust
//! use superstep_core::{ChannelPolicy, NodeOutput, StateGraph, END, START};
//! use serde_json::json;
//!
//! let mut graph = StateGraph::new();
//! graph.add_channel("bar", ChannelPolicy::append());
//! graph.add_node("node_a", |_state, _ctx| async move {
//!     Ok(NodeOutput::update(json!({"foo": "a", "bar": ["a"]})))
//! });
//! graph.add_edge(START, "node_a");
//! graph.add_edge("node_a", END);
//! let compiled = graph.compile().unwrap();
//! assert_eq!(compiled.node_names(), vec!["node_a"]);
//! ```

use crate::compiled::CompiledGraph;
use crate::error::{GraphError, NodeError, Result};
use crate::interrupt::NodeContext;
use crate::pregel::{is_reserved_channel, join_channel};
use crate::send::{self, Route};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use superstep_checkpoint::{
    reducers, BinaryOperatorChannel, Channel, LastValueChannel, ReducerFn,
};

/// Virtual entry node; its outgoing edges receive the run input
pub const START: &str = "__start__";
/// Virtual exit node
pub const END: &str = "__end__";

/// Boxed future returned by a node
pub type NodeFuture = Pin<Box<dyn Future<Output = std::result::Result<NodeOutput, NodeError>> + Send>>;

/// Type-erased node function
pub type NodeFn = Arc<dyn Fn(Value, NodeContext) -> NodeFuture + Send + Sync>;

/// Type-erased router
pub type RouterFn = Arc<dyn Fn(&Value) -> Route + Send + Sync>;

/// Merge policy of a state channel
#[derive(Clone)]
pub enum ChannelPolicy {
    /// Last write in task order wins
    Overwrite,
    /// Writes are folded into the current value
    Accumulate(ReducerFn),
}

impl ChannelPolicy {
    /// Accumulate with a custom reducer
    pub fn accumulate<F>(reducer: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        Self::Accumulate(Arc::new(reducer))
    }

    /// Accumulate by list concatenation
    pub fn append() -> Self {
        Self::Accumulate(reducers::append())
    }

    /// Accumulate by numeric addition
    pub fn sum() -> Self {
        Self::Accumulate(reducers::sum())
    }

    pub fn is_accumulate(&self) -> bool {
        matches!(self, Self::Accumulate(_))
    }

    pub(crate) fn channel(&self) -> Box<dyn Channel> {
        match self {
            Self::Overwrite => Box::new(LastValueChannel::new()),
            Self::Accumulate(reducer) => {
                Box::new(BinaryOperatorChannel::from_reducer(Arc::clone(reducer)))
            }
        }
    }
}

impl std::fmt::Debug for ChannelPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overwrite => write!(f, "Overwrite"),
            Self::Accumulate(_) => write!(f, "Accumulate(<reducer>)"),
        }
    }
}

/// What a node returns when it completes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    /// Object of channel writes, or `Null` for none
    pub update: Value,
    /// Nodes to run next in addition to the static edges
    pub goto: Vec<String>,
    /// Dynamic tasks for the next superstep
    pub sends: Vec<send::Send>,
}

impl NodeOutput {
    /// Output writing the keys of `update`
    pub fn update(update: Value) -> Self {
        Self {
            update,
            ..Self::default()
        }
    }

    /// Output without writes
    pub fn empty() -> Self {
        Self::default()
    }

    /// Serialize a typed update; failures abort the run before anything is stored
    pub fn try_from_serialize<T: Serialize>(update: &T) -> std::result::Result<Self, NodeError> {
        Ok(Self::update(serde_json::to_value(update)?))
    }

    pub fn with_goto(mut self, node: impl Into<String>) -> Self {
        self.goto.push(node.into());
        self
    }

    pub fn with_send(mut self, send: send::Send) -> Self {
        self.sends.push(send);
        self
    }
}

impl From<Value> for NodeOutput {
    fn from(update: Value) -> Self {
        Self::update(update)
    }
}

#[derive(Clone)]
pub(crate) struct Branch {
    pub router: RouterFn,
    pub path_map: Option<HashMap<String, String>>,
}

impl Branch {
    /// Evaluate the router and translate targets through the path map
    pub fn route(&self, source: &str, state: &Value) -> Result<(Vec<String>, Vec<send::Send>)> {
        let route = (self.router)(state);
        let sends = route.sends().to_vec();
        let targets = route
            .targets()
            .into_iter()
            .map(|target| match &self.path_map {
                Some(map) => map.get(target).cloned().ok_or_else(|| {
                    GraphError::InvalidUpdate(format!(
                        "Router of '{}' returned '{}', which is not in its path map",
                        source, target
                    ))
                }),
                None => Ok(target.to_string()),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((targets, sends))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct JoinEdge {
    pub channel: String,
    pub sources: Vec<String>,
    pub target: String,
}

/// Validated graph structure shared by every run of a [`CompiledGraph`]
pub(crate) struct Graph {
    pub channels: BTreeMap<String, ChannelPolicy>,
    pub nodes: BTreeMap<String, NodeFn>,
    pub edges: BTreeMap<String, Vec<String>>,
    pub joins: Vec<JoinEdge>,
    pub branches: BTreeMap<String, Vec<Branch>>,
}

impl Graph {
    pub fn is_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Whether `name` is a valid goto/route/send target
    pub fn is_target(&self, name: &str) -> bool {
        name == END || self.is_node(name)
    }

    pub fn joins_from<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a JoinEdge> + 'a {
        self.joins
            .iter()
            .filter(move |join| join.sources.iter().any(|s| s == source))
    }

    pub fn joins_into<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a JoinEdge> + 'a {
        self.joins.iter().filter(move |join| join.target == target)
    }

    pub fn static_targets(&self, source: &str) -> &[String] {
        self.edges.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn branches_of(&self, source: &str) -> &[Branch] {
        self.branches.get(source).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Builder for executable graphs
#[derive(Default)]
pub struct StateGraph {
    channels: BTreeMap<String, ChannelPolicy>,
    nodes: BTreeMap<String, NodeFn>,
    edges: Vec<(String, String)>,
    joins: Vec<(Vec<String>, String)>,
    branches: Vec<(String, Branch)>,
    errors: Vec<String>,
}

impl StateGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a state channel and its merge policy
    pub fn add_channel(&mut self, name: impl Into<String>, policy: ChannelPolicy) -> &mut Self {
        let name = name.into();
        if is_reserved_channel(&name) {
            self.errors
                .push(format!("Channel name '{}' is reserved", name));
        }
        self.channels.insert(name, policy);
        self
    }

    /// Register a node
    pub fn add_node<F, Fut>(&mut self, name: impl Into<String>, node: F) -> &mut Self
    where
        F: Fn(Value, NodeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<NodeOutput, NodeError>> + Send + 'static,
    {
        let name = name.into();
        if name == START || name == END || is_reserved_channel(&name) || name.contains(':') {
            self.errors.push(format!("Node name '{}' is reserved", name));
        }
        if self.nodes.contains_key(&name) {
            self.errors.push(format!("Node '{}' already exists", name));
        }
        let node: NodeFn = Arc::new(move |input, ctx| Box::pin(node(input, ctx)));
        self.nodes.insert(name, node);
        self
    }

    /// Run `to` in the superstep after `from` finishes
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Run `target` once every node in `sources` has finished
    pub fn add_join_edge<I, S>(&mut self, sources: I, target: impl Into<String>) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sources: Vec<String> = sources.into_iter().map(Into::into).collect();
        sources.sort();
        sources.dedup();
        self.joins.push((sources, target.into()));
        self
    }

    /// Pick successors of `source` from the state after it ran.
    ///
    /// The router sees the state with the node's own writes applied. With a
    /// path map, router results are keys into the map.
    pub fn add_conditional_edges<F, R>(
        &mut self,
        source: impl Into<String>,
        router: F,
        path_map: Option<HashMap<String, String>>,
    ) -> &mut Self
    where
        F: Fn(&Value) -> R + Send + Sync + 'static,
        R: Into<Route>,
    {
        let router: RouterFn = Arc::new(move |state| router(state).into());
        self.branches
            .push((source.into(), Branch { router, path_map }));
        self
    }

    /// Validate the structure and build an executable graph
    pub fn compile(self) -> Result<CompiledGraph> {
        if let Some(error) = self.errors.first() {
            return Err(GraphError::Validation(error.clone()));
        }
        if self.nodes.is_empty() {
            return Err(GraphError::Validation("Graph has no nodes".to_string()));
        }

        let is_source = |name: &str| name == START || self.nodes.contains_key(name);
        let is_target = |name: &str| name == END || self.nodes.contains_key(name);

        let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (from, to) in &self.edges {
            if !is_source(from) {
                return Err(GraphError::Validation(format!(
                    "Edge source '{}' does not exist",
                    from
                )));
            }
            if !is_target(to) {
                return Err(GraphError::Validation(format!(
                    "Edge target '{}' does not exist",
                    to
                )));
            }
            if to != END {
                let targets = edges.entry(from.clone()).or_default();
                if !targets.contains(to) {
                    targets.push(to.clone());
                }
            }
        }

        let mut joins = Vec::new();
        for (sources, target) in &self.joins {
            if sources.is_empty() {
                return Err(GraphError::Validation(format!(
                    "Join edge into '{}' has no sources",
                    target
                )));
            }
            if let Some(unknown) = sources.iter().find(|s| !self.nodes.contains_key(s.as_str())) {
                return Err(GraphError::Validation(format!(
                    "Join source '{}' does not exist",
                    unknown
                )));
            }
            if !self.nodes.contains_key(target) {
                return Err(GraphError::Validation(format!(
                    "Join target '{}' does not exist",
                    target
                )));
            }
            joins.push(JoinEdge {
                channel: join_channel(sources, target),
                sources: sources.clone(),
                target: target.clone(),
            });
        }

        let mut branches: BTreeMap<String, Vec<Branch>> = BTreeMap::new();
        for (source, branch) in self.branches {
            if !is_source(&source) {
                return Err(GraphError::Validation(format!(
                    "Conditional edge source '{}' does not exist",
                    source
                )));
            }
            if let Some(map) = &branch.path_map {
                let targets: BTreeSet<&String> = map.values().collect();
                if let Some(unknown) = targets.into_iter().find(|t| !is_target(t)) {
                    return Err(GraphError::Validation(format!(
                        "Branch target '{}' does not exist",
                        unknown
                    )));
                }
            }
            branches.entry(source).or_default().push(branch);
        }

        if !edges.contains_key(START) && !branches.contains_key(START) {
            return Err(GraphError::Validation(
                "Graph has no entry point; add an edge from START".to_string(),
            ));
        }

        Ok(CompiledGraph::new(Graph {
            channels: self.channels,
            nodes: self.nodes,
            edges,
            joins,
            branches,
        }))
    }
}

impl std::fmt::Debug for StateGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateGraph")
            .field("channels", &self.channels)
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("edges", &self.edges)
            .field("joins", &self.joins)
            .field("branches", &self.branches.len())
            .finish()
    }
}
