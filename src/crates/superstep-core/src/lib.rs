//! # superstep-core - Durable Checkpointed Graph Execution
//!
//! Runs graphs of async nodes over shared, versioned state channels in
//! **supersteps**, persisting a checkpoint after every superstep so that any
//! run can be paused, resumed, replayed or forked.
//!
//! ## Overview
//!
//! - **Channels** - named state slots with an overwrite or accumulate merge policy
//! - **Supersteps** - runnable nodes execute in parallel, supersteps run in sequence
//! - **Checkpoints** - one immutable snapshot per superstep, linked to its parent
//! - **Pending writes** - finished tasks are recorded before the superstep commits,
//!   so a failure or interrupt never re-runs completed siblings
//! - **Interrupts** - nodes pause with [`NodeContext::interrupt`] and resume with
//!   positional values
//! - **Time travel** - invoke from any historical checkpoint to fork a new lineage,
//!   or write state with [`CompiledGraph::update_state`]
//! - **Cross-thread store** - namespaced key/value memory with optional
//!   similarity search
//!
//! ## Execution model
//!
//! ```text
//!  invoke(input, config)
//!        │
//!        ▼
//!  ┌──────────────┐   step -1: input checkpoint
//!  │ __start__    │──────────────────────────────────► checkpoint
//!  └──────┬───────┘
//!         ▼
//!  ┌──────────────┐   writes merged in task order
//!  │ nodes ∥      │──────────────────────────────────► checkpoint (step 0..n)
//!  └──────┬───────┘
//!         ▼
//!   no runnable tasks ──► RunStatus::Completed
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use serde_json::json;
//! use superstep_core::{ChannelPolicy, NodeOutput, StateGraph, START, END};
//! use superstep_checkpoint::{CheckpointConfig, InMemoryCheckpointSaver};
//!
//! let mut graph = StateGraph::new();
//! graph
//!     .add_channel("foo", ChannelPolicy::Overwrite)
//!     .add_channel("bar", ChannelPolicy::append())
//!     .add_node("a", |_state, _ctx| async move {
//!         Ok(NodeOutput::update(json!({"foo": "a", "bar": ["a"]})))
//!     })
//!     .add_node("b", |_state, _ctx| async move {
//!         Ok(NodeOutput::update(json!({"foo": "b", "bar": ["b"]})))
//!     })
//!     .add_edge(START, "a")
//!     .add_edge("a", "b")
//!     .add_edge("b", END);
//!
//! let app = graph
//!     .compile()?
//!     .with_checkpointer(InMemoryCheckpointSaver::new());
//!
//! let config = CheckpointConfig::for_thread("t1");
//! let outcome = app.invoke(Some(json!({"foo": ""})), &config).await?;
//! assert_eq!(outcome.values, json!({"foo": "b", "bar": ["a", "b"]}));
//! ```
//!
//! ## Human-in-the-loop
//!
//! ```rust,ignore
//! graph.add_node("review", |state, ctx| async move {
//!     let answer = ctx.interrupt(json!({"draft": state["draft"]}))?;
//!     Ok(NodeOutput::update(json!({"approved": answer})))
//! });
//!
//! let paused = app.invoke(Some(input), &config).await?;
//! assert!(paused.is_interrupted());
//! let done = app.resume(&config, vec![json!(true)]).await?;
//! ```
//!
//! ## Modules
//!
//! - [`graph`] - graph builder, channel policies and node outputs
//! - [`compiled`] - run entry points, state inspection and streaming
//! - [`pregel`] - superstep scheduler internals
//! - [`interrupt`] - interrupts and the node runtime context
//! - [`send`] - routing results and dynamic fan-out packets
//! - [`store`] - cross-thread key/value store
//! - [`config`] - engine settings from files and environment
//! - [`error`] - error types

pub mod compiled;
pub mod config;
pub mod error;
pub mod graph;
pub mod interrupt;
pub mod pregel;
pub mod send;
pub mod store;

pub use compiled::{
    CompiledGraph, EventStream, RunOutcome, RunStatus, StateSnapshot, StateSnapshotStream,
    StreamEvent, StreamMode, TaskInfo,
};
pub use config::{CheckpointerConfig, EngineConfig};
pub use error::{GraphError, NodeError, Result};
pub use graph::{ChannelPolicy, NodeOutput, StateGraph, END, START};
pub use interrupt::{Interrupt, NodeContext};
pub use send::{Route, Send};
pub use store::{
    Embedder, InMemoryStore, IndexConfig, Item, SearchItem, SearchRequest, Store, StoreError,
};
pub use superstep_checkpoint::{CheckpointConfig, CheckpointMetadata, CheckpointSaver};
