//! Runtime of a compiled graph
//!
//! A [`CompiledGraph`] runs a validated [`StateGraph`](crate::StateGraph)
//! against a checkpoint saver. Every run is addressed by a
//! [`CheckpointConfig`](superstep_checkpoint::CheckpointConfig):
//!
//! | Config | `input` | Behavior |
//! |--------|---------|----------|
//! | thread only | `Some` | new input on top of the thread head |
//! | thread only | `None` | continue the head past a breakpoint |
//! | thread + checkpoint id | `Some`/`None` | fork from that checkpoint |
//!
//! Forks never touch the checkpoints they start from: the first save of the
//! run is a new child of the addressed checkpoint.
//!
//! # Operations
//!
//! - [`invoke`](CompiledGraph::invoke) / [`stream`](CompiledGraph::stream) run supersteps
//! - [`resume`](CompiledGraph::resume) supplies values for pending interrupts
//! - [`get_state`](CompiledGraph::get_state) / [`get_state_history`](CompiledGraph::get_state_history) inspect a thread
//! - [`update_state`](CompiledGraph::update_state) writes state as if a node produced it
//! - [`delete_thread`](CompiledGraph::delete_thread) drops a thread

mod execution;
mod graph;
mod state;
mod streaming;
pub(crate) mod types;

pub use graph::CompiledGraph;
pub use types::{
    EventStream, RunOutcome, RunStatus, StateSnapshot, StateSnapshotStream, StreamEvent,
    StreamMode, TaskInfo,
};
