//! Dynamic task creation and routing results
//!
//! A router attached with
//! [`StateGraph::add_conditional_edges`](crate::StateGraph::add_conditional_edges)
//! returns a [`Route`]. Besides naming fixed successors it can return
//! [`Send`] packets: each one becomes its own task in the next superstep,
//! running the target node with the packet's argument instead of the shared
//! state.
//!
//! ```text
//!            router(state) → Route::Send([...])
//!         ┌──────────────┼──────────────┐
//!         ▼              ▼              ▼
//!   worker({"n":1}) worker({"n":2}) worker({"n":3})   ← one superstep
//!         └──────────────┼──────────────┘
//!                        ▼
//!                 accumulate channel
//! ```
//!
//! Send tasks are ordered by their position in the superstep's packet list,
//! so results folded into an accumulate channel keep emission order.
//!
//! ```rust
//! use superstep_core::{Route, Send};
//! use serde_json::{json, Value};
//!
//! fn fan_out(state: &Value) -> Route {
//!     let items = state["items"].as_array().cloned().unwrap_or_default();
//!     Route::Send(items.into_iter().map(|item| Send::new("worker", item)).collect())
//! }
//!
//! assert_eq!(fan_out(&json!({"items": [1, 2]})).sends().len(), 2);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message to run `node` with `arg` as its input in the next superstep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Send {
    /// Target node
    pub node: String,
    /// Input handed to the node instead of the state
    pub arg: Value,
}

impl Send {
    pub fn new(node: impl Into<String>, arg: Value) -> Self {
        Self {
            node: node.into(),
            arg,
        }
    }
}

/// Where execution continues after a node
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// A single successor
    To(String),
    /// Several successors, run in parallel
    Many(Vec<String>),
    /// Dynamic tasks with their own input
    Send(Vec<Send>),
    /// Stop this branch
    End,
}

impl Route {
    /// Target names, before any path-map translation
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Route::To(target) => vec![target.as_str()],
            Route::Many(targets) => targets.iter().map(String::as_str).collect(),
            Route::Send(_) | Route::End => Vec::new(),
        }
    }

    /// Send packets carried by the route
    pub fn sends(&self) -> &[Send] {
        match self {
            Route::Send(sends) => sends,
            _ => &[],
        }
    }
}

impl From<&str> for Route {
    fn from(target: &str) -> Self {
        Route::To(target.to_string())
    }
}

impl From<String> for Route {
    fn from(target: String) -> Self {
        Route::To(target)
    }
}

impl From<Vec<String>> for Route {
    fn from(targets: Vec<String>) -> Self {
        Route::Many(targets)
    }
}

impl From<Vec<&str>> for Route {
    fn from(targets: Vec<&str>) -> Self {
        Route::Many(targets.into_iter().map(String::from).collect())
    }
}

impl From<Send> for Route {
    fn from(send: Send) -> Self {
        Route::Send(vec![send])
    }
}

impl From<Vec<Send>> for Route {
    fn from(sends: Vec<Send>) -> Self {
        Route::Send(sends)
    }
}
