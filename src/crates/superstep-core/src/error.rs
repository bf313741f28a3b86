//! Error types for graph construction and execution
//!
//! # Error Hierarchy
//!
//! ```text
//! GraphError
//! ├── Validation               - Graph structure errors, found at compile time
//! ├── TaskFailed               - A node returned an error; sibling writes stay pending
//! ├── Serialization            - A value could not be represented; nothing was persisted
//! ├── CheckpointNotFound       - Caller referenced an unknown checkpoint
//! ├── AmbiguousResume          - Resume values do not line up with pending interrupts
//! ├── NonDeterministicInterrupt- A re-run node raised a different interrupt sequence
//! ├── InvalidUpdate            - A write or state update was rejected
//! ├── RecursionLimit           - Too many supersteps in one run
//! ├── Configuration            - Engine or run configuration errors
//! ├── Checkpoint               - Storage backend errors (including write conflicts)
//! ├── Store                    - Cross-thread store errors
//! └── Yaml / Toml / Io         - Configuration file loading
//! ```
//!
//! An interrupt is **not** an error: runs that pause return
//! [`RunStatus::Interrupted`](crate::RunStatus::Interrupted) inside `Ok`.
//!
//! # Node errors
//!
//! Node functions return `Result<NodeOutput, NodeError>`. Together with `Ok`
//! this is the three-way task result the scheduler acts on:
//!
//! | Node result | Scheduler action |
//! |-------------|------------------|
//! | `Ok(output)` | writes recorded as pending, folded into the next checkpoint |
//! | `Err(NodeError::Interrupted(..))` | interrupt recorded, run pauses after siblings finish |
//! | `Err(NodeError::Failed(..))` | error recorded, run fails after siblings finish |
//!
//! ```rust
//! use superstep_core::{NodeContext, NodeError, NodeOutput};
//! use serde_json::{json, Value};
//!
//! async fn approve(state: Value, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
//!     if state["amount"].as_i64().unwrap_or(0) < 0 {
//!         return Err(NodeError::failed("negative amount"));
//!     }
//!     let answer = ctx.interrupt(json!({"question": "approve?"}))?;
//!     Ok(NodeOutput::update(json!({"approved": answer})))
//! }
//! ```

use crate::interrupt::Interrupt;
use crate::store::StoreError;
use superstep_checkpoint::CheckpointError;
use thiserror::Error;

/// Convenience result type using [`GraphError`]
pub type Result<T> = std::result::Result<T, GraphError>;

/// Error type for all graph operations
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure validation failed
    ///
    /// Raised by [`StateGraph::compile`](crate::StateGraph::compile) when an edge
    /// references an unknown node, a node name is reserved, or no entry edge exists.
    #[error("Graph validation failed: {0}")]
    Validation(String),

    /// A node returned an unrecoverable error
    ///
    /// The superstep is not committed. Writes from sibling tasks that succeeded
    /// stay pending against the current checkpoint, so re-invoking the thread
    /// without input only re-runs the failed task.
    #[error("Task '{node}' ({task_id}) failed: {message}")]
    TaskFailed {
        /// Node that failed
        node: String,
        /// Deterministic task id
        task_id: String,
        /// Error message returned by the node
        message: String,
    },

    /// A value was not representable as plain structured data
    ///
    /// Raised before anything from the offending task is persisted.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The referenced checkpoint does not exist
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Resume values do not match the pending interrupts
    #[error("Ambiguous resume: {expected} pending interrupt(s), {supplied} resume value(s) supplied")]
    AmbiguousResume {
        /// Pending interrupts across all tasks
        expected: usize,
        /// Values supplied by the caller
        supplied: usize,
    },

    /// A node raised a different interrupt sequence than on its previous attempt
    ///
    /// Resume values are matched by position; a node whose interrupts depend on
    /// something other than its input and its resume values cannot be resumed
    /// safely.
    #[error(
        "Node '{node}' ({task_id}) consumed {consumed} of {supplied} resume value(s); \
         its interrupt sequence changed between attempts"
    )]
    NonDeterministicInterrupt {
        /// Node that misbehaved
        node: String,
        /// Deterministic task id
        task_id: String,
        /// Resume values recorded for the task
        supplied: usize,
        /// Resume values the task actually consumed
        consumed: usize,
    },

    /// A node output or state update was rejected
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    /// The run exceeded the configured number of supersteps
    #[error("Recursion limit of {limit} supersteps reached without completing")]
    RecursionLimit {
        /// Configured limit
        limit: usize,
    },

    /// Engine or run configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Checkpoint storage error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Cross-thread store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Application-defined error raised by a node
    #[error("{0}")]
    Custom(String),
}

impl GraphError {
    pub fn task_failed(
        node: impl Into<String>,
        task_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::TaskFailed {
            node: node.into(),
            task_id: task_id.into(),
            message: message.into(),
        }
    }

    /// Whether this error must abort a superstep without recording anything
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            GraphError::Serialization(_) | GraphError::NonDeterministicInterrupt { .. }
        )
    }
}

/// Error returned by a node function
#[derive(Error, Debug)]
pub enum NodeError {
    /// The node suspended the run and is waiting for resume values
    #[error("Interrupted with {} payload(s)", .0.len())]
    Interrupted(Vec<Interrupt>),

    /// The node failed
    #[error(transparent)]
    Failed(GraphError),
}

impl NodeError {
    /// Failure with a plain message
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(GraphError::Custom(message.into()))
    }
}

impl From<GraphError> for NodeError {
    fn from(err: GraphError) -> Self {
        Self::Failed(err)
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(GraphError::Serialization(err))
    }
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        Self::Failed(GraphError::Store(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_failed_display() {
        let err = GraphError::task_failed("writer", "abc", "disk full");
        assert_eq!(err.to_string(), "Task 'writer' (abc) failed: disk full");
    }

    #[test]
    fn test_serialization_is_fatal() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(GraphError::from(json_err).is_fatal());
        assert!(!GraphError::Custom("x".into()).is_fatal());
    }

    #[test]
    fn test_node_error_conversions() {
        let err: NodeError = GraphError::InvalidUpdate("bad".into()).into();
        assert!(matches!(err, NodeError::Failed(GraphError::InvalidUpdate(_))));

        let err = NodeError::failed("boom");
        assert_eq!(err.to_string(), "boom");
    }
}
