//! Interrupt and resume
//!
//! A node pauses the run by calling [`NodeContext::interrupt`] and propagating
//! its error with `?`. The superstep finishes its sibling tasks, their writes
//! are recorded as pending, and the run returns
//! [`RunStatus::Interrupted`](crate::RunStatus::Interrupted) with the payloads.
//!
//! # Resume protocol
//!
//! ```text
//!  attempt 1:  interrupt(q1) ──► pause                      resume = []
//!  resume(["yes"])
//!  attempt 2:  interrupt(q1) = "yes", interrupt(q2) ──► pause  resume = ["yes"]
//!  resume(["42"])
//!  attempt 3:  interrupt(q1) = "yes", interrupt(q2) = "42" ──► Ok
//! ```
//!
//! Every attempt re-runs the node from the top. The n-th `interrupt` call
//! returns the n-th recorded resume value; the first call without a recorded
//! value pauses again. Resume values are therefore matched by **position**, and
//! a node must raise its interrupts in the same order on every attempt. A node
//! that finishes without consuming all recorded values fails the run with
//! [`GraphError::NonDeterministicInterrupt`](crate::GraphError::NonDeterministicInterrupt).
//!
//! Interrupt ids derive from the task id and the call position, so they are
//! stable across attempts.

use crate::error::NodeError;
use crate::store::Store;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use superstep_checkpoint::CheckpointConfig;
use uuid::Uuid;

/// A pause request raised by a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    /// Stable id, derived from the task id and `index`
    pub id: String,
    /// Payload surfaced to the caller
    pub value: Value,
    /// Node that raised the interrupt
    pub node: String,
    /// Task that raised the interrupt
    pub task_id: String,
    /// Position among the task's interrupt calls
    pub index: usize,
}

impl Interrupt {
    pub fn new(task_id: &str, node: &str, index: usize, value: Value) -> Self {
        Self {
            id: interrupt_id(task_id, index),
            value,
            node: node.to_string(),
            task_id: task_id.to_string(),
            index,
        }
    }

    /// Static breakpoint raised before `node` runs
    pub(crate) fn before(task_id: &str, node: &str) -> Self {
        Self::new(task_id, node, 0, json!({"node": node, "when": "before"}))
    }

    /// Static breakpoint raised after `node` ran
    pub(crate) fn after(task_id: &str, node: &str) -> Self {
        Self::new(task_id, node, 0, json!({"node": node, "when": "after"}))
    }
}

fn interrupt_id(task_id: &str, index: usize) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{task_id}|{index}").as_bytes()).to_string()
}

/// Per-attempt resume bookkeeping shared between a task and its context
#[derive(Debug, Default)]
pub(crate) struct Scratchpad {
    pub resume: Vec<Value>,
    pub consumed: usize,
}

impl Scratchpad {
    pub fn new(resume: Vec<Value>) -> Self {
        Self {
            resume,
            consumed: 0,
        }
    }
}

/// Runtime context handed to every node invocation
#[derive(Clone)]
pub struct NodeContext {
    /// Deterministic id of the running task
    pub task_id: String,
    /// Name of the running node
    pub node: String,
    /// Step of the checkpoint the task was prepared from
    pub step: i64,
    /// Run configuration (thread, namespace, checkpoint)
    pub config: CheckpointConfig,
    store: Option<Arc<dyn Store>>,
    scratchpad: Arc<Mutex<Scratchpad>>,
}

impl NodeContext {
    pub(crate) fn new(
        task_id: impl Into<String>,
        node: impl Into<String>,
        step: i64,
        config: CheckpointConfig,
        store: Option<Arc<dyn Store>>,
        resume: Vec<Value>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            node: node.into(),
            step,
            config,
            store,
            scratchpad: Arc::new(Mutex::new(Scratchpad::new(resume))),
        }
    }

    /// Cross-thread store attached to the graph, if any
    pub fn store(&self) -> Option<&Arc<dyn Store>> {
        self.store.as_ref()
    }

    /// Pause for external input, or return the recorded resume value.
    ///
    /// ```rust,ignore
    /// let approved = ctx.interrupt(json!({"question": "ship it?"}))?;
    /// ```
    pub fn interrupt(&self, value: Value) -> Result<Value, NodeError> {
        let mut pad = self.scratchpad.lock();
        let index = pad.consumed;
        if let Some(resume) = pad.resume.get(index).cloned() {
            pad.consumed += 1;
            return Ok(resume);
        }
        Err(NodeError::Interrupted(vec![Interrupt::new(
            &self.task_id,
            &self.node,
            index,
            value,
        )]))
    }

    /// Resume values recorded for this task and how many were consumed
    pub(crate) fn resume_usage(&self) -> (usize, usize) {
        let pad = self.scratchpad.lock();
        (pad.resume.len(), pad.consumed)
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("task_id", &self.task_id)
            .field("node", &self.node)
            .field("step", &self.step)
            .field("config", &self.config)
            .field("store", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(resume: Vec<Value>) -> NodeContext {
        NodeContext::new("task-1", "ask", 0, CheckpointConfig::new(), None, resume)
    }

    #[test]
    fn test_interrupt_without_resume_pauses() {
        let ctx = context(vec![]);
        match ctx.interrupt(json!("q")) {
            Err(NodeError::Interrupted(interrupts)) => {
                assert_eq!(interrupts.len(), 1);
                assert_eq!(interrupts[0].index, 0);
                assert_eq!(interrupts[0].value, json!("q"));
                assert_eq!(interrupts[0].node, "ask");
            }
            other => panic!("expected interrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_resume_values_are_positional() {
        let ctx = context(vec![json!("first")]);
        assert_eq!(ctx.interrupt(json!("q1")).unwrap(), json!("first"));

        let Err(NodeError::Interrupted(interrupts)) = ctx.interrupt(json!("q2")) else {
            panic!("second interrupt should pause");
        };
        assert_eq!(interrupts[0].index, 1);
        assert_eq!(ctx.resume_usage(), (1, 1));
    }

    #[test]
    fn test_interrupt_ids_are_stable() {
        let a = Interrupt::new("task-1", "ask", 0, json!(1));
        let b = Interrupt::new("task-1", "ask", 0, json!(2));
        let c = Interrupt::new("task-1", "ask", 1, json!(1));
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_static_interrupt_payload() {
        let interrupt = Interrupt::before("t", "review");
        assert_eq!(interrupt.value, json!({"node": "review", "when": "before"}));
    }
}
