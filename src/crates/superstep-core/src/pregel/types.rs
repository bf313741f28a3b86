//! Core scheduler data types.

use crate::error::GraphError;
use crate::interrupt::Interrupt;
use serde_json::Value;
use std::fmt;

/// Position of a task inside its superstep.
///
/// The derived order is the order writes are applied in: pull tasks by node
/// name, then push tasks by packet position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPath {
    /// Triggered by channel versions
    Pull(String),
    /// Created from the n-th `Send` packet
    Push(usize),
}

impl fmt::Display for TaskPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPath::Pull(node) => write!(f, "pull:{}", node),
            TaskPath::Push(index) => write!(f, "push:{}", index),
        }
    }
}

/// A task prepared for the next superstep
#[derive(Debug, Clone)]
pub(crate) struct PregelTask {
    /// Deterministic id, see [`task_id`](super::algo::task_id)
    pub id: String,
    /// Node to run
    pub name: String,
    pub path: TaskPath,
    /// State object for pull tasks, the packet argument for push tasks
    pub input: Value,
    /// Channels whose versions made the task runnable
    pub triggers: Vec<String>,
}

impl PregelTask {
    pub fn is_push(&self) -> bool {
        matches!(self.path, TaskPath::Push(_))
    }
}

/// How a task attempt ended
#[derive(Debug)]
pub(crate) enum TaskResult {
    /// Channel writes, including routing writes
    Completed(Vec<(String, Value)>),
    Interrupted(Vec<Interrupt>),
    Failed(GraphError),
}
