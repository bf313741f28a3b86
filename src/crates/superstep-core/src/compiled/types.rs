//! Type definitions for compiled graph execution

use crate::error::Result;
use crate::interrupt::Interrupt;
use crate::pregel::types::PregelTask;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use superstep_checkpoint::{CheckpointConfig, CheckpointMetadata};

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// No runnable tasks remain
    Completed,
    /// Paused; resume with [`CompiledGraph::resume`](super::CompiledGraph::resume)
    /// or continue with `invoke(None, ..)`
    Interrupted,
}

/// Result of [`invoke`](super::CompiledGraph::invoke) and
/// [`resume`](super::CompiledGraph::resume).
///
/// A failed run is an `Err`; this type only covers the two ways a run can
/// stop cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// State after the last saved checkpoint
    pub values: Value,
    /// Pending interrupts, in the order resume values must be supplied
    pub interrupts: Vec<Interrupt>,
    /// Address of the last saved checkpoint
    pub config: CheckpointConfig,
}

impl RunOutcome {
    pub fn is_interrupted(&self) -> bool {
        self.status == RunStatus::Interrupted
    }

    /// Value of one state channel
    pub fn get(&self, channel: &str) -> Option<&Value> {
        self.values.get(channel)
    }
}

/// A task scheduled for, or recorded against, the next superstep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub name: String,
    /// `pull:<node>` or `push:<index>`
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interrupts: Vec<Interrupt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// State update of a finished task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl TaskInfo {
    pub(crate) fn pending(task: &PregelTask) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            path: task.path.to_string(),
            interrupts: Vec::new(),
            error: None,
            result: None,
        }
    }

    pub(crate) fn finished(task: &PregelTask, update: Value) -> Self {
        Self {
            result: Some(update),
            ..Self::pending(task)
        }
    }

    pub(crate) fn interrupted(task: &PregelTask, interrupts: Vec<Interrupt>) -> Self {
        Self {
            interrupts,
            ..Self::pending(task)
        }
    }

    pub(crate) fn failed(task: &PregelTask, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::pending(task)
        }
    }
}

/// Snapshot of the graph state at one checkpoint.
///
/// `next` and `tasks` describe the superstep that would run from this
/// checkpoint. Tasks that already finished or paused carry their recorded
/// result, interrupts or error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State channel values
    pub values: Value,
    /// Names of the nodes that run next, in task order
    pub next: Vec<String>,
    pub tasks: Vec<TaskInfo>,
    /// Interrupts waiting for resume values
    pub interrupts: Vec<Interrupt>,
    /// Address of this checkpoint; thread-only for an empty thread
    pub config: CheckpointConfig,
    pub metadata: Option<CheckpointMetadata>,
    pub created_at: Option<DateTime<Utc>>,
    pub parent_config: Option<CheckpointConfig>,
}

impl StateSnapshot {
    /// Snapshot of a thread that has no checkpoints yet
    pub(crate) fn empty(config: CheckpointConfig) -> Self {
        Self {
            values: Value::Object(Default::default()),
            next: Vec::new(),
            tasks: Vec::new(),
            interrupts: Vec::new(),
            config,
            metadata: None,
            created_at: None,
            parent_config: None,
        }
    }

    /// Step recorded in the checkpoint metadata
    pub fn step(&self) -> Option<i64> {
        self.metadata.as_ref().and_then(|m| m.step)
    }
}

/// Which events a [`stream`](super::CompiledGraph::stream) yields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Full state after every saved checkpoint
    Values,
    /// Per-node state updates after every superstep
    Updates,
    /// Every recorded task result
    Tasks,
    /// Every saved checkpoint with its metadata
    Checkpoints,
    /// Interrupts that paused the run
    Interrupts,
}

/// An event observed while a run executes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    Values {
        step: i64,
        values: Value,
    },
    Updates {
        step: i64,
        node: String,
        update: Value,
    },
    Task {
        step: i64,
        task: TaskInfo,
    },
    Checkpoint {
        config: CheckpointConfig,
        metadata: CheckpointMetadata,
        values: Value,
        next: Vec<String>,
    },
    Interrupt {
        interrupts: Vec<Interrupt>,
    },
}

impl StreamEvent {
    /// Mode that selects this event
    pub fn mode(&self) -> StreamMode {
        match self {
            StreamEvent::Values { .. } => StreamMode::Values,
            StreamEvent::Updates { .. } => StreamMode::Updates,
            StreamEvent::Task { .. } => StreamMode::Tasks,
            StreamEvent::Checkpoint { .. } => StreamMode::Checkpoints,
            StreamEvent::Interrupt { .. } => StreamMode::Interrupts,
        }
    }
}

/// Stream of run events; a run error ends the stream with an `Err`
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Stream of state snapshots, newest first
pub type StateSnapshotStream = Pin<Box<dyn Stream<Item = Result<StateSnapshot>> + Send>>;
