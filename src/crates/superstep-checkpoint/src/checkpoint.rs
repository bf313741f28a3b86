//! Core checkpoint data structures for state persistence and time-travel
//!
//! This module defines the record types persisted by every [`CheckpointSaver`]:
//! **[`Checkpoint`]**, **[`CheckpointConfig`]**, **[`CheckpointMetadata`]**,
//! **[`CheckpointTuple`]** and **[`PendingWrite`]**.
//!
//! # Overview
//!
//! - **State Snapshots** - Complete point-in-time captures of all channel values
//! - **Version Tracking** - Per-channel monotonic counters used to decide which nodes run next
//! - **Lineage** - Every checkpoint except the first of a thread names exactly one parent
//! - **Pending Writes** - Results of finished tasks inside an unfinished superstep
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  CheckpointTuple                                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ config         thread_id / checkpoint_ns / id       │  │
//! │  │ parent_config  thread_id / checkpoint_ns / parent   │  │
//! │  ├────────────────────────────────────────────────────┤  │
//! │  │ Checkpoint                                          │  │
//! │  │   channel_values   {"foo": "b", "bar": ["a","b"]}   │  │
//! │  │   channel_versions {"foo": 2, "bar": 2}             │  │
//! │  │   versions_seen    {"node_b": {"branch:to:node_b": 1}}│ │
//! │  ├────────────────────────────────────────────────────┤  │
//! │  │ CheckpointMetadata source=loop step=2 writes={..}   │  │
//! │  ├────────────────────────────────────────────────────┤  │
//! │  │ pending_writes [(task_id, channel, value), ...]     │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Step numbering
//!
//! | Step | Source | Contents |
//! |------|--------|----------|
//! | `-1` | `Input` | Input written to `__start__`, nothing applied yet |
//! | `0` | `Loop` | Input applied to state channels |
//! | `n` | `Loop` | State after the n-th node superstep |
//! | parent + 1 | `Update` | Manual state edit, child of the edited checkpoint |
//!
//! # Versions Seen Tracking
//!
//! ```text
//!   Channel "branch:to:writer" is at version 3
//!   Node "writer" has seen version 2
//!   → "writer" is runnable
//!
//!   Node "reviewer" has seen "branch:to:reviewer" at its current version
//!   → "reviewer" is skipped
//! ```
//!
//! [`CheckpointSaver`]: crate::traits::CheckpointSaver

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{CheckpointError, Result};

/// Checkpoint ID type
pub type CheckpointId = String;

/// Reserved channel for errors raised by a failed task
pub const ERROR: &str = "__error__";
/// Reserved channel for interrupts raised by a task
pub const INTERRUPT: &str = "__interrupt__";
/// Reserved channel for resume values delivered to a task
pub const RESUME: &str = "__resume__";
/// Marker written by a task that finished without producing writes
pub const NO_WRITES: &str = "__no_writes__";

/// Storage index of a pending write.
///
/// Special channels get a fixed negative index so a later write for the same
/// task replaces the earlier one. Regular writes keep their position.
pub fn write_index(channel: &str, position: usize) -> i64 {
    match channel {
        ERROR => -1,
        INTERRUPT => -3,
        RESUME => -4,
        _ => position as i64,
    }
}

/// Whether a channel name is reserved for pending-write bookkeeping
pub fn is_special_channel(channel: &str) -> bool {
    matches!(channel, ERROR | INTERRUPT | RESUME | NO_WRITES)
}

/// Monotonic version counter of a single channel.
///
/// A channel that was never written has version 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelVersion(pub u64);

impl ChannelVersion {
    /// Version of a channel that was never written
    pub const ZERO: ChannelVersion = ChannelVersion(0);

    /// Get the next version
    pub fn next(&self) -> Self {
        ChannelVersion(self.0 + 1)
    }
}

impl fmt::Display for ChannelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mapping from channel name to version
pub type ChannelVersions = HashMap<String, ChannelVersion>;

/// Metadata source type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Checkpoint created from an input to invoke/stream
    Input,
    /// Checkpoint created from inside the superstep loop
    Loop,
    /// Checkpoint created from a manual state update
    Update,
    /// Checkpoint created as a copy of another checkpoint
    Fork,
}

/// Metadata associated with a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// The step number of the checkpoint
    /// -1 for the first "input" checkpoint
    /// 0 for the first "loop" checkpoint
    /// n for the nth checkpoint afterwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// The IDs of the parent checkpoints
    /// Mapping from checkpoint namespace to checkpoint ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<HashMap<String, String>>,

    /// Writes folded into this checkpoint, keyed by node name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writes: Option<Value>,

    /// Identifier of the run that produced the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl CheckpointMetadata {
    /// Create a new checkpoint metadata
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source
    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the step number
    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    /// Set parent checkpoints
    pub fn with_parents(mut self, parents: HashMap<String, String>) -> Self {
        self.parents = Some(parents);
        self
    }

    /// Record the writes folded into the checkpoint
    pub fn with_writes(mut self, writes: Value) -> Self {
        self.writes = Some(writes);
        self
    }

    /// Set the producing run
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Add custom metadata
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Check the metadata against an equality filter.
    ///
    /// Filter keys address the serialized form, so `source`, `step`,
    /// `run_id` and custom keys can all be matched.
    pub fn matches(&self, filter: &HashMap<String, Value>) -> bool {
        if filter.is_empty() {
            return true;
        }
        let Ok(Value::Object(serialized)) = serde_json::to_value(self) else {
            return false;
        };
        filter
            .iter()
            .all(|(key, expected)| serialized.get(key) == Some(expected))
    }
}

/// State snapshot at a given point in time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    /// The version of the checkpoint format (currently 1)
    pub v: i32,

    /// The ID of the checkpoint (unique and time-ordered)
    pub id: CheckpointId,

    /// The timestamp of the checkpoint
    pub ts: DateTime<Utc>,

    /// The values of the channels at the time of the checkpoint
    pub channel_values: HashMap<String, Value>,

    /// The versions of the channels at the time of the checkpoint
    pub channel_versions: ChannelVersions,

    /// Map from node name to map from channel name to version seen
    /// Used to determine which nodes to execute next
    pub versions_seen: HashMap<String, ChannelVersions>,

    /// The channels that were updated in this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_channels: Option<Vec<String>>,
}

impl Checkpoint {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: i32 = 1;

    /// Create a new checkpoint
    pub fn new(
        id: CheckpointId,
        channel_values: HashMap<String, Value>,
        channel_versions: ChannelVersions,
        versions_seen: HashMap<String, ChannelVersions>,
    ) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id,
            ts: Utc::now(),
            channel_values,
            channel_versions,
            versions_seen,
            updated_channels: None,
        }
    }

    /// Create an empty checkpoint
    pub fn empty() -> Self {
        Self::new(
            Self::new_id(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        )
    }

    /// Generate a fresh, time-ordered checkpoint id
    pub fn new_id() -> CheckpointId {
        Uuid::now_v7().to_string()
    }

    /// Copy the state into a new checkpoint with a fresh id and timestamp.
    ///
    /// The receiver is left untouched; checkpoints are never mutated once saved.
    pub fn successor(&self) -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id: Self::new_id(),
            ts: Utc::now(),
            channel_values: self.channel_values.clone(),
            channel_versions: self.channel_versions.clone(),
            versions_seen: self.versions_seen.clone(),
            updated_channels: None,
        }
    }

    /// Set the updated channels
    pub fn with_updated_channels(mut self, channels: Vec<String>) -> Self {
        self.updated_channels = Some(channels);
        self
    }

    /// Version of a channel, zero when never written
    pub fn version_of(&self, channel: &str) -> ChannelVersion {
        self.channel_versions
            .get(channel)
            .copied()
            .unwrap_or(ChannelVersion::ZERO)
    }
}

/// Configuration for checkpoint operations
///
/// Every call into the engine carries one: `thread_id` addresses the history,
/// `checkpoint_id` optionally selects a historical point and `checkpoint_ns`
/// isolates state within a thread.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CheckpointConfig {
    /// Thread ID for grouping related checkpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Specific checkpoint ID to retrieve
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,

    /// Checkpoint namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_ns: Option<String>,

    /// Additional configuration
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl CheckpointConfig {
    /// Create a new checkpoint configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration addressing the latest checkpoint of a thread
    pub fn for_thread(thread_id: impl Into<String>) -> Self {
        Self::new().with_thread_id(thread_id)
    }

    /// Set the thread ID
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// Set the checkpoint ID
    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    /// Set the checkpoint namespace
    pub fn with_checkpoint_ns(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(checkpoint_ns.into());
        self
    }

    /// Thread id, or an `Invalid` error when missing
    pub fn require_thread_id(&self) -> Result<&str> {
        self.thread_id
            .as_deref()
            .ok_or_else(|| CheckpointError::Invalid("thread_id is required".to_string()))
    }

    /// Namespace, empty for the root graph
    pub fn namespace(&self) -> &str {
        self.checkpoint_ns.as_deref().unwrap_or("")
    }

    /// Same thread and namespace, pointing at another checkpoint
    pub fn at_checkpoint(&self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        Self {
            thread_id: self.thread_id.clone(),
            checkpoint_id: Some(checkpoint_id.into()),
            checkpoint_ns: self.checkpoint_ns.clone(),
            extra: self.extra.clone(),
        }
    }

    /// Same thread and namespace, addressing the latest checkpoint
    pub fn latest(&self) -> Self {
        Self {
            checkpoint_id: None,
            ..self.clone()
        }
    }
}

/// A write produced by a task whose superstep has not been folded into a checkpoint yet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingWrite {
    /// Task that produced the write
    pub task_id: String,
    /// Target channel
    pub channel: String,
    /// Written value
    pub value: Value,
}

impl PendingWrite {
    /// Create a new pending write
    pub fn new(task_id: impl Into<String>, channel: impl Into<String>, value: Value) -> Self {
        Self {
            task_id: task_id.into(),
            channel: channel.into(),
            value,
        }
    }
}

/// A tuple containing a checkpoint and its associated data
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    /// Configuration for this checkpoint
    pub config: CheckpointConfig,

    /// The checkpoint itself
    pub checkpoint: Checkpoint,

    /// Metadata associated with the checkpoint
    pub metadata: CheckpointMetadata,

    /// Parent configuration (if any)
    pub parent_config: Option<CheckpointConfig>,

    /// Writes recorded against this checkpoint and not yet folded forward
    pub pending_writes: Vec<PendingWrite>,
}

impl CheckpointTuple {
    /// Create a new checkpoint tuple
    pub fn new(
        config: CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self {
            config,
            checkpoint,
            metadata,
            parent_config: None,
            pending_writes: Vec::new(),
        }
    }

    /// Set the parent configuration
    pub fn with_parent_config(mut self, parent_config: CheckpointConfig) -> Self {
        self.parent_config = Some(parent_config);
        self
    }

    /// Set the pending writes
    pub fn with_pending_writes(mut self, pending_writes: Vec<PendingWrite>) -> Self {
        self.pending_writes = pending_writes;
        self
    }

    /// Id of the parent checkpoint, if any
    pub fn parent_checkpoint_id(&self) -> Option<&str> {
        self.parent_config
            .as_ref()
            .and_then(|c| c.checkpoint_id.as_deref())
    }

    /// Step index recorded in the metadata
    pub fn step(&self) -> i64 {
        self.metadata.step.unwrap_or(-1)
    }
}
