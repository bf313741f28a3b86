//! Storage trait for checkpoint backends
//!
//! **[`CheckpointSaver`]** is the seam between the execution engine and storage.
//! The engine never talks to a database directly; it saves one checkpoint per
//! finished superstep, records task results while a superstep is in flight, and
//! reads history back through this trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Execution engine                                         │
//! │    superstep done    → put_if_latest(config, checkpoint)  │
//! │    task done         → put_writes(config, writes, task)   │
//! │    resume / replay   → get_tuple(config)                  │
//! │    history           → list(config, filter, before, limit)│
//! └─────────────────────────┬────────────────────────────────┘
//!                           │ CheckpointSaver
//!         ┌─────────────────┼─────────────────────┐
//!         ▼                 ▼                     ▼
//!  InMemoryCheckpointSaver  SqliteCheckpointSaver  your backend
//! ```
//!
//! # Contract
//!
//! | Operation | Guarantee |
//! |-----------|-----------|
//! | `put` | Stores the checkpoint as a child of `config.checkpoint_id`; returns a config addressing it |
//! | `put_if_latest` | As `put`, but fails with `Conflict` when the thread head moved |
//! | `put_writes` | Idempotent per `(task_id, index)`; special channels are replaced |
//! | `get_tuple` | Exact checkpoint when `checkpoint_id` is set, latest otherwise; `None` when absent |
//! | `list` | Newest first, insertion order, filtered by metadata |
//! | `delete_thread` | Removes every namespace of the thread, writes included |
//!
//! "Latest" always means most recently inserted within `(thread_id, checkpoint_ns)`.
//!
//! # Writing a backend
//!
//! ```rust,ignore
//! use superstep_checkpoint::{CheckpointSaver, CheckpointTuple, CheckpointConfig, Result};
//! use async_trait::async_trait;
//!
//! struct RedisSaver { /* ... */ }
//!
//! #[async_trait]
//! impl CheckpointSaver for RedisSaver {
//!     async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
//!         // ...
//!     }
//!     // list, put, put_writes, delete_thread
//! }
//! ```
//!
//! Backends that can check and insert atomically should override
//! [`CheckpointSaver::put_if_latest`]; the default implementation reads the head
//! and then writes, which leaves a small window for a competing writer.

use crate::checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
};
use crate::error::{CheckpointError, Result};
use async_trait::async_trait;
use futures::stream::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;

/// Stream of checkpoint tuples returned by [`CheckpointSaver::list`]
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send>>;

/// Core trait for implementing checkpoint storage backends
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch a checkpoint using the given configuration
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|tuple| tuple.checkpoint))
    }

    /// Fetch a checkpoint tuple using the given configuration
    ///
    /// With `checkpoint_id` set, returns exactly that checkpoint; otherwise the
    /// latest checkpoint of the thread and namespace. Pending writes recorded
    /// against the checkpoint are attached to the tuple.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// List checkpoints matching the given criteria, newest first
    ///
    /// * `config` - restricts to a thread; a namespace or checkpoint id narrows further
    /// * `filter` - metadata key/value pairs that must all match
    /// * `before` - only checkpoints inserted before this one
    /// * `limit` - maximum number of results
    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream>;

    /// Store a checkpoint with its configuration and metadata
    ///
    /// `config.checkpoint_id` names the parent. The returned configuration
    /// addresses the stored checkpoint.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig>;

    /// Store a checkpoint only if the thread head is still `expected_latest`
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Conflict`] when another writer advanced the
    /// thread since the caller loaded it.
    async fn put_if_latest(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
        expected_latest: Option<&str>,
    ) -> Result<CheckpointConfig> {
        let thread_id = config.require_thread_id()?;
        let head = self.get_tuple(&config.latest()).await?;
        let found = head.map(|tuple| tuple.checkpoint.id);
        if found.as_deref() != expected_latest {
            return Err(CheckpointError::Conflict {
                thread_id: thread_id.to_string(),
                expected: expected_latest.map(String::from),
                found,
            });
        }
        self.put(config, checkpoint, metadata, new_versions).await
    }

    /// Store intermediate writes linked to a checkpoint
    ///
    /// `config.checkpoint_id` names the checkpoint whose successor the writes
    /// belong to. Writes are indexed by position, or by
    /// [`write_index`](crate::checkpoint::write_index) for special channels.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<()>;

    /// Drop pending writes recorded against a checkpoint
    async fn delete_writes(&self, _config: &CheckpointConfig) -> Result<()> {
        Ok(())
    }

    /// Delete all checkpoints and writes associated with a thread ID
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}
