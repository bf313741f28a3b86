//! # superstep-checkpoint - Durable state for superstep execution
//!
//! **Checkpoint records, merge channels and storage backends** for the
//! `superstep-core` execution engine. Every finished superstep becomes one
//! immutable [`Checkpoint`]; the chain of parent links forms a thread's history
//! and makes replay, forking and resume-after-crash possible.
//!
//! ## Core Concepts
//!
//! ### 1. CheckpointSaver Trait
//!
//! [`CheckpointSaver`] is the storage seam:
//!
//! - **`put()` / `put_if_latest()`** - Save a checkpoint, optionally guarded against concurrent writers
//! - **`put_writes()`** - Record results of finished tasks inside an unfinished superstep
//! - **`get_tuple()`** - Load a checkpoint with its pending writes
//! - **`list()`** - Query history, newest first
//! - **`delete_thread()`** - Drop a thread across all namespaces
//!
//! [`BlockingCheckpointSaver`] exposes the same operations synchronously.
//!
//! ### 2. Channels
//!
//! - [`LastValueChannel`] - Overwrite, last writer in task order wins
//! - [`BinaryOperatorChannel`] - Fold writes through an associative reducer
//! - [`TopicChannel`] - Collect values until consumed
//! - [`NamedBarrierValueChannel`] - Wait for several named writers
//!
//! ### 3. Backends
//!
//! | Backend | Durability | Notes |
//! |---------|------------|-------|
//! | [`InMemoryCheckpointSaver`] | process lifetime | tests, single-process interrupt/resume |
//! | [`SqliteCheckpointSaver`] | on disk | survives restarts, `sqlite` feature |
//!
//! Both encode through a [`SerializerProtocol`]; wrap the default
//! [`JsonSerializer`] in an [`EncryptedSerializer`] for AES-256-GCM at rest.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use superstep_checkpoint::{
//!     InMemoryCheckpointSaver, CheckpointSaver, CheckpointConfig,
//!     Checkpoint, CheckpointMetadata
//! };
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let saver = InMemoryCheckpointSaver::new();
//!
//!     let config = CheckpointConfig::for_thread("thread-123");
//!     let saved = saver
//!         .put(&config, Checkpoint::empty(), CheckpointMetadata::default(), HashMap::new())
//!         .await?;
//!
//!     if let Some(tuple) = saver.get_tuple(&saved).await? {
//!         println!("Retrieved checkpoint: {}", tuple.checkpoint.id);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`checkpoint`] - [`Checkpoint`], [`CheckpointConfig`], [`CheckpointMetadata`], [`CheckpointTuple`]
//! - [`channels`] - [`Channel`] trait and merge policies
//! - [`traits`] - [`CheckpointSaver`] and [`CheckpointStream`]
//! - [`memory`] - [`InMemoryCheckpointSaver`]
//! - [`sqlite`] - [`SqliteCheckpointSaver`]
//! - [`blocking`] - [`BlockingCheckpointSaver`]
//! - [`serializer`] - [`SerializerProtocol`], [`JsonSerializer`], [`EncryptedSerializer`]
//! - [`error`] - [`CheckpointError`]

pub mod blocking;
pub mod channels;
pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod serializer;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

// Re-export main types
pub use blocking::BlockingCheckpointSaver;
pub use channels::{
    reducers, BinaryOperatorChannel, Channel, LastValueChannel, NamedBarrierValueChannel,
    ReducerFn, TopicChannel,
};
pub use checkpoint::{
    ChannelVersion, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointId,
    CheckpointMetadata, CheckpointSource, CheckpointTuple, PendingWrite,
};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointSaver;
pub use serializer::{generate_key, EncryptedSerializer, JsonSerializer, SerializerProtocol};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCheckpointSaver;
pub use traits::{CheckpointSaver, CheckpointStream};
