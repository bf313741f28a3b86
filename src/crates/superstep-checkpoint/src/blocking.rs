//! Synchronous facade over any [`CheckpointSaver`]
//!
//! For callers without an async runtime: a CLI, a test harness or a plain
//! thread. The wrapper owns a current-thread tokio runtime and drives every call
//! to completion. Calling it from inside another runtime panics, as with any
//! nested `block_on`.

use crate::{
    checkpoint::{ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple},
    error::Result,
    traits::CheckpointSaver,
};
use futures::TryStreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

/// Blocking wrapper around an async checkpoint saver
pub struct BlockingCheckpointSaver {
    inner: Arc<dyn CheckpointSaver>,
    runtime: Runtime,
}

impl std::fmt::Debug for BlockingCheckpointSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingCheckpointSaver").finish_non_exhaustive()
    }
}

fn runtime() -> Result<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}

impl BlockingCheckpointSaver {
    /// Wrap an existing saver
    pub fn new(inner: impl CheckpointSaver + 'static) -> Result<Self> {
        Self::from_arc(Arc::new(inner))
    }

    /// Wrap a shared saver
    pub fn from_arc(inner: Arc<dyn CheckpointSaver>) -> Result<Self> {
        Ok(Self {
            inner,
            runtime: runtime()?,
        })
    }

    /// Open a SQLite file on the wrapper's own runtime
    #[cfg(feature = "sqlite")]
    pub fn open_sqlite(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let runtime = runtime()?;
        let saver = runtime.block_on(crate::sqlite::SqliteCheckpointSaver::open(path))?;
        Ok(Self {
            inner: Arc::new(saver),
            runtime,
        })
    }

    /// The wrapped async saver
    pub fn inner(&self) -> Arc<dyn CheckpointSaver> {
        Arc::clone(&self.inner)
    }

    pub fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        self.runtime.block_on(self.inner.get(config))
    }

    pub fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        self.runtime.block_on(self.inner.get_tuple(config))
    }

    /// Collect the whole listing, newest first
    pub fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>> {
        self.runtime.block_on(async {
            let stream = self.inner.list(config, filter, before, limit).await?;
            stream.try_collect().await
        })
    }

    pub fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        self.runtime
            .block_on(self.inner.put(config, checkpoint, metadata, new_versions))
    }

    pub fn put_if_latest(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
        expected_latest: Option<&str>,
    ) -> Result<CheckpointConfig> {
        self.runtime.block_on(self.inner.put_if_latest(
            config,
            checkpoint,
            metadata,
            new_versions,
            expected_latest,
        ))
    }

    pub fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<()> {
        self.runtime
            .block_on(self.inner.put_writes(config, writes, task_id))
    }

    pub fn delete_writes(&self, config: &CheckpointConfig) -> Result<()> {
        self.runtime.block_on(self.inner.delete_writes(config))
    }

    pub fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.runtime.block_on(self.inner.delete_thread(thread_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCheckpointSaver;
    use serde_json::json;

    #[test]
    fn test_blocking_roundtrip() {
        let saver = BlockingCheckpointSaver::new(InMemoryCheckpointSaver::new()).unwrap();
        let config = CheckpointConfig::for_thread("sync");

        let first = saver
            .put(
                &config,
                Checkpoint::empty(),
                CheckpointMetadata::new().with_step(-1),
                HashMap::new(),
            )
            .unwrap();
        saver
            .put_writes(&first, vec![("foo".into(), json!("a"))], "task")
            .unwrap();

        let tuple = saver.get_tuple(&config).unwrap().unwrap();
        assert_eq!(tuple.pending_writes.len(), 1);
        assert_eq!(saver.list(Some(&config), None, None, None).unwrap().len(), 1);

        saver.delete_thread("sync").unwrap();
        assert!(saver.get(&config).unwrap().is_none());
    }
}
