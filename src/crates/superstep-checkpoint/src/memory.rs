//! In-memory checkpoint storage
//!
//! [`InMemoryCheckpointSaver`] keeps every checkpoint of every thread in process
//! memory. It goes through the same [`SerializerProtocol`] as the durable
//! backends, so an [`EncryptedSerializer`](crate::EncryptedSerializer) or a
//! serialization failure behaves identically here and in SQLite.
//!
//! # Layout
//!
//! ```text
//! Storage
//! ├── checkpoints: (thread_id, checkpoint_ns) → [seq-ordered entries]
//! └── writes:      (thread_id, checkpoint_ns, checkpoint_id)
//!                    → (task_id, index) → (channel, bytes)
//! ```
//!
//! A single `tokio::sync::RwLock` guards both maps, so
//! [`put_if_latest`](CheckpointSaver::put_if_latest) checks the head and inserts
//! without a window for a competing writer.
//!
//! Nothing survives the process. Use
//! [`SqliteCheckpointSaver`](crate::SqliteCheckpointSaver) when state must
//! outlive a restart.

use crate::{
    checkpoint::{
        write_index, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata,
        CheckpointTuple, PendingWrite,
    },
    error::{CheckpointError, Result},
    serializer::{JsonSerializer, SerializerProtocol},
    traits::{CheckpointSaver, CheckpointStream},
};
use async_trait::async_trait;
use futures::stream;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

type ThreadKey = (String, String);
type WritesKey = (String, String, String);

/// Storage entry for in-memory checkpoints
#[derive(Debug, Clone)]
struct CheckpointEntry {
    seq: u64,
    checkpoint_id: String,
    parent_checkpoint_id: Option<String>,
    checkpoint: Vec<u8>,
    metadata: Vec<u8>,
}

#[derive(Debug, Clone)]
struct WriteEntry {
    channel: String,
    value: Vec<u8>,
}

#[derive(Debug, Default)]
struct Storage {
    next_seq: u64,
    checkpoints: HashMap<ThreadKey, Vec<CheckpointEntry>>,
    writes: HashMap<WritesKey, BTreeMap<(String, i64), WriteEntry>>,
}

impl Storage {
    fn head(&self, key: &ThreadKey) -> Option<&CheckpointEntry> {
        self.checkpoints.get(key).and_then(|entries| entries.last())
    }

    fn insert(&mut self, key: ThreadKey, mut entry: CheckpointEntry) {
        self.next_seq += 1;
        entry.seq = self.next_seq;
        let entries = self.checkpoints.entry(key).or_default();
        match entries
            .iter_mut()
            .find(|existing| existing.checkpoint_id == entry.checkpoint_id)
        {
            Some(existing) => {
                entry.seq = existing.seq;
                *existing = entry;
            }
            None => entries.push(entry),
        }
    }
}

/// In-memory checkpoint saver implementation
///
/// Suitable for tests, short-lived processes and graphs that only need
/// interrupt/resume within one process.
///
/// # Example
///
/// ```rust
/// use superstep_checkpoint::{InMemoryCheckpointSaver, CheckpointSaver};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let saver = InMemoryCheckpointSaver::new();
///     assert_eq!(saver.checkpoint_count().await, 0);
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct InMemoryCheckpointSaver<S = JsonSerializer> {
    storage: Arc<RwLock<Storage>>,
    serde: Arc<S>,
}

impl<S> Clone for InMemoryCheckpointSaver<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            serde: Arc::clone(&self.serde),
        }
    }
}

impl InMemoryCheckpointSaver<JsonSerializer> {
    /// Create a new in-memory checkpoint saver
    pub fn new() -> Self {
        Self::with_serializer(JsonSerializer)
    }
}

impl Default for InMemoryCheckpointSaver<JsonSerializer> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SerializerProtocol> InMemoryCheckpointSaver<S> {
    /// Create a saver that encodes everything with `serde`
    pub fn with_serializer(serde: S) -> Self {
        Self {
            storage: Arc::new(RwLock::new(Storage::default())),
            serde: Arc::new(serde),
        }
    }

    /// Get the number of threads being tracked
    pub async fn thread_count(&self) -> usize {
        let storage = self.storage.read().await;
        let mut threads: Vec<&String> = storage.checkpoints.keys().map(|(t, _)| t).collect();
        threads.sort();
        threads.dedup();
        threads.len()
    }

    /// Get the total number of checkpoints across all threads
    pub async fn checkpoint_count(&self) -> usize {
        self.storage
            .read()
            .await
            .checkpoints
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Clear all checkpoints and writes
    pub async fn clear(&self) {
        let mut storage = self.storage.write().await;
        storage.checkpoints.clear();
        storage.writes.clear();
    }

    fn thread_key(config: &CheckpointConfig) -> Result<ThreadKey> {
        Ok((
            config.require_thread_id()?.to_string(),
            config.namespace().to_string(),
        ))
    }

    fn encode_entry(
        &self,
        config: &CheckpointConfig,
        checkpoint: &Checkpoint,
        metadata: &CheckpointMetadata,
    ) -> Result<CheckpointEntry> {
        Ok(CheckpointEntry {
            seq: 0,
            checkpoint_id: checkpoint.id.clone(),
            parent_checkpoint_id: config.checkpoint_id.clone(),
            checkpoint: self.serde.dumps(checkpoint)?,
            metadata: self.serde.dumps(metadata)?,
        })
    }

    fn decode_tuple(
        &self,
        storage: &Storage,
        key: &ThreadKey,
        entry: &CheckpointEntry,
    ) -> Result<CheckpointTuple> {
        let config = CheckpointConfig::for_thread(key.0.clone())
            .with_checkpoint_ns(key.1.clone())
            .with_checkpoint_id(entry.checkpoint_id.clone());

        let pending_writes = storage
            .writes
            .get(&(key.0.clone(), key.1.clone(), entry.checkpoint_id.clone()))
            .map(|writes| {
                writes
                    .iter()
                    .map(|((task_id, _), write)| {
                        Ok(PendingWrite::new(
                            task_id.clone(),
                            write.channel.clone(),
                            self.serde.loads(&write.value)?,
                        ))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        let mut tuple = CheckpointTuple::new(
            config.clone(),
            self.serde.loads(&entry.checkpoint)?,
            self.serde.loads(&entry.metadata)?,
        )
        .with_pending_writes(pending_writes);

        if let Some(parent_id) = &entry.parent_checkpoint_id {
            tuple = tuple.with_parent_config(config.at_checkpoint(parent_id.clone()));
        }
        Ok(tuple)
    }
}

#[async_trait]
impl<S: SerializerProtocol + 'static> CheckpointSaver for InMemoryCheckpointSaver<S> {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let key = Self::thread_key(config)?;
        let storage = self.storage.read().await;

        let Some(entries) = storage.checkpoints.get(&key) else {
            return Ok(None);
        };

        let entry = match &config.checkpoint_id {
            Some(checkpoint_id) => entries.iter().find(|e| &e.checkpoint_id == checkpoint_id),
            None => entries.last(),
        };

        entry
            .map(|entry| self.decode_tuple(&storage, &key, entry))
            .transpose()
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let storage = self.storage.read().await;

        let before_seq = match before.and_then(|b| b.checkpoint_id.as_ref().map(|id| (b, id))) {
            Some((before_cfg, before_id)) => Some(
                storage
                    .checkpoints
                    .iter()
                    .filter(|((thread, _), _)| {
                        before_cfg.thread_id.as_ref().map_or(true, |t| t == thread)
                    })
                    .flat_map(|(_, entries)| entries.iter())
                    .find(|entry| &entry.checkpoint_id == before_id)
                    .map(|entry| entry.seq)
                    .ok_or_else(|| CheckpointError::NotFound(before_id.clone()))?,
            ),
            None => None,
        };

        let mut candidates: Vec<(&ThreadKey, &CheckpointEntry)> = storage
            .checkpoints
            .iter()
            .filter(|((thread, ns), _)| match config {
                Some(cfg) => {
                    cfg.thread_id.as_ref().map_or(true, |t| t == thread)
                        && cfg.checkpoint_ns.as_ref().map_or(true, |n| n == ns)
                }
                None => true,
            })
            .flat_map(|(key, entries)| entries.iter().map(move |entry| (key, entry)))
            .filter(|(_, entry)| {
                config
                    .and_then(|cfg| cfg.checkpoint_id.as_ref())
                    .map_or(true, |id| &entry.checkpoint_id == id)
            })
            .filter(|(_, entry)| before_seq.map_or(true, |seq| entry.seq < seq))
            .collect();

        candidates.sort_by(|a, b| b.1.seq.cmp(&a.1.seq));

        let mut results = Vec::new();
        for (key, entry) in candidates {
            if limit.is_some_and(|lim| results.len() >= lim) {
                break;
            }
            let tuple = self.decode_tuple(&storage, key, entry)?;
            if let Some(filter_map) = &filter {
                if !tuple.metadata.matches(filter_map) {
                    continue;
                }
            }
            results.push(Ok(tuple));
        }

        Ok(Box::pin(stream::iter(results)))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        let key = Self::thread_key(config)?;
        let entry = self.encode_entry(config, &checkpoint, &metadata)?;
        let saved = config.at_checkpoint(checkpoint.id.clone());

        self.storage.write().await.insert(key, entry);
        Ok(saved)
    }

    async fn put_if_latest(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
        expected_latest: Option<&str>,
    ) -> Result<CheckpointConfig> {
        let key = Self::thread_key(config)?;
        let entry = self.encode_entry(config, &checkpoint, &metadata)?;
        let saved = config.at_checkpoint(checkpoint.id.clone());

        let mut storage = self.storage.write().await;
        let found = storage.head(&key).map(|head| head.checkpoint_id.clone());
        if found.as_deref() != expected_latest {
            return Err(CheckpointError::Conflict {
                thread_id: key.0,
                expected: expected_latest.map(String::from),
                found,
            });
        }
        storage.insert(key, entry);
        Ok(saved)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: &str,
    ) -> Result<()> {
        let (thread_id, ns) = Self::thread_key(config)?;
        let checkpoint_id = config
            .checkpoint_id
            .clone()
            .ok_or_else(|| CheckpointError::Invalid("checkpoint_id is required".to_string()))?;

        let encoded = writes
            .into_iter()
            .enumerate()
            .map(|(position, (channel, value))| {
                let idx = write_index(&channel, position);
                let value = self.serde.dumps(&value)?;
                Ok((idx, WriteEntry { channel, value }))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut storage = self.storage.write().await;
        let exists = storage
            .checkpoints
            .get(&(thread_id.clone(), ns.clone()))
            .is_some_and(|entries| entries.iter().any(|e| e.checkpoint_id == checkpoint_id));
        if !exists {
            return Err(CheckpointError::NotFound(checkpoint_id));
        }

        let slot = storage
            .writes
            .entry((thread_id, ns, checkpoint_id))
            .or_default();
        for (idx, write) in encoded {
            let key = (task_id.to_string(), idx);
            if idx < 0 {
                slot.insert(key, write);
            } else {
                slot.entry(key).or_insert(write);
            }
        }
        Ok(())
    }

    async fn delete_writes(&self, config: &CheckpointConfig) -> Result<()> {
        let (thread_id, ns) = Self::thread_key(config)?;
        if let Some(checkpoint_id) = config.checkpoint_id.clone() {
            self.storage
                .write()
                .await
                .writes
                .remove(&(thread_id, ns, checkpoint_id));
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.checkpoints.retain(|(thread, _), _| thread != thread_id);
        storage.writes.retain(|(thread, _, _), _| thread != thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointSource, ERROR, RESUME};
    use crate::serializer::{generate_key, EncryptedSerializer};
    use futures::StreamExt;
    use serde_json::json;

    async fn put_chain(saver: &InMemoryCheckpointSaver, thread: &str, n: i64) -> Vec<String> {
        let mut config = CheckpointConfig::for_thread(thread);
        let mut ids = Vec::new();
        for step in 0..n {
            let checkpoint = Checkpoint::empty();
            let metadata = CheckpointMetadata::new()
                .with_source(CheckpointSource::Loop)
                .with_step(step);
            config = saver
                .put(&config, checkpoint, metadata, HashMap::new())
                .await
                .unwrap();
            ids.push(config.checkpoint_id.clone().unwrap());
        }
        ids
    }

    async fn collect(stream: CheckpointStream) -> Vec<CheckpointTuple> {
        stream.map(|r| r.unwrap()).collect().await
    }

    #[tokio::test]
    async fn test_save_and_load_checkpoint() {
        let saver = InMemoryCheckpointSaver::new();
        let checkpoint = Checkpoint::empty();
        let metadata = CheckpointMetadata::new().with_source(CheckpointSource::Input);
        let config = CheckpointConfig::for_thread("thread-1");

        let saved_config = saver
            .put(&config, checkpoint.clone(), metadata, HashMap::new())
            .await
            .unwrap();
        assert_eq!(saved_config.checkpoint_id.as_deref(), Some(checkpoint.id.as_str()));

        let tuple = saver.get_tuple(&saved_config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint, checkpoint);
        assert!(tuple.parent_config.is_none());
        assert_eq!(tuple.metadata.source, Some(CheckpointSource::Input));
    }

    #[tokio::test]
    async fn test_latest_and_parent_links() {
        let saver = InMemoryCheckpointSaver::new();
        let ids = put_chain(&saver, "t", 3).await;

        let latest = saver
            .get_tuple(&CheckpointConfig::for_thread("t"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.checkpoint.id, ids[2]);
        assert_eq!(latest.parent_checkpoint_id(), Some(ids[1].as_str()));
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_none() {
        let saver = InMemoryCheckpointSaver::new();
        put_chain(&saver, "t", 1).await;
        let config = CheckpointConfig::for_thread("t").with_checkpoint_id("nope");
        assert!(saver.get_tuple(&config).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let saver = InMemoryCheckpointSaver::new();
        let ids = put_chain(&saver, "t", 4).await;

        let all = collect(
            saver
                .list(Some(&CheckpointConfig::for_thread("t")), None, None, None)
                .await
                .unwrap(),
        )
        .await;
        let listed: Vec<_> = all.iter().map(|t| t.checkpoint.id.clone()).collect();
        let mut expected = ids.clone();
        expected.reverse();
        assert_eq!(listed, expected);

        let before = CheckpointConfig::for_thread("t").with_checkpoint_id(ids[2].clone());
        let older = collect(
            saver
                .list(Some(&CheckpointConfig::for_thread("t")), None, Some(&before), Some(1))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].checkpoint.id, ids[1]);
    }

    #[tokio::test]
    async fn test_list_filter() {
        let saver = InMemoryCheckpointSaver::new();
        put_chain(&saver, "t", 3).await;

        let filter = HashMap::from([("step".to_string(), json!(1))]);
        let found = collect(
            saver
                .list(Some(&CheckpointConfig::for_thread("t")), Some(filter), None, None)
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metadata.step, Some(1));
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let saver = InMemoryCheckpointSaver::new();
        let root = CheckpointConfig::for_thread("t");
        let child = CheckpointConfig::for_thread("t").with_checkpoint_ns("child");

        saver
            .put(&root, Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();
        let child_cp = Checkpoint::empty();
        saver
            .put(&child, child_cp.clone(), CheckpointMetadata::new(), HashMap::new())
            .await
            .unwrap();

        let root_head = saver.get_tuple(&root).await.unwrap().unwrap();
        assert_ne!(root_head.checkpoint.id, child_cp.id);

        saver.delete_thread("t").await.unwrap();
        assert!(saver.get_tuple(&root).await.unwrap().is_none());
        assert!(saver.get_tuple(&child).await.unwrap().is_none());
        assert_eq!(saver.thread_count().await, 0);
    }

    #[tokio::test]
    async fn test_put_writes_idempotent_and_special_upsert() {
        let saver = InMemoryCheckpointSaver::new();
        let ids = put_chain(&saver, "t", 1).await;
        let config = CheckpointConfig::for_thread("t").with_checkpoint_id(ids[0].clone());

        saver
            .put_writes(&config, vec![("foo".into(), json!("a"))], "task-1")
            .await
            .unwrap();
        saver
            .put_writes(&config, vec![("foo".into(), json!("changed"))], "task-1")
            .await
            .unwrap();
        saver
            .put_writes(&config, vec![(RESUME.into(), json!(["x"]))], "task-2")
            .await
            .unwrap();
        saver
            .put_writes(&config, vec![(RESUME.into(), json!(["x", "y"]))], "task-2")
            .await
            .unwrap();

        let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(
            tuple.pending_writes,
            vec![
                PendingWrite::new("task-1", "foo", json!("a")),
                PendingWrite::new("task-2", RESUME, json!(["x", "y"])),
            ]
        );

        saver.delete_writes(&config).await.unwrap();
        let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
        assert!(tuple.pending_writes.is_empty());
    }

    #[tokio::test]
    async fn test_put_writes_requires_existing_checkpoint() {
        let saver = InMemoryCheckpointSaver::new();
        let config = CheckpointConfig::for_thread("t").with_checkpoint_id("ghost");
        let err = saver
            .put_writes(&config, vec![(ERROR.into(), json!("boom"))], "task")
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_put_if_latest_detects_conflict() {
        let saver = InMemoryCheckpointSaver::new();
        let ids = put_chain(&saver, "t", 2).await;
        let stale = CheckpointConfig::for_thread("t").with_checkpoint_id(ids[0].clone());

        let err = saver
            .put_if_latest(
                &stale,
                Checkpoint::empty(),
                CheckpointMetadata::new(),
                HashMap::new(),
                Some(&ids[0]),
            )
            .await
            .unwrap_err();
        match err {
            CheckpointError::Conflict { found, .. } => assert_eq!(found, Some(ids[1].clone())),
            other => panic!("unexpected error: {other:?}"),
        }

        let head = CheckpointConfig::for_thread("t").with_checkpoint_id(ids[1].clone());
        saver
            .put_if_latest(
                &head,
                Checkpoint::empty(),
                CheckpointMetadata::new(),
                HashMap::new(),
                Some(&ids[1]),
            )
            .await
            .unwrap();
        assert_eq!(saver.checkpoint_count().await, 3);
    }

    #[tokio::test]
    async fn test_encrypted_saver_roundtrip() {
        let saver =
            InMemoryCheckpointSaver::with_serializer(EncryptedSerializer::new(JsonSerializer, &generate_key()));
        let mut checkpoint = Checkpoint::empty();
        checkpoint
            .channel_values
            .insert("secret".to_string(), json!("hunter2"));

        let config = saver
            .put(
                &CheckpointConfig::for_thread("t"),
                checkpoint.clone(),
                CheckpointMetadata::new(),
                HashMap::new(),
            )
            .await
            .unwrap();

        let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.channel_values["secret"], json!("hunter2"));
    }

    #[tokio::test]
    async fn test_clear() {
        let saver = InMemoryCheckpointSaver::new();
        put_chain(&saver, "a", 2).await;
        put_chain(&saver, "b", 1).await;
        assert_eq!(saver.thread_count().await, 2);
        assert_eq!(saver.checkpoint_count().await, 3);

        saver.clear().await;
        assert_eq!(saver.checkpoint_count().await, 0);
    }
}
