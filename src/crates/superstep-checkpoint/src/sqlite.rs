//! SQLite-backed durable checkpoint storage
//!
//! [`SqliteCheckpointSaver`] persists checkpoints and pending writes in a single
//! SQLite file. Checkpoints and metadata are stored as opaque blobs produced by
//! the configured [`SerializerProtocol`], so encryption at rest is a matter of
//! choosing an [`EncryptedSerializer`](crate::EncryptedSerializer).
//!
//! Two pools are opened against the file:
//!
//! - `writer` holds one connection, so every mutation is serialized and
//!   [`put_if_latest`](CheckpointSaver::put_if_latest) runs its head check and
//!   insert inside one transaction.
//! - `reader` holds several read-only connections for `get_tuple` and `list`.
//!
//! Metadata filters are evaluated after decoding because the blob may be
//! encrypted.

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
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const MAX_READERS: u32 = 4;

/// Durable checkpoint saver on top of SQLite
pub struct SqliteCheckpointSaver<S = JsonSerializer> {
    reader: SqlitePool,
    writer: SqlitePool,
    serde: Arc<S>,
}

impl<S> Clone for SqliteCheckpointSaver<S> {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
            writer: self.writer.clone(),
            serde: Arc::clone(&self.serde),
        }
    }
}

impl<S> std::fmt::Debug for SqliteCheckpointSaver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointSaver")
            .field("readers", &self.reader.size())
            .finish_non_exhaustive()
    }
}

impl SqliteCheckpointSaver<JsonSerializer> {
    /// Open (creating if missing) a database file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        Self::connect_with(options, false).await
    }

    /// Connect using a URL such as `sqlite://state.db` or `sqlite::memory:`
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let in_memory = database_url.contains(":memory:");
        Self::connect_with(options, in_memory).await
    }

    async fn connect_with(options: SqliteConnectOptions, in_memory: bool) -> Result<Self> {
        let options = options
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;

        sqlx::migrate!("./migrations").run(&writer).await?;

        // Every connection to `:memory:` is a separate database.
        let reader = if in_memory {
            writer.clone()
        } else {
            SqlitePoolOptions::new()
                .max_connections(MAX_READERS)
                .connect_with(options.read_only(true))
                .await?
        };

        info!(in_memory, "Opened SQLite checkpoint store");
        Ok(Self {
            reader,
            writer,
            serde: Arc::new(JsonSerializer),
        })
    }
}

impl<S: SerializerProtocol> SqliteCheckpointSaver<S> {
    /// Replace the serializer used for checkpoints, metadata and writes
    pub fn with_serializer<S2: SerializerProtocol>(self, serde: S2) -> SqliteCheckpointSaver<S2> {
        SqliteCheckpointSaver {
            reader: self.reader,
            writer: self.writer,
            serde: Arc::new(serde),
        }
    }

    /// Close both pools, waiting for in-flight statements
    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }

    fn decode_checkpoint_row(&self, row: &SqliteRow) -> Result<CheckpointTuple> {
        let thread_id: String = row.try_get("thread_id")?;
        let checkpoint_ns: String = row.try_get("checkpoint_ns")?;
        let checkpoint_id: String = row.try_get("checkpoint_id")?;
        let parent_checkpoint_id: Option<String> = row.try_get("parent_checkpoint_id")?;
        let checkpoint: Vec<u8> = row.try_get("checkpoint")?;
        let metadata: Vec<u8> = row.try_get("metadata")?;

        let config = CheckpointConfig::for_thread(thread_id)
            .with_checkpoint_ns(checkpoint_ns)
            .with_checkpoint_id(checkpoint_id);

        let mut tuple = CheckpointTuple::new(
            config.clone(),
            self.serde.loads(&checkpoint)?,
            self.serde.loads(&metadata)?,
        );
        if let Some(parent_id) = parent_checkpoint_id {
            tuple = tuple.with_parent_config(config.at_checkpoint(parent_id));
        }
        Ok(tuple)
    }

    async fn load_writes(&self, config: &CheckpointConfig) -> Result<Vec<PendingWrite>> {
        let rows = sqlx::query(
            "SELECT task_id, channel, value FROM writes \
             WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ? \
             ORDER BY task_id, idx",
        )
        .bind(config.require_thread_id()?)
        .bind(config.namespace())
        .bind(config.checkpoint_id.as_deref())
        .fetch_all(&self.reader)
        .await?;

        rows.iter()
            .map(|row| {
                let value: Vec<u8> = row.try_get("value")?;
                Ok(PendingWrite::new(
                    row.try_get::<String, _>("task_id")?,
                    row.try_get::<String, _>("channel")?,
                    self.serde.loads(&value)?,
                ))
            })
            .collect()
    }

    async fn insert_checkpoint<'c, E>(
        executor: E,
        config: &CheckpointConfig,
        checkpoint_id: &str,
        checkpoint: Vec<u8>,
        metadata: Vec<u8>,
    ) -> Result<()>
    where
        E: sqlx::Executor<'c, Database = Sqlite>,
    {
        sqlx::query(
            "INSERT INTO checkpoints \
             (thread_id, checkpoint_ns, checkpoint_id, parent_checkpoint_id, checkpoint, metadata) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (thread_id, checkpoint_ns, checkpoint_id) DO UPDATE SET \
             parent_checkpoint_id = excluded.parent_checkpoint_id, \
             checkpoint = excluded.checkpoint, \
             metadata = excluded.metadata",
        )
        .bind(config.require_thread_id()?)
        .bind(config.namespace())
        .bind(checkpoint_id)
        .bind(config.checkpoint_id.as_deref())
        .bind(checkpoint)
        .bind(metadata)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl<S: SerializerProtocol + 'static> CheckpointSaver for SqliteCheckpointSaver<S> {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let thread_id = config.require_thread_id()?;

        let row = match &config.checkpoint_id {
            Some(checkpoint_id) => {
                sqlx::query(
                    "SELECT * FROM checkpoints \
                     WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
                )
                .bind(thread_id)
                .bind(config.namespace())
                .bind(checkpoint_id)
                .fetch_optional(&self.reader)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM checkpoints \
                     WHERE thread_id = ? AND checkpoint_ns = ? \
                     ORDER BY seq DESC LIMIT 1",
                )
                .bind(thread_id)
                .bind(config.namespace())
                .fetch_optional(&self.reader)
                .await?
            }
        };

        let Some(row) = row else {
            return Ok(None);
        };

        let tuple = self.decode_checkpoint_row(&row)?;
        let pending_writes = self.load_writes(&tuple.config).await?;
        Ok(Some(tuple.with_pending_writes(pending_writes)))
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let before_seq: Option<i64> = match before.and_then(|b| b.checkpoint_id.as_deref()) {
            Some(before_id) => {
                let mut query =
                    QueryBuilder::<Sqlite>::new("SELECT seq FROM checkpoints WHERE checkpoint_id = ");
                query.push_bind(before_id);
                if let Some(thread_id) = before.and_then(|b| b.thread_id.as_deref()) {
                    query.push(" AND thread_id = ").push_bind(thread_id);
                }
                let row = query.build().fetch_optional(&self.reader).await?;
                let row = row.ok_or_else(|| CheckpointError::NotFound(before_id.to_string()))?;
                Some(row.try_get("seq")?)
            }
            None => None,
        };

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM checkpoints WHERE 1 = 1");
        if let Some(cfg) = config {
            if let Some(thread_id) = &cfg.thread_id {
                query.push(" AND thread_id = ").push_bind(thread_id.clone());
            }
            if let Some(ns) = &cfg.checkpoint_ns {
                query.push(" AND checkpoint_ns = ").push_bind(ns.clone());
            }
            if let Some(checkpoint_id) = &cfg.checkpoint_id {
                query
                    .push(" AND checkpoint_id = ")
                    .push_bind(checkpoint_id.clone());
            }
        }
        if let Some(seq) = before_seq {
            query.push(" AND seq < ").push_bind(seq);
        }
        query.push(" ORDER BY seq DESC");

        let rows = query.build().fetch_all(&self.reader).await?;

        let mut results = Vec::new();
        for row in &rows {
            if limit.is_some_and(|lim| results.len() >= lim) {
                break;
            }
            let tuple = self.decode_checkpoint_row(row)?;
            if let Some(filter_map) = &filter {
                if !tuple.metadata.matches(filter_map) {
                    continue;
                }
            }
            let pending_writes = self.load_writes(&tuple.config).await?;
            results.push(Ok(tuple.with_pending_writes(pending_writes)));
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
        let saved = config.at_checkpoint(checkpoint.id.clone());
        let checkpoint_bytes = self.serde.dumps(&checkpoint)?;
        let metadata_bytes = self.serde.dumps(&metadata)?;

        Self::insert_checkpoint(
            &self.writer,
            config,
            &checkpoint.id,
            checkpoint_bytes,
            metadata_bytes,
        )
        .await?;

        debug!(
            thread_id = config.thread_id.as_deref().unwrap_or_default(),
            checkpoint_id = %checkpoint.id,
            "Stored checkpoint"
        );
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
        let thread_id = config.require_thread_id()?;
        let saved = config.at_checkpoint(checkpoint.id.clone());
        let checkpoint_bytes = self.serde.dumps(&checkpoint)?;
        let metadata_bytes = self.serde.dumps(&metadata)?;

        let mut tx = self.writer.begin().await?;

        let found: Option<String> = sqlx::query_scalar(
            "SELECT checkpoint_id FROM checkpoints \
             WHERE thread_id = ? AND checkpoint_ns = ? \
             ORDER BY seq DESC LIMIT 1",
        )
        .bind(thread_id)
        .bind(config.namespace())
        .fetch_optional(&mut *tx)
        .await?;

        if found.as_deref() != expected_latest {
            tx.rollback().await?;
            return Err(CheckpointError::Conflict {
                thread_id: thread_id.to_string(),
                expected: expected_latest.map(String::from),
                found,
            });
        }

        Self::insert_checkpoint(
            &mut *tx,
            config,
            &checkpoint.id,
            checkpoint_bytes,
            metadata_bytes,
        )
        .await?;
        tx.commit().await?;

        debug!(thread_id, checkpoint_id = %checkpoint.id, "Advanced thread head");
        Ok(saved)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: &str,
    ) -> Result<()> {
        let thread_id = config.require_thread_id()?;
        let checkpoint_id = config
            .checkpoint_id
            .as_deref()
            .ok_or_else(|| CheckpointError::Invalid("checkpoint_id is required".to_string()))?;

        let encoded = writes
            .into_iter()
            .enumerate()
            .map(|(position, (channel, value))| {
                let idx = write_index(&channel, position);
                Ok((idx, channel, self.serde.dumps(&value)?))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.writer.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT seq FROM checkpoints \
             WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
        )
        .bind(thread_id)
        .bind(config.namespace())
        .bind(checkpoint_id)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_none() {
            tx.rollback().await?;
            return Err(CheckpointError::NotFound(checkpoint_id.to_string()));
        }

        for (idx, channel, value) in encoded {
            let verb = if idx < 0 {
                "INSERT OR REPLACE"
            } else {
                "INSERT OR IGNORE"
            };
            sqlx::query(&format!(
                "{verb} INTO writes \
                 (thread_id, checkpoint_ns, checkpoint_id, task_id, idx, channel, value) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(thread_id)
            .bind(config.namespace())
            .bind(checkpoint_id)
            .bind(task_id)
            .bind(idx)
            .bind(channel)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_writes(&self, config: &CheckpointConfig) -> Result<()> {
        let Some(checkpoint_id) = config.checkpoint_id.as_deref() else {
            return Ok(());
        };
        sqlx::query(
            "DELETE FROM writes WHERE thread_id = ? AND checkpoint_ns = ? AND checkpoint_id = ?",
        )
        .bind(config.require_thread_id()?)
        .bind(config.namespace())
        .bind(checkpoint_id)
        .execute(&self.writer)
        .await?;
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut tx = self.writer.begin().await?;
        sqlx::query("DELETE FROM writes WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        info!(thread_id, deleted, "Deleted thread");
        Ok(())
    }
}
