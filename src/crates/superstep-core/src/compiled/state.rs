//! State management methods (get_state, update_state, etc.)
//!
//! This module contains methods for inspecting and modifying thread state.

use super::{CompiledGraph, StateSnapshot, StateSnapshotStream, TaskInfo};
use crate::error::{GraphError, Result};
use crate::graph::{Graph, START};
use crate::pregel::algo::{prepare_next_tasks, user_update};
use crate::pregel::channel_store::ChannelStore;
use crate::pregel::loop_impl::{pending_interrupts, task_records, LoopContext, SuperstepLoop};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use superstep_checkpoint::{
    ChannelVersion, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver,
    CheckpointTuple,
};
use tracing::info;

impl CompiledGraph {
    fn saver(&self) -> Result<&Arc<dyn CheckpointSaver>> {
        self.checkpointer.as_ref().ok_or_else(|| {
            GraphError::Configuration("Thread state requires a checkpointer".to_string())
        })
    }

    /// State at the checkpoint `config` addresses, or at the thread head.
    ///
    /// A thread without checkpoints yields an empty snapshot.
    ///
    /// # Errors
    ///
    /// [`GraphError::CheckpointNotFound`] when `config` names a checkpoint id
    /// the thread does not have.
    pub async fn get_state(&self, config: &CheckpointConfig) -> Result<StateSnapshot> {
        let saver = self.saver()?;
        config.require_thread_id()?;
        match saver.get_tuple(config).await? {
            Some(tuple) => snapshot(&self.graph, tuple),
            None => match &config.checkpoint_id {
                Some(checkpoint_id) => Err(GraphError::CheckpointNotFound(checkpoint_id.clone())),
                None => Ok(StateSnapshot::empty(config.clone())),
            },
        }
    }

    /// Snapshots of a thread, newest first.
    ///
    /// `filter` matches checkpoint metadata, `before` excludes the given
    /// checkpoint and everything newer.
    pub async fn get_state_history(
        &self,
        config: &CheckpointConfig,
        filter: Option<HashMap<String, Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<StateSnapshotStream> {
        let saver = self.saver()?;
        config.require_thread_id()?;
        let graph = self.graph.clone();
        let tuples = saver.list(Some(config), filter, before, limit).await?;
        let snapshots = tuples.map(move |result| {
            result
                .map_err(GraphError::from)
                .and_then(|tuple| snapshot(&graph, tuple))
        });
        Ok(Box::pin(snapshots))
    }

    /// Write `values` as a new checkpoint, as if `as_node` had produced them.
    ///
    /// The new checkpoint is a child of the checkpoint `config` addresses (the
    /// thread head without an id). Overwrite channels take the given values,
    /// accumulate channels merge them. Nodes downstream of `as_node` run on
    /// the next `invoke(None, ..)`.
    ///
    /// Without `as_node`, the node that wrote the addressed checkpoint is
    /// used: [`GraphError::InvalidUpdate`] when several nodes wrote it, or
    /// when several nodes ran last with no single most recent one.
    ///
    /// Returns the address of the new checkpoint.
    #[tracing::instrument(skip(self, config, values), fields(thread_id = ?config.thread_id))]
    pub async fn update_state(
        &self,
        config: &CheckpointConfig,
        values: Value,
        as_node: Option<&str>,
    ) -> Result<CheckpointConfig> {
        let saver = self.saver()?.clone();
        config.require_thread_id()?;
        let ctx = LoopContext {
            graph: self.graph.clone(),
            saver,
            store: self.store.clone(),
            settings: self.run_settings(),
            events: None,
        };
        let mut run = SuperstepLoop::load(ctx, config).await?;

        let as_node = match as_node {
            Some(node) if node == START || self.graph.is_node(node) => node.to_string(),
            Some(node) => {
                return Err(GraphError::InvalidUpdate(format!(
                    "Cannot update state as unknown node '{}'",
                    node
                )))
            }
            None => last_writer(&self.graph, run.checkpoint(), run.metadata())?,
        };

        let saved = run.apply_update(&as_node, values).await?;
        info!(as_node = %as_node, checkpoint_id = ?saved.checkpoint_id, "Updated state");
        Ok(saved)
    }

    /// Delete every checkpoint and pending write of a thread, in all namespaces
    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.saver()?.delete_thread(thread_id).await?;
        info!(%thread_id, "Deleted thread");
        Ok(())
    }
}

/// Node whose writes produced `checkpoint`
fn last_writer(graph: &Graph, checkpoint: &Checkpoint, metadata: &CheckpointMetadata) -> Result<String> {
    if let Some(Value::Object(writes)) = &metadata.writes {
        let writers: Vec<&String> = writes
            .iter()
            .filter(|(_, update)| !update.is_null())
            .map(|(node, _)| node)
            .collect();
        match writers.as_slice() {
            [node] => return Ok((*node).clone()),
            [] => {}
            _ => {
                return Err(GraphError::InvalidUpdate(
                    "Ambiguous update, specify as_node".to_string(),
                ))
            }
        }
    }

    let mut latest: Vec<(ChannelVersion, &str)> = checkpoint
        .versions_seen
        .iter()
        .filter(|(node, _)| graph.is_node(node))
        .filter_map(|(node, seen)| seen.values().max().map(|v| (*v, node.as_str())))
        .collect();
    latest.sort();
    match latest.as_slice() {
        [] => Ok(START.to_string()),
        [.., (a, _), (b, node)] if a == b => Err(GraphError::InvalidUpdate(format!(
            "Ambiguous update, specify as_node ('{}' and others ran last)",
            node
        ))),
        [.., (_, node)] => Ok((*node).to_string()),
    }
}

/// Build the snapshot of one stored checkpoint
fn snapshot(graph: &Graph, tuple: CheckpointTuple) -> Result<StateSnapshot> {
    let channels = ChannelStore::from_checkpoint(graph, &tuple.checkpoint)?;
    let tasks = prepare_next_tasks(
        graph,
        &channels,
        &tuple.checkpoint.versions_seen,
        &tuple.checkpoint.id,
        tuple.config.namespace(),
        tuple.step(),
    )?;
    let records = task_records(&tuple.pending_writes)?;
    let interrupts = pending_interrupts(&tasks, &records);

    let infos = tasks
        .iter()
        .map(|task| match records.get(&task.id) {
            Some(record) if record.completed => TaskInfo::finished(task, user_update(&record.writes)),
            Some(record) if record.error.is_some() => {
                TaskInfo::failed(task, record.error.clone().unwrap_or_default())
            }
            Some(record) if !record.unanswered().is_empty() => {
                TaskInfo::interrupted(task, record.unanswered())
            }
            _ => TaskInfo::pending(task),
        })
        .collect();

    Ok(StateSnapshot {
        values: channels.state(),
        next: tasks.iter().map(|task| task.name.clone()).collect(),
        tasks: infos,
        interrupts,
        created_at: Some(tuple.checkpoint.ts),
        config: tuple.config,
        metadata: Some(tuple.metadata),
        parent_config: tuple.parent_config,
    })
}
