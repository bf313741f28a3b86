//! Main superstep execution loop.
//!
//! [`SuperstepLoop`] owns the live state of one run: the checkpoint it
//! started from, the restored channels and the saver that receives every
//! pending write and checkpoint.
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!            │ prepare_next_tasks                        │
//!            └───────────────┬──────────────────────────┘
//!          none ◄────────────┤
//!       Completed            │ interrupt_before hit ──► Interrupted
//!                            ▼
//!            ┌──────────────────────────────────────────┐
//!            │ tick: reuse pending writes, run the rest  │
//!            │ concurrently, put_writes per finished task│
//!            └───────────────┬──────────────────────────┘
//!     failed ──► Err(TaskFailed)   interrupted ──► Interrupted
//!                            ▼
//!            ┌──────────────────────────────────────────┐
//!            │ commit: apply_writes, put_if_latest,      │
//!            │ delete folded writes                      │
//!            └───────────────┬──────────────────────────┘
//!                            │ interrupt_after hit ──► Interrupted
//!                            └──► next superstep
//! ```
//!
//! An interrupted or failed superstep writes no checkpoint. Its finished
//! tasks stay as pending writes against the current checkpoint, so the next
//! attempt re-prepares the same task ids and only runs what is missing.

use super::algo::{
    apply_writes, input_writes, node_triggers, prepare_next_tasks, routing_writes,
    should_interrupt, task_writes, update_writes, user_update,
};
use super::channel_store::ChannelStore;
use super::types::{PregelTask, TaskResult};
use super::{INPUT, INTERRUPT_SEEN};
use crate::compiled::types::{RunOutcome, RunStatus, StreamEvent, StreamMode, TaskInfo};
use crate::error::{GraphError, NodeError, Result};
use crate::graph::{Graph, START};
use crate::interrupt::{Interrupt, NodeContext};
use crate::store::Store;
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use superstep_checkpoint::checkpoint::{ERROR, INTERRUPT, NO_WRITES, RESUME};
use superstep_checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
    ChannelVersions, PendingWrite,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Per-run limits and breakpoints
#[derive(Debug, Clone)]
pub(crate) struct RunSettings {
    pub recursion_limit: usize,
    pub max_concurrency: Option<usize>,
    pub interrupt_before: Vec<String>,
    pub interrupt_after: Vec<String>,
}

/// Forwards run events to a stream consumer
#[derive(Clone)]
pub(crate) struct EventSink {
    pub tx: mpsc::Sender<Result<StreamEvent>>,
    pub modes: Vec<StreamMode>,
}

impl EventSink {
    async fn emit(&self, event: StreamEvent) {
        if !self.modes.contains(&event.mode()) {
            return;
        }
        if self.tx.send(Ok(event)).await.is_err() {
            debug!("Stream consumer dropped, event discarded");
        }
    }
}

/// What the pending writes of a checkpoint say about one task
#[derive(Debug, Default, Clone)]
pub(crate) struct TaskRecord {
    /// Regular writes, in the order the task produced them
    pub writes: Vec<(String, Value)>,
    /// The task finished; `writes` is its full output
    pub completed: bool,
    pub interrupts: Vec<Interrupt>,
    pub error: Option<String>,
    pub resume: Vec<Value>,
}

impl TaskRecord {
    /// Interrupts that no recorded resume value answers yet, in call order
    pub fn unanswered(&self) -> Vec<Interrupt> {
        let mut interrupts: Vec<Interrupt> = self
            .interrupts
            .iter()
            .filter(|i| i.index >= self.resume.len())
            .cloned()
            .collect();
        interrupts.sort_by_key(|i| i.index);
        interrupts
    }
}

/// Group pending writes by task id
pub(crate) fn task_records(pending: &[PendingWrite]) -> Result<HashMap<String, TaskRecord>> {
    let mut records: HashMap<String, TaskRecord> = HashMap::new();
    for write in pending {
        let record = records.entry(write.task_id.clone()).or_default();
        match write.channel.as_str() {
            INTERRUPT => {
                record.interrupts = serde_json::from_value(write.value.clone())?;
            }
            RESUME => {
                record.resume = match &write.value {
                    Value::Array(values) => values.clone(),
                    other => vec![other.clone()],
                };
            }
            ERROR => {
                record.error = Some(
                    write.value["message"]
                        .as_str()
                        .map(String::from)
                        .unwrap_or_else(|| write.value.to_string()),
                );
            }
            NO_WRITES => record.completed = true,
            channel => {
                record.completed = true;
                record.writes.push((channel.to_string(), write.value.clone()));
            }
        }
    }
    Ok(records)
}

/// Interrupts still waiting for resume values, in task-path then call order
pub(crate) fn pending_interrupts(
    tasks: &[PregelTask],
    records: &HashMap<String, TaskRecord>,
) -> Vec<Interrupt> {
    tasks
        .iter()
        .filter_map(|task| records.get(&task.id))
        .filter(|record| !record.completed)
        .flat_map(TaskRecord::unanswered)
        .collect()
}

enum StepOutcome {
    Completed(Vec<Vec<(String, Value)>>),
    Interrupted(Vec<Interrupt>),
}

/// Shared handles a loop needs from its compiled graph
#[derive(Clone)]
pub(crate) struct LoopContext {
    pub graph: Arc<Graph>,
    pub saver: Arc<dyn CheckpointSaver>,
    pub store: Option<Arc<dyn Store>>,
    pub settings: RunSettings,
    pub events: Option<EventSink>,
}

/// The superstep execution loop of a single run
pub(crate) struct SuperstepLoop {
    ctx: LoopContext,
    run_id: String,
    /// Thread and namespace, without a checkpoint id
    thread: CheckpointConfig,
    /// Working copy of the current checkpoint; `versions_seen` is updated in place
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    /// Address of `checkpoint`, `None` until the thread has one
    checkpoint_config: Option<CheckpointConfig>,
    step: i64,
    channels: ChannelStore,
    pending_writes: Vec<PendingWrite>,
    /// Thread head the run expects when it saves
    head: Option<String>,
}

impl SuperstepLoop {
    /// Load the checkpoint addressed by `config`, or the thread head
    pub async fn load(ctx: LoopContext, config: &CheckpointConfig) -> Result<Self> {
        let thread = config.latest();
        let latest = ctx.saver.get_tuple(&thread).await?;
        let head = latest.as_ref().map(|tuple| tuple.checkpoint.id.clone());

        let target = match &config.checkpoint_id {
            Some(checkpoint_id) => Some(
                ctx.saver
                    .get_tuple(config)
                    .await?
                    .ok_or_else(|| GraphError::CheckpointNotFound(checkpoint_id.clone()))?,
            ),
            None => latest,
        };

        let run_id = uuid::Uuid::new_v4().to_string();
        let loaded = match target {
            Some(tuple) => {
                debug!(
                    checkpoint_id = %tuple.checkpoint.id,
                    step = tuple.step(),
                    pending = tuple.pending_writes.len(),
                    "Loaded checkpoint"
                );
                Self {
                    channels: ChannelStore::from_checkpoint(&ctx.graph, &tuple.checkpoint)?,
                    step: tuple.step(),
                    checkpoint_config: Some(tuple.config),
                    checkpoint: tuple.checkpoint,
                    metadata: tuple.metadata,
                    pending_writes: tuple.pending_writes,
                    ctx,
                    run_id,
                    thread,
                    head,
                }
            }
            None => Self {
                channels: ChannelStore::new(&ctx.graph),
                checkpoint: Checkpoint::empty(),
                metadata: CheckpointMetadata::new(),
                checkpoint_config: None,
                step: -1,
                pending_writes: Vec::new(),
                ctx,
                run_id,
                thread,
                head,
            },
        };
        Ok(loaded)
    }

    /// Fail unless the run starts from an existing checkpoint
    pub fn require_checkpoint(&self) -> Result<()> {
        if self.checkpoint_config.is_none() {
            return Err(GraphError::Configuration(format!(
                "Thread '{}' has no checkpoint to continue from; invoke it with input first",
                self.thread.thread_id.as_deref().unwrap_or_default()
            )));
        }
        Ok(())
    }

    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint_config.is_some()
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Metadata of the loaded checkpoint, empty for a new thread
    pub fn metadata(&self) -> &CheckpointMetadata {
        &self.metadata
    }

    fn thread_id(&self) -> &str {
        self.thread.thread_id.as_deref().unwrap_or_default()
    }

    fn prepare(&self) -> Result<Vec<PregelTask>> {
        prepare_next_tasks(
            &self.ctx.graph,
            &self.channels,
            &self.checkpoint.versions_seen,
            &self.checkpoint.id,
            self.thread.namespace(),
            self.step,
        )
    }

    /// Treat every pending breakpoint as already handled
    pub fn mark_interrupt_seen(&mut self) {
        self.checkpoint
            .versions_seen
            .insert(INTERRUPT_SEEN.to_string(), self.channels.versions().clone());
    }

    /// Start a new run: drop unfinished work, then save an input checkpoint
    pub async fn apply_input(&mut self, input: Value) -> Result<()> {
        if !input.is_object() {
            return Err(GraphError::InvalidUpdate(
                "Input must be an object of channel values".to_string(),
            ));
        }

        if self.checkpoint_config.is_some() {
            let tasks = self.prepare()?;
            if !tasks.is_empty() {
                debug!(discarded = tasks.len(), "Discarding unfinished tasks before new input");
            }
            let empty = vec![Vec::new(); tasks.len()];
            apply_writes(
                &mut self.channels,
                &mut self.checkpoint.versions_seen,
                &tasks,
                empty,
            )?;
        }

        let changed = self.channels.update(vec![(INPUT.to_string(), input.clone())])?;
        self.channels.bump(&changed);
        let step = if self.checkpoint_config.is_some() {
            self.step + 1
        } else {
            -1
        };
        self.save(CheckpointSource::Input, step, json!({ INPUT: input }), changed)
            .await
    }

    /// Save `values` as a child checkpoint, as if `as_node` had written them.
    ///
    /// `as_node` is marked as having seen its triggers, and its outgoing
    /// edges fire, so the nodes after it run next.
    pub async fn apply_update(&mut self, as_node: &str, values: Value) -> Result<CheckpointConfig> {
        let mut writes = update_writes(as_node, values.clone())?;
        let routing = routing_writes(&self.ctx.graph, &self.channels, as_node, &writes, &[], &[])?;

        let seen = self
            .checkpoint
            .versions_seen
            .entry(as_node.to_string())
            .or_default();
        for trigger in node_triggers(&self.ctx.graph, as_node) {
            let version = self.channels.version(&trigger);
            seen.insert(trigger, version);
        }

        writes.extend(routing);
        let changed = self.channels.update(writes)?;
        self.channels.bump(&changed);
        let step = if self.checkpoint_config.is_some() {
            self.step + 1
        } else {
            -1
        };
        self.save(CheckpointSource::Update, step, json!({ as_node: values }), changed)
            .await?;
        self.current_config()
    }

    /// Record resume values against the pending interrupts, by position
    pub async fn record_resume(&mut self, values: Vec<Value>) -> Result<()> {
        let tasks = self.prepare()?;
        let records = task_records(&self.pending_writes)?;
        let expected = pending_interrupts(&tasks, &records).len();
        if expected != values.len() {
            return Err(GraphError::AmbiguousResume {
                expected,
                supplied: values.len(),
            });
        }
        let Some(config) = self.checkpoint_config.clone() else {
            return Ok(());
        };

        let mut values = values.into_iter();
        for task in &tasks {
            let Some(record) = records.get(&task.id).filter(|r| !r.completed) else {
                continue;
            };
            let unanswered = record.unanswered().len();
            if unanswered == 0 {
                continue;
            }
            let mut resume = record.resume.clone();
            resume.extend(values.by_ref().take(unanswered));
            let resume = Value::Array(resume);

            self.ctx
                .saver
                .put_writes(&config, vec![(RESUME.to_string(), resume.clone())], &task.id)
                .await?;
            self.pending_writes
                .retain(|w| !(w.task_id == task.id && w.channel == RESUME));
            self.pending_writes
                .push(PendingWrite::new(task.id.clone(), RESUME, resume));
            debug!(task_id = %task.id, node = %task.name, "Recorded resume values");
        }
        Ok(())
    }

    /// Run supersteps until the graph completes or pauses
    pub async fn run(mut self) -> Result<RunOutcome> {
        let limit = self.ctx.settings.recursion_limit;
        let mut supersteps = 0usize;

        loop {
            let tasks = self.prepare()?;
            if tasks.is_empty() {
                info!(thread_id = %self.thread_id(), step = self.step, "Run completed");
                return Ok(self.outcome(RunStatus::Completed, Vec::new()));
            }
            if supersteps >= limit {
                warn!(thread_id = %self.thread_id(), limit, "Recursion limit reached");
                return Err(GraphError::RecursionLimit { limit });
            }

            let before = should_interrupt(
                &self.channels,
                &self.checkpoint.versions_seen,
                &self.ctx.settings.interrupt_before,
                &tasks,
            );
            if !before.is_empty() {
                let interrupts = before
                    .into_iter()
                    .map(|task| Interrupt::before(&task.id, &task.name))
                    .collect();
                return Ok(self.interrupted(interrupts).await);
            }

            match self.tick(&tasks).await? {
                StepOutcome::Interrupted(interrupts) => {
                    return Ok(self.interrupted(interrupts).await);
                }
                StepOutcome::Completed(writes) => self.commit(&tasks, writes).await?,
            }
            supersteps += 1;

            let mut after_nodes = BTreeSet::new();
            let after: Vec<Interrupt> = tasks
                .iter()
                .filter(|task| self.ctx.settings.interrupt_after.contains(&task.name))
                .filter(|task| after_nodes.insert(task.name.clone()))
                .map(|task| Interrupt::after(&task.id, &task.name))
                .collect();
            if !after.is_empty() {
                self.mark_interrupt_seen();
                return Ok(self.interrupted(after).await);
            }
        }
    }

    /// Run one superstep's tasks, recording each result as it arrives
    async fn tick(&mut self, tasks: &[PregelTask]) -> Result<StepOutcome> {
        let config = self.current_config()?;
        let mut records = task_records(&self.pending_writes)?;
        let mut results: Vec<Option<TaskResult>> = tasks.iter().map(|_| None).collect();

        for (index, task) in tasks.iter().enumerate() {
            if let Some(record) = records.get(&task.id).filter(|r| r.completed) {
                debug!(task_id = %task.id, node = %task.name, "Reusing pending writes");
                results[index] = Some(TaskResult::Completed(record.writes.clone()));
            }
        }

        for (index, task) in tasks.iter().enumerate() {
            if results[index].is_some() || task.name != START {
                continue;
            }
            let result = match input_writes(&self.ctx.graph, &self.channels, &task.input) {
                Ok(writes) => TaskResult::Completed(writes),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => TaskResult::Failed(err),
            };
            self.record(&config, task, &result).await?;
            results[index] = Some(result);
        }

        let mut runs = Vec::new();
        for (index, task) in tasks.iter().enumerate() {
            if results[index].is_some() {
                continue;
            }
            let Some(node) = self.ctx.graph.nodes.get(&task.name).cloned() else {
                return Err(GraphError::InvalidUpdate(format!(
                    "Task for unknown node '{}'",
                    task.name
                )));
            };
            let resume = records
                .remove(&task.id)
                .map(|record| record.resume)
                .unwrap_or_default();
            let node_ctx = NodeContext::new(
                task.id.clone(),
                task.name.clone(),
                self.step,
                config.clone(),
                self.ctx.store.clone(),
                resume,
            );
            let input = task.input.clone();
            debug!(task_id = %task.id, node = %task.name, step = self.step, "Starting task");
            runs.push(async move {
                let output = node(input, node_ctx.clone()).await;
                (index, node_ctx, output)
            });
        }

        let concurrency = self
            .ctx
            .settings
            .max_concurrency
            .unwrap_or(runs.len())
            .max(1);
        // A fatal task error still lets in-flight siblings finish and be recorded
        let mut fatal: Option<GraphError> = None;
        let mut running = stream::iter(runs).buffer_unordered(concurrency);
        while let Some((index, node_ctx, output)) = running.next().await {
            let task = &tasks[index];
            let result = match output {
                Ok(output) => {
                    let (supplied, consumed) = node_ctx.resume_usage();
                    if consumed < supplied {
                        warn!(task_id = %task.id, node = %task.name, supplied, consumed, "Interrupt sequence changed on resume");
                        fatal.get_or_insert(GraphError::NonDeterministicInterrupt {
                            node: task.name.clone(),
                            task_id: task.id.clone(),
                            supplied,
                            consumed,
                        });
                        continue;
                    }
                    match task_writes(&self.ctx.graph, &self.channels, task, output) {
                        Ok(writes) => TaskResult::Completed(writes),
                        Err(err) if err.is_fatal() => {
                            fatal.get_or_insert(err);
                            continue;
                        }
                        Err(err) => TaskResult::Failed(err),
                    }
                }
                Err(NodeError::Interrupted(interrupts)) => TaskResult::Interrupted(interrupts),
                Err(NodeError::Failed(err)) if err.is_fatal() => {
                    fatal.get_or_insert(err);
                    continue;
                }
                Err(NodeError::Failed(err)) => TaskResult::Failed(err),
            };
            self.record(&config, task, &result).await?;
            results[index] = Some(result);
        }
        drop(running);
        if let Some(err) = fatal {
            return Err(err);
        }

        let mut completed = Vec::with_capacity(tasks.len());
        let mut interrupts = Vec::new();
        let mut failure = None;
        for (task, result) in tasks.iter().zip(results) {
            match result {
                Some(TaskResult::Completed(writes)) => completed.push(writes),
                Some(TaskResult::Interrupted(raised)) => interrupts.extend(raised),
                Some(TaskResult::Failed(err)) => {
                    failure.get_or_insert_with(|| {
                        GraphError::task_failed(&task.name, &task.id, err.to_string())
                    });
                }
                None => {
                    failure.get_or_insert_with(|| {
                        GraphError::task_failed(&task.name, &task.id, "task did not run")
                    });
                }
            }
        }

        if let Some(err) = failure {
            warn!(thread_id = %self.thread_id(), step = self.step, error = %err, "Superstep failed");
            return Err(err);
        }
        if !interrupts.is_empty() {
            return Ok(StepOutcome::Interrupted(interrupts));
        }
        Ok(StepOutcome::Completed(completed))
    }

    /// Persist one task's result as pending writes
    async fn record(
        &self,
        config: &CheckpointConfig,
        task: &PregelTask,
        result: &TaskResult,
    ) -> Result<()> {
        let (writes, info) = match result {
            TaskResult::Completed(writes) if writes.is_empty() => (
                vec![(NO_WRITES.to_string(), Value::Null)],
                TaskInfo::finished(task, user_update(writes)),
            ),
            TaskResult::Completed(writes) => (writes.clone(), TaskInfo::finished(task, user_update(writes))),
            TaskResult::Interrupted(interrupts) => (
                vec![(INTERRUPT.to_string(), serde_json::to_value(interrupts)?)],
                TaskInfo::interrupted(task, interrupts.clone()),
            ),
            TaskResult::Failed(err) => (
                vec![(ERROR.to_string(), json!({ "message": err.to_string() }))],
                TaskInfo::failed(task, err.to_string()),
            ),
        };

        self.ctx
            .saver
            .put_writes(config, writes, &task.id)
            .await?;
        debug!(task_id = %task.id, node = %task.name, "Recorded task result");

        if let Some(events) = &self.ctx.events {
            events
                .emit(StreamEvent::Task {
                    step: self.step + 1,
                    task: info,
                })
                .await;
        }
        Ok(())
    }

    /// Fold a completed superstep into the next checkpoint
    async fn commit(&mut self, tasks: &[PregelTask], writes: Vec<Vec<(String, Value)>>) -> Result<()> {
        let mut by_node: Vec<(String, Vec<Value>)> = Vec::new();
        for (task, task_writes) in tasks.iter().zip(&writes) {
            let update = if task.name == START {
                task.input.clone()
            } else {
                user_update(task_writes)
            };
            match by_node.iter_mut().find(|(node, _)| node == &task.name) {
                Some((_, updates)) => updates.push(update),
                None => by_node.push((task.name.clone(), vec![update])),
            }
        }
        let updates: Vec<(String, Value)> = by_node
            .into_iter()
            .map(|(node, mut updates)| {
                let update = if updates.len() == 1 {
                    updates.remove(0)
                } else {
                    Value::Array(updates)
                };
                (node, update)
            })
            .collect();
        let metadata_writes: Map<String, Value> = updates.iter().cloned().collect();

        let parent = self.current_config()?;
        let changed = apply_writes(
            &mut self.channels,
            &mut self.checkpoint.versions_seen,
            tasks,
            writes,
        )?;
        self.save(
            CheckpointSource::Loop,
            self.step + 1,
            Value::Object(metadata_writes),
            changed,
        )
        .await?;
        self.ctx.saver.delete_writes(&parent).await?;

        if let Some(events) = &self.ctx.events {
            for (node, update) in updates {
                events
                    .emit(StreamEvent::Updates {
                        step: self.step,
                        node,
                        update,
                    })
                    .await;
            }
        }
        Ok(())
    }

    /// Save the current channels as a child of the current checkpoint
    async fn save(
        &mut self,
        source: CheckpointSource,
        step: i64,
        writes: Value,
        changed: BTreeSet<String>,
    ) -> Result<()> {
        let mut checkpoint = self.checkpoint.successor();
        checkpoint.channel_values = self.channels.values();
        checkpoint.channel_versions = self.channels.versions().clone();
        checkpoint.updated_channels = Some(changed.iter().cloned().collect());

        let new_versions: ChannelVersions = changed
            .iter()
            .map(|channel| (channel.clone(), self.channels.version(channel)))
            .collect();
        let metadata = CheckpointMetadata::new()
            .with_source(source)
            .with_step(step)
            .with_parents(HashMap::new())
            .with_writes(writes)
            .with_run_id(self.run_id.clone());

        let parent = self
            .checkpoint_config
            .clone()
            .unwrap_or_else(|| self.thread.clone());
        let saved = self
            .ctx
            .saver
            .put_if_latest(
                &parent,
                checkpoint.clone(),
                metadata.clone(),
                new_versions,
                self.head.as_deref(),
            )
            .await?;

        info!(
            thread_id = %self.thread_id(),
            checkpoint_id = %checkpoint.id,
            step,
            source = ?source,
            "Saved checkpoint"
        );

        self.head = Some(checkpoint.id.clone());
        self.checkpoint = checkpoint;
        self.metadata = metadata.clone();
        self.checkpoint_config = Some(saved.clone());
        self.step = step;
        self.pending_writes.clear();

        if let Some(events) = self.ctx.events.clone() {
            let next = self
                .prepare()?
                .into_iter()
                .map(|task| task.name)
                .collect();
            events
                .emit(StreamEvent::Checkpoint {
                    config: saved,
                    metadata,
                    values: self.channels.state(),
                    next,
                })
                .await;
            events
                .emit(StreamEvent::Values {
                    step,
                    values: self.channels.state(),
                })
                .await;
        }
        Ok(())
    }

    fn current_config(&self) -> Result<CheckpointConfig> {
        self.checkpoint_config.clone().ok_or_else(|| {
            GraphError::Configuration("Run has no checkpoint to record writes against".to_string())
        })
    }

    async fn interrupted(self, interrupts: Vec<Interrupt>) -> RunOutcome {
        info!(
            thread_id = %self.thread_id(),
            step = self.step,
            interrupts = interrupts.len(),
            "Run interrupted"
        );
        if let Some(events) = &self.ctx.events {
            events
                .emit(StreamEvent::Interrupt {
                    interrupts: interrupts.clone(),
                })
                .await;
        }
        self.outcome(RunStatus::Interrupted, interrupts)
    }

    fn outcome(&self, status: RunStatus, interrupts: Vec<Interrupt>) -> RunOutcome {
        RunOutcome {
            status,
            values: self.channels.state(),
            interrupts,
            config: self
                .checkpoint_config
                .clone()
                .unwrap_or_else(|| self.thread.clone()),
        }
    }
}
