//! Run entry points: invoke and resume

use super::{CompiledGraph, RunOutcome};
use crate::error::{GraphError, Result};
use crate::pregel::loop_impl::{EventSink, LoopContext, RunSettings, SuperstepLoop};
use serde_json::Value;
use std::sync::Arc;
use superstep_checkpoint::{CheckpointConfig, CheckpointSaver, InMemoryCheckpointSaver};
use tracing::{debug, error, info};

/// What a run starts with
#[derive(Debug, Clone)]
pub(crate) enum RunInput {
    /// New input written on top of the loaded checkpoint
    Fresh(Value),
    /// Run the loaded checkpoint's pending tasks
    Continue,
    /// Answer pending interrupts by position, then continue
    Resume(Vec<Value>),
}

impl CompiledGraph {
    /// Run the graph until it completes or pauses.
    ///
    /// With `input`, the input is saved as a new checkpoint on top of the
    /// checkpoint `config` addresses (the thread head when no checkpoint id is
    /// given) and execution starts from it. Without input, the addressed
    /// checkpoint's pending tasks run, which continues past a static
    /// breakpoint.
    ///
    /// A `checkpoint_id` in `config` forks: every checkpoint the run saves is a
    /// descendant of the addressed one and the original lineage is untouched.
    ///
    /// Without a checkpointer the run uses a throwaway in-memory saver and
    /// only `input` runs are possible.
    ///
    /// # Errors
    ///
    /// - [`GraphError::CheckpointNotFound`] for an unknown `checkpoint_id`
    /// - [`GraphError::TaskFailed`] when a node fails; finished siblings stay recorded
    /// - [`GraphError::Checkpoint`] with a conflict when another run advanced the thread
    /// - [`GraphError::RecursionLimit`] when the run exceeds its superstep budget
    #[tracing::instrument(skip(self, input, config), fields(thread_id = ?config.thread_id, checkpoint_id = ?config.checkpoint_id))]
    pub async fn invoke(&self, input: Option<Value>, config: &CheckpointConfig) -> Result<RunOutcome> {
        let input = match input {
            Some(value) => RunInput::Fresh(value),
            None => RunInput::Continue,
        };
        self.execute(input, config, None).await
    }

    /// Resume interrupted tasks with one value per pending interrupt.
    ///
    /// Values are matched to interrupts by position, in the order
    /// [`RunOutcome::interrupts`] and [`StateSnapshot::interrupts`](super::StateSnapshot)
    /// list them. Completed sibling tasks are not run again.
    ///
    /// # Errors
    ///
    /// [`GraphError::AmbiguousResume`] when the number of values differs from
    /// the number of pending interrupts; nothing is recorded in that case.
    #[tracing::instrument(skip(self, values, config), fields(thread_id = ?config.thread_id, values = values.len()))]
    pub async fn resume(&self, config: &CheckpointConfig, values: Vec<Value>) -> Result<RunOutcome> {
        self.execute(RunInput::Resume(values), config, None).await
    }

    pub(crate) fn run_settings(&self) -> RunSettings {
        RunSettings {
            recursion_limit: self.config.recursion_limit,
            max_concurrency: self.config.max_concurrency,
            interrupt_before: self.config.interrupt_before.clone(),
            interrupt_after: self.config.interrupt_after.clone(),
        }
    }

    /// Saver and thread config a run uses
    fn run_target(
        &self,
        input: &RunInput,
        config: &CheckpointConfig,
    ) -> Result<(Arc<dyn CheckpointSaver>, CheckpointConfig)> {
        match &self.checkpointer {
            Some(saver) => {
                config.require_thread_id()?;
                Ok((saver.clone(), config.clone()))
            }
            None => {
                if !matches!(input, RunInput::Fresh(_)) {
                    return Err(GraphError::Configuration(
                        "Continuing or resuming a run requires a checkpointer".to_string(),
                    ));
                }
                let thread_id = config
                    .thread_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                debug!(%thread_id, "No checkpointer configured, using an in-memory saver");
                let saver: Arc<dyn CheckpointSaver> = Arc::new(InMemoryCheckpointSaver::new());
                Ok((saver, config.clone().with_thread_id(thread_id)))
            }
        }
    }

    pub(crate) async fn execute(
        &self,
        input: RunInput,
        config: &CheckpointConfig,
        events: Option<EventSink>,
    ) -> Result<RunOutcome> {
        self.config.validate()?;
        let (saver, config) = self.run_target(&input, config)?;
        let ctx = LoopContext {
            graph: self.graph.clone(),
            saver,
            store: self.store.clone(),
            settings: self.run_settings(),
            events,
        };

        let mut run = SuperstepLoop::load(ctx, &config).await?;
        match input {
            RunInput::Fresh(value) => run.apply_input(value).await?,
            RunInput::Continue => {
                run.require_checkpoint()?;
                run.mark_interrupt_seen();
            }
            RunInput::Resume(values) => {
                run.require_checkpoint()?;
                run.record_resume(values).await?;
                run.mark_interrupt_seen();
            }
        }

        info!(nodes = self.graph.nodes.len(), "Running graph");
        let outcome = run.run().await.map_err(|err| {
            error!(error = %err, "Graph execution failed");
            err
        })?;
        info!(status = ?outcome.status, "Graph execution finished");
        Ok(outcome)
    }
}
