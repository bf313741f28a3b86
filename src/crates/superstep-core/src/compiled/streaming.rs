//! Streaming execution

use super::execution::RunInput;
use super::{CompiledGraph, EventStream, StreamMode};
use crate::pregel::loop_impl::EventSink;
use serde_json::Value;
use superstep_checkpoint::CheckpointConfig;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Buffered events before a slow consumer applies backpressure
const STREAM_BUFFER: usize = 100;

impl CompiledGraph {
    /// Run like [`invoke`](Self::invoke) and observe it as a stream.
    ///
    /// Only events selected by `modes` are yielded. A run error is the last
    /// item of the stream. Dropping the stream does not cancel the run; its
    /// checkpoints are saved either way.
    pub fn stream(
        &self,
        input: Option<Value>,
        config: CheckpointConfig,
        modes: Vec<StreamMode>,
    ) -> EventStream {
        let input = match input {
            Some(value) => RunInput::Fresh(value),
            None => RunInput::Continue,
        };
        self.spawn_stream(input, config, modes)
    }

    /// Resume pending interrupts and observe the rest of the run as a stream
    pub fn stream_resume(
        &self,
        config: CheckpointConfig,
        values: Vec<Value>,
        modes: Vec<StreamMode>,
    ) -> EventStream {
        self.spawn_stream(RunInput::Resume(values), config, modes)
    }

    fn spawn_stream(
        &self,
        input: RunInput,
        config: CheckpointConfig,
        modes: Vec<StreamMode>,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let sink = EventSink {
            tx: tx.clone(),
            modes,
        };
        let graph = self.clone();

        tokio::spawn(async move {
            if let Err(err) = graph.execute(input, &config, Some(sink)).await {
                if tx.send(Err(err)).await.is_err() {
                    debug!("Stream consumer dropped before the run error");
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}
