//! End-to-end superstep execution tests
//!
//! These tests run complete graphs against real savers and check the
//! checkpoints they leave behind.

use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use superstep_checkpoint::{CheckpointConfig, CheckpointError, CheckpointSource, InMemoryCheckpointSaver};
use superstep_core::{
    ChannelPolicy, GraphError, InMemoryStore, NodeError, NodeOutput, Route, RunStatus, Send,
    StateGraph, StateSnapshot, Store, StreamEvent, StreamMode, END, START,
};
use tokio::sync::Notify;

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

/// `a` then `b`, each writing `foo` and appending to `bar`
fn foo_bar_graph(calls: Arc<AtomicUsize>) -> StateGraph {
    let mut graph = StateGraph::new();
    let calls_a = calls.clone();
    let calls_b = calls;
    graph
        .add_channel("foo", ChannelPolicy::Overwrite)
        .add_channel("bar", ChannelPolicy::append())
        .add_node("a", move |_state, _ctx| {
            calls_a.fetch_add(1, Ordering::SeqCst);
            async move { Ok(NodeOutput::update(json!({"foo": "a", "bar": ["a"]}))) }
        })
        .add_node("b", move |_state, _ctx| {
            calls_b.fetch_add(1, Ordering::SeqCst);
            async move { Ok(NodeOutput::update(json!({"foo": "b", "bar": ["b"]}))) }
        })
        .add_edge(START, "a")
        .add_edge("a", "b")
        .add_edge("b", END);
    graph
}

async fn history(app: &superstep_core::CompiledGraph, thread: &str) -> Vec<StateSnapshot> {
    app.get_state_history(&CheckpointConfig::for_thread(thread), None, None, None)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_two_step_run_checkpoints() {
    let app = foo_bar_graph(counter())
        .compile()
        .unwrap()
        .with_checkpointer(InMemoryCheckpointSaver::new());
    let config = CheckpointConfig::for_thread("t1");

    let outcome = app.invoke(Some(json!({})), &config).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.values, json!({"foo": "b", "bar": ["a", "b"]}));

    let snapshots = history(&app, "t1").await;
    let steps: Vec<i64> = snapshots.iter().filter_map(|s| s.step()).collect();
    assert_eq!(steps, vec![2, 1, 0, -1]);
    assert_eq!(snapshots[0].values, json!({"foo": "b", "bar": ["a", "b"]}));
    assert_eq!(snapshots[1].values, json!({"foo": "a", "bar": ["a"]}));
    assert_eq!(
        snapshots[3].metadata.as_ref().and_then(|m| m.source),
        Some(CheckpointSource::Input)
    );

    // every checkpoint links to the one before it
    for pair in snapshots.windows(2) {
        assert_eq!(
            pair[0].parent_config.as_ref().and_then(|c| c.checkpoint_id.clone()),
            pair[1].config.checkpoint_id
        );
    }
    assert!(snapshots[3].parent_config.is_none());

    let state = app.get_state(&config).await.unwrap();
    assert!(state.next.is_empty());
    assert_eq!(state.config.checkpoint_id, outcome.config.checkpoint_id);
}

#[tokio::test]
async fn test_second_input_continues_thread() {
    let app = foo_bar_graph(counter())
        .compile()
        .unwrap()
        .with_checkpointer(InMemoryCheckpointSaver::new());
    let config = CheckpointConfig::for_thread("t1");

    app.invoke(Some(json!({})), &config).await.unwrap();
    let outcome = app.invoke(Some(json!({"foo": "x"})), &config).await.unwrap();

    assert_eq!(outcome.values["bar"], json!(["a", "b", "a", "b"]));
    let steps: Vec<i64> = history(&app, "t1").await.iter().filter_map(|s| s.step()).collect();
    assert_eq!(steps, vec![6, 5, 4, 3, 2, 1, 0, -1]);
}

#[tokio::test]
async fn test_invoke_without_checkpointer() {
    let calls = counter();
    let app = foo_bar_graph(calls.clone()).compile().unwrap();

    let outcome = app.invoke(Some(json!({})), &CheckpointConfig::new()).await.unwrap();
    assert_eq!(outcome.values["foo"], json!("b"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let err = app.invoke(None, &CheckpointConfig::new()).await.unwrap_err();
    assert!(matches!(err, GraphError::Configuration(_)));
}

#[tokio::test]
async fn test_checkpointer_requires_thread_id() {
    let app = foo_bar_graph(counter())
        .compile()
        .unwrap()
        .with_checkpointer(InMemoryCheckpointSaver::new());

    let err = app.invoke(Some(json!({})), &CheckpointConfig::new()).await.unwrap_err();
    assert!(matches!(err, GraphError::Checkpoint(CheckpointError::Invalid(_))));
}

#[tokio::test]
async fn test_non_object_input_rejected() {
    let app = foo_bar_graph(counter())
        .compile()
        .unwrap()
        .with_checkpointer(InMemoryCheckpointSaver::new());
    let config = CheckpointConfig::for_thread("t1");

    let err = app.invoke(Some(json!("hello")), &config).await.unwrap_err();
    assert!(matches!(err, GraphError::InvalidUpdate(_)));
    assert!(history(&app, "t1").await.is_empty());
}

#[tokio::test]
async fn test_send_fan_out_merges_in_packet_order() {
    let mut graph = StateGraph::new();
    graph
        .add_channel("results", ChannelPolicy::append())
        .add_node("plan", |_state, _ctx| async move {
            let output = (0..4).fold(NodeOutput::empty(), |output, i| {
                output.with_send(Send::new("worker", json!(i)))
            });
            Ok(output)
        })
        .add_node("worker", |arg: Value, _ctx| async move {
            let n = arg.as_u64().unwrap_or(0);
            // later packets finish first
            tokio::time::sleep(Duration::from_millis(40 - n * 10)).await;
            Ok(NodeOutput::update(json!({"results": [n * 10]})))
        })
        .add_edge(START, "plan");
    let app = graph
        .compile()
        .unwrap()
        .with_checkpointer(InMemoryCheckpointSaver::new());

    let outcome = app
        .invoke(Some(json!({})), &CheckpointConfig::for_thread("fan"))
        .await
        .unwrap();
    assert_eq!(outcome.values["results"], json!([0, 10, 20, 30]));
}

#[tokio::test]
async fn test_runs_are_deterministic_across_completion_orders() {
    let reversed = Arc::new(AtomicBool::new(false));
    let finished: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let (flip, order) = (reversed.clone(), finished.clone());

    let mut graph = StateGraph::new();
    graph
        .add_channel("results", ChannelPolicy::append())
        .add_channel("total", ChannelPolicy::sum())
        .add_node("plan", |_state, _ctx| async move {
            Ok((0..5).fold(NodeOutput::empty(), |output, i| {
                output.with_send(Send::new("worker", json!(i)))
            }))
        })
        .add_node("worker", move |arg: Value, _ctx| {
            let n = arg.as_u64().unwrap_or(0);
            let delay = if flip.load(Ordering::SeqCst) { n * 8 } else { 40 - n * 8 };
            let order = order.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                order.lock().push(n);
                Ok(NodeOutput::update(json!({"results": [format!("w{n}")], "total": n})))
            }
        })
        .add_edge(START, "plan");
    let app = graph
        .compile()
        .unwrap()
        .with_checkpointer(InMemoryCheckpointSaver::new())
        .with_config(superstep_core::EngineConfig::default().with_max_concurrency(5));

    let first = app
        .invoke(Some(json!({})), &CheckpointConfig::for_thread("det-1"))
        .await
        .unwrap();
    let first_order = std::mem::take(&mut *finished.lock());

    reversed.store(true, Ordering::SeqCst);
    let second = app
        .invoke(Some(json!({})), &CheckpointConfig::for_thread("det-2"))
        .await
        .unwrap();
    let second_order = std::mem::take(&mut *finished.lock());
    assert_ne!(first_order, second_order);

    // replaying det-1 from its input checkpoint gives the same state again
    let input = history(&app, "det-1").await.pop().unwrap();
    assert_eq!(input.step(), Some(-1));
    let replayed = app.invoke(None, &input.config).await.unwrap();

    let expected = json!({"results": ["w0", "w1", "w2", "w3", "w4"], "total": 10});
    assert_eq!(first.values, expected);
    let bytes = serde_json::to_vec(&first.values).unwrap();
    assert_eq!(serde_json::to_vec(&second.values).unwrap(), bytes);
    assert_eq!(serde_json::to_vec(&replayed.values).unwrap(), bytes);
}

#[tokio::test]
async fn test_conditional_send_fan_out() {
    let mut graph = StateGraph::new();
    graph
        .add_channel("subjects", ChannelPolicy::Overwrite)
        .add_channel("jokes", ChannelPolicy::append())
        .add_node("joke", |subject: Value, _ctx| async move {
            let joke = format!("joke about {}", subject.as_str().unwrap_or_default());
            Ok(NodeOutput::update(json!({"jokes": [joke]})))
        })
        .add_conditional_edges(
            START,
            |state: &Value| {
                let sends: Vec<Send> = state["subjects"]
                    .as_array()
                    .into_iter()
                    .flatten()
                    .map(|s| Send::new("joke", s.clone()))
                    .collect();
                sends
            },
            None,
        );
    let app = graph.compile().unwrap();

    let outcome = app
        .invoke(Some(json!({"subjects": ["cats", "dogs"]})), &CheckpointConfig::new())
        .await
        .unwrap();
    assert_eq!(
        outcome.values["jokes"],
        json!(["joke about cats", "joke about dogs"])
    );
}

#[tokio::test]
async fn test_join_edge_waits_for_all_sources() {
    let c_calls = counter();
    let c_seen = c_calls.clone();
    let mut graph = StateGraph::new();
    graph
        .add_channel("log", ChannelPolicy::append())
        .add_node("a", |_s, _c| async move { Ok(NodeOutput::update(json!({"log": ["a"]}))) })
        .add_node("a2", |_s, _c| async move { Ok(NodeOutput::update(json!({"log": ["a2"]}))) })
        .add_node("b", |_s, _c| async move { Ok(NodeOutput::update(json!({"log": ["b"]}))) })
        .add_node("c", move |state: Value, _c| {
            c_seen.fetch_add(1, Ordering::SeqCst);
            let seen = state["log"].as_array().map(Vec::len).unwrap_or(0);
            async move { Ok(NodeOutput::update(json!({"log": [format!("c saw {seen}")]}))) }
        })
        .add_edge(START, "a")
        .add_edge(START, "b")
        .add_edge("a", "a2")
        .add_join_edge(["a2", "b"], "c");
    let app = graph.compile().unwrap();

    let outcome = app.invoke(Some(json!({})), &CheckpointConfig::new()).await.unwrap();
    assert_eq!(c_calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.values["log"], json!(["a", "b", "a2", "c saw 3"]));
}

#[tokio::test]
async fn test_conditional_edges_with_path_map() {
    let mut graph = StateGraph::new();
    graph
        .add_channel("n", ChannelPolicy::sum())
        .add_node("inc", |_s, _c| async move { Ok(NodeOutput::update(json!({"n": 1}))) })
        .add_edge(START, "inc")
        .add_conditional_edges(
            "inc",
            |state: &Value| if state["n"].as_i64().unwrap_or(0) < 3 { "again" } else { "done" },
            Some(
                [("again".to_string(), "inc".to_string()), ("done".to_string(), END.to_string())]
                    .into_iter()
                    .collect(),
            ),
        );
    let app = graph.compile().unwrap();

    let outcome = app.invoke(Some(json!({"n": 0})), &CheckpointConfig::new()).await.unwrap();
    assert_eq!(outcome.values["n"], json!(3));
}

#[tokio::test]
async fn test_goto_routes_without_edges() {
    let mut graph = StateGraph::new();
    graph
        .add_channel("path", ChannelPolicy::append())
        .add_node("router", |_s, _c| async move {
            Ok(NodeOutput::update(json!({"path": ["router"]})).with_goto("right"))
        })
        .add_node("left", |_s, _c| async move { Ok(NodeOutput::update(json!({"path": ["left"]}))) })
        .add_node("right", |_s, _c| async move { Ok(NodeOutput::update(json!({"path": ["right"]}))) })
        .add_edge(START, "router");
    let app = graph.compile().unwrap();

    let outcome = app.invoke(Some(json!({})), &CheckpointConfig::new()).await.unwrap();
    assert_eq!(outcome.values["path"], json!(["router", "right"]));
}

#[tokio::test]
async fn test_recursion_limit() {
    let mut graph = StateGraph::new();
    graph
        .add_channel("n", ChannelPolicy::sum())
        .add_node("spin", |_s, _c| async move { Ok(NodeOutput::update(json!({"n": 1}))) })
        .add_edge(START, "spin")
        .add_conditional_edges("spin", |_state: &Value| Route::To("spin".to_string()), None);
    let app = graph
        .compile()
        .unwrap()
        .with_checkpointer(InMemoryCheckpointSaver::new())
        .with_recursion_limit(5);
    let config = CheckpointConfig::for_thread("spin");

    let err = app.invoke(Some(json!({"n": 0})), &config).await.unwrap_err();
    assert!(matches!(err, GraphError::RecursionLimit { limit: 5 }));

    // the start superstep counts, so four spins were saved
    let state = app.get_state(&config).await.unwrap();
    assert_eq!(state.values["n"], json!(4));
    assert_eq!(state.next, vec!["spin"]);
}

#[tokio::test]
async fn test_failed_task_keeps_sibling_writes() {
    let flaky_calls = counter();
    let steady_calls = counter();
    let flaky = flaky_calls.clone();
    let steady = steady_calls.clone();

    let mut graph = StateGraph::new();
    graph
        .add_channel("flaky", ChannelPolicy::Overwrite)
        .add_channel("steady", ChannelPolicy::Overwrite)
        .add_node("flaky", move |_s, _c| {
            let attempt = flaky.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    return Err(NodeError::failed("upstream timeout"));
                }
                Ok(NodeOutput::update(json!({"flaky": "ok"})))
            }
        })
        .add_node("steady", move |_s, _c| {
            steady.fetch_add(1, Ordering::SeqCst);
            async move { Ok(NodeOutput::update(json!({"steady": "done"}))) }
        })
        .add_edge(START, "flaky")
        .add_edge(START, "steady");
    let app = graph
        .compile()
        .unwrap()
        .with_checkpointer(InMemoryCheckpointSaver::new());
    let config = CheckpointConfig::for_thread("retry");

    let err = app.invoke(Some(json!({})), &config).await.unwrap_err();
    match err {
        GraphError::TaskFailed { node, message, .. } => {
            assert_eq!(node, "flaky");
            assert!(message.contains("upstream timeout"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let state = app.get_state(&config).await.unwrap();
    assert_eq!(state.next, vec!["flaky", "steady"]);
    assert!(state.tasks[0].error.as_deref().unwrap_or_default().contains("upstream timeout"));
    assert_eq!(state.tasks[1].result, Some(json!({"steady": "done"})));

    let outcome = app.invoke(None, &config).await.unwrap();
    assert_eq!(outcome.values, json!({"flaky": "ok", "steady": "done"}));
    assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);
    assert_eq!(steady_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_reserved_channel_write_fails_task() {
    let mut graph = StateGraph::new();
    graph
        .add_node("sneaky", |_s, _c| async move {
            Ok(NodeOutput::update(json!({"__tasks__": ["x"]})))
        })
        .add_edge(START, "sneaky");
    let app = graph.compile().unwrap();

    let err = app.invoke(Some(json!({})), &CheckpointConfig::new()).await.unwrap_err();
    assert!(matches!(err, GraphError::TaskFailed { ref node, .. } if node == "sneaky"));
}

#[tokio::test]
async fn test_concurrent_writer_conflict() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (started_tx, release_rx) = (started.clone(), release.clone());

    let mut graph = StateGraph::new();
    graph
        .add_channel("foo", ChannelPolicy::Overwrite)
        .add_node("slow", move |_s, _c| {
            let (started, release) = (started_tx.clone(), release_rx.clone());
            async move {
                started.notify_one();
                release.notified().await;
                Ok(NodeOutput::update(json!({"foo": "slow"})))
            }
        })
        .add_edge(START, "slow");
    let app = graph
        .compile()
        .unwrap()
        .with_checkpointer(InMemoryCheckpointSaver::new());
    let config = CheckpointConfig::for_thread("contended");

    let runner = app.clone();
    let run_config = config.clone();
    let run = tokio::spawn(async move { runner.invoke(Some(json!({})), &run_config).await });

    started.notified().await;
    app.update_state(&config, json!({"foo": "other"}), Some("slow"))
        .await
        .unwrap();
    release.notify_one();

    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, GraphError::Checkpoint(CheckpointError::Conflict { .. })));
    assert_eq!(app.get_state(&config).await.unwrap().values["foo"], json!("other"));
}

#[tokio::test]
async fn test_max_concurrency_bounds_parallel_tasks() {
    let running = counter();
    let peak = counter();
    let mut graph = StateGraph::new();
    graph.add_channel("done", ChannelPolicy::append());
    for name in ["w1", "w2", "w3", "w4"] {
        let (running, peak) = (running.clone(), peak.clone());
        graph.add_node(name, move |_s, _c| {
            let (running, peak) = (running.clone(), peak.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(NodeOutput::update(json!({"done": [1]})))
            }
        });
        graph.add_edge(START, name);
    }
    let app = graph
        .compile()
        .unwrap()
        .with_config(superstep_core::EngineConfig::default().with_max_concurrency(2));

    let outcome = app.invoke(Some(json!({})), &CheckpointConfig::new()).await.unwrap();
    assert_eq!(outcome.values["done"], json!([1, 1, 1, 1]));
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_stream_updates_and_values() {
    let app = foo_bar_graph(counter())
        .compile()
        .unwrap()
        .with_checkpointer(InMemoryCheckpointSaver::new());

    let events: Vec<StreamEvent> = app
        .stream(
            Some(json!({})),
            CheckpointConfig::for_thread("streamed"),
            vec![StreamMode::Updates, StreamMode::Values],
        )
        .try_collect()
        .await
        .unwrap();

    let updated: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Updates { node, .. } if node != START => Some(node.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(updated, vec!["a", "b"]);

    let last_values = events.iter().rev().find_map(|event| match event {
        StreamEvent::Values { values, .. } => Some(values.clone()),
        _ => None,
    });
    assert_eq!(last_values, Some(json!({"foo": "b", "bar": ["a", "b"]})));
    assert!(events
        .iter()
        .all(|e| matches!(e.mode(), StreamMode::Updates | StreamMode::Values)));
}

#[tokio::test]
async fn test_stream_ends_with_run_error() {
    let mut graph = StateGraph::new();
    graph
        .add_node("boom", |_s, _c| async move { Err(NodeError::failed("boom")) })
        .add_edge(START, "boom");
    let app = graph.compile().unwrap();

    let mut stream = app.stream(Some(json!({})), CheckpointConfig::new(), vec![StreamMode::Tasks]);
    let mut last = None;
    while let Some(item) = stream.next().await {
        last = Some(item);
    }
    assert!(matches!(last, Some(Err(GraphError::TaskFailed { .. }))));
}

#[tokio::test]
async fn test_nodes_share_cross_thread_store() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let mut graph = StateGraph::new();
    graph
        .add_channel("seen", ChannelPolicy::Overwrite)
        .add_node("remember", |_state: Value, ctx| async move {
            let store = ctx
                .store()
                .cloned()
                .ok_or_else(|| NodeError::failed("no store"))?;
            let ns = vec!["users".to_string(), "alice".to_string()];
            let previous = store.get(&ns, "visits").await?;
            let visits = previous
                .and_then(|item| item.value.as_u64())
                .unwrap_or(0)
                + 1;
            store.put(&ns, "visits", json!(visits)).await?;
            Ok::<_, NodeError>(NodeOutput::update(json!({"seen": visits})))
        })
        .add_edge(START, "remember");
    let app = graph
        .compile()
        .unwrap()
        .with_checkpointer(InMemoryCheckpointSaver::new())
        .with_store(store.clone());

    app.invoke(Some(json!({})), &CheckpointConfig::for_thread("one")).await.unwrap();
    let outcome = app
        .invoke(Some(json!({})), &CheckpointConfig::for_thread("two"))
        .await
        .unwrap();

    assert_eq!(outcome.values["seen"], json!(2));
    let item = store
        .get(&["users".to_string(), "alice".to_string()], "visits")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.value, json!(2));
}
