use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use superstep_checkpoint::{CheckpointConfig, InMemoryCheckpointSaver};
use superstep_core::{ChannelPolicy, CompiledGraph, NodeOutput, Send, StateGraph, START};

/// A chain of `len` nodes, each appending its index
fn chain(len: usize) -> CompiledGraph {
    let mut graph = StateGraph::new();
    graph.add_channel("trail", ChannelPolicy::append());
    for i in 0..len {
        graph.add_node(format!("n{i}"), move |_state, _ctx| async move {
            Ok(NodeOutput::update(json!({"trail": [i]})))
        });
        let from = if i == 0 { START.to_string() } else { format!("n{}", i - 1) };
        graph.add_edge(from, format!("n{i}"));
    }
    graph.compile().unwrap()
}

/// One planner fanning out to `width` workers
fn fan_out(width: usize) -> CompiledGraph {
    let mut graph = StateGraph::new();
    graph
        .add_channel("results", ChannelPolicy::append())
        .add_node("plan", move |_state, _ctx| async move {
            Ok((0..width).fold(NodeOutput::empty(), |out, i| {
                out.with_send(Send::new("work", json!(i)))
            }))
        })
        .add_node("work", |arg, _ctx| async move {
            Ok(NodeOutput::update(json!({"results": [arg]})))
        })
        .add_edge(START, "plan");
    graph.compile().unwrap()
}

fn chain_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("chain");
    for len in [2, 8, 32] {
        let app = chain(len).with_checkpointer(InMemoryCheckpointSaver::new());
        let mut thread = 0u64;
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.to_async(&runtime).iter(|| {
                thread += 1;
                let config = CheckpointConfig::for_thread(format!("bench-{thread}"));
                let app = app.clone();
                async move {
                    app.invoke(Some(black_box(json!({}))), &config).await.unwrap();
                }
            });
        });
    }
    group.finish();
}

fn fan_out_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("fan_out");
    for width in [4, 64] {
        let app = fan_out(width);
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.to_async(&runtime).iter(|| async {
                app.invoke(Some(black_box(json!({}))), &CheckpointConfig::new())
                    .await
                    .unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, chain_benchmark, fan_out_benchmark);
criterion_main!(benches);
