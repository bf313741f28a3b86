use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::collections::HashMap;
use superstep_checkpoint::{
    generate_key, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver,
    EncryptedSerializer, InMemoryCheckpointSaver, JsonSerializer,
};

fn sample_checkpoint() -> Checkpoint {
    let mut checkpoint = Checkpoint::empty();
    checkpoint
        .channel_values
        .insert("messages".to_string(), json!((0..64).collect::<Vec<_>>()));
    checkpoint
        .channel_values
        .insert("status".to_string(), json!("running"));
    checkpoint
}

fn checkpoint_save_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let saver = InMemoryCheckpointSaver::new();
    let config = CheckpointConfig::for_thread("bench-thread");

    c.bench_function("checkpoint save", |b| {
        b.to_async(&runtime).iter(|| async {
            saver
                .put(
                    &config,
                    black_box(sample_checkpoint()),
                    CheckpointMetadata::new(),
                    HashMap::new(),
                )
                .await
                .unwrap();
        });
    });
}

fn checkpoint_load_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let saver = InMemoryCheckpointSaver::new();
    let saved_config = runtime
        .block_on(saver.put(
            &CheckpointConfig::for_thread("bench-thread"),
            sample_checkpoint(),
            CheckpointMetadata::new(),
            HashMap::new(),
        ))
        .unwrap();

    c.bench_function("checkpoint load", |b| {
        b.to_async(&runtime).iter(|| async {
            saver.get_tuple(black_box(&saved_config)).await.unwrap();
        });
    });
}

fn encrypted_save_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let saver = InMemoryCheckpointSaver::with_serializer(EncryptedSerializer::new(
        JsonSerializer,
        &generate_key(),
    ));
    let config = CheckpointConfig::for_thread("bench-thread");

    c.bench_function("encrypted checkpoint save", |b| {
        b.to_async(&runtime).iter(|| async {
            saver
                .put(
                    &config,
                    black_box(sample_checkpoint()),
                    CheckpointMetadata::new(),
                    HashMap::new(),
                )
                .await
                .unwrap();
        });
    });
}

criterion_group!(
    benches,
    checkpoint_save_benchmark,
    checkpoint_load_benchmark,
    encrypted_save_benchmark
);
criterion_main!(benches);
