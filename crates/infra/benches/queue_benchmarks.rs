use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use tidepool_core::{BackoffPolicy, NewItem, WorkerId, compute_backoff_seconds};
use tidepool_infra::queue::{HandlerRegistry, InMemoryQueueStore, ProcessorConfig, QueueProcessor};
use tidepool_infra::QueueStore;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");

    group.bench_function("compute_backoff_seconds", |b| {
        b.iter(|| {
            for r in 0..20u32 {
                black_box(compute_backoff_seconds(black_box(r), black_box(4)));
            }
        })
    });

    let policy = BackoffPolicy::default();
    group.bench_function("policy_delay", |b| {
        b.iter(|| black_box(policy.delay(black_box(7))))
    });

    group.finish();
}

fn bench_claim_complete(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("in_memory_claim_complete");
    let worker = WorkerId::new("bench").unwrap();

    for queued in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(queued as u64));
        group.bench_with_input(BenchmarkId::from_parameter(queued), &queued, |b, &queued| {
            b.iter(|| {
                rt.block_on(async {
                    let store = InMemoryQueueStore::new();
                    for i in 0..queued {
                        store
                            .enqueue(NewItem::new("bench", serde_json::json!({ "i": i })))
                            .await
                            .unwrap();
                    }
                    while let Some(item) = store
                        .claim_next(&worker, Duration::from_secs(900))
                        .await
                        .unwrap()
                    {
                        store.complete(item.id, &worker).await.unwrap();
                    }
                })
            })
        });
    }

    group.finish();
}

fn bench_processor_tick(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("processor_tick");

    let mut registry = HandlerRegistry::new();
    registry.register_fn("bench", |_item, _cancel| async { Ok(()) });
    let registry = Arc::new(registry);

    for batch in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                rt.block_on(async {
                    let store = Arc::new(InMemoryQueueStore::new());
                    for _ in 0..batch {
                        store
                            .enqueue(NewItem::new("bench", serde_json::Value::Null))
                            .await
                            .unwrap();
                    }
                    let processor = QueueProcessor::new(
                        store,
                        registry.clone(),
                        WorkerId::new("bench").unwrap(),
                        ProcessorConfig::default().with_batch_size(batch),
                    );
                    black_box(processor.run_tick(&CancellationToken::new()).await)
                })
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_backoff,
    bench_claim_complete,
    bench_processor_tick
);
criterion_main!(benches);
