use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use jobguard_core::{
    IdempotencyKeyCodec, JobPayload, LsnDistance, StaticWorkerRegistry, WorkerOptions,
};
use jobguard_infra::config::DedupConfig;
use jobguard_infra::dedup::{DedupError, Deduplicator, DuplicateJobGuard};
use jobguard_infra::store::InMemoryKeyStore;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

fn args_of_size(n: usize) -> Vec<JsonValue> {
    (0..n)
        .map(|i| json!({"id": i, "name": format!("item-{i}"), "tags": ["a", "b"]}))
        .collect()
}

fn bench_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_derivation");

    for size in [1usize, 10, 100] {
        let args = args_of_size(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &args, |b, args| {
            b.iter(|| IdempotencyKeyCodec::compute(black_box("ReportWorker"), black_box(args)));
        });
    }

    group.finish();
}

fn bench_check_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("guard_cycle");
    let store = InMemoryKeyStore::new();
    let registry = StaticWorkerRegistry::new().with("ReportWorker", WorkerOptions::idempotent());
    let config = DedupConfig::default();
    let window = Duration::from_secs(60);

    group.bench_function("check_and_delete", |b| {
        b.iter(|| {
            let mut job = JobPayload::new("ReportWorker", vec![json!(1)]);
            let mut guard =
                DuplicateJobGuard::new(&mut job, &store, &registry, &LsnDistance, &config);
            black_box(guard.check(window).unwrap());
            guard.delete().unwrap();
        });
    });

    group.bench_function("check_with_wal_tracking", |b| {
        b.iter(|| {
            let mut job = JobPayload::new("ReportWorker", vec![json!(1)])
                .with_wal_location("main", "0/AAA")
                .with_wal_location("ci", "16/B374D848");
            let mut guard =
                DuplicateJobGuard::new(&mut job, &store, &registry, &LsnDistance, &config);
            guard.check(window).unwrap();
            guard.update_latest_wal_location().unwrap();
            black_box(guard.latest_wal_locations().unwrap());
            guard.delete().unwrap();
        });
    });

    group.finish();
}

fn bench_schedule_duplicates(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule");
    let registry = StaticWorkerRegistry::new().with("ReportWorker", WorkerOptions::idempotent());
    let dedup = Deduplicator::new(InMemoryKeyStore::arc()).with_registry(Arc::new(registry));

    // Holds the window so every iteration below is dropped.
    let mut holder = JobPayload::new("ReportWorker", vec![json!(1)]);
    dedup.schedule(&mut holder, |_| Ok::<_, DedupError>(())).unwrap();

    group.bench_function("drop_duplicate", |b| {
        b.iter(|| {
            let mut job = JobPayload::new("ReportWorker", vec![json!(1)]);
            black_box(dedup.schedule(&mut job, |_| Ok::<_, DedupError>(())).unwrap());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_key_derivation,
    bench_check_cycle,
    bench_schedule_duplicates
);
criterion_main!(benches);
