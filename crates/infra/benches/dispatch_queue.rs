use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use productsnap_core::{JobId, WorkerId};
use productsnap_infra::dispatch::{DispatchQueue, InMemoryDispatchQueue, Priority, QueueConfig};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Fill a queue with an even paid/free mix.
async fn filled(depth: usize) -> InMemoryDispatchQueue {
    let queue = InMemoryDispatchQueue::new(QueueConfig::default());
    for i in 0..depth {
        let priority = if i % 2 == 0 { Priority::Paid } else { Priority::Free };
        queue.enqueue(JobId::new(), priority).await.unwrap();
    }
    queue
}

fn bench_lease_ack_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("lease_ack_cycle");
    group.throughput(Throughput::Elements(1));

    for depth in [100usize, 1_000, 10_000] {
        let queue = rt.block_on(filled(depth));
        let queue = &queue;
        let worker = WorkerId::new();
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.to_async(&rt).iter(|| async move {
                // Lease, ack and put a fresh job back to keep depth constant.
                let lease = queue.lease(worker).await.unwrap().unwrap();
                queue.ack(lease.job_id, lease.token).await.unwrap();
                queue
                    .enqueue(JobId::new(), lease.priority)
                    .await
                    .unwrap();
                black_box(lease.deliveries)
            });
        });
    }

    group.finish();
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue");
    group.throughput(Throughput::Elements(1));

    let queue = InMemoryDispatchQueue::new(QueueConfig::default());
    let queue = &queue;
    group.bench_function("paid_lane", |b| {
        b.to_async(&rt).iter(|| async move {
            queue
                .enqueue(black_box(JobId::new()), Priority::Paid)
                .await
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_lease_ack_cycle, bench_enqueue);
criterion_main!(benches);
