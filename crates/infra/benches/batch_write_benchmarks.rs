use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use graphstore_core::{NodeMutation, TablePrefix};
use graphstore_infra::adapter::GraphAdapter;
use graphstore_infra::connector::InMemoryConnector;
use graphstore_infra::jobs::{Job, QueueEvent, RetryPolicy, SequentialQueue};
use graphstore_infra::sql::{NewRow, ValueTable};

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

fn batch(size: usize, key: &str) -> Vec<NodeMutation> {
    (0..size)
        .map(|i| NodeMutation::new(key, format!("field{i}"), i as i64, 1))
        .collect()
}

fn bench_queue_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("sequential_queue");

    for job_count in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*job_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(job_count), job_count, |b, &n| {
            b.iter(|| {
                rt.block_on(async {
                    let (queue, mut events) = SequentialQueue::with_events("bench");
                    for _ in 0..n {
                        queue
                            .push(Job::from_fn(|| async { Ok(()) }).prepared())
                            .expect("queue closed");
                    }
                    while let Some(event) = events.recv().await {
                        if matches!(event, QueueEvent::Drained { .. }) {
                            break;
                        }
                    }
                })
            });
        });
    }

    group.finish();
}

fn bench_insert_statement_build(c: &mut Criterion) {
    let table = ValueTable::new(TablePrefix::parse("bench").expect("valid prefix"));
    let mut group = c.benchmark_group("insert_statement_build");

    for row_count in [10usize, 1000, 10000].iter() {
        let rows: Vec<NewRow> = batch(*row_count, "node").iter().map(NewRow::from_mutation).collect();
        group.throughput(Throughput::Elements(*row_count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(row_count), &rows, |b, rows| {
            b.iter(|| black_box(table.insert_many(rows)));
        });
    }

    group.finish();
}

fn bench_put_batch(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("put_batch_in_memory");

    for batch_size in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), batch_size, |b, &n| {
            let adapter = rt.block_on(async {
                let adapter = GraphAdapter::new();
                adapter
                    .configure(
                        InMemoryConnector::new(),
                        TablePrefix::parse("bench").expect("valid prefix"),
                        RetryPolicy::no_retry(),
                    )
                    .await
                    .expect("configure");
                adapter
            });
            let mut round = 0u64;

            b.iter(|| {
                round += 1;
                let key = format!("node{round}");
                rt.block_on(async { black_box(adapter.put(batch(n, &key)).await.expect("put")) })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_queue_throughput, bench_insert_statement_build, bench_put_batch);
criterion_main!(benches);
