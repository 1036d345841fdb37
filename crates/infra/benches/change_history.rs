use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use fieldops_core::{NodeId, UserId};
use fieldops_events::{Edge, Field, LogEntry, Node, Op};
use fieldops_infra::handlers::derive_activities;

fn work_order(id: i64, status: &str, assignee: i64) -> Node {
    Node::new(NodeId::new(id), "WorkOrder")
        .with_field(Field::new("creation_date", "time", 1_700_000_000))
        .with_field(Field::new("status", "string", status))
        .with_field(Field::new("priority", "string", "HIGH"))
        .with_edge(Edge::new("assignee", "User", vec![NodeId::new(assignee)]))
        .with_edge(Edge::new("owner", "User", vec![NodeId::new(7)]))
}

fn created(id: i64) -> LogEntry {
    let mut entry = LogEntry::new("ops@acme.test", Some(UserId::new(7)), Op::Create);
    entry.current_state = Some(work_order(id, "PLANNED", 11));
    entry
}

fn updated(id: i64) -> LogEntry {
    let mut entry = LogEntry::new("ops@acme.test", Some(UserId::new(7)), Op::UpdateOne);
    entry.previous_state = Some(work_order(id, "PLANNED", 11));
    entry.current_state = Some(work_order(id, "DONE", 12));
    entry
}

fn bench_derive_single(c: &mut Criterion) {
    let mut group = c.benchmark_group("derive_activities");

    let create = created(1);
    group.bench_function("create", |b| b.iter(|| derive_activities(black_box(&create))));

    let update = updated(1);
    group.bench_function("update", |b| b.iter(|| derive_activities(black_box(&update))));

    group.finish();
}

fn bench_decode_and_derive(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_and_derive");

    for batch_size in [10usize, 100, 1000].iter() {
        let bodies: Vec<Vec<u8>> = (0..*batch_size as i64)
            .map(|i| updated(i).encode().expect("encode"))
            .collect();

        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &bodies, |b, bodies| {
            b.iter(|| {
                let mut records = 0usize;
                for body in bodies {
                    let entry = LogEntry::decode(black_box(body)).expect("decode");
                    records += derive_activities(&entry).len();
                }
                records
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_derive_single, bench_decode_and_derive);
criterion_main!(benches);
