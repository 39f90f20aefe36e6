use criterion::{criterion_group, Criterion};

use crate::benchmarks::benchtemplate::BenchTemplate;
use common::Query;
use utilities::TableTemplate;

fn join_query(outer: &str, inner: &str) -> Query {
    Query::new()
        .table(outer, "a")
        .table(inner, "b")
        .output("a._id")
        .output("b.v")
        .join("a.fk", "b._id")
}

fn bench_join_colocated(c: &mut Criterion) {
    let mut bt = BenchTemplate::new(
        1,
        &[
            TableTemplate::new("A", &["_id", "fk"], 2000).value_range(500),
            TableTemplate::new("B", &["_id", "v"], 500),
        ],
    );
    bt.add_query("join_colocated", join_query("A", "B"));
    bt.bench_cluster(c);
}

fn bench_join_partitioned(c: &mut Criterion) {
    let mut bt = BenchTemplate::new(
        3,
        &[
            TableTemplate::new("A", &["_id", "fk"], 2000).value_range(1500),
            TableTemplate::new("B", &["_id", "v"], 1500).parts(3),
        ],
    );
    bt.add_query("join_partitioned", join_query("A", "B"));
    bt.bench_cluster(c);
}

fn bench_join_replicated(c: &mut Criterion) {
    let mut bt = BenchTemplate::new(
        4,
        &[
            TableTemplate::new("A", &["_id", "fk"], 1000).value_range(1000),
            TableTemplate::new("B", &["_id", "v"], 1000).parts(2).replicas(2),
        ],
    );
    bt.add_query("join_replicated", join_query("A", "B"));
    bt.bench_cluster(c);
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_join_colocated, bench_join_partitioned, bench_join_replicated
}
