use criterion::{criterion_group, Criterion};

use crate::benchmarks::benchtemplate::BenchTemplate;
use common::{Query, Value};
use utilities::TableTemplate;

fn bench_scans(c: &mut Criterion) {
    let mut bt = BenchTemplate::new(
        2,
        &[TableTemplate::new("T", &["_id", "v"], 20000).parts(2)],
    );
    bt.add_query("scan_full", Query::new().table("T", "t").output("t.v"));
    bt.add_query(
        "scan_point",
        Query::new()
            .table("T", "t")
            .output("t.v")
            .eq("t._id", Value::Int(15000)),
    );
    bt.add_query(
        "scan_range",
        Query::new()
            .table("T", "t")
            .output("t.v")
            .gt("t._id", Value::Int(19000)),
    );
    bt.bench_cluster(c);
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_scans
}
