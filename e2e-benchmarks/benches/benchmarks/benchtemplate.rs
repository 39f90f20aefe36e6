use common::Query;
use criterion::{black_box, Criterion};
use utilities::{LocalCluster, TableTemplate};

/// A generated cluster and the queries to time on it.
pub struct BenchTemplate {
    cluster: LocalCluster,
    queries: Vec<(String, Query)>,
}

impl BenchTemplate {
    pub fn new(nodes: usize, tables: &[TableTemplate]) -> Self {
        BenchTemplate {
            cluster: LocalCluster::start(nodes, tables, 17).unwrap(),
            queries: Vec::new(),
        }
    }

    pub fn add_query(&mut self, name: &str, query: Query) {
        self.queries.push((name.to_string(), query));
    }

    /// Times each query from planning to its last row.
    pub fn bench_cluster(&self, c: &mut Criterion) {
        let mut conductor = self.cluster.conductor().unwrap();
        // Statistics are gathered once, outside of the timed runs.
        conductor.pretreat().unwrap();
        for (name, query) in &self.queries {
            c.bench_function(name, |b| {
                b.iter(|| {
                    conductor.run_query(query).unwrap();
                    let mut rows = 0;
                    while let Some(row) = conductor.fetch_row().unwrap() {
                        black_box(row);
                        rows += 1;
                    }
                    rows
                })
            });
        }
    }
}
