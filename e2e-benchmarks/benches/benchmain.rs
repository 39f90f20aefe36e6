use criterion::criterion_main;

mod benchmarks;

criterion_main! {
    benchmarks::joinbench::benches,
    benchmarks::scanbench::benches,
}
