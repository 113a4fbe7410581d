//! Criterion benchmarks for asset graph operations
//!
//! These benchmarks measure graph construction (which checks for cycles on
//! every registration) and the ordering queries the evaluator runs on every
//! pass, at several graph sizes.

use cadence_core::{AssetDefinition, AssetGraph, AssetKey};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Chain: asset_0 -> asset_1 -> ... -> asset_n
fn chain(size: usize) -> Vec<AssetDefinition> {
    (0..size)
        .map(|i| {
            let builder = AssetDefinition::builder(format!("asset_{i:05}"));
            let builder = if i > 0 {
                builder.depends_on(format!("asset_{:05}", i - 1))
            } else {
                builder
            };
            builder.build().unwrap()
        })
        .collect()
}

/// Layered diamond: each layer depends on every asset of the previous layer
fn layered(layers: usize, width: usize) -> Vec<AssetDefinition> {
    let mut defs = Vec::with_capacity(layers * width);
    for layer in 0..layers {
        for i in 0..width {
            let mut builder = AssetDefinition::builder(format!("l{layer:03}_{i:03}"));
            if layer > 0 {
                for j in 0..width {
                    builder = builder.depends_on(format!("l{:03}_{j:03}", layer - 1));
                }
            }
            defs.push(builder.build().unwrap());
        }
    }
    defs
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_build");
    for size in [10, 100, 500] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("chain", size), &size, |b, &size| {
            b.iter_batched(
                || chain(size),
                |defs| black_box(AssetGraph::from_definitions(defs).unwrap()),
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_topological_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("topological_order");
    for (layers, width) in [(5, 5), (10, 10), (20, 20)] {
        let graph = AssetGraph::from_definitions(layered(layers, width)).unwrap();
        let subset: Vec<AssetKey> = graph.keys().iter().rev().step_by(2).cloned().collect();
        group.bench_with_input(
            BenchmarkId::new("layered_subset", layers * width),
            &subset,
            |b, subset| b.iter(|| black_box(graph.topological_order(subset.iter()))),
        );
    }
    group.finish();
}

fn bench_downstream_closure(c: &mut Criterion) {
    let mut group = c.benchmark_group("downstream_closure");
    for size in [10, 100, 500] {
        let graph = AssetGraph::from_definitions(chain(size)).unwrap();
        let root = AssetKey::new("asset_00000");
        group.bench_with_input(BenchmarkId::new("chain", size), &root, |b, root| {
            b.iter(|| black_box(graph.downstream_closure(std::iter::once(root))))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_build,
    bench_topological_order,
    bench_downstream_closure
);
criterion_main!(benches);
