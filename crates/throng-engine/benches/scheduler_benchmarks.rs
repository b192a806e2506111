//! Scheduler throughput benchmarks.
//!
//! Measures complete runs of small graphs with trivial invocations, so the
//! numbers are dominated by claiming, reporting and node transitions.
//!
//! Run with: `cargo bench --bench scheduler_benchmarks`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use throng_engine::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn launch(blocks: u32, groups: u32, lanes: u32) -> EngineConfig {
    EngineConfig {
        launch: LaunchConfig {
            num_blocks: blocks,
            groups_per_block: groups,
            lanes_per_group: lanes,
        },
        trace: TraceConfig {
            enabled: false,
            ..TraceConfig::default()
        },
        ..EngineConfig::default()
    }
}

/// An engine over `nodes` fixed nodes of `count` invocations each.
fn setup_engine(config: EngineConfig, nodes: u32, count: u32, tpi: u32) -> Engine {
    let state = StateManager::new(config.state.clone()).unwrap();
    let sink = Arc::new(AtomicU64::new(0));
    let mut dispatcher = Dispatcher::new();
    let f = dispatcher.register(move |_, _, offset| {
        sink.fetch_add(black_box(offset) as u64, Ordering::Relaxed);
    });
    let mut builder = TaskGraphBuilder::new();
    for _ in 0..nodes {
        builder.add_node(NodeSpec::fixed(f, count).with_threads_per_invocation(tpi));
    }
    Engine::new(config, state, builder.build(), dispatcher).unwrap()
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

/// One node, growing invocation count.
fn bench_invocation_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("invocation_scaling");
    for count in [1_000u32, 10_000, 100_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let mut engine = setup_engine(launch(1, 4, 32), 1, count, 1);
            b.iter(|| black_box(engine.run()));
        });
    }
    group.finish();
}

/// Many small nodes: node transitions dominate.
fn bench_node_transitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_transitions");
    for nodes in [16u32, 128, 512] {
        group.throughput(Throughput::Elements(nodes as u64));
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &nodes, |b, &nodes| {
            let mut engine = setup_engine(launch(2, 2, 8), nodes, 8, 1);
            b.iter(|| black_box(engine.run()));
        });
    }
    group.finish();
}

/// Same work under different launch shapes.
fn bench_launch_shapes(c: &mut Criterion) {
    let mut group = c.benchmark_group("launch_shapes");
    group.throughput(Throughput::Elements(4 * 4096));
    for (blocks, groups, lanes) in [(1, 1, 32), (1, 4, 32), (4, 1, 32), (2, 4, 8)] {
        let id = format!("{blocks}x{groups}x{lanes}");
        group.bench_function(id, |b| {
            let mut engine = setup_engine(launch(blocks, groups, lanes), 4, 4096, 1);
            b.iter(|| black_box(engine.run()));
        });
    }
    group.finish();
}

/// Block-wide cooperative invocations against per-lane ones.
fn bench_block_wide_invocations(c: &mut Criterion) {
    let mut group = c.benchmark_group("threads_per_invocation");
    for tpi in [1u32, 8, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(tpi), &tpi, |b, &tpi| {
            let mut engine = setup_engine(launch(2, 4, 16), 2, 2048, tpi);
            b.iter(|| black_box(engine.run()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_invocation_scaling,
    bench_node_transitions,
    bench_launch_shapes,
    bench_block_wide_invocations,
);
criterion_main!(benches);
