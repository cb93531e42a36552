//! Criterion benchmarks for the cascade simulation engine.
//!
//! Four benchmark groups:
//! - `deep_chain`: 100-node linear pipeline -- per-tick cost of pure flow
//! - `wide_fanout`: load balancer spreading over 100 workers -- routing cost
//! - `failure_storm`: total worker failure with dead-letter rerouting --
//!   settle-loop cost under the worst reroute load
//! - `snapshot`: windowed metrics computation over a warmed event log

use cascade_core::engine::Engine;
use cascade_core::test_utils::*;
use criterion::{Criterion, criterion_group, criterion_main};

// ===========================================================================
// Engine builders
// ===========================================================================

fn build_deep_chain() -> Engine {
    let mut engine = started_engine(&build_chain_spec(100));
    run_ticks(&mut engine, 10);
    engine
}

fn build_wide_fanout() -> Engine {
    let mut engine = started_engine(&build_fanout_spec(100));
    run_ticks(&mut engine, 10);
    engine
}

/// Twenty independent producer -> failing worker -> dead-letter pipelines.
/// Every message errors and reroutes, which maximizes settle-loop work.
fn build_failure_storm() -> Engine {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    for i in 0..20 {
        let p = format!("p{i}");
        let w = format!("w{i}");
        let d = format!("d{i}");
        nodes.push(producer(&p, 100.0));
        nodes.push(failing_worker(&w, 1.0));
        nodes.push(dead_letter(&d));
        edges.push((p, w.clone()));
        edges.push((w, d));
    }
    let edge_refs: Vec<(&str, &str)> = edges
        .iter()
        .map(|(a, b)| (a.as_str(), b.as_str()))
        .collect();
    let mut engine = started_engine(&topology(nodes, &edge_refs));
    run_ticks(&mut engine, 10);
    engine
}

// ===========================================================================
// Benchmarks
// ===========================================================================

fn bench_deep_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("deep_chain");
    group.sample_size(50);

    let mut engine = build_deep_chain();
    group.bench_function("100_node_pipeline_tick", |b| {
        b.iter(|| {
            engine.tick();
        });
    });

    group.finish();
}

fn bench_wide_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("wide_fanout");
    group.sample_size(50);

    let mut engine = build_wide_fanout();
    group.bench_function("lb_over_100_workers_tick", |b| {
        b.iter(|| {
            engine.tick();
        });
    });

    group.finish();
}

fn bench_failure_storm(c: &mut Criterion) {
    let mut group = c.benchmark_group("failure_storm");
    group.sample_size(30);

    let mut engine = build_failure_storm();
    group.bench_function("20_pipelines_total_failure_tick", |b| {
        b.iter(|| {
            engine.tick();
        });
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");
    group.sample_size(50);

    let mut engine = build_wide_fanout();
    run_ticks(&mut engine, 100);

    group.bench_function("windowed_metrics_100_workers", |b| {
        b.iter(|| engine.snapshot());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_deep_chain,
    bench_wide_fanout,
    bench_failure_storm,
    bench_snapshot
);
criterion_main!(benches);
