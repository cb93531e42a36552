//! Headless scenario runner: drives a catalog topology at wall-clock pace,
//! logs every published snapshot, and injects a mid-run crash so the
//! recovery shows up in the health scores.
//!
//! Run with: `cargo run -p cascade-scenarios --example headless_runner -- checkout 150`
//! (scenario name and tick count are optional; defaults: `checkout`, 150.)

use std::thread;
use std::time::Duration;

use cascade_core::engine::{Engine, EngineConfig};
use cascade_core::fixed::Fixed64;
use cascade_core::id::NodeId;
use cascade_core::metrics::SystemSnapshot;
use cascade_core::publish::{SinkError, SnapshotSink};
use cascade_core::topology::NodeKind;
use log::{LevelFilter, info};

/// Logs each snapshot as one info line.
#[derive(Debug)]
struct LogSink;

impl SnapshotSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn publish(&mut self, snapshot: &SystemSnapshot) -> Result<(), SinkError> {
        let bottleneck = snapshot.bottleneck_node_id.as_deref().unwrap_or("-");
        info!(
            "t={}ms throughput={:.1}/s health={:.2} bottleneck={}",
            snapshot.virtual_time_ms,
            snapshot.total_throughput,
            snapshot.overall_health_score,
            bottleneck,
        );
        Ok(())
    }
}

/// First processing-tier node, the most interesting thing to crash.
fn crash_candidate(engine: &Engine) -> Option<NodeId> {
    engine.topology.order().iter().copied().find(|&node| {
        matches!(
            engine.topology.kind(node),
            NodeKind::Worker | NodeKind::ConsumerGroup
        )
    })
}

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .unwrap();

    let mut args = std::env::args().skip(1);
    let name = args.next().unwrap_or_else(|| "checkout".to_string());
    let ticks: usize = args
        .next()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(150);

    let Some(scenario) = cascade_scenarios::find(&name) else {
        eprintln!("unknown scenario `{name}`; available:");
        for entry in cascade_scenarios::all() {
            eprintln!("  {:<15} {}", entry.name, entry.summary);
        }
        std::process::exit(1);
    };

    info!("scenario `{}`: {}", scenario.name, scenario.summary);
    let spec = scenario.build();
    let mut engine = Engine::new(&spec, EngineConfig::default()).expect("preset specs are valid");
    engine.add_sink(Box::new(LogSink));
    engine.set_speed(Fixed64::from_num(5));
    engine.start();

    let victim = crash_candidate(&engine);
    let crash_at = ticks / 2;
    let recover_at = ticks * 3 / 4;

    info!("run {} for {ticks} ticks", engine.run_id());
    for tick in 0..ticks {
        if let Some(node) = victim {
            if tick == crash_at {
                info!("crashing `{}`", engine.topology.name(node));
                engine.crash_node(node);
            } else if tick == recover_at {
                info!("recovering `{}`", engine.topology.name(node));
                engine.recover_node(node);
            }
        }
        engine.tick();
        thread::sleep(Duration::from_millis(engine.tick_interval_ms()));
    }

    let last = engine.snapshot();
    println!(
        "{}",
        serde_json::to_string_pretty(&last).expect("snapshots serialize")
    );
}
