//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use std::sync::{Arc, Mutex};

use crate::engine::{Engine, EngineConfig};
use crate::event::EventKind;
use crate::fixed::Fixed64;
use crate::metrics::SystemSnapshot;
use crate::publish::{SinkError, SnapshotSink};
use crate::topology::{EdgeSpec, NodeSpec, TopologySpec};

// ===========================================================================
// Fixed-point helper
// ===========================================================================

pub fn fixed(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

// ===========================================================================
// Node spec constructors
// ===========================================================================

pub fn producer(id: &str, rate_per_sec: f64) -> NodeSpec {
    let mut node = NodeSpec::new(id, "producer");
    node.throughput_per_sec = Some(rate_per_sec);
    node
}

pub fn worker(id: &str, throughput_per_sec: f64) -> NodeSpec {
    let mut node = NodeSpec::new(id, "worker");
    node.throughput_per_sec = Some(throughput_per_sec);
    node
}

pub fn failing_worker(id: &str, failure_rate: f64) -> NodeSpec {
    let mut node = NodeSpec::new(id, "worker");
    node.throughput_per_sec = Some(100.0);
    node.failure_rate = Some(failure_rate);
    node
}

pub fn kafka(id: &str, partitions: u32) -> NodeSpec {
    let mut node = NodeSpec::new(id, "kafka");
    node.partitions = Some(partitions);
    node
}

pub fn load_balancer(id: &str) -> NodeSpec {
    NodeSpec::new(id, "load_balancer")
}

/// Terminal database: a received message finalizes as delivered.
pub fn sink_database(id: &str) -> NodeSpec {
    let mut node = NodeSpec::new(id, "database");
    node.sink = true;
    node
}

pub fn dead_letter(id: &str) -> NodeSpec {
    NodeSpec::new(id, "dead_letter_queue")
}

// ===========================================================================
// Topology builders
// ===========================================================================

/// Assemble a spec from nodes and (source, target) name pairs.
pub fn topology(nodes: Vec<NodeSpec>, edges: &[(&str, &str)]) -> TopologySpec {
    TopologySpec {
        nodes,
        edges: edges
            .iter()
            .enumerate()
            .map(|(i, (source, target))| EdgeSpec {
                id: format!("e{i}"),
                source_id: source.to_string(),
                target_id: target.to_string(),
            })
            .collect(),
    }
}

/// Producer -> worker -> terminal database. The smallest useful pipeline.
pub fn pipeline_spec() -> TopologySpec {
    topology(
        vec![
            producer("producer", 50.0),
            worker("worker", 100.0),
            sink_database("db"),
        ],
        &[("producer", "worker"), ("worker", "db")],
    )
}

/// Producer -> worker (certain failure) -> dead-letter queue.
pub fn dead_letter_spec() -> TopologySpec {
    topology(
        vec![
            producer("producer", 50.0),
            failing_worker("worker", 1.0),
            dead_letter("dlq"),
        ],
        &[("producer", "worker"), ("worker", "dlq")],
    )
}

/// A linear chain: producer -> worker * (length - 2) -> terminal database.
/// Deep topology, one node per level.
pub fn build_chain_spec(length: usize) -> TopologySpec {
    let mut nodes = vec![producer("n0", 100.0)];
    let mut edges = Vec::new();
    for i in 1..length.saturating_sub(1) {
        nodes.push(worker(&format!("n{i}"), 200.0));
        edges.push((format!("n{}", i - 1), format!("n{i}")));
    }
    if length >= 2 {
        let last = length - 1;
        nodes.push(sink_database(&format!("n{last}")));
        edges.push((format!("n{}", last - 1), format!("n{last}")));
    }
    TopologySpec {
        nodes,
        edges: edges
            .into_iter()
            .enumerate()
            .map(|(i, (source_id, target_id))| EdgeSpec {
                id: format!("e{i}"),
                source_id,
                target_id,
            })
            .collect(),
    }
}

/// A wide topology: producer -> load balancer -> N workers -> one shared
/// terminal database. Three levels, worst case for fan-out bookkeeping.
pub fn build_fanout_spec(fan_out: usize) -> TopologySpec {
    let mut nodes = vec![
        producer("producer", 200.0),
        load_balancer("lb"),
        sink_database("db"),
    ];
    let mut edges = vec![("producer".to_string(), "lb".to_string())];
    for i in 0..fan_out {
        let id = format!("w{i}");
        nodes.push(worker(&id, 50.0));
        edges.push(("lb".to_string(), id.clone()));
        edges.push((id, "db".to_string()));
    }
    TopologySpec {
        nodes,
        edges: edges
            .into_iter()
            .enumerate()
            .map(|(i, (source_id, target_id))| EdgeSpec {
                id: format!("e{i}"),
                source_id,
                target_id,
            })
            .collect(),
    }
}

// ===========================================================================
// Engine helpers
// ===========================================================================

/// Engine over the given spec with default configuration, already started.
pub fn started_engine(spec: &TopologySpec) -> Engine {
    let mut engine = Engine::new(spec, EngineConfig::default()).unwrap();
    engine.start();
    engine
}

pub fn run_ticks(engine: &mut Engine, ticks: usize) {
    for _ in 0..ticks {
        engine.tick();
    }
}

pub fn count_events(engine: &Engine, kind: EventKind) -> usize {
    engine.events().iter().filter(|e| e.kind == kind).count()
}

// ===========================================================================
// Snapshot sinks
// ===========================================================================

/// Sink that stores every snapshot it is handed. Clone the handle before
/// boxing the sink into the engine.
#[derive(Debug, Default)]
pub struct RecordingSink {
    snapshots: Arc<Mutex<Vec<SystemSnapshot>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Arc<Mutex<Vec<SystemSnapshot>>> {
        Arc::clone(&self.snapshots)
    }
}

impl SnapshotSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn publish(&mut self, snapshot: &SystemSnapshot) -> Result<(), SinkError> {
        self.snapshots.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}

/// Sink that fails a fixed number of times before accepting, to exercise
/// retry policies.
#[derive(Debug)]
pub struct FlakySink {
    remaining_failures: u32,
    accepted: Arc<Mutex<Vec<u64>>>,
}

impl FlakySink {
    pub fn new(failures: u32) -> Self {
        Self {
            remaining_failures: failures,
            accepted: Arc::default(),
        }
    }

    /// Virtual times of accepted snapshots.
    pub fn accepted(&self) -> Arc<Mutex<Vec<u64>>> {
        Arc::clone(&self.accepted)
    }
}

impl SnapshotSink for FlakySink {
    fn name(&self) -> &str {
        "flaky"
    }

    fn publish(&mut self, snapshot: &SystemSnapshot) -> Result<(), SinkError> {
        if self.remaining_failures > 0 {
            self.remaining_failures -= 1;
            return Err(SinkError::Unavailable("transient outage".to_string()));
        }
        self.accepted.lock().unwrap().push(snapshot.virtual_time_ms);
        Ok(())
    }
}
