//! Windowed metrics aggregation over the event log.
//!
//! Every snapshot is a pure function of the recent event window plus the
//! current node state, so two runs with the same seed produce bit-identical
//! snapshot streams. Events are attributed to the node that emitted them
//! (the source), not the node they were addressed to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use slotmap::SecondaryMap;

use crate::event::{EventKind, EventLog};
use crate::fixed::{Fixed64, clamp01, fixed64_to_f64};
use crate::id::NodeId;
use crate::node::{Behavior, BreakerPhase, NodeRuntime, breaker_phase, consumer_lag, queue_depth};
use crate::topology::Topology;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Aggregation window and health-score weights.
///
/// The three weights apply to the error-rate, queue-saturation, and
/// normalized-latency penalties and should sum to at most one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    /// Events older than this are ignored by snapshots.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_error_weight")]
    pub error_weight: Fixed64,
    #[serde(default = "default_saturation_weight")]
    pub saturation_weight: Fixed64,
    #[serde(default = "default_latency_weight")]
    pub latency_weight: Fixed64,
}

fn default_window_ms() -> u64 {
    10_000
}

fn default_error_weight() -> Fixed64 {
    Fixed64::from_num(0.6)
}

fn default_saturation_weight() -> Fixed64 {
    Fixed64::from_num(0.3)
}

fn default_latency_weight() -> Fixed64 {
    Fixed64::from_num(0.1)
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            error_weight: default_error_weight(),
            saturation_weight: default_saturation_weight(),
            latency_weight: default_latency_weight(),
        }
    }
}

/// Assumed throughput for health scoring when a node has no configured rate.
const DEFAULT_NOMINAL_THROUGHPUT: u32 = 10;

/// Latency at or above this normalizes to a full latency penalty.
const LATENCY_NORM_MS: u32 = 1000;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

/// Per-service metrics over the aggregation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    pub node_id: String,
    pub throughput_per_sec: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
    /// Failures (errors plus drops) per sent message; 0 when nothing sent.
    pub error_rate: f64,
    pub queue_depth: u64,
    /// Composite 0..1 score; 1 is fully healthy.
    pub health_score: f64,
    /// Present only on circuit breaker nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_state: Option<BreakerPhase>,
    /// Present only on consumer group nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_lag: Option<u64>,
}

/// System-wide metrics snapshot published at the snapshot cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub run_id: String,
    pub virtual_time_ms: u64,
    /// Keyed by node id; ordered for stable serialization.
    pub services: BTreeMap<String, ServiceSnapshot>,
    pub total_throughput: f64,
    /// Node with the lowest windowed throughput; earliest wins ties.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bottleneck_node_id: Option<String>,
    pub overall_health_score: f64,
}

/// Borrowed engine state handed to the aggregator.
pub struct SnapshotInputs<'a> {
    pub run_id: &'a str,
    pub now_ms: u64,
    pub topology: &'a Topology,
    pub behaviors: &'a SecondaryMap<NodeId, Behavior>,
    pub runtimes: &'a SecondaryMap<NodeId, NodeRuntime>,
    pub log: &'a EventLog,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    config: MetricsConfig,
}

impl MetricsAggregator {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Compute a full system snapshot from the current window.
    pub fn compute_snapshot(&self, inputs: SnapshotInputs<'_>) -> SystemSnapshot {
        let window_start = inputs.now_ms.saturating_sub(self.config.window_ms);
        let window = inputs.log.window(window_start);

        let mut services = BTreeMap::new();
        let mut total_throughput = Fixed64::ZERO;
        let mut health_sum = Fixed64::ZERO;
        let mut bottleneck: Option<(NodeId, Fixed64)> = None;

        for &node in inputs.topology.order() {
            let mut sent = 0u32;
            let mut failures = 0u32;
            let mut latencies: Vec<u32> = Vec::new();
            for event in window {
                if event.source != node {
                    continue;
                }
                match event.kind {
                    EventKind::MessageSent => sent += 1,
                    EventKind::MessageError | EventKind::MessageDropped => failures += 1,
                    _ => {}
                }
                if let Some(latency) = event.latency_ms {
                    latencies.push(latency);
                }
            }

            let throughput = self.windowed_rate(sent);
            let avg_latency = mean_latency(&latencies);
            let p95_latency = p95_latency(&mut latencies);
            let error_rate = if sent == 0 {
                Fixed64::ZERO
            } else {
                Fixed64::from_num(failures) / Fixed64::from_num(sent)
            };

            let (depth, breaker, lag) =
                match (inputs.behaviors.get(node), inputs.runtimes.get(node)) {
                    (Some(behavior), Some(runtime)) => (
                        queue_depth(behavior, runtime),
                        breaker_phase(behavior),
                        consumer_lag(behavior),
                    ),
                    _ => (0, None, None),
                };

            let health = self.health_score(inputs.topology, node, error_rate, depth, avg_latency);

            total_throughput += throughput;
            health_sum += health;
            match bottleneck {
                Some((_, lowest)) if throughput >= lowest => {}
                _ => bottleneck = Some((node, throughput)),
            }

            let name = inputs.topology.name(node).to_string();
            services.insert(
                name.clone(),
                ServiceSnapshot {
                    node_id: name,
                    throughput_per_sec: fixed64_to_f64(throughput),
                    avg_latency_ms: fixed64_to_f64(avg_latency),
                    p95_latency_ms: f64::from(p95_latency),
                    error_rate: fixed64_to_f64(error_rate),
                    queue_depth: depth as u64,
                    health_score: fixed64_to_f64(health),
                    circuit_breaker_state: breaker,
                    consumer_lag: lag,
                },
            );
        }

        let node_count = inputs.topology.node_count();
        let overall = if node_count == 0 {
            Fixed64::ZERO
        } else {
            health_sum / Fixed64::from_num(node_count as u32)
        };

        SystemSnapshot {
            run_id: inputs.run_id.to_string(),
            virtual_time_ms: inputs.now_ms,
            services,
            total_throughput: fixed64_to_f64(total_throughput),
            bottleneck_node_id: bottleneck
                .map(|(node, _)| inputs.topology.name(node).to_string()),
            overall_health_score: fixed64_to_f64(overall),
        }
    }

    /// Events per second over the window, using the full window as divisor
    /// so early-run rates ramp up instead of spiking.
    fn windowed_rate(&self, count: u32) -> Fixed64 {
        if self.config.window_ms == 0 {
            return Fixed64::ZERO;
        }
        let window_s = Fixed64::from_num(self.config.window_ms.min(3_600_000) as u32)
            / Fixed64::from_num(1000);
        Fixed64::from_num(count) / window_s
    }

    fn health_score(
        &self,
        topology: &Topology,
        node: NodeId,
        error_rate: Fixed64,
        depth: usize,
        avg_latency: Fixed64,
    ) -> Fixed64 {
        let nominal = topology
            .config(node)
            .throughput_per_sec
            .unwrap_or(Fixed64::from_num(DEFAULT_NOMINAL_THROUGHPUT))
            .max(Fixed64::ONE);
        let saturation =
            (Fixed64::from_num(depth.min(1_000_000_000) as u32) / nominal).min(Fixed64::ONE);
        let latency_norm =
            (avg_latency / Fixed64::from_num(LATENCY_NORM_MS)).min(Fixed64::ONE);

        clamp01(
            Fixed64::ONE
                - self.config.error_weight * error_rate
                - self.config.saturation_weight * saturation
                - self.config.latency_weight * latency_norm,
        )
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Latency statistics
// ---------------------------------------------------------------------------

fn mean_latency(latencies: &[u32]) -> Fixed64 {
    if latencies.is_empty() {
        return Fixed64::ZERO;
    }
    let len = latencies.len() as u64;
    let sum: u64 = latencies.iter().map(|&l| u64::from(l)).sum();
    // Whole part first keeps arbitrarily large sums inside fixed-point range.
    let whole = (sum / len).min(1_000_000) as u32;
    let remainder = (sum % len) as u32;
    Fixed64::from_num(whole)
        + Fixed64::from_num(remainder) / Fixed64::from_num(latencies.len() as u32)
}

/// Nearest-rank p95. Sorts in place; returns 0 for an empty sample.
fn p95_latency(latencies: &mut [u32]) -> u32 {
    if latencies.is_empty() {
        return 0;
    }
    latencies.sort_unstable();
    let rank = (latencies.len() * 95 / 100).min(latencies.len() - 1);
    latencies[rank]
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::MessageId;
    use crate::topology::{EdgeSpec, NodeSpec, TopologySpec};

    // Helpers ---------------------------------------------------------------

    struct Fixture {
        topology: Topology,
        behaviors: SecondaryMap<NodeId, Behavior>,
        runtimes: SecondaryMap<NodeId, NodeRuntime>,
        log: EventLog,
    }

    impl Fixture {
        fn new(nodes: Vec<NodeSpec>, edges: Vec<(&str, &str)>) -> Self {
            let spec = TopologySpec {
                nodes,
                edges: edges
                    .into_iter()
                    .enumerate()
                    .map(|(i, (source, target))| EdgeSpec {
                        id: format!("e{i}"),
                        source_id: source.to_string(),
                        target_id: target.to_string(),
                    })
                    .collect(),
            };
            let topology = Topology::build(&spec).unwrap();
            let mut behaviors = SecondaryMap::new();
            let mut runtimes = SecondaryMap::new();
            for &node in topology.order() {
                behaviors.insert(node, Behavior::for_node(&topology, node));
                runtimes.insert(node, NodeRuntime::default());
            }
            Self {
                topology,
                behaviors,
                runtimes,
                log: EventLog::new(),
            }
        }

        fn node(&self, name: &str) -> NodeId {
            self.topology.node_id(name).unwrap()
        }

        fn snapshot_at(&self, now_ms: u64) -> SystemSnapshot {
            MetricsAggregator::default().compute_snapshot(SnapshotInputs {
                run_id: "run-test",
                now_ms,
                topology: &self.topology,
                behaviors: &self.behaviors,
                runtimes: &self.runtimes,
                log: &self.log,
            })
        }
    }

    fn two_node_fixture() -> Fixture {
        Fixture::new(
            vec![NodeSpec::new("p", "producer"), NodeSpec::new("w", "worker")],
            vec![("p", "w")],
        )
    }

    // -----------------------------------------------------------------------
    // 1. Throughput is sent-count over the window
    // -----------------------------------------------------------------------
    #[test]
    fn throughput_counts_sent_events_over_window() {
        let mut fx = two_node_fixture();
        let p = fx.node("p");
        fx.log.set_time(5_000);
        for n in 0..20 {
            fx.log.message_sent(p, MessageId(n), 5);
        }

        let snapshot = fx.snapshot_at(5_000);
        let service = &snapshot.services["p"];
        // 20 sends over a 10s window.
        assert!((service.throughput_per_sec - 2.0).abs() < 1e-9);
        assert!((snapshot.total_throughput - 2.0).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // 2. Stale events age out of the window
    // -----------------------------------------------------------------------
    #[test]
    fn window_excludes_stale_events() {
        let mut fx = two_node_fixture();
        let p = fx.node("p");
        fx.log.set_time(0);
        for n in 0..10 {
            fx.log.message_sent(p, MessageId(n), 5);
        }
        fx.log.set_time(20_000);
        fx.log.message_sent(p, MessageId(100), 5);

        let snapshot = fx.snapshot_at(20_000);
        // Only the single in-window send counts: 1 / 10s.
        assert!((snapshot.services["p"].throughput_per_sec - 0.1).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // 3. Error rate is failures per send
    // -----------------------------------------------------------------------
    #[test]
    fn error_rate_divides_failures_by_sends() {
        let mut fx = two_node_fixture();
        let p = fx.node("p");
        let w = fx.node("w");
        fx.log.set_time(1_000);
        for n in 0..8 {
            fx.log.message_sent(w, MessageId(n), 30);
        }
        fx.log.message_error(w, Some(p), MessageId(100), false);
        fx.log.message_dropped(w, Some(p), MessageId(101), None, false);

        let snapshot = fx.snapshot_at(1_000);
        assert!((snapshot.services["w"].error_rate - 0.25).abs() < 1e-9);
        // A node with failures but no sends reports zero, not infinity.
        fx.log.message_error(p, None, MessageId(102), false);
        let snapshot = fx.snapshot_at(1_000);
        assert_eq!(snapshot.services["p"].error_rate, 0.0);
    }

    // -----------------------------------------------------------------------
    // 4. Latency percentiles use nearest rank
    // -----------------------------------------------------------------------
    #[test]
    fn p95_uses_nearest_rank_of_sorted_samples() {
        let mut fx = two_node_fixture();
        let p = fx.node("p");
        fx.log.set_time(1_000);
        // 100 samples with latencies 1..=100, emitted out of order.
        for n in (1..=100u64).rev() {
            fx.log.message_sent(p, MessageId(n), n as u32);
        }

        let snapshot = fx.snapshot_at(1_000);
        let service = &snapshot.services["p"];
        assert_eq!(service.p95_latency_ms, 96.0);
        assert!((service.avg_latency_ms - 50.5).abs() < 1e-6);
    }

    #[test]
    fn latency_includes_spike_markers_with_magnitude() {
        let mut fx = two_node_fixture();
        let w = fx.node("w");
        fx.log.set_time(1_000);
        fx.log.message_sent(w, MessageId(1), 10);
        fx.log.latency_spike(w, Some(400), true);
        // Transition markers without magnitude stay out of the sample.
        fx.log.latency_spike(w, None, false);

        let snapshot = fx.snapshot_at(1_000);
        assert!((snapshot.services["w"].avg_latency_ms - 205.0).abs() < 1e-9);
    }

    // -----------------------------------------------------------------------
    // 5. Health scoring
    // -----------------------------------------------------------------------
    #[test]
    fn health_penalizes_errors_saturation_and_latency() {
        let mut fx = two_node_fixture();
        let p = fx.node("p");
        let w = fx.node("w");
        fx.log.set_time(1_000);

        // Clean node: full health.
        let snapshot = fx.snapshot_at(1_000);
        assert_eq!(snapshot.services["p"].health_score, 1.0);

        // All-failing node: 1 - 0.6*1.0 = 0.4 with no queue or latency.
        fx.log.message_sent(w, MessageId(1), 0);
        fx.log.message_error(w, Some(p), MessageId(1), false);
        let snapshot = fx.snapshot_at(1_000);
        assert!((snapshot.services["w"].health_score - 0.4).abs() < 1e-9);
        assert!(snapshot.overall_health_score < 1.0);
    }

    #[test]
    fn health_floors_at_zero() {
        let mut fx = two_node_fixture();
        let p = fx.node("p");
        let w = fx.node("w");
        fx.log.set_time(1_000);
        // Max out every penalty: 100% errors, huge latency, deep queue.
        fx.log.message_sent(w, MessageId(1), 5_000);
        fx.log.message_error(w, Some(p), MessageId(1), false);
        let runtime = fx.runtimes.get_mut(w).unwrap();
        for n in 0..500 {
            runtime.inbox.push_back(crate::message::IncomingMessage {
                message: crate::message::Message::new(MessageId(n), 0),
                from: p,
                received_at_ms: 0,
            });
        }

        let snapshot = fx.snapshot_at(1_000);
        assert_eq!(snapshot.services["w"].health_score, 0.0);
    }

    // -----------------------------------------------------------------------
    // 6. Bottleneck selection
    // -----------------------------------------------------------------------
    #[test]
    fn bottleneck_is_lowest_throughput_earliest_wins_ties() {
        let mut fx = Fixture::new(
            vec![
                NodeSpec::new("a", "producer"),
                NodeSpec::new("b", "worker"),
                NodeSpec::new("c", "worker"),
            ],
            vec![("a", "b"), ("a", "c")],
        );
        let a = fx.node("a");
        fx.log.set_time(1_000);
        fx.log.message_sent(a, MessageId(1), 0);

        // b and c are tied at zero; b appears first in the topology.
        let snapshot = fx.snapshot_at(1_000);
        assert_eq!(snapshot.bottleneck_node_id.as_deref(), Some("b"));
    }

    // -----------------------------------------------------------------------
    // 7. Archetype-specific fields
    // -----------------------------------------------------------------------
    #[test]
    fn breaker_state_and_consumer_lag_appear_only_where_relevant() {
        let fx = Fixture::new(
            vec![
                NodeSpec::new("p", "producer"),
                NodeSpec::new("cb", "circuit_breaker"),
                NodeSpec::new("cg", "consumer_group"),
            ],
            vec![("p", "cb"), ("cb", "cg")],
        );

        let snapshot = fx.snapshot_at(1_000);
        assert_eq!(
            snapshot.services["cb"].circuit_breaker_state,
            Some(BreakerPhase::Closed)
        );
        assert_eq!(snapshot.services["cb"].consumer_lag, None);
        assert_eq!(snapshot.services["cg"].consumer_lag, Some(0));
        assert_eq!(snapshot.services["p"].circuit_breaker_state, None);
    }

    // -----------------------------------------------------------------------
    // 8. Wire format
    // -----------------------------------------------------------------------
    #[test]
    fn snapshot_serializes_camel_case_with_optional_fields_elided() {
        let fx = Fixture::new(
            vec![
                NodeSpec::new("p", "producer"),
                NodeSpec::new("cb", "circuit_breaker"),
            ],
            vec![("p", "cb")],
        );
        let snapshot = fx.snapshot_at(2_000);
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["runId"], "run-test");
        assert_eq!(json["virtualTimeMs"], 2_000);
        let p = &json["services"]["p"];
        assert!(p.get("throughputPerSec").is_some());
        assert!(p.get("healthScore").is_some());
        // Producer has no breaker state; the key must be absent, not null.
        assert!(p.get("circuitBreakerState").is_none());
        assert_eq!(json["services"]["cb"]["circuitBreakerState"], "closed");
        assert!(json.get("bottleneckNodeId").is_some());
    }

    #[test]
    fn empty_topology_window_yields_zeroed_snapshot() {
        let fx = two_node_fixture();
        let snapshot = fx.snapshot_at(0);
        assert_eq!(snapshot.total_throughput, 0.0);
        assert_eq!(snapshot.overall_health_score, 1.0);
        assert_eq!(snapshot.services.len(), 2);
    }
}
