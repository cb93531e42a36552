//! Failure injector: externally-driven fault state.
//!
//! The injector is a pure state holder — crashing a node here has no side
//! effect until the engine's failure-sync step reconciles node flags against
//! it at the top of the next tick. That split keeps fault state fully
//! external to node logic, so a controller (or a chaos schedule) can drive
//! it without touching any node internals.

use std::collections::{HashMap, HashSet};

use crate::fixed::{Fixed64, clamp01};
use crate::id::NodeId;
use crate::rng::SimRng;

/// How a probabilistic failure trial classified a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Processing failed; recorded as a `message_error`.
    Error,
    /// Message silently lost; recorded as a `message_dropped`.
    Drop,
}

#[derive(Debug, Clone, Default)]
pub struct FailureInjector {
    crashed: HashSet<NodeId>,
    latency_spikes: HashMap<NodeId, u32>,
    partition_splits: HashSet<NodeId>,
    down_replicas: HashMap<NodeId, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    // -----------------------------------------------------------------------
    // Crash state
    // -----------------------------------------------------------------------

    pub fn crash_node(&mut self, node: NodeId) {
        self.crashed.insert(node);
    }

    pub fn recover_node(&mut self, node: NodeId) {
        self.crashed.remove(&node);
    }

    pub fn is_crashed(&self, node: NodeId) -> bool {
        self.crashed.contains(&node)
    }

    // -----------------------------------------------------------------------
    // Latency spikes
    // -----------------------------------------------------------------------

    pub fn inject_latency_spike(&mut self, node: NodeId, spike_ms: u32) {
        self.latency_spikes.insert(node, spike_ms);
    }

    pub fn clear_latency_spike(&mut self, node: NodeId) {
        self.latency_spikes.remove(&node);
    }

    /// Active spike magnitude for a node, if any.
    pub fn latency_spike(&self, node: NodeId) -> Option<u32> {
        self.latency_spikes.get(&node).copied().filter(|ms| *ms > 0)
    }

    // -----------------------------------------------------------------------
    // Partition splits (one-shot)
    // -----------------------------------------------------------------------

    pub fn trigger_partition_split(&mut self, node: NodeId) {
        self.partition_splits.insert(node);
    }

    /// Take a pending split trigger. Returns true exactly once per trigger.
    pub fn consume_partition_split(&mut self, node: NodeId) -> bool {
        self.partition_splits.remove(&node)
    }

    // -----------------------------------------------------------------------
    // Consumer replica outages
    // -----------------------------------------------------------------------

    pub fn set_down_replicas(&mut self, node: NodeId, count: u32) {
        if count == 0 {
            self.down_replicas.remove(&node);
        } else {
            self.down_replicas.insert(node, count);
        }
    }

    pub fn down_replicas(&self, node: NodeId) -> u32 {
        self.down_replicas.get(&node).copied().unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Probabilistic gate
    // -----------------------------------------------------------------------

    /// Classify one message trial against a failure rate.
    ///
    /// A single uniform draw lands in the error band with probability
    /// `rate`, else in the drop band with probability `rate / 2`; the two
    /// are mutually exclusive and their combined mass is capped at 1.
    pub fn roll_outcome(rate: Fixed64, rng: &mut SimRng) -> Option<FailureOutcome> {
        let rate = clamp01(rate);
        if rate == Fixed64::ZERO {
            return None;
        }
        let roll = rng.uniform();
        if roll < rate {
            return Some(FailureOutcome::Error);
        }
        let drop_edge = clamp01(rate + rate / 2);
        if roll < drop_edge {
            return Some(FailureOutcome::Drop);
        }
        None
    }

    /// Clear all fault state (run reset).
    pub fn reset(&mut self) {
        self.crashed.clear();
        self.latency_spikes.clear();
        self.partition_splits.clear();
        self.down_replicas.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::f64_to_fixed64;
    use slotmap::SlotMap;

    fn node_ids(n: usize) -> Vec<NodeId> {
        let mut map: SlotMap<NodeId, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn crash_and_recover() {
        let ids = node_ids(2);
        let mut injector = FailureInjector::new();

        injector.crash_node(ids[0]);
        assert!(injector.is_crashed(ids[0]));
        assert!(!injector.is_crashed(ids[1]));

        injector.recover_node(ids[0]);
        assert!(!injector.is_crashed(ids[0]));
    }

    #[test]
    fn latency_spike_roundtrip() {
        let ids = node_ids(1);
        let mut injector = FailureInjector::new();

        assert_eq!(injector.latency_spike(ids[0]), None);
        injector.inject_latency_spike(ids[0], 250);
        assert_eq!(injector.latency_spike(ids[0]), Some(250));
        injector.clear_latency_spike(ids[0]);
        assert_eq!(injector.latency_spike(ids[0]), None);

        // Zero-magnitude spikes are treated as no spike.
        injector.inject_latency_spike(ids[0], 0);
        assert_eq!(injector.latency_spike(ids[0]), None);
    }

    #[test]
    fn partition_split_consumed_exactly_once() {
        let ids = node_ids(1);
        let mut injector = FailureInjector::new();

        assert!(!injector.consume_partition_split(ids[0]));
        injector.trigger_partition_split(ids[0]);
        assert!(injector.consume_partition_split(ids[0]));
        assert!(!injector.consume_partition_split(ids[0]));
    }

    #[test]
    fn down_replicas_tracking() {
        let ids = node_ids(1);
        let mut injector = FailureInjector::new();

        assert_eq!(injector.down_replicas(ids[0]), 0);
        injector.set_down_replicas(ids[0], 2);
        assert_eq!(injector.down_replicas(ids[0]), 2);
        injector.set_down_replicas(ids[0], 0);
        assert_eq!(injector.down_replicas(ids[0]), 0);
    }

    #[test]
    fn roll_outcome_edges() {
        let mut rng = SimRng::new(42);
        for _ in 0..100 {
            assert_eq!(FailureInjector::roll_outcome(Fixed64::ZERO, &mut rng), None);
            assert_eq!(
                FailureInjector::roll_outcome(Fixed64::ONE, &mut rng),
                Some(FailureOutcome::Error)
            );
        }
    }

    #[test]
    fn roll_outcome_distribution() {
        // rate 0.4: ~40% errors, ~20% drops, ~40% clean.
        let mut rng = SimRng::new(777);
        let rate = f64_to_fixed64(0.4);
        let trials = 10_000;
        let mut errors = 0u32;
        let mut drops = 0u32;
        for _ in 0..trials {
            match FailureInjector::roll_outcome(rate, &mut rng) {
                Some(FailureOutcome::Error) => errors += 1,
                Some(FailureOutcome::Drop) => drops += 1,
                None => {}
            }
        }
        assert!(
            (3500..=4500).contains(&errors),
            "expected ~4000 errors, got {errors}"
        );
        assert!(
            (1600..=2400).contains(&drops),
            "expected ~2000 drops, got {drops}"
        );
    }

    #[test]
    fn reset_clears_everything() {
        let ids = node_ids(2);
        let mut injector = FailureInjector::new();
        injector.crash_node(ids[0]);
        injector.inject_latency_spike(ids[1], 100);
        injector.trigger_partition_split(ids[1]);
        injector.set_down_replicas(ids[0], 1);

        injector.reset();

        assert!(!injector.is_crashed(ids[0]));
        assert_eq!(injector.latency_spike(ids[1]), None);
        assert!(!injector.consume_partition_split(ids[1]));
        assert_eq!(injector.down_replicas(ids[0]), 0);
    }
}
