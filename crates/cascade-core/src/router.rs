//! Delivery scheduling and target selection.
//!
//! Every message handoff goes through the [`DeliveryQueue`], a min-heap
//! ordered by delivery time with a monotonic sequence number breaking ties.
//! Two messages scheduled for the same virtual instant therefore arrive in
//! the order they were scheduled, which keeps runs reproducible.
//!
//! [`route_message`] is the single fan-out policy: callers never pick edges
//! themselves (the one exception being an explicit target override, used by
//! load balancers and failure rerouting).

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::id::{MessageId, NodeId};
use crate::injector::FailureOutcome;
use crate::message::{LifecycleTable, Message};
use crate::topology::{RoutingMode, Topology};

// ---------------------------------------------------------------------------
// Delivery queue
// ---------------------------------------------------------------------------

/// A message in transit: scheduled, not yet drained.
#[derive(Debug, Clone, Copy)]
pub struct ScheduledDelivery {
    pub deliver_at_ms: u64,
    /// Tie-breaker among deliveries due at the same instant.
    pub seq: u64,
    pub message: Message,
    pub from: NodeId,
    pub target: NodeId,
    /// When set, the drain step records this outcome instead of delivering.
    pub forced: Option<FailureOutcome>,
    pub failure_injected: bool,
}

impl Ord for ScheduledDelivery {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deliver_at_ms, self.seq).cmp(&(other.deliver_at_ms, other.seq))
    }
}

impl PartialOrd for ScheduledDelivery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledDelivery {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScheduledDelivery {}

/// Time-ordered pending deliveries.
#[derive(Debug, Clone, Default)]
pub struct DeliveryQueue {
    heap: BinaryHeap<Reverse<ScheduledDelivery>>,
    next_seq: u64,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deliver_at_ms: u64, message: Message, from: NodeId, target: NodeId) {
        self.schedule_outcome(deliver_at_ms, message, from, target, None, false);
    }

    /// Schedule with an optional forced outcome and failure provenance.
    pub fn schedule_outcome(
        &mut self,
        deliver_at_ms: u64,
        message: Message,
        from: NodeId,
        target: NodeId,
        forced: Option<FailureOutcome>,
        failure_injected: bool,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(ScheduledDelivery {
            deliver_at_ms,
            seq,
            message,
            from,
            target,
            forced,
            failure_injected,
        }));
    }

    /// Pop the earliest delivery due at or before `now_ms`, if any.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<ScheduledDelivery> {
        match self.heap.peek() {
            Some(Reverse(next)) if next.deliver_at_ms <= now_ms => {
                self.heap.pop().map(|Reverse(delivery)| delivery)
            }
            _ => None,
        }
    }

    pub fn has_due(&self, now_ms: u64) -> bool {
        matches!(self.heap.peek(), Some(Reverse(next)) if next.deliver_at_ms <= now_ms)
    }

    /// Delivery time of the earliest pending entry.
    pub fn next_due_at(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(next)| next.deliver_at_ms)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.next_seq = 0;
    }
}

// ---------------------------------------------------------------------------
// Target selection
// ---------------------------------------------------------------------------

/// Deterministic index into a candidate list, keyed by message id.
///
/// The id bits go through an avalanche mix first so sequential ids spread
/// evenly instead of cycling through the candidates in lockstep.
fn scatter_index(id: MessageId, len: usize) -> usize {
    let mut z = id.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z % len as u64) as usize
}

/// Routing parameters beyond the message itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteOptions<'a> {
    pub latency_ms: u32,
    /// Explicit target subset. Filters the full downstream set and bypasses
    /// both mode selection and the dead-letter preference.
    pub only_targets: Option<&'a [NodeId]>,
    /// Forward as a synthesized outcome instead of a real delivery.
    pub forced: Option<FailureOutcome>,
    pub failure_injected: bool,
}

impl<'a> RouteOptions<'a> {
    pub fn with_latency(latency_ms: u32) -> Self {
        Self {
            latency_ms,
            ..Self::default()
        }
    }
}

/// Fan a message out of `source` along its outgoing edges.
///
/// Selection rules, in order:
/// - `only_targets`, when given, filters the full downstream set and
///   bypasses mode selection entirely; every surviving target is scheduled.
/// - Otherwise dead-letter targets are excluded while at least one ordinary
///   target exists, and the node's [`RoutingMode`] picks from the rest.
///
/// Deliveries land at `now_ms + latency_ms`. Targets the lifecycle table
/// refuses (terminal messages, DLQ-bound messages headed anywhere but a
/// DLQ) are skipped. Returns the number of deliveries actually scheduled.
pub fn route_message(
    topology: &Topology,
    lifecycle: &LifecycleTable,
    queue: &mut DeliveryQueue,
    now_ms: u64,
    source: NodeId,
    message: Message,
    options: RouteOptions<'_>,
) -> u32 {
    let candidates: Vec<NodeId> = topology.downstream(source).collect();
    if candidates.is_empty() {
        return 0;
    }

    let chosen: Vec<NodeId> = if let Some(filter) = options.only_targets {
        candidates
            .into_iter()
            .filter(|target| filter.contains(target))
            .collect()
    } else {
        let non_dlq: Vec<NodeId> = candidates
            .iter()
            .copied()
            .filter(|target| !topology.is_dlq(*target))
            .collect();
        let pool = if non_dlq.is_empty() { candidates } else { non_dlq };
        match topology.config(source).routing_mode {
            RoutingMode::Single => {
                vec![pool[scatter_index(message.id, pool.len())]]
            }
            RoutingMode::Broadcast => pool,
        }
    };

    let mut fanout = 0;
    for target in chosen {
        if lifecycle.should_skip_delivery(message.id, topology.is_dlq(target)) {
            continue;
        }
        queue.schedule_outcome(
            now_ms + u64::from(options.latency_ms),
            message,
            source,
            target,
            options.forced,
            options.failure_injected,
        );
        fanout += 1;
    }
    fanout
}
