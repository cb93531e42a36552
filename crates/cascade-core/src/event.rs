//! Engine-scoped event log.
//!
//! Every observable fact in a run — sends, receipts, drops, errors, crash
//! and recovery transitions, latency spikes, partition splits — lands here
//! as an immutable [`SimEvent`]. The log is append-only and never reordered:
//! the engine's lifecycle scan reads it through a cursor, and metrics
//! aggregation reads it through trailing time windows.
//!
//! The log is a plain engine field, owned for exactly one run and cleared on
//! reset. Nothing in this crate holds global mutable state.

use serde::{Deserialize, Serialize};

use crate::id::{MessageId, NodeId};

/// The closed set of event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessageSent,
    MessageReceived,
    MessageDropped,
    MessageError,
    NodeCrashed,
    NodeRecovered,
    LatencySpike,
    PartitionSplit,
}

/// One immutable event. `source` is the node the fact is attributed to;
/// message-flow events carry the message id, node-status events do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimEvent {
    /// Position in the log; doubles as a stable event id.
    pub seq: u64,
    /// Virtual time of emission.
    pub timestamp_ms: u64,
    pub kind: EventKind,
    pub source: NodeId,
    pub target: Option<NodeId>,
    pub message: Option<MessageId>,
    pub latency_ms: Option<u32>,
    /// True when the outcome was forced by the failure injector (crash
    /// drops, injected spikes) rather than produced by a node's own model.
    pub failure_injected: bool,
}

/// Append-only event log with the current virtual time stamped on emission.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<SimEvent>,
    now_ms: u64,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the timestamp applied to subsequent events.
    pub fn set_time(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn all(&self) -> &[SimEvent] {
        &self.events
    }

    /// Events appended at or after the given cursor position.
    pub fn from_seq(&self, seq: usize) -> &[SimEvent] {
        &self.events[seq.min(self.events.len())..]
    }

    /// Index of the first event with `timestamp_ms >= start_ms`. Timestamps
    /// are non-decreasing, so this is a binary search.
    pub fn window_start(&self, start_ms: u64) -> usize {
        self.events.partition_point(|e| e.timestamp_ms < start_ms)
    }

    /// Events inside the trailing window starting at `start_ms`.
    pub fn window(&self, start_ms: u64) -> &[SimEvent] {
        &self.events[self.window_start(start_ms)..]
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.now_ms = 0;
    }

    fn push(
        &mut self,
        kind: EventKind,
        source: NodeId,
        target: Option<NodeId>,
        message: Option<MessageId>,
        latency_ms: Option<u32>,
        failure_injected: bool,
    ) {
        let seq = self.events.len() as u64;
        self.events.push(SimEvent {
            seq,
            timestamp_ms: self.now_ms,
            kind,
            source,
            target,
            message,
            latency_ms,
            failure_injected,
        });
    }

    // -----------------------------------------------------------------------
    // Emission helpers, one per kind
    // -----------------------------------------------------------------------

    pub fn message_sent(&mut self, source: NodeId, message: MessageId, latency_ms: u32) {
        self.push(
            EventKind::MessageSent,
            source,
            None,
            Some(message),
            Some(latency_ms),
            false,
        );
    }

    pub fn message_received(&mut self, from: NodeId, target: NodeId, message: MessageId) {
        self.push(
            EventKind::MessageReceived,
            from,
            Some(target),
            Some(message),
            None,
            false,
        );
    }

    pub fn message_dropped(
        &mut self,
        source: NodeId,
        target: Option<NodeId>,
        message: MessageId,
        latency_ms: Option<u32>,
        failure_injected: bool,
    ) {
        self.push(
            EventKind::MessageDropped,
            source,
            target,
            Some(message),
            latency_ms,
            failure_injected,
        );
    }

    pub fn message_error(
        &mut self,
        source: NodeId,
        target: Option<NodeId>,
        message: MessageId,
        failure_injected: bool,
    ) {
        self.push(
            EventKind::MessageError,
            source,
            target,
            Some(message),
            None,
            failure_injected,
        );
    }

    pub fn node_crashed(&mut self, node: NodeId) {
        self.push(EventKind::NodeCrashed, node, None, None, None, true);
    }

    pub fn node_recovered(&mut self, node: NodeId) {
        self.push(EventKind::NodeRecovered, node, None, None, None, true);
    }

    pub fn latency_spike(&mut self, node: NodeId, latency_ms: Option<u32>, failure_injected: bool) {
        self.push(
            EventKind::LatencySpike,
            node,
            None,
            None,
            latency_ms,
            failure_injected,
        );
    }

    pub fn partition_split(&mut self, node: NodeId) {
        self.push(EventKind::PartitionSplit, node, None, None, None, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn node_ids(n: usize) -> Vec<NodeId> {
        let mut map: SlotMap<NodeId, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    #[test]
    fn events_are_sequenced_and_timestamped() {
        let ids = node_ids(2);
        let mut log = EventLog::new();

        log.set_time(100);
        log.message_sent(ids[0], MessageId(0), 5);
        log.message_received(ids[0], ids[1], MessageId(0));
        log.set_time(200);
        log.message_error(ids[1], Some(ids[0]), MessageId(0), false);

        let events = log.all();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].seq, 0);
        assert_eq!(events[1].seq, 1);
        assert_eq!(events[2].seq, 2);
        assert_eq!(events[0].timestamp_ms, 100);
        assert_eq!(events[2].timestamp_ms, 200);
        assert_eq!(events[2].kind, EventKind::MessageError);
    }

    #[test]
    fn cursor_reads_only_new_events() {
        let ids = node_ids(1);
        let mut log = EventLog::new();
        log.node_crashed(ids[0]);
        let cursor = log.len();
        log.node_recovered(ids[0]);

        let fresh = log.from_seq(cursor);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].kind, EventKind::NodeRecovered);
    }

    #[test]
    fn window_finds_trailing_events() {
        let ids = node_ids(1);
        let mut log = EventLog::new();
        for t in [100u64, 200, 300, 400] {
            log.set_time(t);
            log.latency_spike(ids[0], Some(50), true);
        }

        assert_eq!(log.window(250).len(), 2);
        assert_eq!(log.window(0).len(), 4);
        assert_eq!(log.window(500).len(), 0);
        assert_eq!(log.window(300).len(), 2);
    }

    #[test]
    fn clear_resets_log_and_time() {
        let ids = node_ids(1);
        let mut log = EventLog::new();
        log.set_time(500);
        log.partition_split(ids[0]);
        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.now_ms(), 0);
    }

    #[test]
    fn status_events_carry_no_message_id() {
        let ids = node_ids(1);
        let mut log = EventLog::new();
        log.node_crashed(ids[0]);
        log.latency_spike(ids[0], Some(120), true);
        assert!(log.all().iter().all(|e| e.message.is_none()));
        assert!(log.all().iter().all(|e| e.failure_injected));
    }
}
