//! Message identity and lifecycle tracking.
//!
//! Every message has exactly one authoritative lifecycle state for the
//! duration of a run:
//!
//! ```text
//! in_flight ──> routing_to_dlq ──> dlq
//!     └───────────> delivered
//! ```
//!
//! `delivered` and `dlq` are terminal and idempotent: once reached, later
//! deliveries for the same id are silently skipped. This is what prevents a
//! message from looping into the dead-letter sink more than once when
//! several downstream edges fail for it in the same tick.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::id::{MessageId, NodeId};

/// A message traveling through the topology. Small and `Copy`; the engine's
/// delivery queue owns the authoritative copy until the lifecycle ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Virtual time at which the producer manufactured this message.
    pub created_at_ms: u64,
    /// Optional end-to-end latency budget carried as metadata. Models may
    /// consult it; none of the built-in archetypes enforce it.
    pub latency_budget_ms: Option<u32>,
}

impl Message {
    pub fn new(id: MessageId, created_at_ms: u64) -> Self {
        Self {
            id,
            created_at_ms,
            latency_budget_ms: None,
        }
    }
}

/// An inbox entry: a message plus where and when it arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub message: Message,
    pub from: NodeId,
    pub received_at_ms: u64,
}

/// Lifecycle state of one message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    InFlight,
    RoutingToDlq,
    Delivered,
    Dlq,
}

impl MessageState {
    /// Terminal states accept no further deliveries or transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Delivered | MessageState::Dlq)
    }
}

/// Engine-owned table of message lifecycle states.
///
/// Messages the table has never seen are `in_flight`: the state only becomes
/// interesting once a failure or a terminal receipt happens.
#[derive(Debug, Clone, Default)]
pub struct LifecycleTable {
    states: HashMap<MessageId, MessageState>,
}

impl LifecycleTable {
    pub fn state(&self, id: MessageId) -> MessageState {
        self.states
            .get(&id)
            .copied()
            .unwrap_or(MessageState::InFlight)
    }

    pub fn set(&mut self, id: MessageId, state: MessageState) {
        self.states.insert(id, state);
    }

    /// Transition `in_flight -> routing_to_dlq`. Returns false (and changes
    /// nothing) if the message already left `in_flight`, which is how a
    /// second failure event for the same message becomes a no-op.
    pub fn begin_dlq_routing(&mut self, id: MessageId) -> bool {
        if self.state(id) != MessageState::InFlight {
            return false;
        }
        self.states.insert(id, MessageState::RoutingToDlq);
        true
    }

    /// Whether a delivery of `id` to `target_is_dlq` should be skipped.
    ///
    /// Terminal messages skip everything; `routing_to_dlq` messages are only
    /// deliverable to dead-letter nodes.
    pub fn should_skip_delivery(&self, id: MessageId, target_is_dlq: bool) -> bool {
        match self.state(id) {
            MessageState::Delivered | MessageState::Dlq => true,
            MessageState::RoutingToDlq => !target_is_dlq,
            MessageState::InFlight => false,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    /// Count of messages currently in the given state. Tracked states only;
    /// untracked (implicitly in-flight) messages are not counted.
    pub fn count_in(&self, state: MessageState) -> usize {
        self.states.values().filter(|s| **s == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_messages_are_in_flight() {
        let table = LifecycleTable::default();
        assert_eq!(table.state(MessageId(7)), MessageState::InFlight);
    }

    #[test]
    fn begin_dlq_routing_only_from_in_flight() {
        let mut table = LifecycleTable::default();
        let id = MessageId(0);

        assert!(table.begin_dlq_routing(id));
        assert_eq!(table.state(id), MessageState::RoutingToDlq);

        // Second failure for the same message is a no-op.
        assert!(!table.begin_dlq_routing(id));

        table.set(id, MessageState::Dlq);
        assert!(!table.begin_dlq_routing(id));
        assert_eq!(table.state(id), MessageState::Dlq);
    }

    #[test]
    fn terminal_states_skip_all_deliveries() {
        let mut table = LifecycleTable::default();
        let id = MessageId(1);
        table.set(id, MessageState::Delivered);
        assert!(table.should_skip_delivery(id, false));
        assert!(table.should_skip_delivery(id, true));

        table.set(id, MessageState::Dlq);
        assert!(table.should_skip_delivery(id, false));
        assert!(table.should_skip_delivery(id, true));
    }

    #[test]
    fn routing_to_dlq_only_reaches_dlq_nodes() {
        let mut table = LifecycleTable::default();
        let id = MessageId(2);
        table.begin_dlq_routing(id);
        assert!(table.should_skip_delivery(id, false));
        assert!(!table.should_skip_delivery(id, true));
    }

    #[test]
    fn in_flight_messages_deliver_anywhere() {
        let table = LifecycleTable::default();
        assert!(!table.should_skip_delivery(MessageId(3), false));
        assert!(!table.should_skip_delivery(MessageId(3), true));
    }
}
