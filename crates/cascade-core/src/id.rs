use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

new_key_type! {
    /// Identifies a service node in the topology.
    pub struct NodeId;

    /// Identifies a directed edge (dependency link) in the topology.
    pub struct EdgeId;
}

/// Identifies a message for the duration of one run. Cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

/// Hands out sequential message ids. Engine-owned; restarts from zero on reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageIdGen {
    next: u64,
}

impl MessageIdGen {
    pub fn next_id(&mut self) -> MessageId {
        let id = MessageId(self.next);
        self.next += 1;
        id
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }
}
