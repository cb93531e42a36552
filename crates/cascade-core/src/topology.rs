//! Immutable service topology.
//!
//! A topology arrives once, at engine construction, as a [`TopologySpec`]
//! (the serde-facing shape external tools produce: string ids, camelCase
//! tunables). Construction validates it and interns everything into slotmap
//! keys; the engine never mutates it during a run. Snapshots translate back
//! to the original string ids so external consumers see the names they
//! configured.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap};

use crate::error::TopologyError;
use crate::fixed::{Fixed64, f64_to_fixed64};
use crate::id::{EdgeId, NodeId};

// ---------------------------------------------------------------------------
// Spec structs (external contract)
// ---------------------------------------------------------------------------

/// Per-node routing behavior for ordinary forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Pick exactly one target, by deterministic hash of the message id.
    #[default]
    Single,
    /// Deliver to every eligible target.
    Broadcast,
}

/// One node as configured by the caller. Unset tunables fall back to
/// per-archetype defaults at use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_per_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_hit_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_timeout_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefetch_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_refresh_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipart_threshold_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_capacity: Option<f64>,
    /// Terminal service: a received message finalizes as `delivered`.
    #[serde(default)]
    pub sink: bool,
    #[serde(default)]
    pub routing_mode: RoutingMode,
}

impl NodeSpec {
    /// Minimal spec with everything else defaulted.
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            label: String::new(),
            latency_ms: None,
            throughput_per_sec: None,
            replicas: None,
            partitions: None,
            failure_rate: None,
            timeout_ms: None,
            cache_hit_rate: None,
            circuit_breaker_threshold: None,
            ack_timeout_ms: None,
            prefetch_count: None,
            index_refresh_ms: None,
            multipart_threshold_mb: None,
            rate_limit_per_sec: None,
            burst_capacity: None,
            sink: false,
            routing_mode: RoutingMode::Single,
        }
    }
}

/// One directed edge as configured by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSpec {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
}

/// The full caller-facing topology description.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologySpec {
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

// ---------------------------------------------------------------------------
// Node kinds
// ---------------------------------------------------------------------------

/// Service archetypes. One behavior model per kind; selection happens once
/// at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Producer,
    Kafka,
    Rabbitmq,
    Worker,
    Database,
    Postgresql,
    Cassandra,
    Elasticsearch,
    S3,
    Cache,
    Redis,
    LoadBalancer,
    ApiGateway,
    RateLimiter,
    CircuitBreaker,
    DeadLetterQueue,
    ConsumerGroup,
}

impl NodeKind {
    /// Parse the wire name used by topology specs.
    pub fn from_wire(kind: &str) -> Option<Self> {
        Some(match kind {
            "producer" => NodeKind::Producer,
            "kafka" => NodeKind::Kafka,
            "rabbitmq" => NodeKind::Rabbitmq,
            "worker" => NodeKind::Worker,
            "database" => NodeKind::Database,
            "postgresql" => NodeKind::Postgresql,
            "cassandra" => NodeKind::Cassandra,
            "elasticsearch" => NodeKind::Elasticsearch,
            "s3" => NodeKind::S3,
            "cache" => NodeKind::Cache,
            "redis" => NodeKind::Redis,
            "load_balancer" => NodeKind::LoadBalancer,
            "api_gateway" => NodeKind::ApiGateway,
            "rate_limiter" => NodeKind::RateLimiter,
            "circuit_breaker" => NodeKind::CircuitBreaker,
            "dead_letter_queue" => NodeKind::DeadLetterQueue,
            "consumer_group" => NodeKind::ConsumerGroup,
            _ => return None,
        })
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            NodeKind::Producer => "producer",
            NodeKind::Kafka => "kafka",
            NodeKind::Rabbitmq => "rabbitmq",
            NodeKind::Worker => "worker",
            NodeKind::Database => "database",
            NodeKind::Postgresql => "postgresql",
            NodeKind::Cassandra => "cassandra",
            NodeKind::Elasticsearch => "elasticsearch",
            NodeKind::S3 => "s3",
            NodeKind::Cache => "cache",
            NodeKind::Redis => "redis",
            NodeKind::LoadBalancer => "load_balancer",
            NodeKind::ApiGateway => "api_gateway",
            NodeKind::RateLimiter => "rate_limiter",
            NodeKind::CircuitBreaker => "circuit_breaker",
            NodeKind::DeadLetterQueue => "dead_letter_queue",
            NodeKind::ConsumerGroup => "consumer_group",
        }
    }
}

// ---------------------------------------------------------------------------
// Interned configuration
// ---------------------------------------------------------------------------

/// A node's tunables after interning: fractional values converted to
/// fixed-point once, so the tick loop never touches floats. Unset fields
/// keep per-archetype defaults (resolved at use, like the models describe).
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub latency_ms: Option<u32>,
    pub throughput_per_sec: Option<Fixed64>,
    pub replicas: Option<u32>,
    pub partitions: Option<u32>,
    pub failure_rate: Option<Fixed64>,
    pub timeout_ms: Option<u32>,
    pub cache_hit_rate: Option<Fixed64>,
    pub circuit_breaker_threshold: Option<Fixed64>,
    pub ack_timeout_ms: Option<u32>,
    pub prefetch_count: Option<u32>,
    pub index_refresh_ms: Option<u32>,
    pub multipart_threshold_mb: Option<u32>,
    pub rate_limit_per_sec: Option<Fixed64>,
    pub burst_capacity: Option<Fixed64>,
    pub sink: bool,
    pub routing_mode: RoutingMode,
}

impl NodeConfig {
    fn from_spec(spec: &NodeSpec) -> Self {
        Self {
            latency_ms: spec.latency_ms,
            throughput_per_sec: spec.throughput_per_sec.map(f64_to_fixed64),
            replicas: spec.replicas,
            partitions: spec.partitions,
            failure_rate: spec.failure_rate.map(f64_to_fixed64),
            timeout_ms: spec.timeout_ms,
            cache_hit_rate: spec.cache_hit_rate.map(f64_to_fixed64),
            circuit_breaker_threshold: spec.circuit_breaker_threshold.map(f64_to_fixed64),
            ack_timeout_ms: spec.ack_timeout_ms,
            prefetch_count: spec.prefetch_count,
            index_refresh_ms: spec.index_refresh_ms,
            multipart_threshold_mb: spec.multipart_threshold_mb,
            rate_limit_per_sec: spec.rate_limit_per_sec.map(f64_to_fixed64),
            burst_capacity: spec.burst_capacity.map(f64_to_fixed64),
            sink: spec.sink,
            routing_mode: spec.routing_mode,
        }
    }
}

/// An interned node: original string id, display label, kind, tunables.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub name: String,
    pub label: String,
    pub kind: NodeKind,
    pub config: NodeConfig,
}

/// An interned edge.
#[derive(Debug, Clone)]
pub struct EdgeEntry {
    pub name: String,
    pub source: NodeId,
    pub target: NodeId,
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Validated, interned, immutable topology.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: SlotMap<NodeId, NodeEntry>,
    edges: SlotMap<EdgeId, EdgeEntry>,
    outgoing: SecondaryMap<NodeId, Vec<EdgeId>>,
    /// Node ids in spec order. Tick iteration and tie-breaking follow this.
    order: Vec<NodeId>,
    by_name: HashMap<String, NodeId>,
    /// Dead-letter nodes in spec order; first entry is the global fallback
    /// target for failure rerouting.
    dlq_nodes: Vec<NodeId>,
}

impl Topology {
    /// Validate and intern a spec. Any configuration problem fails the whole
    /// build; there is no partially-constructed topology.
    pub fn build(spec: &TopologySpec) -> Result<Self, TopologyError> {
        if spec.nodes.is_empty() {
            return Err(TopologyError::Empty);
        }

        let mut nodes = SlotMap::with_key();
        let mut by_name = HashMap::new();
        let mut order = Vec::with_capacity(spec.nodes.len());
        let mut dlq_nodes = Vec::new();

        for node_spec in &spec.nodes {
            let kind = NodeKind::from_wire(&node_spec.kind).ok_or_else(|| {
                TopologyError::UnknownNodeType {
                    node: node_spec.id.clone(),
                    kind: node_spec.kind.clone(),
                }
            })?;

            let label = if node_spec.label.is_empty() {
                node_spec.id.clone()
            } else {
                node_spec.label.clone()
            };

            let id = nodes.insert(NodeEntry {
                name: node_spec.id.clone(),
                label,
                kind,
                config: NodeConfig::from_spec(node_spec),
            });

            if by_name.insert(node_spec.id.clone(), id).is_some() {
                return Err(TopologyError::DuplicateNodeId {
                    node: node_spec.id.clone(),
                });
            }
            order.push(id);
            if kind == NodeKind::DeadLetterQueue {
                dlq_nodes.push(id);
            }
        }

        let mut edges = SlotMap::with_key();
        let mut outgoing: SecondaryMap<NodeId, Vec<EdgeId>> = SecondaryMap::new();
        let mut edge_names = HashMap::new();

        for node in &order {
            outgoing.insert(*node, Vec::new());
        }

        for edge_spec in &spec.edges {
            let source = *by_name.get(&edge_spec.source_id).ok_or_else(|| {
                TopologyError::EdgeEndpointMissing {
                    edge: edge_spec.id.clone(),
                    node: edge_spec.source_id.clone(),
                }
            })?;
            let target = *by_name.get(&edge_spec.target_id).ok_or_else(|| {
                TopologyError::EdgeEndpointMissing {
                    edge: edge_spec.id.clone(),
                    node: edge_spec.target_id.clone(),
                }
            })?;

            let id = edges.insert(EdgeEntry {
                name: edge_spec.id.clone(),
                source,
                target,
            });
            if edge_names.insert(edge_spec.id.clone(), id).is_some() {
                return Err(TopologyError::DuplicateEdgeId {
                    edge: edge_spec.id.clone(),
                });
            }
            outgoing[source].push(id);
        }

        Ok(Self {
            nodes,
            edges,
            outgoing,
            order,
            by_name,
            dlq_nodes,
        })
    }

    pub fn node(&self, id: NodeId) -> &NodeEntry {
        &self.nodes[id]
    }

    pub fn edge(&self, id: EdgeId) -> &EdgeEntry {
        &self.edges[id]
    }

    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.nodes[id].kind
    }

    pub fn config(&self, id: NodeId) -> &NodeConfig {
        &self.nodes[id].config
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id].name
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    /// Node ids in spec order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn node_count(&self) -> usize {
        self.order.len()
    }

    /// Outgoing edges of a node, in spec order.
    pub fn outgoing(&self, id: NodeId) -> &[EdgeId] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct downstream neighbor nodes, in edge spec order.
    pub fn downstream(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.outgoing(id).iter().map(|edge| self.edges[*edge].target)
    }

    pub fn is_dlq(&self, id: NodeId) -> bool {
        self.nodes[id].kind == NodeKind::DeadLetterQueue
    }

    pub fn dlq_nodes(&self) -> &[NodeId] {
        &self.dlq_nodes
    }
}
