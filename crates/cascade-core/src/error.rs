use thiserror::Error;

/// Errors raised while validating a topology at engine construction.
///
/// Configuration problems are fatal: the engine either builds completely or
/// not at all. Per-message failures during a run are modeled as events, not
/// errors (see [`crate::event`]).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("unsupported node type `{kind}` on node `{node}`")]
    UnknownNodeType { node: String, kind: String },

    #[error("duplicate node id `{node}`")]
    DuplicateNodeId { node: String },

    #[error("duplicate edge id `{edge}`")]
    DuplicateEdgeId { edge: String },

    #[error("edge `{edge}` references unknown node `{node}`")]
    EdgeEndpointMissing { edge: String, node: String },

    #[error("topology has no nodes")]
    Empty,
}
