use crate::fingerprint::Fingerprint;
use crate::kind::NodeId;
use thiserror::Error;

/// Top-level error type for flow operations.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error("construction error: {0}")]
    Construction(#[from] ConstructionError),

    #[error(transparent)]
    Node(#[from] NodeFailure),

    #[error(transparent)]
    Resource(#[from] ResourceFailure),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("execution cancelled")]
    Cancelled,
}

/// Graph wiring is malformed. Raised while adding nodes or during the
/// one-time input validation pass; retrying without changing the graph
/// will not help.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstructionError {
    #[error("node id already added: {0}")]
    DuplicateNodeId(NodeId),

    #[error("node {node_id} binds parameter '{param}' to unknown node {referent}")]
    UnknownReferent {
        node_id: NodeId,
        param: String,
        referent: NodeId,
    },

    #[error("adding node {0} would introduce a cycle")]
    Cycle(NodeId),

    #[error("node {node_id}: unknown parameter '{param}'")]
    UnknownParameter { node_id: NodeId, param: String },

    #[error("node {node_id}: missing parameter '{param}'")]
    MissingParameter { node_id: NodeId, param: String },

    #[error("node {node_id}: parameter '{param}' expected {expected}, got {actual}")]
    TypeMismatch {
        node_id: NodeId,
        param: String,
        expected: String,
        actual: String,
    },

    #[error("node {0} is not a constant node")]
    NotAConstant(NodeId),

    #[error("unknown node id: {0}")]
    UnknownNode(NodeId),
}

/// Errors produced inside a processor's `init`, `process` or `release`.
///
/// The executor wraps these with node identity before they surface as
/// [`NodeFailure`] or [`ResourceFailure`].
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("missing required input: {0}")]
    MissingInput(String),

    #[error("invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Failed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl ProcessError {
    pub fn failed(msg: impl Into<String>) -> Self {
        ProcessError::Failed(msg.into())
    }
}

/// A node's `process` call failed. Aborts the current run; in batch mode it
/// is recorded in the report and the next item continues.
#[derive(Error, Debug)]
#[error("node {node_id} ({name}) failed: {source}")]
pub struct NodeFailure {
    pub node_id: NodeId,
    pub name: String,
    pub fingerprint: Fingerprint,
    #[source]
    pub source: ProcessError,
}

/// Which resource-lifecycle hook failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePhase {
    Init,
    Release,
}

impl std::fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourcePhase::Init => write!(f, "init"),
            ResourcePhase::Release => write!(f, "release"),
        }
    }
}

/// A node's `init` or `release` failed. Propagates like [`NodeFailure`] but
/// is distinguishable so batch callers can choose to abort outright (e.g.
/// the GPU is gone).
#[derive(Error, Debug)]
#[error("{phase} failed for node {node_id} ({name}): {source}")]
pub struct ResourceFailure {
    pub node_id: NodeId,
    pub name: String,
    pub phase: ResourcePhase,
    #[source]
    pub source: ProcessError,
}

/// Persistence-layer errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("no persistence location bound")]
    NotBound,
}

/// Result type for flow operations.
pub type Result<T> = std::result::Result<T, FlowError>;
