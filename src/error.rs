//! Error taxonomy shared by the graph engine and its collaborators.
//!
//! Network and storage failures are recovered inside the worker that hits
//! them. Only graph lookup and wiring errors are meant to reach callers.

use thiserror::Error;

use crate::graph::GraphId;

/// Errors raised while building, registering or looking up graphs.
#[derive(Debug, Error)]
pub enum GraphError {
    /// No graph has been created under this id.
    #[error("graph {0} not found")]
    NotFound(GraphId),

    /// No graph is registered under this raw id (remote re-entry path).
    #[error("graph id {0} not registered")]
    UnknownId(u32),

    /// The graph exists but carries a different element type.
    #[error("graph {id} holds {actual}, requested {requested}")]
    TypeMismatch {
        id: GraphId,
        actual: &'static str,
        requested: &'static str,
    },

    /// A node index outside the graph was addressed.
    #[error("graph {graph} has no node {node}")]
    NodeNotFound { graph: GraphId, node: u32 },

    /// Wiring was attempted with an invalid layout.
    #[error("invalid wiring for graph {graph}: {reason}")]
    InvalidWiring { graph: GraphId, reason: String },

    /// A worker failed while wiring the graph.
    #[error("building worker {worker} for graph {graph}")]
    Build {
        graph: GraphId,
        worker: &'static str,
        #[source]
        source: ModuleError,
    },

    /// A stage-local processing failure surfaced through `push`.
    #[error("worker {worker} in graph {graph} failed")]
    Worker {
        graph: GraphId,
        worker: &'static str,
        #[source]
        source: WorkerError,
    },
}

/// Stage-local failures reported by `Worker::process`.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The record cannot be processed (missing identity, bad fields).
    #[error("malformed record: {0}")]
    Malformed(String),

    /// The worker was used before the graph attached it to a node.
    #[error("worker {0} is not attached to a graph node")]
    Detached(&'static str),

    /// Payload (de)serialization failed.
    #[error("serializing record: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Remote transport failures. Never propagated past the dispatch worker.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The member has no reachable endpoint.
    #[error("member {0} unreachable")]
    Unreachable(String),

    /// The send queue is at capacity; the envelope was shed.
    #[error("remote send queue full")]
    Backpressure,

    /// The sender has been shut down.
    #[error("remote sender closed")]
    Closed,

    /// A request exceeded its timeout.
    #[error("remote send to {0} timed out")]
    Timeout(String),

    /// The peer answered with a non-success status or refused the request.
    #[error("remote send to {member} rejected: {reason}")]
    Rejected { member: String, reason: String },
}

impl NetworkError {
    /// Short label used for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Backpressure => "backpressure",
            Self::Closed => "closed",
            Self::Timeout(_) => "timeout",
            Self::Rejected { .. } => "rejected",
        }
    }
}

/// Storage collaborator failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The row cannot be written as given.
    #[error("invalid row for table {table}: {reason}")]
    InvalidRow { table: String, reason: String },

    /// The backend rejected or failed the operation.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// The write queue is at capacity.
    #[error("storage write queue full")]
    QueueFull,
}

/// Module lookup failures during worker construction.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Nothing is registered under this module name.
    #[error("module {0} not found")]
    NotFound(String),

    /// The module exists but provides a different service type.
    #[error("module {name} does not provide {requested}")]
    TypeMismatch {
        name: String,
        requested: &'static str,
    },
}
