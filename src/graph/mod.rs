//! Typed worker graphs.
//!
//! A graph is an ordered DAG of nodes sharing one element type. Each node
//! wraps a [`Worker`] and forwards whatever the worker emits to its
//! downstream nodes in edge-insertion order. Wiring happens once through
//! [`GraphBuilder`]; the resulting [`Graph`] is immutable.

pub mod builder;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use crate::error::{GraphError, WorkerError};

pub use builder::{GraphBuilder, NodeBuilder};
pub use registry::{ErasedGraph, GraphRegistry};

/// Identifier of a graph: numeric id plus a human readable name.
///
/// The numeric id is what travels on the wire; the name is for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphId {
    id: u32,
    name: &'static str,
}

impl GraphId {
    pub const fn new(id: u32, name: &'static str) -> Self {
        Self { id, name }
    }

    pub const fn id(&self) -> u32 {
        self.id
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Index of a node inside its graph, assigned in insertion order.
pub type NodeId = u32;

/// Result of processing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Continue downstream with this record.
    Forward(T),
    /// Stop traversal; the worker consumed the record.
    Terminate,
}

/// Stage a worker plays in the pipeline. Used to drive stage flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Aggregation,
    RemoteDispatch,
    Persistence,
    Custom,
}

impl WorkerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aggregation => "aggregation",
            Self::RemoteDispatch => "remote_dispatch",
            Self::Persistence => "persistence",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A processing unit driven by a graph node.
///
/// `process` runs on the caller's task and must not block. Workers that hold
/// windowed state return it from `flush`; the graph forwards the drained
/// records to the worker's downstream nodes.
pub trait Worker<T>: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> WorkerKind;

    /// Called once by the builder with the worker's position in the graph.
    fn attach(&self, _graph: GraphId, _node: NodeId) {}

    fn process(&self, record: T) -> Result<Outcome<T>, WorkerError>;

    /// Drains windowed state. Stateless workers return nothing.
    fn flush(&self) -> Vec<T> {
        Vec::new()
    }
}

pub(crate) struct Node<T> {
    pub(crate) worker: Arc<dyn Worker<T>>,
    pub(crate) next: Vec<NodeId>,
}

/// An immutable, wired graph.
pub struct Graph<T> {
    id: GraphId,
    nodes: Vec<Node<T>>,
    roots: Vec<NodeId>,
}

impl<T: Clone + Send + 'static> Graph<T> {
    pub(crate) fn new(id: GraphId, nodes: Vec<Node<T>>, roots: Vec<NodeId>) -> Self {
        Self { id, nodes, roots }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Worker name and kind at a node, if present.
    pub fn worker_at(&self, node: NodeId) -> Option<(&'static str, WorkerKind)> {
        self.nodes
            .get(node as usize)
            .map(|n| (n.worker.name(), n.worker.kind()))
    }

    /// Ingests a record at every root node.
    pub fn push(&self, record: T) -> Result<(), GraphError> {
        self.fan_out(&self.roots, record)
    }

    /// Pushes a record into a specific node, running its worker.
    pub fn push_to(&self, node: NodeId, record: T) -> Result<(), GraphError> {
        let target = self.node(node)?;
        let outcome = target
            .worker
            .process(record)
            .map_err(|source| GraphError::Worker {
                graph: self.id,
                worker: target.worker.name(),
                source,
            })?;

        match outcome {
            Outcome::Forward(record) => self.fan_out(&target.next, record),
            Outcome::Terminate => Ok(()),
        }
    }

    /// Delivers a record to the downstream nodes of `node`, skipping its
    /// worker. Used when a record re-enters the graph from a peer.
    pub fn push_after(&self, node: NodeId, record: T) -> Result<(), GraphError> {
        let source = self.node(node)?;
        self.fan_out(&source.next, record)
    }

    /// Flushes every worker of the given kind and forwards the drained
    /// records downstream. Nodes are visited in insertion order, which is a
    /// topological order, so upstream output reaches downstream windows
    /// before those are flushed in a later pass.
    ///
    /// Returns the number of records drained. Per-record forwarding failures
    /// are logged and do not stop the flush.
    pub fn flush_stage(&self, kind: WorkerKind) -> usize {
        let mut drained = 0usize;

        for (idx, node) in self.nodes.iter().enumerate() {
            if node.worker.kind() != kind {
                continue;
            }

            let records = node.worker.flush();
            drained += records.len();

            for record in records {
                if let Err(e) = self.fan_out(&node.next, record) {
                    tracing::warn!(
                        graph = %self.id,
                        node = idx,
                        error = %e,
                        "dropping flushed record",
                    );
                }
            }
        }

        drained
    }

    fn node(&self, node: NodeId) -> Result<&Node<T>, GraphError> {
        self.nodes
            .get(node as usize)
            .ok_or(GraphError::NodeNotFound {
                graph: self.id,
                node,
            })
    }

    fn fan_out(&self, targets: &[NodeId], record: T) -> Result<(), GraphError> {
        let Some((last, rest)) = targets.split_last() else {
            return Ok(());
        };

        for &target in rest {
            self.push_to(target, record.clone())?;
        }
        self.push_to(*last, record)
    }
}

impl<T> fmt::Debug for Graph<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("nodes", &self.nodes.len())
            .field("roots", &self.roots)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Probe;
    use super::*;

    const ID: GraphId = GraphId::new(1, "sample");

    #[test]
    fn test_graph_id_display() {
        assert_eq!(GraphId::new(400, "service_heart_beat").to_string(), "service_heart_beat(400)");
    }

    #[test]
    fn test_push_forwards_in_chain() {
        let (a, seen_a) = Probe::new("a", true);
        let (b, seen_b) = Probe::new("b", true);
        let (c, seen_c) = Probe::new("c", false);

        let mut builder = GraphBuilder::new(ID);
        builder.add_node(a).add_next(b).add_next(c);
        let graph = builder.build().expect("build");

        graph.push(1).expect("push");

        assert_eq!(*seen_a.lock(), vec![1]);
        assert_eq!(*seen_b.lock(), vec![2]);
        assert_eq!(*seen_c.lock(), vec![3]);
    }

    #[test]
    fn test_terminate_stops_traversal() {
        let (a, _) = Probe::new("a", false);
        let (b, seen_b) = Probe::new("b", true);

        let mut builder = GraphBuilder::new(ID);
        builder.add_node(a).add_next(b);
        let graph = builder.build().expect("build");

        graph.push(5).expect("push");
        assert!(seen_b.lock().is_empty());
    }

    #[test]
    fn test_fan_out_in_insertion_order() {
        let (head, _) = Probe::new("head", true);
        let (left, seen_left) = Probe::new("left", false);
        let (right, seen_right) = Probe::new("right", false);

        let mut builder = GraphBuilder::new(ID);
        let head = builder.add_node(head).id();
        builder.node(head).expect("head").add_next(left);
        builder.node(head).expect("head").add_next(right);
        let graph = builder.build().expect("build");

        graph.push(10).expect("push");
        assert_eq!(*seen_left.lock(), vec![11]);
        assert_eq!(*seen_right.lock(), vec![11]);
    }

    #[test]
    fn test_worker_error_propagates() {
        let (a, _) = Probe::new("a", true);
        let mut builder = GraphBuilder::new(ID);
        builder.add_node(a);
        let graph = builder.build().expect("build");

        let err = graph.push(-1).expect_err("negative must fail");
        assert!(matches!(err, GraphError::Worker { worker: "a", .. }));
    }

    #[test]
    fn test_push_after_skips_worker() {
        let (a, seen_a) = Probe::new("a", true);
        let (b, seen_b) = Probe::new("b", false);

        let mut builder = GraphBuilder::new(ID);
        builder.add_node(a).add_next(b);
        let graph = builder.build().expect("build");

        graph.push_after(0, 42).expect("push_after");
        assert!(seen_a.lock().is_empty());
        assert_eq!(*seen_b.lock(), vec![42]);

        assert!(matches!(
            graph.push_after(9, 1),
            Err(GraphError::NodeNotFound { node: 9, .. })
        ));
    }

    #[test]
    fn test_flush_stage_forwards_drained() {
        let (agg, _) = Probe::new("agg", false);
        let agg = agg.with_kind(WorkerKind::Aggregation);
        let (sink, seen_sink) = Probe::new("sink", false);

        let mut builder = GraphBuilder::new(ID);
        builder.add_node(agg).add_next(sink);
        let graph = builder.build().expect("build");

        graph.push(1).expect("push");
        graph.push(2).expect("push");
        assert!(seen_sink.lock().is_empty());

        assert_eq!(graph.flush_stage(WorkerKind::Persistence), 0);
        assert_eq!(graph.flush_stage(WorkerKind::Aggregation), 2);
        assert_eq!(*seen_sink.lock(), vec![1, 2]);
        assert_eq!(graph.flush_stage(WorkerKind::Aggregation), 0);
    }
}
