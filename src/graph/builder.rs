use std::sync::Arc;

use crate::error::GraphError;

use super::{Graph, GraphId, Node, NodeId, Worker};

/// Mutable wiring stage of a graph. Consumed by [`GraphBuilder::build`].
pub struct GraphBuilder<T> {
    id: GraphId,
    nodes: Vec<Node<T>>,
    roots: Vec<NodeId>,
}

impl<T: Clone + Send + 'static> GraphBuilder<T> {
    pub fn new(id: GraphId) -> Self {
        Self {
            id,
            nodes: Vec::with_capacity(4),
            roots: Vec::with_capacity(1),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    /// Adds a root node; records pushed into the graph enter here.
    pub fn add_node<W>(&mut self, worker: W) -> NodeBuilder<'_, T>
    where
        W: Worker<T> + 'static,
    {
        let node = self.insert(Arc::new(worker));
        self.roots.push(node);
        NodeBuilder {
            graph: self,
            node,
        }
    }

    /// Reopens an existing node to add more downstream edges (fan-out).
    pub fn node(&mut self, node: NodeId) -> Result<NodeBuilder<'_, T>, GraphError> {
        if node as usize >= self.nodes.len() {
            return Err(GraphError::NodeNotFound {
                graph: self.id,
                node,
            });
        }
        Ok(NodeBuilder { graph: self, node })
    }

    /// Freezes the wiring and attaches every worker to its position.
    pub fn build(self) -> Result<Graph<T>, GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::InvalidWiring {
                graph: self.id,
                reason: "graph has no nodes".to_string(),
            });
        }

        for (idx, node) in self.nodes.iter().enumerate() {
            node.worker.attach(self.id, idx as NodeId);
        }

        tracing::debug!(
            graph = %self.id,
            nodes = self.nodes.len(),
            "graph wired",
        );

        Ok(Graph::new(self.id, self.nodes, self.roots))
    }

    fn insert(&mut self, worker: Arc<dyn Worker<T>>) -> NodeId {
        let node = self.nodes.len() as NodeId;
        self.nodes.push(Node {
            worker,
            next: Vec::with_capacity(1),
        });
        node
    }
}

/// Handle to one node while wiring. `add_next` returns the new child so
/// chains read top to bottom.
pub struct NodeBuilder<'a, T> {
    graph: &'a mut GraphBuilder<T>,
    node: NodeId,
}

impl<'a, T: Clone + Send + 'static> NodeBuilder<'a, T> {
    pub fn id(&self) -> NodeId {
        self.node
    }

    pub fn add_next<W>(self, worker: W) -> NodeBuilder<'a, T>
    where
        W: Worker<T> + 'static,
    {
        let child = self.graph.insert(Arc::new(worker));
        self.graph.nodes[self.node as usize].next.push(child);
        NodeBuilder {
            graph: self.graph,
            node: child,
        }
    }
}
