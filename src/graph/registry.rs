use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::data::StreamData;
use crate::error::{GraphError, WorkerError};

use super::{Graph, GraphBuilder, GraphId, NodeId, WorkerKind};

/// Type-erased view of a graph, used by paths that only know the numeric id:
/// remote re-entry and the flush scheduler.
pub trait ErasedGraph: Send + Sync {
    fn id(&self) -> GraphId;

    fn element_type(&self) -> &'static str;

    /// Decodes a JSON payload and delivers it downstream of `node`.
    fn accept_remote(&self, node: NodeId, payload: &[u8]) -> Result<(), GraphError>;

    fn flush_stage(&self, kind: WorkerKind) -> usize;
}

impl<T: StreamData> ErasedGraph for Graph<T> {
    fn id(&self) -> GraphId {
        Graph::id(self)
    }

    fn element_type(&self) -> &'static str {
        type_name::<T>()
    }

    fn accept_remote(&self, node: NodeId, payload: &[u8]) -> Result<(), GraphError> {
        let record: T = serde_json::from_slice(payload).map_err(|e| GraphError::Worker {
            graph: Graph::id(self),
            worker: "remote_receiver",
            source: WorkerError::Codec(e),
        })?;
        self.push_after(node, record)
    }

    fn flush_stage(&self, kind: WorkerKind) -> usize {
        Graph::flush_stage(self, kind)
    }
}

struct Entry {
    id: GraphId,
    element_type: &'static str,
    typed: Arc<dyn Any + Send + Sync>,
    erased: Arc<dyn ErasedGraph>,
}

/// Process-wide table of graphs, keyed by numeric graph id.
///
/// Entries are added during initialization and never removed. The write
/// lock is only taken by `create_if_absent`.
#[derive(Default)]
pub struct GraphRegistry {
    graphs: RwLock<HashMap<u32, Entry>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the graph registered under `id`, or wires and registers a new
    /// one. Concurrent first calls observe exactly one graph; `wire` runs at
    /// most once per id, under the registry write lock, so it must not call
    /// back into the registry.
    pub fn create_if_absent<T, F>(&self, id: GraphId, wire: F) -> Result<Arc<Graph<T>>, GraphError>
    where
        T: StreamData,
        F: FnOnce(&mut GraphBuilder<T>) -> Result<(), GraphError>,
    {
        if let Some(entry) = self.graphs.read().get(&id.id()) {
            return downcast(entry);
        }

        let mut graphs = self.graphs.write();
        if let Some(entry) = graphs.get(&id.id()) {
            return downcast(entry);
        }

        let mut builder = GraphBuilder::new(id);
        wire(&mut builder)?;
        let graph = Arc::new(builder.build()?);

        graphs.insert(
            id.id(),
            Entry {
                id,
                element_type: type_name::<T>(),
                typed: Arc::clone(&graph) as Arc<dyn Any + Send + Sync>,
                erased: Arc::clone(&graph) as Arc<dyn ErasedGraph>,
            },
        );

        tracing::info!(graph = %id, element = type_name::<T>(), "graph registered");

        Ok(graph)
    }

    /// Looks up a registered graph with its element type.
    pub fn find<T: StreamData>(&self, id: GraphId) -> Result<Arc<Graph<T>>, GraphError> {
        match self.graphs.read().get(&id.id()) {
            Some(entry) => downcast(entry),
            None => Err(GraphError::NotFound(id)),
        }
    }

    /// Looks up a graph by its wire id, without knowing its element type.
    pub fn find_erased(&self, id: u32) -> Result<Arc<dyn ErasedGraph>, GraphError> {
        self.graphs
            .read()
            .get(&id)
            .map(|entry| Arc::clone(&entry.erased))
            .ok_or(GraphError::UnknownId(id))
    }

    /// Re-injects a serialized record from a peer into the local graph.
    pub fn accept_remote(&self, graph_id: u32, node: NodeId, payload: &[u8]) -> Result<(), GraphError> {
        self.find_erased(graph_id)?.accept_remote(node, payload)
    }

    /// Snapshot of every registered graph.
    pub fn graphs(&self) -> Vec<Arc<dyn ErasedGraph>> {
        let mut graphs: Vec<_> = self
            .graphs
            .read()
            .values()
            .map(|entry| Arc::clone(&entry.erased))
            .collect();
        graphs.sort_by_key(|g| g.id().id());
        graphs
    }

    pub fn len(&self) -> usize {
        self.graphs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.read().is_empty()
    }
}

fn downcast<T: StreamData>(entry: &Entry) -> Result<Arc<Graph<T>>, GraphError> {
    Arc::clone(&entry.typed)
        .downcast::<Graph<T>>()
        .map_err(|_| GraphError::TypeMismatch {
            id: entry.id,
            actual: entry.element_type,
            requested: type_name::<T>(),
        })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::error::WorkerError;
    use crate::graph::{Outcome, Worker};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Sample {
        key: String,
        value: i64,
    }

    impl StreamData for Sample {
        fn id(&self) -> String {
            self.key.clone()
        }

        fn merge(&mut self, other: &Self) {
            self.value += other.value;
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Other(u8);

    impl StreamData for Other {
        fn id(&self) -> String {
            self.0.to_string()
        }

        fn merge(&mut self, _other: &Self) {}
    }

    struct Pass;

    impl<T: StreamData> Worker<T> for Pass {
        fn name(&self) -> &'static str {
            "pass"
        }

        fn kind(&self) -> WorkerKind {
            WorkerKind::Custom
        }

        fn process(&self, record: T) -> Result<Outcome<T>, WorkerError> {
            Ok(Outcome::Forward(record))
        }
    }

    const SAMPLE_GRAPH: GraphId = GraphId::new(10, "sample");

    #[test]
    fn test_find_missing_fails_fast() {
        let registry = GraphRegistry::new();
        let err = registry.find::<Sample>(SAMPLE_GRAPH).expect_err("missing");
        assert!(matches!(err, GraphError::NotFound(id) if id == SAMPLE_GRAPH));
        assert!(matches!(
            registry.find_erased(99),
            Err(GraphError::UnknownId(99))
        ));
    }

    #[test]
    fn test_create_if_absent_returns_same_graph() {
        let registry = GraphRegistry::new();
        let calls = AtomicUsize::new(0);

        let first = registry
            .create_if_absent::<Sample, _>(SAMPLE_GRAPH, |b| {
                calls.fetch_add(1, Ordering::SeqCst);
                b.add_node(Pass);
                Ok(())
            })
            .expect("create");
        let second = registry
            .create_if_absent::<Sample, _>(SAMPLE_GRAPH, |b| {
                calls.fetch_add(1, Ordering::SeqCst);
                b.add_node(Pass);
                Ok(())
            })
            .expect("create again");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let found = registry.find::<Sample>(SAMPLE_GRAPH).expect("find");
        assert!(Arc::ptr_eq(&first, &found));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_create_is_idempotent() {
        let registry = Arc::new(GraphRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let calls = Arc::clone(&calls);
                std::thread::spawn(move || {
                    registry
                        .create_if_absent::<Sample, _>(SAMPLE_GRAPH, |b| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            b.add_node(Pass);
                            Ok(())
                        })
                        .expect("create")
                })
            })
            .collect();

        let graphs: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for g in &graphs[1..] {
            assert!(Arc::ptr_eq(&graphs[0], g));
        }
    }

    #[test]
    fn test_type_mismatch() {
        let registry = GraphRegistry::new();
        registry
            .create_if_absent::<Sample, _>(SAMPLE_GRAPH, |b| {
                b.add_node(Pass);
                Ok(())
            })
            .expect("create");

        let err = registry.find::<Other>(SAMPLE_GRAPH).expect_err("mismatch");
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
    }

    #[test]
    fn test_failed_wiring_registers_nothing() {
        let registry = GraphRegistry::new();
        let result = registry.create_if_absent::<Sample, _>(SAMPLE_GRAPH, |_| Ok(()));
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_accept_remote_rejects_bad_payload() {
        let registry = GraphRegistry::new();
        registry
            .create_if_absent::<Sample, _>(SAMPLE_GRAPH, |b| {
                b.add_node(Pass).add_next(Pass);
                Ok(())
            })
            .expect("create");

        let good = serde_json::to_vec(&Sample {
            key: "k".into(),
            value: 1,
        })
        .expect("encode");
        registry
            .accept_remote(SAMPLE_GRAPH.id(), 0, &good)
            .expect("accept");

        let err = registry
            .accept_remote(SAMPLE_GRAPH.id(), 0, b"not json")
            .expect_err("bad payload");
        assert!(matches!(
            err,
            GraphError::Worker {
                source: WorkerError::Codec(_),
                ..
            }
        ));
    }
}
