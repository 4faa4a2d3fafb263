//! Service name heartbeats.
//!
//! Agents report a heartbeat per (application, service) endpoint. The
//! collector keeps the latest heartbeat for each and persists it to the
//! `service_name` table, which the UI queries for live services.

pub mod ui;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::data::{PersistenceData, StreamData};
use crate::error::GraphError;
use crate::graph::{Graph, GraphRegistry};
use crate::module::ModuleManager;
use crate::storage::{ColumnType, Row, TableSchema, Value};
use crate::worker::{
    AggregationWorkerFactory, PersistenceWorkerFactory, RemoteDispatchWorkerFactory,
    WorkerCreateListener, WorkerFactory,
};

use super::SERVICE_HEART_BEAT_PERSISTENCE_GRAPH_ID;

pub use ui::{ServiceInfo, ServiceNameUiDao};

pub const TABLE: &str = "service_name";

pub const SERVICE_ID: &str = "service_id";
pub const SERVICE_NAME: &str = "service_name";
pub const APPLICATION_ID: &str = "application_id";
pub const SRC_SPAN_TYPE: &str = "src_span_type";
pub const HEARTBEAT_TIME: &str = "heartbeat_time";

pub const SCHEMA: TableSchema = TableSchema {
    table: TABLE,
    columns: &[
        (SERVICE_ID, ColumnType::Int32),
        (SERVICE_NAME, ColumnType::String),
        (APPLICATION_ID, ColumnType::Int32),
        (SRC_SPAN_TYPE, ColumnType::Int32),
        (HEARTBEAT_TIME, ColumnType::Int64),
    ],
};

/// Last seen heartbeat of one service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceName {
    pub service_id: i32,
    pub service_name: String,
    pub application_id: i32,
    pub src_span_type: i32,
    pub heartbeat_time: i64,
}

impl ServiceName {
    fn rank(&self) -> (i64, i32, i32) {
        (self.heartbeat_time, self.service_id, self.src_span_type)
    }
}

impl StreamData for ServiceName {
    fn id(&self) -> String {
        if self.service_name.is_empty() {
            return String::new();
        }
        format!("{}_{}", self.application_id, self.service_name)
    }

    /// Latest heartbeat wins. Ties on time fall back to the remaining
    /// fields so the result does not depend on arrival order.
    fn merge(&mut self, other: &Self) {
        if other.rank() > self.rank() {
            self.service_id = other.service_id;
            self.src_span_type = other.src_span_type;
            self.heartbeat_time = other.heartbeat_time;
        }
    }
}

impl PersistenceData for ServiceName {
    const TABLE: &'static str = TABLE;

    fn version(&self) -> i64 {
        self.heartbeat_time
    }

    fn to_row(&self) -> Row {
        Row::new(self.id(), self.heartbeat_time)
            .with(SERVICE_ID, Value::Int(self.service_id.into()))
            .with(SERVICE_NAME, Value::Str(self.service_name.clone()))
            .with(APPLICATION_ID, Value::Int(self.application_id.into()))
            .with(SRC_SPAN_TYPE, Value::Int(self.src_span_type.into()))
            .with(HEARTBEAT_TIME, Value::Int(self.heartbeat_time))
    }
}

/// Wires the heartbeat graph: aggregation, then remote dispatch to the
/// owning member, then persistence.
pub struct ServiceNameHeartBeatGraph {
    modules: Arc<ModuleManager>,
    listener: WorkerCreateListener,
}

impl ServiceNameHeartBeatGraph {
    pub fn new(modules: Arc<ModuleManager>, listener: WorkerCreateListener) -> Self {
        Self { modules, listener }
    }

    pub fn create(&self, registry: &GraphRegistry) -> Result<Arc<Graph<ServiceName>>, GraphError> {
        let id = SERVICE_HEART_BEAT_PERSISTENCE_GRAPH_ID;
        // Events reach the listener only once the graph is registered.
        let (staging, staged) = self.listener.staged();

        let graph = registry.create_if_absent(id, |graph| {
            let aggregation = AggregationWorkerFactory::<ServiceName>::new("service_name_aggregation")
                .create(id, &self.modules, &staging)?;
            let remote = RemoteDispatchWorkerFactory::<ServiceName>::new("service_name_heart_beat_remote")
                .create(id, &self.modules, &staging)?;
            let persistence =
                PersistenceWorkerFactory::<ServiceName>::new("service_name_heart_beat_persistence")
                    .create(id, &self.modules, &staging)?;

            graph.add_node(aggregation).add_next(remote).add_next(persistence);
            Ok(())
        })?;

        staged.commit();
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::cluster::{ClusterView, Member};
    use crate::error::ModuleError;
    use crate::graph::WorkerKind;
    use crate::module::{CLUSTER, REMOTE, STORAGE};
    use crate::remote::{LoopbackSender, RemoteSender};
    use crate::storage::{MemoryStorage, Storage, StorageWriter};

    fn beat(name: &str, app: i32, time: i64) -> ServiceName {
        ServiceName {
            service_id: 1,
            service_name: name.to_string(),
            application_id: app,
            src_span_type: 0,
            heartbeat_time: time,
        }
    }

    #[test]
    fn test_id_from_application_and_name() {
        assert_eq!(beat("A", 7, 0).id(), "7_A");
        assert_eq!(beat("", 7, 0).id(), "");
    }

    #[test]
    fn test_merge_keeps_latest() {
        let mut state = beat("A", 7, 100);
        let mut newer = beat("A", 7, 150);
        newer.service_id = 9;
        state.merge(&newer);
        state.merge(&beat("A", 7, 120));

        assert_eq!(state.heartbeat_time, 150);
        assert_eq!(state.service_id, 9);
    }

    #[test]
    fn test_row_carries_every_column() {
        let row = beat("A", 7, 150).to_row();
        assert_eq!(row.id, "7_A");
        assert_eq!(row.version, 150);
        for (column, _) in SCHEMA.columns {
            assert!(row.get(column).is_some(), "missing {column}");
        }
        assert_eq!(row.get_str(SERVICE_NAME), Some("A"));
        assert_eq!(row.get_i64(APPLICATION_ID), Some(7));
    }

    #[tokio::test]
    async fn test_create_wires_three_stages_once() {
        let modules = Arc::new(ModuleManager::new());
        let local = Member::new("127.0.0.1:11800");
        modules.register(CLUSTER, Arc::new(ClusterView::standalone(local)));
        modules.register::<Arc<dyn RemoteSender>>(REMOTE, Arc::new(LoopbackSender::new()));
        let storage = Arc::new(Storage::Memory(Arc::new(MemoryStorage::new())));
        let (writer, _handle) = StorageWriter::start(storage, 8, 1, None, CancellationToken::new());
        modules.register(STORAGE, writer);

        let (listener, mut rx) = WorkerCreateListener::channel();
        let registry = GraphRegistry::new();
        let assembly = ServiceNameHeartBeatGraph::new(modules, listener);

        let graph = assembly.create(&registry).expect("create");
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.worker_at(0).map(|(_, k)| k), Some(WorkerKind::Aggregation));
        assert_eq!(graph.worker_at(1).map(|(_, k)| k), Some(WorkerKind::RemoteDispatch));
        assert_eq!(graph.worker_at(2).map(|(_, k)| k), Some(WorkerKind::Persistence));

        let again = assembly.create(&registry).expect("create again");
        assert!(Arc::ptr_eq(&graph, &again));

        let mut created = 0;
        while rx.try_recv().is_ok() {
            created += 1;
        }
        assert_eq!(created, 3);
    }

    #[test]
    fn test_create_without_remote_module_fails() {
        let modules = Arc::new(ModuleManager::new());
        modules.register(
            CLUSTER,
            Arc::new(ClusterView::standalone(Member::new("127.0.0.1:11800"))),
        );
        let registry = GraphRegistry::new();
        let (listener, mut rx) = WorkerCreateListener::channel();

        let err = ServiceNameHeartBeatGraph::new(modules, listener)
            .create(&registry)
            .err()
            .expect("remote missing");
        assert!(matches!(
            err,
            GraphError::Build {
                source: ModuleError::NotFound(_),
                ..
            }
        ));
        assert!(registry.is_empty());
        // The aggregation worker was built before the remote lookup failed.
        assert!(rx.try_recv().is_err());
    }
}
