use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use crate::cluster::{ClusterView, Placement};
use crate::data::StreamData;
use crate::error::{ModuleError, WorkerError};
use crate::graph::{GraphId, NodeId, Outcome, Worker, WorkerKind};
use crate::module::{ModuleManager, CLUSTER, REMOTE, TELEMETRY};
use crate::remote::{RemoteEnvelope, RemoteSender};
use crate::telemetry::HealthMetrics;

use super::WorkerFactory;

struct Position {
    graph: GraphId,
    node: NodeId,
    label: String,
}

/// Routes each record to the member that owns its id.
///
/// Locally owned records continue to the next stage synchronously. Others
/// are serialized and handed to the remote sender; a failed hand-off is
/// logged and counted, and the record is dropped. Errors never reach the
/// caller for network reasons.
pub struct RemoteDispatchWorker<T> {
    name: &'static str,
    cluster: Arc<ClusterView>,
    sender: Arc<dyn RemoteSender>,
    position: OnceLock<Position>,
    telemetry: Option<Arc<HealthMetrics>>,
    _marker: PhantomData<fn(T)>,
}

impl<T: StreamData> RemoteDispatchWorker<T> {
    pub fn new(
        name: &'static str,
        cluster: Arc<ClusterView>,
        sender: Arc<dyn RemoteSender>,
        telemetry: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            name,
            cluster,
            sender,
            position: OnceLock::new(),
            telemetry,
            _marker: PhantomData,
        }
    }
}

impl<T: StreamData> Worker<T> for RemoteDispatchWorker<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::RemoteDispatch
    }

    fn attach(&self, graph: GraphId, node: NodeId) {
        let _ = self.position.set(Position {
            graph,
            node,
            label: graph.to_string(),
        });
    }

    fn process(&self, record: T) -> Result<Outcome<T>, WorkerError> {
        let position = self
            .position
            .get()
            .ok_or(WorkerError::Detached(self.name))?;

        let key = record.id();
        if key.is_empty() {
            return Err(WorkerError::Malformed("record has an empty id".to_string()));
        }

        let target = match self.cluster.place(&key) {
            Placement::Local => return Ok(Outcome::Forward(record)),
            Placement::Remote(member) => member,
        };

        let envelope = RemoteEnvelope {
            graph_id: position.graph.id(),
            node_id: position.node,
            payload: serde_json::to_string(&record)?,
            routing_key: key,
        };

        match self.sender.send(&target, envelope) {
            Ok(()) => {
                if let Some(t) = &self.telemetry {
                    t.remote_sent.with_label_values(&[target.as_str()]).inc();
                }
            }
            Err(e) => {
                tracing::warn!(
                    graph = %position.graph,
                    member = %target,
                    error = %e,
                    "remote send failed, dropping record",
                );
                if let Some(t) = &self.telemetry {
                    t.remote_failures.with_label_values(&[e.reason()]).inc();
                    t.records_dropped
                        .with_label_values(&[&position.label, e.reason()])
                        .inc();
                }
            }
        }

        Ok(Outcome::Terminate)
    }
}

/// Factory for [`RemoteDispatchWorker`]. Requires the `cluster` and
/// `remote` modules.
pub struct RemoteDispatchWorkerFactory<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RemoteDispatchWorkerFactory<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }
}

impl<T: StreamData> WorkerFactory<T> for RemoteDispatchWorkerFactory<T> {
    type Worker = RemoteDispatchWorker<T>;

    fn worker_name(&self) -> &'static str {
        self.name
    }

    fn build(&self, modules: &ModuleManager) -> Result<Self::Worker, ModuleError> {
        let cluster = modules.find::<Arc<ClusterView>>(CLUSTER)?;
        let sender = modules.find::<Arc<dyn RemoteSender>>(REMOTE)?;
        let telemetry = modules.find_optional::<Arc<HealthMetrics>>(TELEMETRY)?;
        Ok(RemoteDispatchWorker::new(self.name, cluster, sender, telemetry))
    }
}
