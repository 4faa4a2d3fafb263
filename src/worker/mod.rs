//! Worker variants, their factories and the creation listener.

pub mod aggregation;
pub mod persistence;
pub mod remote;
pub mod window;

use tokio::sync::mpsc;

use crate::error::{GraphError, ModuleError};
use crate::graph::{GraphId, Worker, WorkerKind};
use crate::module::ModuleManager;

pub use aggregation::{AggregationWorker, AggregationWorkerFactory};
pub use persistence::{PersistenceWorker, PersistenceWorkerFactory};
pub use remote::{RemoteDispatchWorker, RemoteDispatchWorkerFactory};
pub use window::KeyedWindow;

/// Emitted once for every worker constructed during graph assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCreated {
    pub graph: GraphId,
    pub worker: &'static str,
    pub kind: WorkerKind,
}

/// Observer of worker construction, backed by an unbounded channel so
/// notifying never blocks assembly.
#[derive(Debug, Clone, Default)]
pub struct WorkerCreateListener {
    tx: Option<mpsc::UnboundedSender<WorkerCreated>>,
}

impl WorkerCreateListener {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkerCreated>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A listener that discards events.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn notify(&self, event: WorkerCreated) {
        tracing::debug!(graph = %event.graph, worker = event.worker, kind = %event.kind, "worker created");
        self.deliver(event);
    }

    /// A listener whose events are held back until `StagedEvents::commit`.
    /// Dropping the `StagedEvents` discards them.
    pub fn staged(&self) -> (Self, StagedEvents) {
        let (staging, rx) = Self::channel();
        let staged = StagedEvents {
            target: self.clone(),
            rx,
        };
        (staging, staged)
    }

    fn deliver(&self, event: WorkerCreated) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::debug!("worker create listener closed");
            }
        }
    }
}

/// Worker creation events waiting on their graph to be registered.
#[derive(Debug)]
pub struct StagedEvents {
    target: WorkerCreateListener,
    rx: mpsc::UnboundedReceiver<WorkerCreated>,
}

impl StagedEvents {
    /// Forwards every held event to the original listener.
    pub fn commit(mut self) -> usize {
        let mut forwarded = 0;
        while let Ok(event) = self.rx.try_recv() {
            self.target.deliver(event);
            forwarded += 1;
        }
        forwarded
    }
}

/// Builds one worker variant from the services in the module manager.
pub trait WorkerFactory<T> {
    type Worker: Worker<T> + 'static;

    fn worker_name(&self) -> &'static str;

    /// Resolves collaborators and constructs the worker.
    fn build(&self, modules: &ModuleManager) -> Result<Self::Worker, ModuleError>;

    /// Builds the worker and notifies the listener exactly once, before the
    /// worker is wired into a graph.
    fn create(
        &self,
        graph: GraphId,
        modules: &ModuleManager,
        listener: &WorkerCreateListener,
    ) -> Result<Self::Worker, GraphError> {
        let worker = self.build(modules).map_err(|source| GraphError::Build {
            graph,
            worker: self.worker_name(),
            source,
        })?;

        listener.notify(WorkerCreated {
            graph,
            worker: worker.name(),
            kind: worker.kind(),
        });

        Ok(worker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::graph::Outcome;

    struct Echo;

    impl Worker<u8> for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn kind(&self) -> WorkerKind {
            WorkerKind::Custom
        }

        fn process(&self, record: u8) -> Result<Outcome<u8>, WorkerError> {
            Ok(Outcome::Forward(record))
        }
    }

    struct EchoFactory {
        needs: Option<&'static str>,
    }

    impl WorkerFactory<u8> for EchoFactory {
        type Worker = Echo;

        fn worker_name(&self) -> &'static str {
            "echo"
        }

        fn build(&self, modules: &ModuleManager) -> Result<Echo, ModuleError> {
            if let Some(name) = self.needs {
                modules.find::<String>(name)?;
            }
            Ok(Echo)
        }
    }

    const GRAPH: GraphId = GraphId::new(3, "echo");

    #[test]
    fn test_create_notifies_once() {
        let (listener, mut rx) = WorkerCreateListener::channel();
        let modules = ModuleManager::new();

        EchoFactory { needs: None }
            .create(GRAPH, &modules, &listener)
            .expect("create");

        let event = rx.try_recv().expect("event");
        assert_eq!(
            event,
            WorkerCreated {
                graph: GRAPH,
                worker: "echo",
                kind: WorkerKind::Custom,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_missing_module_fails_without_notify() {
        let (listener, mut rx) = WorkerCreateListener::channel();
        let modules = ModuleManager::new();

        let err = EchoFactory {
            needs: Some("remote"),
        }
        .create(GRAPH, &modules, &listener)
        .err()
        .expect("missing module");

        assert!(matches!(
            err,
            GraphError::Build {
                source: ModuleError::NotFound(_),
                ..
            }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_noop_listener_accepts_events() {
        WorkerCreateListener::noop().notify(WorkerCreated {
            graph: GRAPH,
            worker: "echo",
            kind: WorkerKind::Custom,
        });
    }

    #[test]
    fn test_staged_events_wait_for_commit() {
        let (listener, mut rx) = WorkerCreateListener::channel();
        let modules = ModuleManager::new();

        let (staging, staged) = listener.staged();
        EchoFactory { needs: None }
            .create(GRAPH, &modules, &staging)
            .expect("create");
        assert!(rx.try_recv().is_err());
        assert_eq!(staged.commit(), 1);
        assert_eq!(rx.try_recv().expect("event").worker, "echo");

        let (staging, staged) = listener.staged();
        EchoFactory { needs: None }
            .create(GRAPH, &modules, &staging)
            .expect("create");
        drop(staged);
        assert!(rx.try_recv().is_err());
    }
}
