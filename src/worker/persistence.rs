use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use crate::data::PersistenceData;
use crate::error::{ModuleError, StorageError, WorkerError};
use crate::graph::{GraphId, NodeId, Outcome, Worker, WorkerKind};
use crate::module::{ModuleManager, STORAGE, TELEMETRY};
use crate::storage::StorageWriter;
use crate::telemetry::HealthMetrics;

use super::window::KeyedWindow;
use super::WorkerFactory;

/// Terminal stage: merges records by id and, on flush, upserts one row per
/// id through the storage writer.
pub struct PersistenceWorker<T> {
    name: &'static str,
    label: OnceLock<String>,
    window: KeyedWindow<T>,
    writer: StorageWriter,
    telemetry: Option<Arc<HealthMetrics>>,
}

impl<T: PersistenceData> PersistenceWorker<T> {
    pub fn new(
        name: &'static str,
        writer: StorageWriter,
        telemetry: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            name,
            label: OnceLock::new(),
            window: KeyedWindow::new(1024),
            writer,
            telemetry,
        }
    }

    pub fn pending(&self) -> usize {
        self.window.len()
    }

    fn graph_label(&self) -> &str {
        self.label.get().map(String::as_str).unwrap_or(self.name)
    }
}

impl<T: PersistenceData> Worker<T> for PersistenceWorker<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Persistence
    }

    fn attach(&self, graph: GraphId, _node: NodeId) {
        let _ = self.label.set(graph.to_string());
    }

    fn process(&self, record: T) -> Result<Outcome<T>, WorkerError> {
        self.window.merge(record)?;
        Ok(Outcome::Terminate)
    }

    /// Hands every buffered row to the writer. Nothing flows downstream.
    fn flush(&self) -> Vec<T> {
        let drained = self.window.drain();
        if drained.is_empty() {
            return Vec::new();
        }

        let mut submitted = 0usize;
        for record in &drained {
            match self.writer.submit(T::TABLE, record.to_row()) {
                Ok(()) => submitted += 1,
                // Already logged by the writer.
                Err(StorageError::QueueFull) => {}
                Err(e) => {
                    tracing::warn!(table = T::TABLE, id = %record.id(), error = %e, "persistence submit failed");
                }
            }
        }

        if let Some(t) = &self.telemetry {
            let graph = self.graph_label();
            let stage = WorkerKind::Persistence.as_str();
            t.window_flushes.with_label_values(&[graph, stage]).inc();
            t.flushed_records
                .with_label_values(&[graph, stage])
                .inc_by(submitted as u64);
        }

        tracing::debug!(
            worker = self.name,
            table = T::TABLE,
            submitted,
            dropped = drained.len() - submitted,
            "persistence window flushed",
        );

        Vec::new()
    }
}

/// Factory for [`PersistenceWorker`]. Requires the `storage` module.
pub struct PersistenceWorkerFactory<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PersistenceWorkerFactory<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }
}

impl<T: PersistenceData> WorkerFactory<T> for PersistenceWorkerFactory<T> {
    type Worker = PersistenceWorker<T>;

    fn worker_name(&self) -> &'static str {
        self.name
    }

    fn build(&self, modules: &ModuleManager) -> Result<Self::Worker, ModuleError> {
        let writer = modules.find::<StorageWriter>(STORAGE)?;
        let telemetry = modules.find_optional::<Arc<HealthMetrics>>(TELEMETRY)?;
        Ok(PersistenceWorker::new(self.name, writer, telemetry))
    }
}
