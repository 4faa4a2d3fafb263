use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use crate::data::StreamData;
use crate::error::{ModuleError, WorkerError};
use crate::graph::{GraphId, NodeId, Outcome, Worker, WorkerKind};
use crate::module::{ModuleManager, TELEMETRY};
use crate::telemetry::HealthMetrics;

use super::window::KeyedWindow;
use super::WorkerFactory;

/// Merges incoming records by id and emits one merged record per key on
/// flush. Never forwards from `process`.
pub struct AggregationWorker<T> {
    name: &'static str,
    label: OnceLock<String>,
    window: KeyedWindow<T>,
    telemetry: Option<Arc<HealthMetrics>>,
}

impl<T: StreamData> AggregationWorker<T> {
    pub fn new(name: &'static str, telemetry: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            name,
            label: OnceLock::new(),
            window: KeyedWindow::new(256),
            telemetry,
        }
    }

    /// Keys currently buffered in the open window.
    pub fn pending(&self) -> usize {
        self.window.len()
    }

    fn graph_label(&self) -> &str {
        self.label.get().map(String::as_str).unwrap_or(self.name)
    }
}

impl<T: StreamData> Worker<T> for AggregationWorker<T> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> WorkerKind {
        WorkerKind::Aggregation
    }

    fn attach(&self, graph: GraphId, _node: NodeId) {
        let _ = self.label.set(graph.to_string());
    }

    fn process(&self, record: T) -> Result<Outcome<T>, WorkerError> {
        let merged = self.window.merge(record);

        if let Some(t) = &self.telemetry {
            let graph = self.graph_label();
            match &merged {
                Ok(()) => t.records_ingested.with_label_values(&[graph]).inc(),
                Err(_) => t
                    .records_dropped
                    .with_label_values(&[graph, "malformed"])
                    .inc(),
            }
        }

        merged.map(|()| Outcome::Terminate)
    }

    fn flush(&self) -> Vec<T> {
        let drained = self.window.drain();

        if let Some(t) = &self.telemetry {
            let graph = self.graph_label();
            let stage = WorkerKind::Aggregation.as_str();
            t.window_flushes.with_label_values(&[graph, stage]).inc();
            t.flushed_records
                .with_label_values(&[graph, stage])
                .inc_by(drained.len() as u64);
        }

        if !drained.is_empty() {
            tracing::debug!(worker = self.name, records = drained.len(), "aggregation window flushed");
        }

        drained
    }
}

/// Factory for [`AggregationWorker`]. Telemetry is optional.
pub struct AggregationWorkerFactory<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AggregationWorkerFactory<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }
}

impl<T: StreamData> WorkerFactory<T> for AggregationWorkerFactory<T> {
    type Worker = AggregationWorker<T>;

    fn worker_name(&self) -> &'static str {
        self.name
    }

    fn build(&self, modules: &ModuleManager) -> Result<Self::Worker, ModuleError> {
        let telemetry = modules.find_optional::<Arc<HealthMetrics>>(TELEMETRY)?;
        Ok(AggregationWorker::new(self.name, telemetry))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Latest {
        key: String,
        ts: i64,
    }

    impl StreamData for Latest {
        fn id(&self) -> String {
            self.key.clone()
        }

        fn merge(&mut self, other: &Self) {
            if other.ts > self.ts {
                self.ts = other.ts;
            }
        }
    }

    fn latest(key: &str, ts: i64) -> Latest {
        Latest {
            key: key.to_string(),
            ts,
        }
    }

    #[test]
    fn test_process_terminates_and_flush_emits_once() {
        let worker = AggregationWorker::new("agg", None);
        for ts in [100, 150, 120] {
            assert_eq!(
                worker.process(latest("a", ts)).expect("process"),
                Outcome::Terminate
            );
        }
        assert_eq!(worker.pending(), 1);

        assert_eq!(worker.flush(), vec![latest("a", 150)]);
        assert!(worker.flush().is_empty());
    }

    #[test]
    fn test_metrics_recorded() {
        let metrics = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let worker = AggregationWorker::new("agg", Some(Arc::clone(&metrics)));
        worker.attach(GraphId::new(9, "g"), 0);

        worker.process(latest("a", 1)).expect("process");
        assert!(worker.process(latest("", 1)).is_err());
        worker.flush();

        assert_eq!(
            metrics.records_ingested.with_label_values(&["g(9)"]).get(),
            1
        );
        assert_eq!(
            metrics
                .records_dropped
                .with_label_values(&["g(9)", "malformed"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .flushed_records
                .with_label_values(&["g(9)", "aggregation"])
                .get(),
            1
        );
    }

    #[test]
    fn test_factory_without_telemetry() {
        let modules = ModuleManager::new();
        let worker = AggregationWorkerFactory::<Latest>::new("agg")
            .build(&modules)
            .expect("build");
        assert_eq!(worker.kind(), WorkerKind::Aggregation);
    }
}
