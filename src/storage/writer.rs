use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::telemetry::HealthMetrics;

use super::{Row, Storage};

struct WriteRequest {
    table: &'static str,
    row: Row,
}

/// Bounded, non-blocking front of a [`Storage`] backend.
///
/// `submit` never waits: a full queue sheds the row with a warning. Rows are
/// written by a pump task with at most `workers` upserts in flight. A failed
/// row is logged and counted and does not hold up later rows.
#[derive(Clone)]
pub struct StorageWriter {
    tx: mpsc::Sender<WriteRequest>,
    telemetry: Option<Arc<HealthMetrics>>,
}

impl StorageWriter {
    /// Spawns the pump. Cancelling `ctx` drains everything already queued
    /// and resolves the returned handle once those writes finish.
    pub fn start(
        storage: Arc<Storage>,
        max_queue_size: usize,
        workers: usize,
        telemetry: Option<Arc<HealthMetrics>>,
        ctx: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        Self::start_with_permits(storage, max_queue_size, permits, telemetry, ctx)
    }

    fn start_with_permits(
        storage: Arc<Storage>,
        max_queue_size: usize,
        semaphore: Arc<Semaphore>,
        telemetry: Option<Arc<HealthMetrics>>,
        ctx: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<WriteRequest>(max_queue_size.max(1));
        let pump_telemetry = telemetry.clone();

        let handle = tokio::spawn(async move {
            let mut in_flight = JoinSet::new();

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        while let Ok(req) = rx.try_recv() {
                            let Some(permit) = acquire(&semaphore, &req).await else {
                                break;
                            };
                            spawn_write(
                                &mut in_flight,
                                Arc::clone(&storage),
                                permit,
                                pump_telemetry.clone(),
                                req,
                            );
                        }
                        break;
                    }

                    // Waiting for a permit here stops the queue from draining,
                    // so a slow backend turns into `QueueFull` at `submit`.
                    req = rx.recv() => {
                        let Some(req) = req else { break };
                        let Some(permit) = acquire(&semaphore, &req).await else {
                            break;
                        };
                        spawn_write(
                            &mut in_flight,
                            Arc::clone(&storage),
                            permit,
                            pump_telemetry.clone(),
                            req,
                        );
                    }

                    joined = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Some(Err(e)) = joined {
                            tracing::debug!(error = %e, "storage write task join failed");
                        }
                    }
                }
            }

            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    tracing::debug!(error = %e, "storage write task join failed");
                }
            }

            tracing::info!("storage writer drained");
        });

        (Self { tx, telemetry }, handle)
    }

    /// Enqueues a row without waiting.
    pub fn submit(&self, table: &'static str, row: Row) -> Result<(), StorageError> {
        match self.tx.try_send(WriteRequest { table, row }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(req)) => {
                tracing::warn!(table, id = %req.row.id, "storage write queue full, dropping row");
                if let Some(t) = &self.telemetry {
                    t.storage_errors.with_label_values(&[table]).inc();
                }
                Err(StorageError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(StorageError::Backend("storage writer stopped".to_string()))
            }
        }
    }
}

async fn acquire(semaphore: &Arc<Semaphore>, req: &WriteRequest) -> Option<OwnedSemaphorePermit> {
    match Arc::clone(semaphore).acquire_owned().await {
        Ok(permit) => Some(permit),
        Err(e) => {
            tracing::warn!(table = req.table, id = %req.row.id, error = %e, "storage writer semaphore closed");
            None
        }
    }
}

fn spawn_write(
    in_flight: &mut JoinSet<()>,
    storage: Arc<Storage>,
    permit: OwnedSemaphorePermit,
    telemetry: Option<Arc<HealthMetrics>>,
    req: WriteRequest,
) {
    in_flight.spawn(async move {
        let _permit = permit;

        let started = Instant::now();
        let result = storage.upsert(req.table, &req.row).await;

        if let Some(t) = &telemetry {
            t.storage_write_duration
                .with_label_values(&[req.table])
                .observe(started.elapsed().as_secs_f64());
        }

        match result {
            Ok(()) => {
                if let Some(t) = &telemetry {
                    t.storage_writes.with_label_values(&[req.table]).inc();
                }
            }
            Err(e) => {
                tracing::warn!(
                    table = req.table,
                    id = %req.row.id,
                    backend = storage.name(),
                    error = %e,
                    "storage upsert failed",
                );
                if let Some(t) = &telemetry {
                    t.storage_errors.with_label_values(&[req.table]).inc();
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::{MemoryStorage, Value};

    fn row(id: &str, version: i64) -> Row {
        Row::new(id.to_string(), version).with("heartbeat_time", Value::Int(version))
    }

    #[tokio::test]
    async fn test_writes_drain_on_cancel() {
        let memory = Arc::new(MemoryStorage::new());
        let storage = Arc::new(Storage::Memory(Arc::clone(&memory)));
        let ctx = CancellationToken::new();
        let (writer, handle) = StorageWriter::start(storage, 16, 2, None, ctx.clone());

        writer.submit("service_name", row("a", 1)).expect("submit");
        writer.submit("service_name", row("b", 2)).expect("submit");
        writer.submit("service_name", row("", 3)).expect("submit");

        ctx.cancel();
        handle.await.expect("join");

        // The empty-id row failed alone; the others landed.
        assert_eq!(memory.count("service_name"), 2);
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails() {
        let memory = Arc::new(MemoryStorage::new());
        let storage = Arc::new(Storage::Memory(memory));
        let ctx = CancellationToken::new();
        ctx.cancel();
        let (writer, handle) = StorageWriter::start(storage, 1, 1, None, ctx);
        handle.await.expect("join");

        // Pump is gone and the receiver dropped with it.
        let err = writer.submit("t", row("a", 1)).expect_err("closed");
        assert!(matches!(err, StorageError::Backend(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_backend_sheds_with_queue_full() {
        let memory = Arc::new(MemoryStorage::new());
        let storage = Arc::new(Storage::Memory(Arc::clone(&memory)));
        let ctx = CancellationToken::new();

        // Holding the only permit stalls every write.
        let semaphore = Arc::new(Semaphore::new(1));
        let held = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .expect("permit");
        let (writer, handle) =
            StorageWriter::start_with_permits(storage, 2, Arc::clone(&semaphore), None, ctx.clone());

        let mut accepted = 0;
        let mut shed = 0;
        for i in 0..50 {
            match writer.submit("t", row(&format!("r{i}"), i)) {
                Ok(()) => accepted += 1,
                Err(StorageError::QueueFull) => shed += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        // One row waits for a permit inside the pump, two wait in the queue.
        assert_eq!(accepted, 3);
        assert_eq!(shed, 47);

        drop(held);
        ctx.cancel();
        handle.await.expect("join");
        assert_eq!(memory.count("t"), 3);
    }
}
