use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::analysis::heartbeat::{self, ServiceName, ServiceNameHeartBeatGraph, ServiceNameUiDao};
use crate::cluster::{ClusterView, Member};
use crate::config::{Config, StorageBackend};
use crate::graph::{Graph, GraphRegistry, WorkerKind};
use crate::module::{ModuleManager, CLUSTER, REMOTE, STORAGE, TELEMETRY};
use crate::remote::{HttpRemoteClient, RemoteReceiver, RemoteSender};
use crate::server;
use crate::storage::{Storage, StorageWriter};
use crate::telemetry::HealthMetrics;
use crate::worker::WorkerCreateListener;

/// CollectorNode owns one cluster member: graphs, transport, storage and
/// the flush schedulers driving them.
pub struct CollectorNode {
    cfg: Config,
    health: Arc<HealthMetrics>,
    registry: Arc<GraphRegistry>,
    storage: Arc<Storage>,
    heartbeats: Option<Arc<Graph<ServiceName>>>,
    server_addr: Option<SocketAddr>,
    /// Server and flush schedulers.
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    /// Storage writer and remote client; drained after the final flush.
    pipeline: Vec<(&'static str, JoinHandle<()>)>,
    cancel: CancellationToken,
    pipeline_cancel: CancellationToken,
}

impl CollectorNode {
    /// Creates a new node, initializing health metrics and the storage
    /// backend. Nothing runs until `start`.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let storage = Arc::new(Storage::from_config(&cfg.storage));

        Ok(Self {
            cfg,
            health,
            registry: Arc::new(GraphRegistry::new()),
            storage,
            heartbeats: None,
            server_addr: None,
            tasks: Vec::new(),
            pipeline: Vec::new(),
            cancel: CancellationToken::new(),
            pipeline_cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin accepting traffic.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so /healthz answers during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Storage schema and writer.
        if self.cfg.storage.backend == StorageBackend::ClickHouse
            && self.cfg.storage.clickhouse.ensure_schema
        {
            self.storage
                .ensure_schema(&[heartbeat::SCHEMA])
                .await
                .context("ensuring storage schema")?;
            info!(database = %self.cfg.storage.clickhouse.database, "storage schema ready");
        }

        let (writer, writer_handle) = StorageWriter::start(
            Arc::clone(&self.storage),
            self.cfg.persistence.max_queue_size,
            self.cfg.persistence.workers,
            Some(Arc::clone(&self.health)),
            self.pipeline_cancel.child_token(),
        );
        self.pipeline.push(("storage writer", writer_handle));
        info!(backend = self.storage.name(), "storage writer started");

        // 2. Membership view.
        let cluster = Arc::new(ClusterView::new(
            Member::new(self.cfg.node.address.as_str()),
            self.cfg.cluster.members.iter().map(Member::new),
        ));
        self.health.cluster_members.set(cluster.len() as f64);
        info!(local = %cluster.local(), members = cluster.len(), "cluster view ready");

        // 3. Remote transport.
        let (remote, remote_handle) = HttpRemoteClient::start(
            self.cfg.remote.clone(),
            Some(Arc::clone(&self.health)),
            self.pipeline_cancel.child_token(),
        )
        .context("starting remote client")?;
        self.pipeline.push(("remote client", remote_handle));

        // 4. Modules consulted by worker factories.
        let modules = Arc::new(ModuleManager::new());
        modules.register(CLUSTER, cluster);
        modules.register::<Arc<dyn RemoteSender>>(REMOTE, Arc::new(remote));
        modules.register(STORAGE, writer);
        modules.register(TELEMETRY, Arc::clone(&self.health));

        // 5. Graphs.
        let (listener, mut created) = WorkerCreateListener::channel();
        let health = Arc::clone(&self.health);
        tokio::spawn(async move {
            while let Some(event) = created.recv().await {
                health
                    .workers_created
                    .with_label_values(&[&event.graph.to_string(), event.worker])
                    .inc();
            }
        });

        let heartbeats = ServiceNameHeartBeatGraph::new(modules, listener)
            .create(&self.registry)
            .context("creating service heartbeat graph")?;
        info!(graph = %heartbeats.id(), nodes = heartbeats.node_count(), "graph created");

        // 6. Server.
        let receiver = Arc::new(RemoteReceiver::new(
            Arc::clone(&self.registry),
            Some(Arc::clone(&self.health)),
        ));
        let (addr, server_handle) = server::start(
            &self.cfg.node.listen_addr,
            receiver,
            Arc::clone(&heartbeats),
            self.cancel.child_token(),
        )
        .await
        .context("starting collector server")?;
        self.tasks.push(("server", server_handle));
        self.server_addr = Some(addr);
        self.heartbeats = Some(heartbeats);

        // 7. Flush schedulers.
        self.tasks.push((
            "aggregation flush",
            self.spawn_flush(WorkerKind::Aggregation, self.cfg.aggregation.flush_interval),
        ));
        self.tasks.push((
            "persistence flush",
            self.spawn_flush(WorkerKind::Persistence, self.cfg.persistence.flush_interval),
        ));

        info!(addr = %addr, "collector node fully started");

        Ok(())
    }

    /// Gracefully stop all components. Buffered windows are flushed once
    /// more and queued rows and envelopes are drained before returning.
    pub async fn stop(&mut self) -> Result<()> {
        // Stop intake and schedulers first so no flush races the final one.
        self.cancel.cancel();
        for (name, handle) in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "task join failed");
            }
        }

        let aggregated = flush_all(&self.registry, WorkerKind::Aggregation);
        flush_all(&self.registry, WorkerKind::Persistence);
        info!(aggregated, "final flush complete");

        self.pipeline_cancel.cancel();
        for (name, handle) in self.pipeline.drain(..) {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "task join failed");
            }
        }

        self.health.stop().await?;

        info!("collector node stopped");

        Ok(())
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Address the collector server is bound to, once started.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    /// The heartbeat graph, once started.
    pub fn heartbeats(&self) -> Option<&Arc<Graph<ServiceName>>> {
        self.heartbeats.as_ref()
    }

    /// Read path over persisted service names.
    pub fn service_names(&self) -> ServiceNameUiDao {
        ServiceNameUiDao::new(Arc::clone(&self.storage))
    }

    fn spawn_flush(&self, kind: WorkerKind, period: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let drained = flush_all(&registry, kind);
                        debug!(stage = %kind, drained, "flush tick");
                    }
                }
            }
        })
    }
}

/// Flushes one stage kind across every registered graph.
fn flush_all(registry: &GraphRegistry, kind: WorkerKind) -> usize {
    registry
        .graphs()
        .iter()
        .map(|graph| graph.flush_stage(kind))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthConfig, NodeConfig};
    use crate::storage::MemoryStorage;

    fn local_config() -> Config {
        Config {
            node: NodeConfig {
                address: "127.0.0.1:11800".to_string(),
                listen_addr: "127.0.0.1:0".to_string(),
            },
            health: HealthConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            ..Default::default()
        }
    }

    fn memory(node: &CollectorNode) -> Arc<MemoryStorage> {
        match node.storage().as_ref() {
            Storage::Memory(m) => Arc::clone(m),
            Storage::ClickHouse(_) => panic!("expected memory storage"),
        }
    }

    #[tokio::test]
    async fn test_stop_flushes_buffered_heartbeats() {
        let mut node = CollectorNode::new(local_config()).expect("new");
        node.start().await.expect("start");
        assert!(node.server_addr().is_some());

        let graph = Arc::clone(node.heartbeats().expect("graph"));
        for time in [100, 150, 120] {
            graph
                .push(ServiceName {
                    service_id: 1,
                    service_name: "A".to_string(),
                    application_id: 7,
                    src_span_type: 0,
                    heartbeat_time: time,
                })
                .expect("push");
        }

        node.stop().await.expect("stop");

        let storage = memory(&node);
        assert_eq!(storage.count(heartbeat::TABLE), 1);
        let row = storage.get(heartbeat::TABLE, "7_A").expect("row");
        assert_eq!(row.get_i64(heartbeat::HEARTBEAT_TIME), Some(150));
        assert_eq!(node.service_names().count(0).await, 1);
    }
}
