use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "collector";

/// Prometheus metrics for the collector pipeline.
///
/// All metrics use the "collector" namespace and live in a private registry
/// served on `/metrics`.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingestion ===
    /// Records accepted by an aggregation stage.
    pub records_ingested: IntCounterVec,
    /// Records dropped by graph and reason.
    pub records_dropped: IntCounterVec,

    // === Windows ===
    /// Window flushes by graph and stage.
    pub window_flushes: IntCounterVec,
    /// Records emitted by window flushes.
    pub flushed_records: IntCounterVec,

    // === Remote ===
    /// Envelopes handed to the transport, per target member.
    pub remote_sent: IntCounterVec,
    /// Remote send failures by reason.
    pub remote_failures: IntCounterVec,
    /// Envelopes waiting in the remote send queue.
    pub remote_queue_length: IntGauge,
    /// Outstanding remote requests.
    pub remote_in_flight: IntGauge,
    /// Envelopes accepted from peers, per graph.
    pub remote_received: IntCounterVec,

    // === Storage ===
    /// Rows written per table.
    pub storage_writes: IntCounterVec,
    /// Row write failures per table.
    pub storage_errors: IntCounterVec,
    /// Upsert latency per table.
    pub storage_write_duration: HistogramVec,

    // === Lifecycle ===
    /// Workers constructed during graph assembly.
    pub workers_created: IntCounterVec,
    /// Current cluster size.
    pub cluster_members: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_ingested = IntCounterVec::new(
            Opts::new(
                "records_ingested_total",
                "Total records accepted by aggregation workers.",
            )
            .namespace(NAMESPACE),
            &["graph"],
        )?;
        let records_dropped = IntCounterVec::new(
            Opts::new(
                "records_dropped_total",
                "Total records dropped by graph and reason.",
            )
            .namespace(NAMESPACE),
            &["graph", "reason"],
        )?;
        let window_flushes = IntCounterVec::new(
            Opts::new("window_flushes_total", "Total window flushes by stage.")
                .namespace(NAMESPACE),
            &["graph", "stage"],
        )?;
        let flushed_records = IntCounterVec::new(
            Opts::new(
                "flushed_records_total",
                "Total records emitted by window flushes.",
            )
            .namespace(NAMESPACE),
            &["graph", "stage"],
        )?;
        let remote_sent = IntCounterVec::new(
            Opts::new(
                "remote_sent_total",
                "Total envelopes queued for a remote member.",
            )
            .namespace(NAMESPACE),
            &["member"],
        )?;
        let remote_failures = IntCounterVec::new(
            Opts::new(
                "remote_failures_total",
                "Total remote send failures by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let remote_queue_length = IntGauge::with_opts(
            Opts::new(
                "remote_queue_length",
                "Current number of envelopes in the remote send queue.",
            )
            .namespace(NAMESPACE),
        )?;
        let remote_in_flight = IntGauge::with_opts(
            Opts::new("remote_in_flight", "Outstanding remote send requests.")
                .namespace(NAMESPACE),
        )?;
        let remote_received = IntCounterVec::new(
            Opts::new(
                "remote_received_total",
                "Total envelopes re-injected from peers.",
            )
            .namespace(NAMESPACE),
            &["graph"],
        )?;
        let storage_writes = IntCounterVec::new(
            Opts::new("storage_writes_total", "Total rows upserted by table.")
                .namespace(NAMESPACE),
            &["table"],
        )?;
        let storage_errors = IntCounterVec::new(
            Opts::new(
                "storage_errors_total",
                "Total row upsert failures by table.",
            )
            .namespace(NAMESPACE),
            &["table"],
        )?;
        let storage_write_duration = HistogramVec::new(
            HistogramOpts::new(
                "storage_write_duration_seconds",
                "Time to upsert one row by table.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.0001, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
            &["table"],
        )?;
        let workers_created = IntCounterVec::new(
            Opts::new(
                "workers_created_total",
                "Total workers constructed by graph and worker.",
            )
            .namespace(NAMESPACE),
            &["graph", "worker"],
        )?;
        let cluster_members = Gauge::with_opts(
            Opts::new("cluster_members", "Number of members in the cluster view.")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(records_ingested.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(window_flushes.clone()))?;
        registry.register(Box::new(flushed_records.clone()))?;
        registry.register(Box::new(remote_sent.clone()))?;
        registry.register(Box::new(remote_failures.clone()))?;
        registry.register(Box::new(remote_queue_length.clone()))?;
        registry.register(Box::new(remote_in_flight.clone()))?;
        registry.register(Box::new(remote_received.clone()))?;
        registry.register(Box::new(storage_writes.clone()))?;
        registry.register(Box::new(storage_errors.clone()))?;
        registry.register(Box::new(storage_write_duration.clone()))?;
        registry.register(Box::new(workers_created.clone()))?;
        registry.register(Box::new(cluster_members.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            records_ingested,
            records_dropped,
            window_flushes,
            flushed_records,
            remote_sent,
            remote_failures,
            remote_queue_length,
            remote_in_flight,
            remote_received,
            storage_writes,
            storage_errors,
            storage_write_duration,
            workers_created,
            cluster_members,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr, ":9090");

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the ":port" shorthand to a wildcard bind address.
pub fn bind_address(addr: &str, fallback: &str) -> String {
    let addr = if addr.is_empty() { fallback } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
