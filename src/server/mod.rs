//! Collector HTTP server: remote envelope intake from peers and heartbeat
//! ingestion from agents.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::CONTENT_ENCODING;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analysis::heartbeat::ServiceName;
use crate::graph::Graph;
use crate::remote::codec::decode_batch;
use crate::remote::http::ENVELOPES_PATH;
use crate::remote::{Compression, RemoteReceiver};

/// Path agents post heartbeat batches to.
pub const HEARTBEATS_PATH: &str = "/v1/heartbeats";

/// Largest request body accepted on any route, before decompression.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Shared state for axum handlers.
struct AppState {
    receiver: Arc<RemoteReceiver>,
    heartbeats: Arc<Graph<ServiceName>>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    accepted: usize,
    rejected: usize,
}

/// Binds `addr` and serves until `ctx` is cancelled. Returns the bound
/// address (useful with port 0) and the server task.
pub async fn start(
    addr: &str,
    receiver: Arc<RemoteReceiver>,
    heartbeats: Arc<Graph<ServiceName>>,
    ctx: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let state = Arc::new(AppState {
        receiver,
        heartbeats,
    });

    let app = Router::new()
        .route(ENVELOPES_PATH, post(envelopes_handler))
        .route(HEARTBEATS_PATH, post(heartbeats_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("listening on {addr}"))?;

    let local_addr = listener.local_addr().context("getting local address")?;

    let handle = tokio::spawn(async move {
        tracing::info!(addr = %local_addr, "collector server started");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                ctx.cancelled().await;
            })
            .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "collector server error");
        }

        tracing::info!("collector server stopped");
    });

    Ok((local_addr, handle))
}

/// POST /remote/v1/envelopes - batch of envelopes from a peer.
async fn envelopes_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Accepted>) {
    let encoding = headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok());

    let envelopes = match Compression::from_content_encoding(encoding)
        .and_then(|compression| decode_batch(&body, compression))
    {
        Ok(envelopes) => envelopes,
        Err(e) => {
            tracing::warn!(
                error = %e,
                encoding = encoding.unwrap_or("identity"),
                "rejecting envelope batch",
            );
            return (
                StatusCode::BAD_REQUEST,
                Json(Accepted {
                    accepted: 0,
                    rejected: 0,
                }),
            );
        }
    };

    let accepted = state.receiver.receive_batch(&envelopes);

    (
        StatusCode::OK,
        Json(Accepted {
            accepted,
            rejected: envelopes.len() - accepted,
        }),
    )
}

/// POST /v1/heartbeats - JSON array of service heartbeats.
async fn heartbeats_handler(
    State(state): State<Arc<AppState>>,
    Json(records): Json<Vec<ServiceName>>,
) -> (StatusCode, Json<Accepted>) {
    let mut accepted = 0usize;

    for record in records.iter().cloned() {
        match state.heartbeats.push(record) {
            Ok(()) => accepted += 1,
            Err(e) => tracing::warn!(graph = %state.heartbeats.id(), error = %e, "heartbeat dropped"),
        }
    }

    (
        StatusCode::OK,
        Json(Accepted {
            accepted,
            rejected: records.len() - accepted,
        }),
    )
}
