//! Remote dispatch transport: envelopes, senders and the receive path that
//! re-enters a local graph.

pub mod codec;
pub mod http;
pub mod loopback;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cluster::Member;
use crate::error::{GraphError, NetworkError};
use crate::graph::{GraphRegistry, NodeId};
use crate::telemetry::HealthMetrics;

pub use codec::Compression;
pub use http::HttpRemoteClient;
pub use loopback::LoopbackSender;

/// A serialized record addressed to a graph node on another member.
///
/// The receiver delivers `payload` downstream of `node_id` in graph
/// `graph_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEnvelope {
    pub graph_id: u32,
    pub node_id: NodeId,
    pub routing_key: String,
    /// JSON encoded record.
    pub payload: String,
}

/// Outbound transport. `send` only enqueues; it must never block the
/// ingestion path.
pub trait RemoteSender: Send + Sync {
    fn send(&self, target: &Member, envelope: RemoteEnvelope) -> Result<(), NetworkError>;
}

/// Receive side: decodes envelopes into the local registry.
pub struct RemoteReceiver {
    registry: Arc<GraphRegistry>,
    telemetry: Option<Arc<HealthMetrics>>,
}

impl RemoteReceiver {
    pub fn new(registry: Arc<GraphRegistry>, telemetry: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            registry,
            telemetry,
        }
    }

    /// Re-injects one envelope.
    pub fn receive(&self, envelope: &RemoteEnvelope) -> Result<(), GraphError> {
        let graph = self.registry.find_erased(envelope.graph_id)?;
        graph.accept_remote(envelope.node_id, envelope.payload.as_bytes())?;

        if let Some(t) = &self.telemetry {
            t.remote_received
                .with_label_values(&[&graph.id().to_string()])
                .inc();
        }
        Ok(())
    }

    /// Re-injects a batch, logging and skipping envelopes that fail.
    /// Returns how many were accepted.
    pub fn receive_batch(&self, envelopes: &[RemoteEnvelope]) -> usize {
        let mut accepted = 0usize;
        for envelope in envelopes {
            match self.receive(envelope) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    tracing::warn!(
                        graph_id = envelope.graph_id,
                        node = envelope.node_id,
                        key = %envelope.routing_key,
                        error = %e,
                        "dropping remote envelope",
                    );
                }
            }
        }
        accepted
    }
}
