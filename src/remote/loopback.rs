use std::sync::Arc;

use dashmap::DashMap;

use crate::cluster::Member;
use crate::error::NetworkError;

use super::{RemoteEnvelope, RemoteReceiver, RemoteSender};

/// In-process transport: delivers envelopes straight into a peer's
/// receiver. Used for single-process clusters and tests.
#[derive(Default)]
pub struct LoopbackSender {
    peers: DashMap<Member, Arc<RemoteReceiver>>,
}

impl LoopbackSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, member: Member, receiver: Arc<RemoteReceiver>) {
        self.peers.insert(member, receiver);
    }

    /// Removes a peer; later sends to it fail as unreachable.
    pub fn disconnect(&self, member: &Member) {
        self.peers.remove(member);
    }
}

impl RemoteSender for LoopbackSender {
    fn send(&self, target: &Member, envelope: RemoteEnvelope) -> Result<(), NetworkError> {
        let receiver = self
            .peers
            .get(target)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| NetworkError::Unreachable(target.to_string()))?;

        receiver
            .receive(&envelope)
            .map_err(|e| NetworkError::Rejected {
                member: target.to_string(),
                reason: e.to_string(),
            })
    }
}
