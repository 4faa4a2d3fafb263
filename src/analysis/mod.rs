//! Analysis pipelines assembled on top of the worker graph engine.

pub mod heartbeat;

use crate::graph::GraphId;

/// Service heartbeat graph: aggregation, remote dispatch, persistence.
pub const SERVICE_HEART_BEAT_PERSISTENCE_GRAPH_ID: GraphId = GraphId::new(400, "service_heart_beat");

/// Span type reported by agents for a service endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SpanType {
    Entry = 0,
    Exit = 1,
    Local = 2,
}

impl SpanType {
    pub fn value(self) -> i32 {
        self as i32
    }
}
