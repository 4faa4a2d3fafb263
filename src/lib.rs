//! Clustered APM collector analysis pipeline.
//!
//! Records enter typed worker graphs, are merged per key, routed to the
//! cluster member that owns the key and persisted there.

pub mod analysis;
pub mod cluster;
pub mod collector;
pub mod config;
pub mod data;
pub mod error;
pub mod graph;
pub mod module;
pub mod remote;
pub mod server;
pub mod storage;
pub mod telemetry;
pub mod worker;
