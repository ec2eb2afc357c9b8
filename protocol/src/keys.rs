//! Broker key naming. Every key the service touches lives under
//! `<prefix>:<version>:` so that incompatible deployments sharing one broker
//! never see each other's queues.

/// Version component baked into every key.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The shared FIFO list all pending work items land on.
pub fn work_queue(prefix: &str) -> String {
    format!("{prefix}:{PROTOCOL_VERSION}:work-queue")
}

/// The single-writer single-reader list carrying one work item's result.
pub fn result_queue(prefix: &str, work_id: &str) -> String {
    format!("{prefix}:{PROTOCOL_VERSION}:result-queue:{work_id}")
}

/// A worker's liveness key; its presence (under TTL) counts the worker as
/// alive in `/status`.
pub fn worker_heartbeat(prefix: &str, worker_id: &str) -> String {
    format!("{prefix}:{PROTOCOL_VERSION}:work-ids:{worker_id}")
}

/// Glob matching every worker heartbeat key under `prefix`.
pub fn worker_heartbeat_pattern(prefix: &str) -> String {
    format!("{prefix}:{PROTOCOL_VERSION}:work-ids:*")
}
