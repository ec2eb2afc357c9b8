//! Minimal broker contract the judge pipeline runs on: a FIFO list queue, a
//! sorted-set priority queue, and a KV space with TTLs, plus the broker's own
//! clock. `RedisBroker` is the production backend; `MemoryBroker` implements
//! the same semantics in-process for tests and local development.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis_broker;

pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

/// Lower bound on the per-call socket timeout; anything shorter makes long
/// blocking pops indistinguishable from dead connections.
pub const MIN_SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("socket timeout must be at least {} seconds", MIN_SOCKET_TIMEOUT.as_secs())]
    SocketTimeoutTooSmall,

    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

/// The operations the pipeline needs from its message broker.
///
/// Blocking pops take an overall timeout and return `None` when it elapses
/// with nothing to claim; backends are responsible for keeping individual
/// network waits below their socket timeout.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn list_push(&self, key: &str, values: &[Vec<u8>]) -> Result<()>;
    async fn list_pop(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Pipelined non-blocking pop across many keys; one slot per key, in
    /// order.
    async fn list_pop_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;
    async fn list_block_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, Vec<u8>)>>;
    async fn list_len(&self, key: &str) -> Result<u64>;

    async fn zset_add(&self, key: &str, members: &[(String, f64)]) -> Result<()>;
    async fn zset_pop_min(&self, key: &str) -> Result<Option<(String, f64)>>;
    async fn zset_block_pop_min(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String, f64)>>;
    async fn zset_len(&self, key: &str) -> Result<u64>;

    async fn kv_set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;
    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn kv_delete(&self, keys: &[String]) -> Result<()>;
    /// Count keys matching a glob pattern (`*` wildcard only).
    async fn kv_count_matching(&self, pattern: &str) -> Result<u64>;

    /// Attach a TTL to an existing key of any type.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// The broker's clock in epoch seconds; the authoritative timestamp for
    /// enqueue times.
    async fn server_time(&self) -> Result<f64>;
}
