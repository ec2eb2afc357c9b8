//! Redis-backed broker. Lists are queues, sorted sets are priority queues,
//! and plain keys with TTLs carry results and worker heartbeats.

use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::aio::ConnectionManagerConfig;

use crate::Broker;
use crate::BrokerError;
use crate::MIN_SOCKET_TIMEOUT;
use crate::Result;

/// Margin kept between a blocking pop's server-side wait and the socket
/// timeout, so a slow reply is not mistaken for a dead connection.
const BLOCK_POP_SLACK: Duration = Duration::from_secs(2);

/// Shortest window worth sending to the server at all.
const MIN_BLOCK_WINDOW: Duration = Duration::from_millis(50);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct RedisBroker {
    manager: ConnectionManager,
    socket_timeout: Duration,
}

impl RedisBroker {
    /// Connect to `uri` with keep-alive and a per-call response timeout.
    /// Rejects socket timeouts under ten seconds.
    pub async fn connect(uri: &str, socket_timeout: Duration) -> Result<Self> {
        if socket_timeout < MIN_SOCKET_TIMEOUT {
            return Err(BrokerError::SocketTimeoutTooSmall);
        }
        let client = redis::Client::open(uri)?;
        let config = ConnectionManagerConfig::new()
            .set_connection_timeout(CONNECT_TIMEOUT)
            .set_response_timeout(socket_timeout);
        let manager = ConnectionManager::new_with_config(client, config).await?;
        tracing::debug!("connected to redis broker");
        Ok(Self {
            manager,
            socket_timeout,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    fn block_window(&self, start: Instant, timeout: Duration) -> Option<Duration> {
        block_window(self.socket_timeout, start.elapsed(), timeout)
    }
}

/// Next server-side wait for a blocking pop that has already waited
/// `elapsed` of an overall `timeout`. Windows are capped below the socket
/// timeout so the reply always beats the socket deadline; `None` means the
/// caller's deadline is spent.
fn block_window(
    socket_timeout: Duration,
    elapsed: Duration,
    timeout: Duration,
) -> Option<Duration> {
    let cap = socket_timeout.saturating_sub(BLOCK_POP_SLACK);
    let remaining = timeout.checked_sub(elapsed)?;
    let window = remaining.min(cap);
    if window < MIN_BLOCK_WINDOW {
        return None;
    }
    Some(window)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn list_push(&self, key: &str, values: &[Vec<u8>]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: i64 = conn.rpush(key, values).await?;
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let reply: Option<Vec<u8>> = conn.lpop(key, None).await?;
        Ok(reply)
    }

    async fn list_pop_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.lpop(key, None);
        }
        let replies: Vec<Option<Vec<u8>>> = pipe.query_async(&mut conn).await?;
        Ok(replies)
    }

    async fn list_block_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, Vec<u8>)>> {
        let start = Instant::now();
        while let Some(window) = self.block_window(start, timeout) {
            let mut conn = self.conn();
            let reply: Option<(String, Vec<u8>)> =
                conn.blpop(keys, window.as_secs_f64()).await?;
            if reply.is_some() {
                return Ok(reply);
            }
        }
        Ok(None)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn zset_add(&self, key: &str, members: &[(String, f64)]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let items: Vec<(f64, &str)> = members
            .iter()
            .map(|(member, score)| (*score, member.as_str()))
            .collect();
        let mut conn = self.conn();
        let _: i64 = conn.zadd_multiple(key, &items).await?;
        Ok(())
    }

    async fn zset_pop_min(&self, key: &str) -> Result<Option<(String, f64)>> {
        let mut conn = self.conn();
        let mut reply: Vec<(String, f64)> = conn.zpopmin(key, 1).await?;
        Ok(reply.pop())
    }

    async fn zset_block_pop_min(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String, f64)>> {
        let start = Instant::now();
        while let Some(window) = self.block_window(start, timeout) {
            let mut conn = self.conn();
            let reply: Option<(String, String, f64)> =
                conn.bzpopmin(keys, window.as_secs_f64()).await?;
            if reply.is_some() {
                return Ok(reply);
            }
        }
        Ok(None)
    }

    async fn zset_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn();
        let len: u64 = conn.zcard(key).await?;
        Ok(len)
    }

    async fn kv_set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let reply: Option<Vec<u8>> = conn.get(key).await?;
        Ok(reply)
    }

    async fn kv_delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: i64 = conn.del(keys).await?;
        Ok(())
    }

    async fn kv_count_matching(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut count: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            count += batch.len() as u64;
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.expire(key, ttl.as_secs().max(1) as i64).await?;
        Ok(())
    }

    async fn server_time(&self) -> Result<f64> {
        let mut conn = self.conn();
        let (secs, micros): (u64, u64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs as f64 + micros as f64 / 1_000_000.0)
    }
}
