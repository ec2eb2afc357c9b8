//! In-process broker with the same observable semantics as the Redis
//! backend. The test suites run the whole pipeline against it, and it backs
//! `--broker memory` for single-process local runs.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::Broker;
use crate::Result;

struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

#[derive(Default)]
struct State {
    lists: HashMap<String, Expiring<VecDeque<Vec<u8>>>>,
    zsets: HashMap<String, Expiring<Vec<(String, f64)>>>,
    kv: HashMap<String, Expiring<Vec<u8>>>,
}

impl State {
    /// Drop every entry whose TTL has lapsed; called before each read so
    /// expiry is observable without a background sweeper.
    fn purge_expired(&mut self) {
        self.lists.retain(|_, entry| entry.live());
        self.zsets.retain(|_, entry| entry.live());
        self.kv.retain(|_, entry| entry.live());
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| {
            // A panic while holding the lock leaves usable data behind; the
            // broker keeps serving rather than poisoning every later test.
            poisoned.into_inner()
        });
        state.purge_expired();
        f(&mut state)
    }

    fn try_list_pop(&self, keys: &[String]) -> Option<(String, Vec<u8>)> {
        self.with_state(|state| {
            for key in keys {
                if let Some(entry) = state.lists.get_mut(key)
                    && let Some(value) = entry.value.pop_front()
                {
                    return Some((key.clone(), value));
                }
            }
            None
        })
    }

    fn try_zset_pop_min(&self, keys: &[String]) -> Option<(String, String, f64)> {
        self.with_state(|state| {
            for key in keys {
                if let Some((member, score)) = pop_min(state, key) {
                    return Some((key.clone(), member, score));
                }
            }
            None
        })
    }
}

fn pop_min(state: &mut State, key: &str) -> Option<(String, f64)> {
    let entry = state.zsets.get_mut(key)?;
    if entry.value.is_empty() {
        return None;
    }
    let mut min = 0;
    for (i, (member, score)) in entry.value.iter().enumerate().skip(1) {
        let (best_member, best_score) = &entry.value[min];
        if score < best_score || (score == best_score && member < best_member) {
            min = i;
        }
    }
    Some(entry.value.remove(min))
}

/// Glob matching for `kv_count_matching`; `*` is the only wildcard the
/// key patterns use.
fn glob_match(pattern: &str, text: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == text,
        Some((head, tail)) => {
            let Some(rest) = text.strip_prefix(head) else {
                return false;
            };
            if tail.is_empty() {
                return true;
            }
            (0..=rest.len())
                .filter(|i| rest.is_char_boundary(*i))
                .any(|i| glob_match(tail, &rest[i..]))
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn list_push(&self, key: &str, values: &[Vec<u8>]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.with_state(|state| {
            let entry = state
                .lists
                .entry(key.to_string())
                .or_insert_with(|| Expiring::new(VecDeque::new()));
            entry.value.extend(values.iter().cloned());
        });
        self.notify.notify_waiters();
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.with_state(|state| {
            state
                .lists
                .get_mut(key)
                .and_then(|entry| entry.value.pop_front())
        }))
    }

    async fn list_pop_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        Ok(self.with_state(|state| {
            keys.iter()
                .map(|key| {
                    state
                        .lists
                        .get_mut(key)
                        .and_then(|entry| entry.value.pop_front())
                })
                .collect()
        }))
    }

    async fn list_block_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, Vec<u8>)>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(hit) = self.try_list_pop(keys) {
                return Ok(Some(hit));
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(None);
            };
            tokio::select! {
                _ = notified => {}
                _ = sleep(remaining) => return Ok(None),
            }
        }
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        Ok(self.with_state(|state| {
            state
                .lists
                .get(key)
                .map_or(0, |entry| entry.value.len() as u64)
        }))
    }

    async fn zset_add(&self, key: &str, members: &[(String, f64)]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        self.with_state(|state| {
            let entry = state
                .zsets
                .entry(key.to_string())
                .or_insert_with(|| Expiring::new(Vec::new()));
            for (member, score) in members {
                match entry.value.iter_mut().find(|(m, _)| m == member) {
                    Some(existing) => existing.1 = *score,
                    None => entry.value.push((member.clone(), *score)),
                }
            }
        });
        self.notify.notify_waiters();
        Ok(())
    }

    async fn zset_pop_min(&self, key: &str) -> Result<Option<(String, f64)>> {
        Ok(self.with_state(|state| pop_min(state, key)))
    }

    async fn zset_block_pop_min(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String, f64)>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(hit) = self.try_zset_pop_min(keys) {
                return Ok(Some(hit));
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(None);
            };
            tokio::select! {
                _ = notified => {}
                _ = sleep(remaining) => return Ok(None),
            }
        }
    }

    async fn zset_len(&self, key: &str) -> Result<u64> {
        Ok(self.with_state(|state| {
            state
                .zsets
                .get(key)
                .map_or(0, |entry| entry.value.len() as u64)
        }))
    }

    async fn kv_set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.with_state(|state| {
            let mut entry = Expiring::new(value.to_vec());
            entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
            state.kv.insert(key.to_string(), entry);
        });
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.with_state(|state| state.kv.get(key).map(|entry| entry.value.clone())))
    }

    async fn kv_delete(&self, keys: &[String]) -> Result<()> {
        self.with_state(|state| {
            for key in keys {
                state.lists.remove(key);
                state.zsets.remove(key);
                state.kv.remove(key);
            }
        });
        Ok(())
    }

    async fn kv_count_matching(&self, pattern: &str) -> Result<u64> {
        Ok(self.with_state(|state| {
            state
                .kv
                .keys()
                .filter(|key| glob_match(pattern, key))
                .count() as u64
        }))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let expires_at = Some(Instant::now() + ttl);
        self.with_state(|state| {
            if let Some(entry) = state.lists.get_mut(key) {
                entry.expires_at = expires_at;
            }
            if let Some(entry) = state.zsets.get_mut(key) {
                entry.expires_at = expires_at;
            }
            if let Some(entry) = state.kv.get_mut(key) {
                entry.expires_at = expires_at;
            }
        });
        Ok(())
    }

    async fn server_time(&self) -> Result<f64> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(now.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_string()).collect()
    }

    #[tokio::test]
    async fn lists_are_fifo() {
        let broker = MemoryBroker::new();
        broker
            .list_push("q", &[b"one".to_vec(), b"two".to_vec()])
            .await
            .expect("push");
        broker.list_push("q", &[b"three".to_vec()]).await.expect("push");

        assert_eq!(broker.list_len("q").await.expect("len"), 3);
        assert_eq!(broker.list_pop("q").await.expect("pop"), Some(b"one".to_vec()));
        assert_eq!(broker.list_pop("q").await.expect("pop"), Some(b"two".to_vec()));
        assert_eq!(broker.list_pop("q").await.expect("pop"), Some(b"three".to_vec()));
        assert_eq!(broker.list_pop("q").await.expect("pop"), None);
    }

    #[tokio::test]
    async fn block_pop_wakes_on_push() {
        let broker = Arc::new(MemoryBroker::new());
        let waiter = Arc::clone(&broker);
        let handle = tokio::spawn(async move {
            waiter
                .list_block_pop(&keys(&["q"]), Duration::from_secs(5))
                .await
        });
        sleep(Duration::from_millis(20)).await;
        broker.list_push("q", &[b"item".to_vec()]).await.expect("push");

        let hit = handle.await.expect("join").expect("pop");
        assert_eq!(hit, Some(("q".to_string(), b"item".to_vec())));
    }

    #[tokio::test]
    async fn block_pop_times_out_empty() {
        let broker = MemoryBroker::new();
        let start = Instant::now();
        let hit = broker
            .list_block_pop(&keys(&["missing"]), Duration::from_millis(50))
            .await
            .expect("pop");
        assert_eq!(hit, None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn block_pop_scans_keys_in_order() {
        let broker = MemoryBroker::new();
        broker.list_push("b", &[b"2".to_vec()]).await.expect("push");
        broker.list_push("a", &[b"1".to_vec()]).await.expect("push");
        let hit = broker
            .list_block_pop(&keys(&["a", "b"]), Duration::from_millis(50))
            .await
            .expect("pop");
        assert_eq!(hit, Some(("a".to_string(), b"1".to_vec())));
    }

    #[tokio::test]
    async fn expired_keys_vanish() {
        let broker = MemoryBroker::new();
        broker
            .kv_set("hb", b"1", Some(Duration::from_millis(30)))
            .await
            .expect("set");
        broker.list_push("rq", &[b"r".to_vec()]).await.expect("push");
        broker
            .expire("rq", Duration::from_millis(30))
            .await
            .expect("expire");

        assert_eq!(broker.kv_get("hb").await.expect("get"), Some(b"1".to_vec()));
        sleep(Duration::from_millis(60)).await;
        assert_eq!(broker.kv_get("hb").await.expect("get"), None);
        assert_eq!(broker.list_len("rq").await.expect("len"), 0);
    }

    #[tokio::test]
    async fn zset_pops_by_score_then_member() {
        let broker = MemoryBroker::new();
        broker
            .zset_add(
                "pq",
                &[
                    ("late".to_string(), 9.0),
                    ("early".to_string(), 1.0),
                    ("also-early".to_string(), 1.0),
                ],
            )
            .await
            .expect("add");

        assert_eq!(
            broker.zset_pop_min("pq").await.expect("pop"),
            Some(("also-early".to_string(), 1.0))
        );
        assert_eq!(
            broker.zset_pop_min("pq").await.expect("pop"),
            Some(("early".to_string(), 1.0))
        );
        assert_eq!(
            broker.zset_pop_min("pq").await.expect("pop"),
            Some(("late".to_string(), 9.0))
        );
        assert_eq!(broker.zset_pop_min("pq").await.expect("pop"), None);
    }

    #[tokio::test]
    async fn pop_many_returns_one_slot_per_key() {
        let broker = MemoryBroker::new();
        broker.list_push("a", &[b"1".to_vec()]).await.expect("push");
        broker.list_push("c", &[b"3".to_vec()]).await.expect("push");
        let popped = broker
            .list_pop_many(&keys(&["a", "b", "c"]))
            .await
            .expect("pop many");
        assert_eq!(
            popped,
            vec![Some(b"1".to_vec()), None, Some(b"3".to_vec())]
        );
    }

    #[tokio::test]
    async fn count_matching_uses_glob() {
        let broker = MemoryBroker::new();
        for id in ["w1", "w2"] {
            broker
                .kv_set(&format!("judge:0.1.0:work-ids:{id}"), b"1", None)
                .await
                .expect("set");
        }
        broker.kv_set("judge:0.1.0:other", b"1", None).await.expect("set");

        let count = broker
            .kv_count_matching("judge:0.1.0:work-ids:*")
            .await
            .expect("count");
        assert_eq!(count, 2);
    }

    #[test]
    fn glob_matcher_handles_inner_stars() {
        assert!(glob_match("a:*:c", "a:b:c"));
        assert!(glob_match("*", "anything"));
        assert!(!glob_match("a:*:c", "a:b:d"));
        assert!(glob_match("a*", "a"));
        assert!(!glob_match("a", "ab"));
    }
}
