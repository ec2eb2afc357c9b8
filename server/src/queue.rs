//! The work-queue protocol: how submissions become broker messages, how
//! results travel back on per-work queues, and how worker liveness is
//! tracked. Shared by the dispatcher side and the worker side.

use std::sync::Arc;
use std::time::Duration;

use judge_broker::Broker;
use judge_protocol::JudgeResult;
use judge_protocol::Mode;
use judge_protocol::Reason;
use judge_protocol::Submission;
use judge_protocol::WorkItem;
use judge_protocol::keys;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;

/// A submitted work item the dispatcher is waiting on.
#[derive(Debug, Clone)]
pub struct PendingWork {
    pub work_id: String,
    pub sub_id: Option<String>,
    pub mode: Mode,
    result_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub queue: u64,
    pub num_workers: u64,
}

pub struct WorkQueue {
    broker: Arc<dyn Broker>,
    config: Arc<Config>,
    work_queue_key: String,
}

impl WorkQueue {
    pub fn new(broker: Arc<dyn Broker>, config: Arc<Config>) -> Self {
        let work_queue_key = keys::work_queue(&config.key_prefix);
        Self {
            broker,
            config,
            work_queue_key,
        }
    }

    pub async fn server_time(&self) -> Result<f64> {
        Ok(self.broker.server_time().await?)
    }

    /// Enqueue one submission under a fresh work id, stamped with the broker
    /// clock.
    pub async fn submit(&self, submission: Submission, mode: Mode) -> Result<PendingWork> {
        let work_id = Uuid::new_v4().to_string();
        let sub_id = submission.sub_id.clone();
        let enqueued_at = self.broker.server_time().await?;
        let item = WorkItem {
            work_id: work_id.clone(),
            submission,
            enqueued_at,
            mode,
        };
        self.broker
            .list_push(&self.work_queue_key, &[item.encode()?])
            .await?;
        tracing::debug!(work_id, ?mode, "enqueued work item");
        Ok(PendingWork {
            result_key: keys::result_queue(&self.config.key_prefix, &work_id),
            work_id,
            sub_id,
            mode,
        })
    }

    /// Block on the result queue until the mode's deadline; a miss becomes a
    /// locally synthesized `queue_timeout`. The key is deleted best-effort
    /// either way; a worker that writes after we gave up leaves a key that
    /// expires via its TTL.
    pub async fn wait_result(&self, pending: &PendingWork) -> Result<JudgeResult> {
        let deadline = match pending.mode {
            Mode::Short => self.config.max_queue_wait_time(),
            Mode::Long => self.config.long_batch_max_queue_wait_time,
        };
        let keys = [pending.result_key.clone()];
        let reply = self
            .broker
            .list_block_pop(&keys, Duration::from_secs(deadline))
            .await?;
        let result = match reply {
            Some((_, bytes)) => JudgeResult::decode(&bytes)?,
            None => {
                tracing::warn!(
                    work_id = pending.work_id,
                    "gave up waiting on result queue"
                );
                JudgeResult::failure(pending.sub_id.clone(), Reason::QueueTimeout, "")
            }
        };
        if let Err(err) = self.broker.kv_delete(&keys).await {
            tracing::warn!(work_id = pending.work_id, "result queue cleanup failed: {err}");
        }
        Ok(result)
    }

    /// Worker side: wait up to one block-pop window for an item to claim.
    /// A corrupt message is logged and dropped; there is no result queue to
    /// answer on without a decodable work id.
    pub async fn claim(&self) -> Result<Option<WorkItem>> {
        let keys = [self.work_queue_key.clone()];
        let Some((_, bytes)) = self
            .broker
            .list_block_pop(&keys, self.config.block_pop_duration())
            .await?
        else {
            return Ok(None);
        };
        match WorkItem::decode(&bytes) {
            Ok(item) => Ok(Some(item)),
            Err(err) => {
                tracing::error!("dropping undecodable work item: {err}");
                Ok(None)
            }
        }
    }

    /// Worker side: publish the one result for a claimed item and arm the
    /// result queue's TTL.
    pub async fn publish(&self, item: &WorkItem, result: &JudgeResult) -> Result<()> {
        let key = keys::result_queue(&self.config.key_prefix, &item.work_id);
        self.broker.list_push(&key, &[result.encode()?]).await?;
        let ttl = match item.mode {
            Mode::Short => self.config.result_ttl,
            Mode::Long => self.config.result_ttl_long,
        };
        self.broker.expire(&key, Duration::from_secs(ttl)).await?;
        Ok(())
    }

    pub async fn refresh_heartbeat(&self, worker_id: &str) -> Result<()> {
        let key = keys::worker_heartbeat(&self.config.key_prefix, worker_id);
        self.broker
            .kv_set(
                &key,
                b"1",
                Some(Duration::from_secs(self.config.worker_heartbeat_ttl)),
            )
            .await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        let queue = self.broker.list_len(&self.work_queue_key).await?;
        let num_workers = self
            .broker
            .kv_count_matching(&keys::worker_heartbeat_pattern(&self.config.key_prefix))
            .await?;
        Ok(StatusSnapshot { queue, num_workers })
    }
}
