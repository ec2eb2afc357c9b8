//! The worker loop: claim, execute in the sandbox, classify, publish.
//! A claimed item always produces exactly one published result, whatever
//! goes wrong around the sandbox.

use std::sync::Arc;
use std::time::Duration;

use judge_broker::Broker;
use judge_protocol::JudgeResult;
use judge_protocol::Language;
use judge_protocol::Mode;
use judge_protocol::Reason;
use judge_protocol::Submission;
use judge_protocol::WorkItem;
use judge_protocol::outputs_match;
use judge_sandbox::COMPILE_ERROR_EXIT_CODE;
use judge_sandbox::CppAdapter;
use judge_sandbox::LanguageAdapter;
use judge_sandbox::ProcessExecuteResult;
use judge_sandbox::PythonAdapter;
use judge_sandbox::ScriptExecutor;
use judge_sandbox::TIMEOUT_EXIT_CODE;
use judge_sandbox::truncate::clip_in_place;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::queue::WorkQueue;

/// Pause after a broker error before retrying the loop, so a dead broker
/// does not turn the worker into a busy spinner.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Worker {
    queue: WorkQueue,
    config: Arc<Config>,
    worker_id: String,
}

impl Worker {
    pub fn new(broker: Arc<dyn Broker>, config: Arc<Config>) -> Self {
        let worker_id = format!("{}-{}", std::process::id(), Uuid::new_v4());
        Self {
            queue: WorkQueue::new(broker, Arc::clone(&config)),
            config,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until cancelled. Each pass refreshes the heartbeat, waits one
    /// block-pop window for work, and processes at most one item.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(worker_id = self.worker_id, "worker started");
        while !shutdown.is_cancelled() {
            if let Err(err) = self.queue.refresh_heartbeat(&self.worker_id).await {
                tracing::warn!(worker_id = self.worker_id, "heartbeat refresh failed: {err}");
            }
            let claimed = tokio::select! {
                _ = shutdown.cancelled() => break,
                claimed = self.queue.claim() => claimed,
            };
            match claimed {
                Ok(Some(item)) => self.process(item).await,
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(worker_id = self.worker_id, "claim failed: {err}");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
        tracing::info!(worker_id = self.worker_id, "worker stopped");
    }

    /// Judge one claimed item and publish its result. Publishing is the only
    /// step allowed to fail without a result materialising, and then only
    /// because the broker itself is gone.
    pub async fn process(&self, item: WorkItem) {
        let result = self.judge(&item).await;
        tracing::info!(
            work_id = item.work_id,
            run_success = result.run_success,
            reason = result.reason.as_str(),
            cost = result.cost,
            "judged submission"
        );
        if let Err(err) = self.queue.publish(&item, &result).await {
            tracing::error!(work_id = item.work_id, "failed to publish result: {err}");
        }
    }

    async fn judge(&self, item: &WorkItem) -> JudgeResult {
        if item.mode == Mode::Short && self.is_stale(item).await {
            tracing::warn!(work_id = item.work_id, "work item went stale in the queue");
            return JudgeResult::failure(item.submission.sub_id.clone(), Reason::QueueTimeout, "");
        }

        let executor = ScriptExecutor::new(self.adapter_for(item.submission.language));
        let executed = executor
            .execute_script(
                &item.submission.solution,
                item.submission.input.as_deref(),
                Some(self.config.execution_timeout()),
            )
            .await;

        let mut result = match executed {
            Ok(exec) => classify(&item.submission, exec),
            // Nothing that goes wrong around the sandbox may drop the item:
            // surface the error as a runtime_error result instead.
            Err(err) => {
                tracing::error!(work_id = item.work_id, "sandbox error: {err}");
                JudgeResult::failure(
                    item.submission.sub_id.clone(),
                    Reason::RuntimeError,
                    err.to_string(),
                )
            }
        };
        clip_in_place(&mut result.stdout, self.config.max_stdout_error_length);
        clip_in_place(&mut result.stderr, self.config.max_stdout_error_length);
        result
    }

    /// Queue age per the broker clock; a clock we cannot read is not a
    /// reason to cancel someone's submission.
    async fn is_stale(&self, item: &WorkItem) -> bool {
        match self.queue.server_time().await {
            Ok(now) => now - item.enqueued_at > self.config.max_queue_work_life_time as f64,
            Err(err) => {
                tracing::warn!("broker clock unavailable, skipping staleness check: {err}");
                false
            }
        }
    }

    fn adapter_for(&self, language: Language) -> Box<dyn LanguageAdapter> {
        let timeout = Some(self.config.max_execution_time);
        let memory = Some(self.config.max_memory_bytes());
        match language {
            Language::Python => Box::new(PythonAdapter::new(
                self.config.python_execute_command.clone(),
                timeout,
                memory,
            )),
            Language::Cpp => Box::new(CppAdapter::new(
                self.config.cpp_compile_command.clone(),
                self.config.cpp_execute_command.clone(),
                timeout,
                memory,
            )),
        }
    }
}

/// Map a terminal execution result onto the verdict taxonomy and run the
/// output comparison when a reference output was supplied.
fn classify(submission: &Submission, exec: ProcessExecuteResult) -> JudgeResult {
    let (run_success, reason) = match exec.exit_code {
        0 => (true, Reason::None),
        TIMEOUT_EXIT_CODE => (false, Reason::WorkerTimeout),
        COMPILE_ERROR_EXIT_CODE => (false, Reason::CompileError),
        _ => (false, Reason::RuntimeError),
    };
    let success = run_success
        && submission
            .expected_output
            .as_deref()
            .is_none_or(|expected| outputs_match(&exec.stdout, expected));
    JudgeResult {
        sub_id: submission.sub_id.clone(),
        run_success,
        success,
        cost: exec.cost,
        stdout: exec.stdout,
        stderr: exec.stderr,
        reason,
    }
}
