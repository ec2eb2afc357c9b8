use serde::Deserialize;
use serde::Serialize;

/// Failure taxonomy carried in a result. The success path is the empty
/// string; `queue_timeout` is the only outcome a client may retry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "queue_timeout")]
    QueueTimeout,
    #[serde(rename = "worker_timeout")]
    WorkerTimeout,
    #[serde(rename = "compile_error")]
    CompileError,
    #[serde(rename = "runtime_error")]
    RuntimeError,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::None => "",
            Reason::QueueTimeout => "queue_timeout",
            Reason::WorkerTimeout => "worker_timeout",
            Reason::CompileError => "compile_error",
            Reason::RuntimeError => "runtime_error",
        }
    }
}

/// The structured verdict for one submission.
///
/// All seven fields are always present on the wire; an absent `sub_id`
/// serializes as `null`. `run_success` means the program compiled (where
/// applicable) and exited 0 within limits; `success` additionally requires
/// the output comparison to pass (or to have been skipped).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeResult {
    #[serde(default)]
    pub sub_id: Option<String>,
    pub run_success: bool,
    pub success: bool,
    pub cost: f64,
    pub stdout: String,
    pub stderr: String,
    pub reason: Reason,
}

impl JudgeResult {
    /// A verdict for a submission that never produced a normal execution
    /// result (stale in queue, dispatcher deadline, worker-side error).
    pub fn failure(sub_id: Option<String>, reason: Reason, stderr: impl Into<String>) -> Self {
        Self {
            sub_id,
            run_success: false,
            success: false,
            cost: 0.0,
            stdout: String::new(),
            stderr: stderr.into(),
            reason,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// The canonical output comparison: whitespace-trimmed exact match, so
/// trailing newlines on either side never fail a submission.
pub fn outputs_match(stdout: &str, expected: &str) -> bool {
    stdout.trim() == expected.trim()
}
