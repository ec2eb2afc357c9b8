use std::path::Path;

use crate::LanguageAdapter;
use crate::ProcessExecuteResult;
use crate::Result;
use crate::Stage;
use crate::TIMEOUT_EXIT_CODE;
use crate::script::render_command;

/// Everything from this mark onward in stdout is judge metadata, stripped
/// before the output leaves the sandbox.
pub const SCRIPT_ENDING_MARK: &str = "@@E";

/// Prefix of the line carrying the in-process duration measurement.
pub const DURATION_MARK: &str = "@@D";

/// Interpreter startup needs headroom beyond the submission's own budget.
const PYTHON_MEMORY_OVERHEAD_BYTES: u64 = 128 * 1024 * 1024;

// Prepended to every submission. Sets the CPU/memory/core rlimits, arms the
// alarm that kills the process group if RLIMIT_CPU never fires (a sleeping
// program burns no CPU), pins numeric libraries to one thread, and records a
// perf-counter start for the duration mark.
const PRE_TEMPLATE: &str = r#"def _exec_prepare():
    import signal
    import resource
    import os
    import time

    # preventing multi-threading for numpy
    os.environ['OPENBLAS_NUM_THREADS'] = '1'

    def _exec_set_alarm_timeout(timeout):
        signal.signal(signal.SIGALRM, _exec_time_exceeded)
        signal.alarm(timeout)

    def _exec_time_exceeded(*_):
        print('Suicide from timeout.', flush=True)
        try:
            os.killpg(0, signal.SIGKILL)
        except Exception:
            pass
        try:
            os.kill(0, signal.SIGKILL)
        except Exception:
            pass
        os._exit({timeout_exit_code})

    def _exec_set_max_runtime(seconds):
        soft, hard = resource.getrlimit(resource.RLIMIT_CPU)
        resource.setrlimit(resource.RLIMIT_CPU, (seconds, hard))

    def _exec_limit_memory(maxsize):
        soft, hard = resource.getrlimit(resource.RLIMIT_AS)
        resource.setrlimit(resource.RLIMIT_AS, (maxsize, hard))

    resource.setrlimit(resource.RLIMIT_CORE, (0, 0))
    if {timeout}:
        _exec_set_alarm_timeout({timeout})
        _exec_set_max_runtime({timeout})

    if {memory_limit}:
        _exec_limit_memory({memory_limit})

    return time.perf_counter()

_exec_time_start = _exec_prepare()
"#;

const POST_TEMPLATE: &str = r#"def _exec_end():
    import time
    _exec_time_end = time.perf_counter()
    _exec_duration = _exec_time_end - _exec_time_start
    print("@@E")
    print(f"@@D{_exec_duration}", flush=True)

_exec_end()
"#;

/// Wraps a Python submission with the resource-limit preamble and the
/// duration epilogue, then runs it through the configured interpreter
/// command.
pub struct PythonAdapter {
    run_template: String,
    timeout_secs: Option<u64>,
    memory_limit_bytes: Option<u64>,
}

impl PythonAdapter {
    pub fn new(
        run_template: impl Into<String>,
        timeout_secs: Option<u64>,
        memory_limit_bytes: Option<u64>,
    ) -> Self {
        Self {
            run_template: run_template.into(),
            timeout_secs,
            memory_limit_bytes: memory_limit_bytes
                .map(|bytes| bytes + PYTHON_MEMORY_OVERHEAD_BYTES),
        }
    }
}

impl LanguageAdapter for PythonAdapter {
    fn prepare(&self, workdir: &Path, source: &str) -> Result<Vec<Stage>> {
        let preamble = PRE_TEMPLATE
            .replace("{timeout_exit_code}", &TIMEOUT_EXIT_CODE.to_string())
            .replace("{timeout}", &self.timeout_secs.unwrap_or(0).to_string())
            .replace(
                "{memory_limit}",
                &self.memory_limit_bytes.unwrap_or(0).to_string(),
            );

        let mut script = String::with_capacity(preamble.len() + source.len() + POST_TEMPLATE.len() + 2);
        script.push_str(&preamble);
        script.push('\n');
        script.push_str(source);
        script.push('\n');
        script.push_str(POST_TEMPLATE);

        let source_path = workdir.join("source.py");
        std::fs::write(&source_path, script)?;

        let command = render_command(
            &self.run_template,
            &[("source", source_path.as_path()), ("workdir", workdir)],
        )?;
        Ok(vec![Stage::run(command)])
    }

    fn postprocess(&self, mut result: ProcessExecuteResult) -> ProcessExecuteResult {
        if let Some(idx) = result.stdout.find(SCRIPT_ENDING_MARK) {
            let meta = result.stdout[idx + SCRIPT_ENDING_MARK.len()..].to_string();
            result.stdout.truncate(idx);
            for line in meta.lines() {
                if let Some(raw) = line.strip_prefix(DURATION_MARK) {
                    if let Ok(duration) = raw.trim().parse::<f64>() {
                        result.cost = duration;
                    }
                    break;
                }
            }
        }
        result
    }
}
