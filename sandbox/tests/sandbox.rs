//! Behavior tests for the process executor and the staged script runner.
//! Everything here runs against `/bin/sh`; the interpreter round-trips at the
//! bottom skip themselves when `python3` is not installed.

use std::path::Path;
use std::time::Duration;
use std::time::Instant;

use judge_sandbox::COMPILE_ERROR_EXIT_CODE;
use judge_sandbox::LanguageAdapter;
use judge_sandbox::ProcessExecutor;
use judge_sandbox::PythonAdapter;
use judge_sandbox::Result;
use judge_sandbox::ScriptExecutor;
use judge_sandbox::Stage;
use judge_sandbox::TIMEOUT_EXIT_CODE;
use pretty_assertions::assert_eq;

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

/// Concatenated command lines of every live process, for asserting that a
/// marker child did not outlive its sandbox.
fn process_table() -> String {
    let mut table = String::new();
    if let Ok(entries) = std::fs::read_dir("/proc") {
        for entry in entries.flatten() {
            if let Ok(bytes) = std::fs::read(entry.path().join("cmdline")) {
                table.push_str(&String::from_utf8_lossy(&bytes).replace('\0', " "));
                table.push('\n');
            }
        }
    }
    table
}

/// The group kill is delivered before `execute` returns, but init may still
/// be reaping the corpse; give it a moment before declaring a leak.
fn assert_process_gone(marker: &str) {
    for _ in 0..20 {
        if !process_table().contains(marker) {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!("process with marker {marker} survived the group kill");
}

#[tokio::test]
async fn captures_stdout_stderr_and_exit_code() {
    let workdir = tempfile::tempdir().expect("tempdir");
    let result = ProcessExecutor
        .execute(
            &sh("echo out; echo err >&2; exit 3"),
            workdir.path(),
            None,
            Some(Duration::from_secs(5)),
        )
        .await
        .expect("execute");

    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
    assert_eq!(result.exit_code, 3);
    assert!(!result.success());
    assert!(result.cost > 0.0);
}

#[tokio::test]
async fn feeds_stdin_to_the_child() {
    let workdir = tempfile::tempdir().expect("tempdir");
    let result = ProcessExecutor
        .execute(
            &sh("cat"),
            workdir.path(),
            Some("hello judge\n"),
            Some(Duration::from_secs(5)),
        )
        .await
        .expect("execute");

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "hello judge\n");
}

#[tokio::test]
async fn wall_deadline_kills_the_process_group() {
    let workdir = tempfile::tempdir().expect("tempdir");
    let start = Instant::now();
    let result = ProcessExecutor
        .execute(
            &sh("sleep 31557"),
            workdir.path(),
            None,
            Some(Duration::from_secs(1)),
        )
        .await
        .expect("execute");

    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "kill took {:?}",
        start.elapsed()
    );
    assert_process_gone("sleep 31557");
}

#[tokio::test]
async fn orphaned_children_cannot_outlive_the_deadline() {
    let workdir = tempfile::tempdir().expect("tempdir");
    // The parent exits immediately but its orphan inherits the stdout pipe,
    // so the run only ends when the deadline reaps the whole group.
    let result = ProcessExecutor
        .execute(
            &sh("sleep 31558 & echo parent done"),
            workdir.path(),
            None,
            Some(Duration::from_secs(1)),
        )
        .await
        .expect("execute");

    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(
        result.stdout.contains("parent done"),
        "partial output lost: {result:?}"
    );
    assert_process_gone("sleep 31558");
}

#[tokio::test]
async fn empty_command_is_rejected() {
    let workdir = tempfile::tempdir().expect("tempdir");
    let err = ProcessExecutor
        .execute(&[], workdir.path(), None, None)
        .await;
    assert!(err.is_err());
}

/// Minimal adapter for exercising the stage machinery without a real
/// compiler: one scripted compile stage, one scripted run stage.
struct ShPlan {
    compile: &'static str,
    run: &'static str,
}

impl LanguageAdapter for ShPlan {
    fn prepare(&self, _workdir: &Path, _source: &str) -> Result<Vec<Stage>> {
        Ok(vec![Stage::compile(sh(self.compile)), Stage::run(sh(self.run))])
    }
}

#[tokio::test]
async fn failing_compile_stage_short_circuits() {
    let executor = ScriptExecutor::new(Box::new(ShPlan {
        compile: "echo 'expected expression' >&2; exit 1",
        run: "echo never reached",
    }));
    let result = executor
        .execute_script("", None, Some(Duration::from_secs(5)))
        .await
        .expect("execute");

    assert_eq!(result.exit_code, COMPILE_ERROR_EXIT_CODE);
    assert_eq!(result.stdout, "");
    assert!(result.stderr.contains("expected expression"));
    assert_eq!(result.cost, 0.0);
}

#[tokio::test]
async fn passing_compile_stage_proceeds_to_run() {
    let executor = ScriptExecutor::new(Box::new(ShPlan {
        compile: "true",
        run: "echo ran",
    }));
    let result = executor
        .execute_script("", None, Some(Duration::from_secs(5)))
        .await
        .expect("execute");

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "ran\n");
}

fn python_available() -> bool {
    which::which("python3").is_ok()
}

#[tokio::test]
async fn python_round_trip_echoes_stdin() {
    if !python_available() {
        return;
    }
    let executor = ScriptExecutor::new(Box::new(PythonAdapter::new(
        "python3 {source}",
        Some(10),
        Some(256 * 1024 * 1024),
    )));
    let result = executor
        .execute_script("print(input())", Some("a"), Some(Duration::from_secs(10)))
        .await
        .expect("execute");

    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(result.stdout, "a\n");
    // The duration mark replaces the wall measurement and never includes
    // interpreter startup overhead measured from outside.
    assert!(result.cost < 10.0);
}

#[tokio::test]
async fn python_sleep_suicides_with_the_timeout_sentinel() {
    if !python_available() {
        return;
    }
    let executor = ScriptExecutor::new(Box::new(PythonAdapter::new(
        "python3 {source}",
        Some(2),
        None,
    )));
    let start = Instant::now();
    let result = executor
        .execute_script(
            "from time import sleep\nsleep(30)",
            None,
            Some(Duration::from_secs(2)),
        )
        .await
        .expect("execute");

    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert!(
        result.stdout.trim().ends_with("Suicide from timeout."),
        "stdout: {result:?}"
    );
    assert!(start.elapsed() < Duration::from_secs(8));
}
