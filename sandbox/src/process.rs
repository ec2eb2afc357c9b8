use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Sentinel exit code meaning the wall-clock deadline fired (either ours or
/// the in-child alarm's).
pub const TIMEOUT_EXIT_CODE: i32 = -101;

/// Sentinel exit code reserved for language adapters whose pre-run stage
/// (compilation) failed.
pub const COMPILE_ERROR_EXIT_CODE: i32 = -102;

// Conventional shell encoding for signal deaths that are not timeouts.
const EXIT_CODE_SIGNAL_BASE: i32 = 128;

const READ_CHUNK_SIZE: usize = 8192;

const SPAWN_RETRY_DELAYS_MS: [u64; 3] = [0, 10, 50];

#[derive(Debug, Error)]
pub enum SandboxErr {
    #[error("command args are empty")]
    EmptyCommand,

    #[error("adapter produced no stages")]
    NoStages,

    #[error("cannot quote path for command template")]
    UnquotablePath,

    #[error("command template did not split into arguments: {0}")]
    BadTemplate(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Terminal outcome of one command stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessExecuteResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Wall-clock seconds spent in the stage; adapters may overwrite it with
    /// an in-process measurement.
    pub cost: f64,
}

impl ProcessExecuteResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one command in its own session/process group, feeding stdin and
/// capturing both output streams, with an optional wall-clock deadline that
/// kills the whole group.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub async fn execute(
        &self,
        command: &[String],
        cwd: &Path,
        stdin: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ProcessExecuteResult, SandboxErr> {
        let start = Instant::now();
        let (program, args) = command.split_first().ok_or(SandboxErr::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // New session: the child becomes its own process-group leader, so
        // the group can be killed as a unit, descendants included.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = spawn_with_retry(&mut cmd).await?;
        // pid == pgid because of setsid above.
        let pgid = child.id();

        if let Some(input) = stdin
            && let Some(mut handle) = child.stdin.take()
        {
            let bytes = input.as_bytes().to_vec();
            tokio::spawn(async move {
                // EPIPE just means the child stopped reading.
                let _ = handle.write_all(&bytes).await;
                let _ = handle.shutdown().await;
            });
        }

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_reader = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout pipe was unexpectedly not available"))?;
        let stderr_reader = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr pipe was unexpectedly not available"))?;
        let mut stdout_task = tokio::spawn(drain(stdout_reader, Arc::clone(&stdout_buf)));
        let mut stderr_task = tokio::spawn(drain(stderr_reader, Arc::clone(&stderr_buf)));

        // The deadline covers the pipe drain as well as the wait: a child
        // that exits but leaves an orphan holding the pipes has not finished
        // from the caller's point of view.
        let status = match timeout {
            Some(limit) => {
                let waited = tokio::time::timeout(
                    limit,
                    wait_and_drain(&mut child, &mut stdout_task, &mut stderr_task),
                )
                .await;
                match waited {
                    Ok(status) => Some(status?),
                    Err(_) => {
                        if let Some(pgid) = pgid {
                            kill_process_group(pgid);
                        }
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        stdout_task.abort();
                        stderr_task.abort();
                        None
                    }
                }
            }
            None => Some(wait_and_drain(&mut child, &mut stdout_task, &mut stderr_task).await?),
        };

        // Harvest orphaned children on every return path; a program that
        // forked unattended descendants is reaped here.
        if let Some(pgid) = pgid {
            kill_process_group(pgid);
        }

        let exit_code = map_exit_status(status);
        if exit_code == TIMEOUT_EXIT_CODE {
            tracing::debug!(?command, "sandboxed command hit its wall-clock deadline");
        }

        Ok(ProcessExecuteResult {
            stdout: take_buffer(&stdout_buf),
            stderr: take_buffer(&stderr_buf),
            exit_code,
            cost: start.elapsed().as_secs_f64(),
        })
    }
}

async fn wait_and_drain(
    child: &mut Child,
    stdout_task: &mut JoinHandle<std::io::Result<()>>,
    stderr_task: &mut JoinHandle<std::io::Result<()>>,
) -> Result<ExitStatus, SandboxErr> {
    let status = child.wait().await?;
    (&mut *stdout_task).await??;
    (&mut *stderr_task).await??;
    Ok(status)
}

async fn drain<R: AsyncRead + Unpin>(
    mut reader: R,
    buf: Arc<Mutex<Vec<u8>>>,
) -> std::io::Result<()> {
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        lock(&buf).extend_from_slice(&chunk[..n]);
    }
}

fn take_buffer(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8_lossy(&lock(buf)).into_owned()
}

fn lock(buf: &Arc<Mutex<Vec<u8>>>) -> std::sync::MutexGuard<'_, Vec<u8>> {
    buf.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `None` means our own deadline killed the run. Otherwise: SIGKILL and
/// SIGXCPU deaths are the in-child limit machinery (alarm suicide, RLIMIT_CPU
/// hard kill) and classify as timeouts; any other signal is encoded the
/// conventional shell way.
fn map_exit_status(status: Option<ExitStatus>) -> i32 {
    let Some(status) = status else {
        return TIMEOUT_EXIT_CODE;
    };
    if let Some(code) = status.code() {
        return code;
    }
    match status.signal() {
        Some(sig) if sig == libc::SIGKILL || sig == libc::SIGXCPU => TIMEOUT_EXIT_CODE,
        Some(sig) => EXIT_CODE_SIGNAL_BASE + sig,
        None => -1,
    }
}

/// Best-effort SIGKILL to a whole process group; the group may already be
/// gone.
pub(crate) fn kill_process_group(pgid: u32) {
    unsafe {
        let _ = libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
    }
}

fn is_temporary_resource_error(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || matches!(
            err.raw_os_error(),
            Some(code) if code == libc::EAGAIN || code == libc::ENOMEM
        )
}

async fn spawn_with_retry(cmd: &mut Command) -> std::io::Result<Child> {
    let mut last_err: Option<std::io::Error> = None;
    for delay_ms in SPAWN_RETRY_DELAYS_MS {
        if delay_ms > 0 {
            sleep(Duration::from_millis(delay_ms)).await;
        }
        match cmd.spawn() {
            Ok(child) => return Ok(child),
            Err(err) if is_temporary_resource_error(&err) => last_err = Some(err),
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("spawn failed")))
}
