//! Worker-pool supervision: N worker OS processes, each in its own process
//! group so a runaway sandbox can never wedge the dispatcher, restarted on
//! death and torn down with SIGTERM then SIGKILL.

use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Child;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

const RESTART_DELAY: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Supervisor {
    children: Vec<Child>,
}

impl Supervisor {
    /// Spawn the configured number of worker processes by re-invoking the
    /// current executable with the `worker` subcommand.
    pub fn spawn(config: &Config) -> std::io::Result<Self> {
        let mut children = Vec::with_capacity(config.max_workers);
        for index in 0..config.max_workers {
            let child = spawn_worker_process()?;
            tracing::info!(index, pid = child.id(), "spawned worker process");
            children.push(child);
        }
        Ok(Self { children })
    }

    /// Monitor the pool until shutdown: dead workers are logged and
    /// relaunched after a short delay.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.shutdown().await;
                    return;
                }
                (index, status) = wait_any(&mut self.children) => {
                    tracing::warn!(index, ?status, "worker process died; restarting");
                    tokio::time::sleep(RESTART_DELAY).await;
                    match spawn_worker_process() {
                        Ok(child) => self.children[index] = child,
                        Err(err) => {
                            tracing::error!(index, "failed to restart worker: {err}");
                        }
                    }
                }
            }
        }
    }

    /// SIGTERM the worker groups, give them a grace period to finish the
    /// submission in flight, then SIGKILL whatever is left.
    async fn shutdown(&mut self) {
        tracing::info!("stopping {} worker processes", self.children.len());
        for child in &mut self.children {
            if let Some(pid) = child.id() {
                signal_group(pid, libc::SIGTERM);
            }
        }
        for child in &mut self.children {
            let graceful =
                tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await;
            if graceful.is_err() {
                if let Some(pid) = child.id() {
                    tracing::warn!(pid, "worker ignored SIGTERM, escalating");
                    signal_group(pid, libc::SIGKILL);
                }
                let _ = child.wait().await;
            }
        }
    }
}

fn spawn_worker_process() -> std::io::Result<Child> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.arg("worker")
        .stdin(Stdio::null())
        .kill_on_drop(true);
    // Each worker leads its own group; shutdown signals the group so any
    // half-reaped sandbox children go with it.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.spawn()
}

async fn wait_any(children: &mut [Child]) -> (usize, std::io::Result<ExitStatus>) {
    if children.is_empty() {
        // Nothing to monitor; park until shutdown cancels us.
        std::future::pending::<()>().await;
    }
    let waits = children
        .iter_mut()
        .map(|child| Box::pin(child.wait()))
        .collect::<Vec<_>>();
    let (status, index, _) = futures::future::select_all(waits).await;
    (index, status)
}

fn signal_group(pid: u32, signal: i32) {
    unsafe {
        let _ = libc::kill(-(pid as i32), signal);
    }
}
