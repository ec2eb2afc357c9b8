//! The judge service: HTTP dispatcher, queue protocol, worker loop, and
//! worker-pool supervision, glued together over a [`judge_broker::Broker`].

use std::sync::Arc;

use judge_broker::Broker;
use judge_broker::RedisBroker;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod dispatch;
pub mod error;
pub mod queue;
pub mod supervisor;
pub mod worker;

use config::Config;
use config::ConfigError;
use dispatch::AppState;
use queue::WorkQueue;
use supervisor::Supervisor;
use worker::Worker;

/// How the serving process obtains its worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLaunch {
    /// Supervised worker OS processes (the production shape).
    Processes,
    /// Worker tasks inside this process; required for the in-memory broker,
    /// which no other process can reach.
    InProcess,
    /// No workers; an externally managed pool drains the queue.
    External,
}

pub async fn connect_redis(config: &Config) -> anyhow::Result<Arc<dyn Broker>> {
    let uri = config
        .redis_uri
        .as_deref()
        .ok_or(ConfigError::Missing("REDIS_URI"))?;
    let broker =
        RedisBroker::connect(uri, std::time::Duration::from_secs(config.socket_timeout)).await?;
    Ok(Arc::new(broker))
}

/// Run the dispatcher (and its worker pool) until SIGTERM/ctrl-c.
pub async fn run_server(
    config: Config,
    broker: Arc<dyn Broker>,
    launch: WorkerLaunch,
) -> anyhow::Result<()> {
    broker.ping().await?;
    let config = Arc::new(config);
    let queue = Arc::new(WorkQueue::new(Arc::clone(&broker), Arc::clone(&config)));
    let state = AppState {
        queue,
        config: Arc::clone(&config),
    };

    let shutdown = CancellationToken::new();
    let mut pool_tasks = Vec::new();
    match launch {
        WorkerLaunch::Processes => {
            let supervisor = Supervisor::spawn(&config)?;
            pool_tasks.push(tokio::spawn(supervisor.run(shutdown.clone())));
        }
        WorkerLaunch::InProcess => {
            for _ in 0..config.max_workers {
                let worker = Worker::new(Arc::clone(&broker), Arc::clone(&config));
                let token = shutdown.clone();
                pool_tasks.push(tokio::spawn(async move { worker.run(token).await }));
            }
        }
        WorkerLaunch::External => {}
    }

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("judge server listening on {}", listener.local_addr()?);
    axum::serve(listener, dispatch::router(state))
        .with_graceful_shutdown(wait_for_shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    for task in pool_tasks {
        let _ = task.await;
    }
    Ok(())
}

/// Run one worker process until SIGTERM/ctrl-c.
pub async fn run_worker(config: Config, broker: Arc<dyn Broker>) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let worker = Worker::new(broker, config);
    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown_signal(shutdown.clone()));
    worker.run(shutdown).await;
    Ok(())
}

async fn wait_for_shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::error!("cannot install SIGTERM handler: {err}");
            let _ = ctrl_c.await;
            shutdown.cancel();
            return;
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm.recv() => {}
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
