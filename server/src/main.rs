//! Entry-point for the `judge-server` binary: `serve` runs the HTTP
//! dispatcher and supervises a worker pool; `worker` runs one worker
//! process, which is how the supervisor re-invokes this executable.

use std::sync::Arc;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use judge_broker::Broker;
use judge_broker::MemoryBroker;
use judge_server::WorkerLaunch;
use judge_server::config::Config;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "judge-server", about = "Sandboxed online code judge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP dispatcher and supervise a pool of worker processes.
    Serve(ServeArgs),
    /// Run a single worker process against the shared work queue.
    Worker,
}

#[derive(clap::Args)]
struct ServeArgs {
    /// Broker backend. The in-memory broker implies in-process workers and
    /// is only useful for single-process local runs.
    #[arg(long, value_enum, default_value_t = BrokerKind::Redis)]
    broker: BrokerKind,

    /// Do not launch workers; an externally managed pool drains the queue.
    #[arg(long)]
    no_workers: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BrokerKind {
    Redis,
    Memory,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve(args) => {
            let broker: Arc<dyn Broker> = match args.broker {
                BrokerKind::Redis => judge_server::connect_redis(&config).await?,
                BrokerKind::Memory => Arc::new(MemoryBroker::new()),
            };
            let launch = match (args.no_workers, args.broker) {
                (true, _) => WorkerLaunch::External,
                (false, BrokerKind::Redis) => WorkerLaunch::Processes,
                (false, BrokerKind::Memory) => WorkerLaunch::InProcess,
            };
            judge_server::run_server(config, broker, launch).await
        }
        Command::Worker => {
            let broker = judge_server::connect_redis(&config).await?;
            judge_server::run_worker(config, broker).await
        }
    }
}
