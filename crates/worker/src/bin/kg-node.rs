//! kg-node — worker-node supervisor.
//!
//! Runs one per host: spawns and heals `kg-worker` processes for every
//! active provider, runs the guard loop (dead workers, zombies,
//! auto-enqueue, auto-retry), and keeps the node heartbeat fresh.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Notify;
use tracing::info;

use novelgraph_core::config::{self, Config};
use novelgraph_kv::KvClient;
use novelgraph_queue::TaskQueues;
use novelgraph_store::{init_pg_pool, ProviderStore, TaskStore};
use novelgraph_worker::{Guard, NodeHeartbeat, QueueReassigner, WorkerPool};

const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Knowledge-graph worker node supervisor.
#[derive(Parser, Debug)]
#[command(name = "kg-node", version, about)]
struct Cli {
    /// Reset orphaned running chapters/tasks at startup. Only safe after a
    /// full outage, when no other node has live workers.
    #[arg(long)]
    recover: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    let kv = KvClient::connect(&config.redis.url).await?;
    kv.ping().await?;

    let pool = init_pg_pool(&config.postgres).await?;
    let tasks = TaskStore::new(pool.clone());
    let providers = ProviderStore::new(pool);
    let queues = TaskQueues::new(kv.clone());

    if cli.recover {
        let (chapters, recovered) = tasks.recover_interrupted().await?;
        info!(chapters, tasks = recovered, "startup recovery sweep done");
    }

    let reassigner = Arc::new(QueueReassigner::new(
        kv.clone(),
        queues.clone(),
        providers.clone(),
        tasks.clone(),
    ));
    let worker_pool = Arc::new(WorkerPool::new(config.node.clone())?);
    let guard = Guard::new(
        config.node.clone(),
        kv.clone(),
        tasks,
        providers,
        queues,
        worker_pool.clone(),
        reassigner,
    );
    let heartbeat = NodeHeartbeat::new(kv, &config.node.name);

    let shutdown = Arc::new(Notify::new());
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_shutdown.notify_waiters();
    });

    let heartbeat_shutdown = shutdown.clone();
    let heartbeat_handle = tokio::spawn(async move {
        heartbeat.run(heartbeat_shutdown).await;
    });

    info!(node = %config.node.name, "kg-node running");
    guard.run(shutdown).await;

    // Guard stopped: bring the children down before exiting.
    worker_pool.stop_all(STOP_TIMEOUT).await;
    heartbeat_handle.abort();
    info!("kg-node exited cleanly");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl_c");
    }
}
