//! kg-worker — one worker process bound to one provider.
//!
//! Spawned by `kg-node` (or run standalone). Opens its own PostgreSQL,
//! Redis, and Neo4j connections after start, consumes the provider's
//! active batch, and drives chapter extraction.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::info;

use novelgraph_core::config::{self, Config};
use novelgraph_extractor::ChapterExtractor;
use novelgraph_graph::GraphStore;
use novelgraph_kv::KvClient;
use novelgraph_queue::TaskQueues;
use novelgraph_store::{init_pg_pool, NovelStore, ProviderStore, TaskStore};
use novelgraph_throttle::ProviderThrottle;
use novelgraph_worker::{QueueReassigner, WorkerLoop, WorkerPresence};

/// Knowledge-graph extraction worker for a single provider.
#[derive(Parser, Debug)]
#[command(name = "kg-worker", version, about)]
struct Cli {
    /// Provider this worker consumes (e.g. "openai", "claude", "rules").
    #[arg(long)]
    provider: String,
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
    info!(provider = %cli.provider, node = %config.node.name, "kg-worker starting");

    // Two Redis clients: blocking pops pin their socket and must not share
    // with short operations.
    let kv = KvClient::connect(&config.redis.url).await?;
    let kv_blocking = KvClient::connect(&config.redis.url).await?;

    let pool = init_pg_pool(&config.postgres).await?;
    let tasks = TaskStore::new(pool.clone());
    let novels = NovelStore::new(pool.clone());
    let providers = ProviderStore::new(pool);

    let graph = GraphStore::connect(&config.neo4j).await?;
    graph.ensure_indexes().await?;

    let throttle = Arc::new(ProviderThrottle::new(kv.clone(), providers.clone()));
    let reassigner = Arc::new(QueueReassigner::new(
        kv.clone(),
        TaskQueues::new(kv.clone()),
        providers.clone(),
        tasks.clone(),
    ));
    throttle.set_listener(reassigner.clone()).await;

    let extractor = ChapterExtractor::new(
        &cli.provider,
        tasks.clone(),
        novels,
        providers,
        graph,
        throttle.clone(),
        kv.clone(),
        std::time::Duration::from_secs(config.llm.request_timeout_secs),
    )
    .await?;

    let presence = WorkerPresence::new(kv.clone(), &cli.provider, &config.node.name);
    let worker = WorkerLoop::new(
        &cli.provider,
        TaskQueues::new(kv_blocking),
        throttle,
        extractor,
        presence,
        reassigner,
    );

    let shutdown = Arc::new(Notify::new());
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_shutdown.notify_waiters();
    });

    worker.run(shutdown).await;
    info!("kg-worker exited cleanly");
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
