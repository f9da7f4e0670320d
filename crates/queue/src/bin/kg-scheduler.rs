//! kg-scheduler — single-instance batch scheduler.
//!
//! Every few seconds, promotes the next batch of task refs from each
//! provider's main queue into its active batch. Run exactly one instance;
//! a supervisor (systemd, k8s) should restart it on exit.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::Notify;
use tracing::info;

use novelgraph_core::config::{self, Config};
use novelgraph_kv::KvClient;
use novelgraph_queue::BatchScheduler;

/// Knowledge-graph batch scheduler.
#[derive(Parser, Debug)]
#[command(name = "kg-scheduler", version, about)]
struct Cli {
    /// Seconds between batch checks.
    #[arg(long, env = "SCHEDULER_INTERVAL")]
    interval: Option<u64>,

    /// Entries moved per batch.
    #[arg(long, env = "BATCH_SIZE")]
    batch_size: Option<usize>,
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
    let mut config = Config::from_env();
    if let Some(interval) = cli.interval {
        config.scheduler.check_interval_secs = interval;
    }
    if let Some(batch_size) = cli.batch_size {
        config.scheduler.batch_size = batch_size;
    }
    config.log_summary();

    let kv = KvClient::connect(&config.redis.url).await?;
    let scheduler = BatchScheduler::new(kv, &config.scheduler);

    let shutdown = Arc::new(Notify::new());
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal_shutdown.notify_waiters();
    });

    scheduler.run(shutdown).await;
    info!("kg-scheduler exited cleanly");
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
