//! Batch scheduler: the single background job that feeds active batches.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use novelgraph_core::config::SchedulerConfig;
use novelgraph_kv::KvClient;

use crate::error::QueueError;
use crate::queues::TaskQueues;

/// Status key for monitoring, refreshed on every tick.
const STATUS_KEY: &str = "kg:batch_scheduler:info";
const STATUS_TTL: u64 = 300;

pub struct BatchScheduler {
    kv: KvClient,
    queues: TaskQueues,
    check_interval: Duration,
    batch_size: usize,
}

impl BatchScheduler {
    pub fn new(kv: KvClient, config: &SchedulerConfig) -> Self {
        Self {
            queues: TaskQueues::new(kv.clone()),
            kv,
            check_interval: Duration::from_secs(config.check_interval_secs),
            batch_size: config.batch_size,
        }
    }

    /// Run until `shutdown` fires. The first tick loads immediately;
    /// missing a later tick is safe because the invariant (non-empty main +
    /// empty active must be refilled) is re-checked every cycle.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(
            interval_secs = self.check_interval.as_secs(),
            batch_size = self.batch_size,
            "batch scheduler started"
        );
        let mut ticker = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_and_load().await {
                        error!(error = %e, "batch scheduler cycle failed");
                    }
                }
                _ = shutdown.notified() => {
                    info!("batch scheduler stopping");
                    break;
                }
            }
        }
    }

    /// One cycle: every provider with backlog and an empty active batch
    /// gets the next batch.
    pub async fn check_and_load(&self) -> Result<usize, QueueError> {
        self.write_status().await;

        let providers = self.queues.providers_with_backlog().await?;
        if providers.is_empty() {
            debug!("no pending work in any main queue");
            return Ok(0);
        }

        let mut total = 0usize;
        for provider in &providers {
            let active = self.queues.active_len(provider).await?;
            if active > 0 {
                debug!(provider = %provider, active, "active batch still in flight");
                continue;
            }
            match self.queues.load_next_batch(provider, self.batch_size).await {
                Ok(moved) => total += moved,
                Err(e) => error!(provider = %provider, error = %e, "failed to load batch"),
            }
        }
        Ok(total)
    }

    async fn write_status(&self) {
        let fields = [
            ("running", "true".to_string()),
            ("check_interval", self.check_interval.as_secs().to_string()),
            ("batch_size", self.batch_size.to_string()),
            ("last_run", Utc::now().to_rfc3339()),
        ];
        if let Err(e) = self.kv.hset_all(STATUS_KEY, &fields).await {
            debug!(error = %e, "failed to write scheduler status");
            return;
        }
        let _ = self.kv.expire(STATUS_KEY, STATUS_TTL as i64).await;
    }
}
