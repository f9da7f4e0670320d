//! Suspension fan-out: what happens to a provider's queued and running
//! work the moment it crosses the failure threshold.

use async_trait::async_trait;
use tracing::{error, info, warn};

use novelgraph_core::keys::{self, normalize_provider};
use novelgraph_kv::KvClient;
use novelgraph_queue::{reassign_provider_tasks, TaskQueues};
use novelgraph_store::{ProviderStore, TaskStore};
use novelgraph_throttle::SuspensionListener;

/// Installed on the throttle by every worker process. On suspension it
/// migrates the provider's queued refs to the best eligible provider and
/// pauses the tasks other workers of that provider currently claim (the
/// workers themselves observe the pause at their next chapter boundary).
pub struct QueueReassigner {
    kv: KvClient,
    queues: TaskQueues,
    providers: ProviderStore,
    tasks: TaskStore,
}

impl QueueReassigner {
    pub fn new(kv: KvClient, queues: TaskQueues, providers: ProviderStore, tasks: TaskStore) -> Self {
        Self { kv, queues, providers, tasks }
    }

    /// Active providers that are not the given one and not suspended.
    pub async fn eligible_targets(&self, excluding: &str) -> Vec<String> {
        let excluding = normalize_provider(excluding);
        let names = match self.providers.active_provider_names().await {
            Ok(names) => names,
            Err(e) => {
                error!(error = %e, "could not list active providers");
                return Vec::new();
            }
        };
        let mut eligible = Vec::new();
        for name in names {
            if name == excluding {
                continue;
            }
            match self.kv.exists(&keys::provider_suspend(&name)).await {
                Ok(true) => continue,
                Ok(false) => eligible.push(name),
                Err(_) => eligible.push(name),
            }
        }
        eligible
    }

    async fn pause_claimed_tasks(&self, provider: &str) {
        let worker_keys = match self.kv.scan_keys(keys::WORKER_PATTERN).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "could not scan worker hashes");
                return;
            }
        };
        for key in worker_keys {
            let Ok(hash) = self.kv.hgetall(&key).await else { continue };
            if hash.get("provider").map(String::as_str) != Some(provider) {
                continue;
            }
            let Some(task_id) = hash.get("task_id").and_then(|t| t.parse::<i64>().ok()) else {
                continue;
            };
            match self.tasks.pause_task(task_id).await {
                Ok(()) => info!(task_id, provider, "paused task of suspended provider"),
                Err(e) => warn!(task_id, provider, error = %e, "could not pause task"),
            }
        }
    }
}

#[async_trait]
impl SuspensionListener for QueueReassigner {
    async fn on_suspended(&self, provider: &str) {
        let provider = normalize_provider(provider);
        let targets = self.eligible_targets(&provider).await;

        match reassign_provider_tasks(&self.queues, &provider, &targets).await {
            Ok(moved) if moved > 0 => {
                info!(provider = %provider, moved, "migrated queued tasks after suspension");
            }
            Ok(_) => {}
            Err(e) => error!(provider = %provider, error = %e, "queue reassignment failed"),
        }

        self.pause_claimed_tasks(&provider).await;
    }
}
