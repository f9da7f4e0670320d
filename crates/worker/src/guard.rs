//! The guard loop: auto-healing for the whole pipeline.
//!
//! Every cycle it respawns missing workers, drops stale worker hashes,
//! reclassifies zombie tasks, enqueues freshly created tasks, and fires
//! due auto-retries. Any single failing step logs and moves on; the next
//! cycle gets another chance.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use novelgraph_core::config::NodeConfig;
use novelgraph_core::keys::{self, ttl, RULES_PROVIDER};
use novelgraph_core::status::{ChapterState, TaskCounters, TaskStatus};
use novelgraph_kv::{DistributedLock, KvClient};
use novelgraph_queue::{choose_provider_for_task, TaskQueues};
use novelgraph_store::{ProviderStore, TaskStore};

use crate::pool::{pid_alive, WorkerPool};
use crate::suspension::QueueReassigner;

/// Zombies handled per cycle; large incidents heal over several cycles.
const ZOMBIE_BATCH_LIMIT: usize = 100;
/// Created tasks enqueued per cycle.
const AUTO_ENQUEUE_LIMIT: i64 = 20;

const ZOMBIE_LOCK: &str = "zombie_reclassify";

/// What to do with a `running` task no live worker claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZombieOutcome {
    Complete,
    Fail,
    Requeue,
}

/// Classify from the task's chapter states and whether an error was
/// recorded: all completed -> complete; any failure evidence -> fail;
/// otherwise back to `created` for a clean re-run.
pub fn classify_zombie(states: &[ChapterState], has_error: bool) -> ZombieOutcome {
    let counters = TaskCounters::aggregate(states.iter().copied());
    if counters.all_completed() {
        ZombieOutcome::Complete
    } else if counters.failed > 0 || has_error {
        ZombieOutcome::Fail
    } else {
        ZombieOutcome::Requeue
    }
}

pub struct Guard {
    node: NodeConfig,
    kv: KvClient,
    lock: DistributedLock,
    tasks: TaskStore,
    providers: ProviderStore,
    queues: TaskQueues,
    pool: Arc<WorkerPool>,
    reassigner: Arc<QueueReassigner>,
}

impl Guard {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: NodeConfig,
        kv: KvClient,
        tasks: TaskStore,
        providers: ProviderStore,
        queues: TaskQueues,
        pool: Arc<WorkerPool>,
        reassigner: Arc<QueueReassigner>,
    ) -> Self {
        Self {
            lock: DistributedLock::new(kv.clone()),
            node,
            kv,
            tasks,
            providers,
            queues,
            pool,
            reassigner,
        }
    }

    pub async fn run(&self, shutdown: Arc<Notify>) {
        let interval = Duration::from_secs(self.node.guard_interval_secs);
        info!(interval_secs = interval.as_secs(), "guard loop started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cycle().await,
                _ = shutdown.notified() => {
                    info!("guard loop stopping");
                    break;
                }
            }
        }
    }

    pub async fn cycle(&self) {
        let providers = self.target_providers().await;
        self.pool.ensure_workers(&providers).await;

        if let Err(e) = self.cleanup_dead_workers().await {
            error!(error = %e, "dead worker cleanup failed");
        }
        if let Err(e) = self.reclassify_zombies().await {
            error!(error = %e, "zombie reclassification failed");
        }
        if let Err(e) = self.auto_enqueue_created().await {
            error!(error = %e, "auto-enqueue failed");
        }
        if let Err(e) = self.poll_auto_retries().await {
            error!(error = %e, "auto-retry poll failed");
        }
    }

    /// Providers this node should staff: the configured list or the active
    /// set from the store, always including `rules`.
    async fn target_providers(&self) -> Vec<String> {
        let mut providers = match &self.node.providers {
            Some(fixed) => fixed.clone(),
            None => self.providers.active_provider_names().await.unwrap_or_else(|e| {
                warn!(error = %e, "could not list active providers");
                Vec::new()
            }),
        };
        if !providers.iter().any(|p| p == RULES_PROVIDER) {
            providers.push(RULES_PROVIDER.to_string());
        }
        providers
    }

    /// Drop `kg:worker:<pid>` hashes whose process is gone: local pids that
    /// no longer exist, or pids owned by a node whose heartbeat expired.
    async fn cleanup_dead_workers(&self) -> Result<(), crate::error::WorkerError> {
        for key in self.kv.scan_keys(keys::WORKER_PATTERN).await? {
            let hash = self.kv.hgetall(&key).await?;
            if hash.is_empty() {
                continue;
            }
            let Some(pid) = keys::pid_from_worker_key(&key) else { continue };
            let owner = hash.get("node_name").cloned().unwrap_or_default();

            let dead = if owner == self.node.name {
                !pid_alive(pid)
            } else if owner.is_empty() {
                false
            } else {
                !self.kv.exists(&keys::node(&owner)).await?
            };

            if dead {
                warn!(pid, node = %owner, "removing dead worker hash");
                self.kv.del(&key).await?;
            }
        }
        Ok(())
    }

    /// Task ids currently claimed in any live worker hash.
    async fn claimed_task_ids(&self) -> Result<HashSet<i64>, crate::error::WorkerError> {
        let mut claimed = HashSet::new();
        for key in self.kv.scan_keys(keys::WORKER_PATTERN).await? {
            if let Some(task_id) = self.kv.hget(&key, "task_id").await? {
                if let Ok(task_id) = task_id.parse::<i64>() {
                    claimed.insert(task_id);
                }
            }
        }
        Ok(claimed)
    }

    /// Reclassify `running` tasks nobody claims. Guarded by a distributed
    /// lock so co-existing guards on other hosts don't double-apply.
    async fn reclassify_zombies(&self) -> Result<(), crate::error::WorkerError> {
        let Some(guard) = self.lock.try_acquire(ZOMBIE_LOCK, ttl::LOCK_DEFAULT).await? else {
            debug!("another guard holds the zombie lock, skipping");
            return Ok(());
        };

        let result = self.reclassify_zombies_locked().await;
        let _ = self.lock.release(guard).await;
        result
    }

    async fn reclassify_zombies_locked(&self) -> Result<(), crate::error::WorkerError> {
        let claimed = self.claimed_task_ids().await?;
        let running = self.tasks.running_task_ids().await?;
        let zombies: Vec<i64> = running
            .into_iter()
            .filter(|id| !claimed.contains(id))
            .take(ZOMBIE_BATCH_LIMIT)
            .collect();

        if zombies.is_empty() {
            return Ok(());
        }
        warn!(count = zombies.len(), "reclassifying zombie tasks");

        for task_id in zombies {
            let Some(task) = self.tasks.task(task_id).await? else { continue };
            let states: Vec<ChapterState> = self
                .tasks
                .chapter_rows(task_id)
                .await?
                .iter()
                .filter_map(|row| row.state())
                .collect();

            match classify_zombie(&states, task.error_message.is_some()) {
                ZombieOutcome::Complete => {
                    info!(task_id, "zombie task actually finished, completing");
                    if let Err(e) = self.tasks.update_task_status(task_id, TaskStatus::Completed, None).await {
                        warn!(task_id, error = %e, "could not complete zombie task");
                    }
                }
                ZombieOutcome::Fail => {
                    info!(task_id, "zombie task has failures, failing");
                    if let Err(e) = self.tasks.update_task_status(task_id, TaskStatus::Failed, None).await {
                        warn!(task_id, error = %e, "could not fail zombie task");
                    }
                }
                ZombieOutcome::Requeue => {
                    info!(task_id, "zombie task reset for re-run");
                    self.tasks.reset_running_to_created(task_id).await?;
                }
            }
        }
        Ok(())
    }

    /// Push `created` tasks onto the best provider's main queue, skipping
    /// any task whose ref is already queued somewhere.
    async fn auto_enqueue_created(&self) -> Result<(), crate::error::WorkerError> {
        let created = self.tasks.created_tasks(AUTO_ENQUEUE_LIMIT).await?;
        if created.is_empty() {
            return Ok(());
        }

        for task in created {
            if self.task_is_queued(task.id).await? {
                continue;
            }
            let candidates = self.reassigner.eligible_targets(RULES_PROVIDER).await;
            let provider =
                choose_provider_for_task(&self.queues, task.use_ai, &candidates).await?;
            self.queues.enqueue_to_main(task.id, &provider).await?;
            info!(task_id = task.id, provider = %provider, "auto-enqueued created task");
        }
        Ok(())
    }

    /// Whether a task ref already sits in any main queue or active batch.
    async fn task_is_queued(&self, task_id: i64) -> Result<bool, crate::error::WorkerError> {
        let needle = format!("\"task_id\":{task_id},");
        for pattern in [keys::MAIN_QUEUE_PATTERN, "kg:active_batch:*"] {
            for key in self.kv.scan_keys(pattern).await? {
                for body in self.kv.lrange(&key, 0, -1).await? {
                    if body.contains(&needle) {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Fire auto-retries whose timer elapsed: reset failed chapters, park
    /// the task in `paused`, and re-enqueue so a worker can promote it.
    async fn poll_auto_retries(&self) -> Result<(), crate::error::WorkerError> {
        for task in self.tasks.tasks_pending_retry().await? {
            info!(task_id = task.id, retry = task.retry_count + 1, "auto-retry due");
            match self.tasks.execute_retry(task.id).await {
                Ok(queued) if queued > 0 => {
                    let candidates = self.reassigner.eligible_targets(RULES_PROVIDER).await;
                    let provider =
                        choose_provider_for_task(&self.queues, task.use_ai, &candidates).await?;
                    self.queues.enqueue_to_main(task.id, &provider).await?;
                    info!(task_id = task.id, provider = %provider, chapters = queued, "auto-retry enqueued");
                }
                Ok(_) => debug!(task_id = task.id, "auto-retry had nothing to queue"),
                Err(e) => warn!(task_id = task.id, error = %e, "auto-retry failed"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_completed_zombie_is_completed() {
        let states = vec![ChapterState::Completed, ChapterState::Completed];
        assert_eq!(classify_zombie(&states, false), ZombieOutcome::Complete);
    }

    #[test]
    fn skipped_chapters_still_count_as_success() {
        let states = vec![ChapterState::Completed, ChapterState::Skipped];
        assert_eq!(classify_zombie(&states, false), ZombieOutcome::Complete);
    }

    #[test]
    fn any_failed_chapter_fails_the_zombie() {
        let states = vec![ChapterState::Completed, ChapterState::Failed];
        assert_eq!(classify_zombie(&states, false), ZombieOutcome::Fail);
    }

    #[test]
    fn recorded_error_fails_even_without_failed_rows() {
        let states = vec![ChapterState::Pending, ChapterState::Running];
        assert_eq!(classify_zombie(&states, true), ZombieOutcome::Fail);
    }

    #[test]
    fn clean_interrupted_zombie_is_requeued() {
        let states = vec![ChapterState::Completed, ChapterState::Running, ChapterState::Pending];
        assert_eq!(classify_zombie(&states, false), ZombieOutcome::Requeue);
    }

    #[test]
    fn empty_task_zombie_counts_as_complete() {
        assert_eq!(classify_zombie(&[], false), ZombieOutcome::Complete);
    }
}
