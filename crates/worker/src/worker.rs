//! The per-provider worker loop.
//!
//! One process runs exactly one of these, bound to one provider. All
//! coordination with other workers goes through the KV store and the
//! relational store; nothing is shared in memory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use novelgraph_core::keys::RULES_PROVIDER;
use novelgraph_extractor::{ChapterExtractor, TaskRunOutcome};
use novelgraph_queue::{choose_provider_for_task, QueueEntry, TaskQueues};
use novelgraph_throttle::ProviderThrottle;

use crate::heartbeat::WorkerPresence;
use crate::suspension::QueueReassigner;

const POP_TIMEOUT_SECS: f64 = 3.0;
const SUSPENDED_SLEEP: Duration = Duration::from_secs(5);
const SUSPENDED_LOG_EVERY: Duration = Duration::from_secs(120);
const IDLE_HEARTBEAT_EVERY: Duration = Duration::from_secs(60);
const MAX_BACKOFF_SECS: u64 = 8;

pub struct WorkerLoop {
    provider: String,
    queues: TaskQueues,
    throttle: Arc<ProviderThrottle>,
    extractor: ChapterExtractor,
    presence: WorkerPresence,
    reassigner: Arc<QueueReassigner>,
}

impl WorkerLoop {
    pub fn new(
        provider: &str,
        queues: TaskQueues,
        throttle: Arc<ProviderThrottle>,
        extractor: ChapterExtractor,
        presence: WorkerPresence,
        reassigner: Arc<QueueReassigner>,
    ) -> Self {
        Self {
            provider: novelgraph_core::keys::normalize_provider(provider),
            queues,
            throttle,
            extractor,
            presence,
            reassigner,
        }
    }

    /// Run until `shutdown` fires. The current task is allowed to finish;
    /// the supervisor enforces a hard deadline with SIGKILL if needed.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(provider = %self.provider, pid = std::process::id(), "worker starting");
        if let Err(e) = self.presence.register().await {
            warn!(error = %e, "could not register worker presence");
        }

        let mut suspended_logged_at: Option<Instant> = None;
        let mut last_heartbeat = Instant::now();
        let mut backoff_secs = 1u64;
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        {
            let stop = stop.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.notified().await;
                stop.store(true, std::sync::atomic::Ordering::SeqCst);
            });
        }

        loop {
            if stop.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }

            // Suspended providers neither pop nor fail work; the queue
            // keeps the backlog until the cooldown lapses.
            if self.provider != RULES_PROVIDER && self.throttle.is_suspended(&self.provider).await {
                let log_due = suspended_logged_at
                    .map(|at| at.elapsed() >= SUSPENDED_LOG_EVERY)
                    .unwrap_or(true);
                if log_due {
                    warn!(provider = %self.provider, "provider suspended, waiting for recovery");
                    suspended_logged_at = Some(Instant::now());
                }
                self.presence.heartbeat().await;
                last_heartbeat = Instant::now();
                tokio::time::sleep(SUSPENDED_SLEEP).await;
                continue;
            }
            if suspended_logged_at.take().is_some() {
                info!(provider = %self.provider, "provider recovered");
            }

            let entry = match self.queues.brpop_active(&self.provider, POP_TIMEOUT_SECS).await {
                Ok(entry) => entry,
                Err(e) => {
                    error!(provider = %self.provider, error = %e, "queue pop failed");
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
            };

            let Some(entry) = entry else {
                if last_heartbeat.elapsed() >= IDLE_HEARTBEAT_EVERY {
                    self.presence.heartbeat().await;
                    last_heartbeat = Instant::now();
                }
                continue;
            };

            info!(provider = %self.provider, task_id = entry.task_id, "claimed task ref");
            self.presence.claim_task(entry.task_id).await;

            match self.extractor.run_task(entry.task_id).await {
                Ok(outcome) => {
                    self.handle_outcome(&entry, &outcome).await;
                    backoff_secs = 1;
                }
                Err(e) => {
                    error!(task_id = entry.task_id, error = %e, "task run failed");
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
            }

            self.presence.clear_task().await;
            self.presence.heartbeat().await;
            last_heartbeat = Instant::now();
        }

        self.presence.deregister().await;
        info!(provider = %self.provider, "worker stopped");
    }

    /// A paused task has lost its queue ref (this worker consumed it).
    /// When the pause came from a provider suspension, re-enqueue it: onto
    /// an eligible provider if one exists, else back onto our own main
    /// queue to wait out the suspension. An admin pause (provider healthy)
    /// stays parked until the operator resumes it.
    async fn handle_outcome(&self, entry: &QueueEntry, outcome: &TaskRunOutcome) {
        match outcome {
            TaskRunOutcome::Paused => {
                if !self.throttle.is_suspended(&self.provider).await {
                    debug!(task_id = entry.task_id, "task paused by operator, leaving parked");
                    return;
                }
                let targets = self.reassigner.eligible_targets(&self.provider).await;
                let use_ai = !targets.is_empty();
                let target = match choose_provider_for_task(&self.queues, use_ai, &targets).await {
                    Ok(target) if use_ai => target,
                    _ => self.provider.clone(),
                };
                match self.queues.enqueue_to_main(entry.task_id, &target).await {
                    Ok(()) => info!(task_id = entry.task_id, target = %target, "paused task re-enqueued"),
                    Err(e) => {
                        error!(task_id = entry.task_id, error = %e, "failed to re-enqueue paused task")
                    }
                }
            }
            TaskRunOutcome::Completed => {
                info!(task_id = entry.task_id, "task completed");
            }
            TaskRunOutcome::Failed => {
                warn!(task_id = entry.task_id, "task finished with failed chapters");
            }
            TaskRunOutcome::AlreadyRunning | TaskRunOutcome::LeftRunning => {
                debug!(task_id = entry.task_id, ?outcome, "task left to other workers");
            }
            TaskRunOutcome::Stopped | TaskRunOutcome::Refused(_) => {
                debug!(task_id = entry.task_id, ?outcome, "task not runnable");
            }
        }
    }
}
