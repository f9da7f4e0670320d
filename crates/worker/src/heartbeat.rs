//! Worker and node presence in the KV store.
//!
//! `kg:worker:<pid>` tells the guard which tasks are actually claimed;
//! `kg:nodes:<name>` tells a central UI which hosts are alive. Both expire
//! on their own, so a crashed process disappears without cleanup.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use novelgraph_core::keys::{self, ttl};
use novelgraph_kv::{KvClient, KvError};

const NODE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// This process's `kg:worker:<pid>` hash.
#[derive(Clone)]
pub struct WorkerPresence {
    kv: KvClient,
    key: String,
    provider: String,
    node_name: String,
}

impl WorkerPresence {
    pub fn new(kv: KvClient, provider: &str, node_name: &str) -> Self {
        Self {
            kv,
            key: keys::worker(std::process::id()),
            provider: keys::normalize_provider(provider),
            node_name: node_name.to_string(),
        }
    }

    pub async fn register(&self) -> Result<(), KvError> {
        let fields = [
            ("provider", self.provider.clone()),
            ("pid", std::process::id().to_string()),
            ("node_name", self.node_name.clone()),
            ("last_heartbeat", unix_now().to_string()),
        ];
        self.kv.hset_all(&self.key, &fields).await?;
        self.kv.expire(&self.key, ttl::WORKER as i64).await
    }

    pub async fn heartbeat(&self) {
        let fields = [("last_heartbeat", unix_now().to_string())];
        if let Err(e) = self.kv.hset_all(&self.key, &fields).await {
            debug!(error = %e, "worker heartbeat skipped");
            return;
        }
        let _ = self.kv.expire(&self.key, ttl::WORKER as i64).await;
    }

    /// Record the claimed task so the guard can tell live work from zombies.
    pub async fn claim_task(&self, task_id: i64) {
        let fields = [
            ("task_id", task_id.to_string()),
            ("start_time", unix_now().to_string()),
        ];
        if let Err(e) = self.kv.hset_all(&self.key, &fields).await {
            warn!(task_id, error = %e, "failed to record task claim");
        }
        let _ = self.kv.expire(&self.key, ttl::WORKER as i64).await;
    }

    pub async fn clear_task(&self) {
        if let Err(e) = self.kv.hdel(&self.key, &["task_id", "start_time"]).await {
            debug!(error = %e, "failed to clear task claim");
        }
    }

    pub async fn deregister(&self) {
        let _ = self.kv.del(&self.key).await;
    }
}

/// Per-host heartbeat loop writing `kg:nodes:<name>` every minute.
pub struct NodeHeartbeat {
    kv: KvClient,
    node_name: String,
    started_at: String,
}

impl NodeHeartbeat {
    pub fn new(kv: KvClient, node_name: &str) -> Self {
        Self {
            kv,
            node_name: node_name.to_string(),
            started_at: Utc::now().to_rfc3339(),
        }
    }

    pub async fn register(&self) {
        let fields = [
            ("node_id", self.node_name.clone()),
            ("node_type", "worker".to_string()),
            ("pid", std::process::id().to_string()),
            ("started_at", self.started_at.clone()),
            ("last_heartbeat", Utc::now().to_rfc3339()),
        ];
        let key = keys::node(&self.node_name);
        if let Err(e) = self.kv.hset_all(&key, &fields).await {
            warn!(node = %self.node_name, error = %e, "node heartbeat failed");
            return;
        }
        let _ = self.kv.expire(&key, ttl::NODE as i64).await;
    }

    pub async fn run(&self, shutdown: Arc<Notify>) {
        self.register().await;
        let mut ticker = tokio::time::interval(NODE_HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.register().await,
                _ = shutdown.notified() => break,
            }
        }
    }
}
