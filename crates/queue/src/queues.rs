//! Two-level per-provider work queue.
//!
//! The main queue is the long-term backlog; the active batch is the small
//! working set workers block-pop from. Keeping them separate bounds the
//! blast radius of a misbehaving provider and lets the scheduler rebalance
//! the backlog without touching in-flight work.

use chrono::Utc;
use redis::Script;
use tracing::{debug, info, warn};

use novelgraph_core::keys::{self, ttl};
use novelgraph_kv::KvClient;

use crate::entry::QueueEntry;
use crate::error::QueueError;

/// Atomic batch promotion. Refuses to load while the active batch is
/// non-empty, so K concurrent invocations produce exactly one non-zero
/// move. LPOP main + LPUSH active keeps FIFO order for the BRPOP consumer.
const LOAD_BATCH_SCRIPT: &str = r#"
if redis.call("LLEN", KEYS[2]) > 0 then
    return 0
end
local moved = 0
local batch = tonumber(ARGV[1])
while moved < batch do
    local item = redis.call("LPOP", KEYS[1])
    if not item then
        break
    end
    redis.call("LPUSH", KEYS[2], item)
    moved = moved + 1
end
if moved > 0 then
    redis.call("HSET", KEYS[3], "loaded_at", ARGV[2], "task_count", moved, "provider", ARGV[3])
    redis.call("EXPIRE", KEYS[3], ARGV[4])
end
return moved
"#;

#[derive(Clone)]
pub struct TaskQueues {
    kv: KvClient,
}

impl TaskQueues {
    pub fn new(kv: KvClient) -> Self {
        Self { kv }
    }

    /// Append a task to the provider's main queue.
    pub async fn enqueue_to_main(&self, task_id: i64, provider: &str) -> Result<(), QueueError> {
        let entry = QueueEntry::new(task_id, provider);
        self.kv.rpush_json(&keys::main_queue(&entry.provider), &entry).await?;
        debug!(task_id, provider = %entry.provider, "task enqueued to main queue");
        Ok(())
    }

    /// Promote up to `batch_size` entries from main to active, atomically.
    /// Returns 0 when the active batch still has work.
    pub async fn load_next_batch(&self, provider: &str, batch_size: usize) -> Result<usize, QueueError> {
        let provider = keys::normalize_provider(provider);
        let mut con = self.kv.connection();
        let moved: i64 = Script::new(LOAD_BATCH_SCRIPT)
            .key(keys::main_queue(&provider))
            .key(keys::active_batch(&provider))
            .key(keys::batch_meta(&provider))
            .arg(batch_size)
            .arg(Utc::now().to_rfc3339())
            .arg(&provider)
            .arg(ttl::BATCH_META)
            .invoke_async(&mut con)
            .await?;
        if moved > 0 {
            info!(provider = %provider, moved, "loaded next batch");
        }
        Ok(moved as usize)
    }

    /// Worker-side blocking pop from the active batch. Entries that fail to
    /// parse are dropped with a warning rather than wedging the consumer.
    pub async fn brpop_active(
        &self,
        provider: &str,
        timeout_secs: f64,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let raw = self.kv.brpop(&keys::active_batch(provider), timeout_secs).await?;
        match raw {
            None => Ok(None),
            Some(body) => match serde_json::from_str::<QueueEntry>(&body) {
                Ok(entry) => Ok(Some(entry)),
                Err(e) => {
                    warn!(provider, error = %e, "discarding malformed queue entry");
                    Ok(None)
                }
            },
        }
    }

    /// Non-blocking pop from the head of either queue, for draining.
    pub async fn pop_main(&self, provider: &str) -> Result<Option<QueueEntry>, QueueError> {
        self.pop_list(&keys::main_queue(provider)).await
    }

    pub async fn pop_active(&self, provider: &str) -> Result<Option<QueueEntry>, QueueError> {
        self.pop_list(&keys::active_batch(provider)).await
    }

    async fn pop_list(&self, key: &str) -> Result<Option<QueueEntry>, QueueError> {
        loop {
            match self.kv.lpop(key).await? {
                None => return Ok(None),
                Some(body) => match serde_json::from_str::<QueueEntry>(&body) {
                    Ok(entry) => return Ok(Some(entry)),
                    Err(e) => {
                        warn!(key, error = %e, "discarding malformed queue entry");
                        continue;
                    }
                },
            }
        }
    }

    pub async fn main_len(&self, provider: &str) -> Result<usize, QueueError> {
        Ok(self.kv.llen(&keys::main_queue(provider)).await?)
    }

    pub async fn active_len(&self, provider: &str) -> Result<usize, QueueError> {
        Ok(self.kv.llen(&keys::active_batch(provider)).await?)
    }

    /// Combined backlog depth, the provider-selection metric.
    pub async fn combined_len(&self, provider: &str) -> Result<usize, QueueError> {
        Ok(self.main_len(provider).await? + self.active_len(provider).await?)
    }

    pub async fn purge_main(&self, provider: &str) -> Result<usize, QueueError> {
        let key = keys::main_queue(provider);
        let len = self.kv.llen(&key).await?;
        self.kv.del(&key).await?;
        info!(provider, purged = len, "purged main queue");
        Ok(len)
    }

    pub async fn purge_active(&self, provider: &str) -> Result<usize, QueueError> {
        let key = keys::active_batch(provider);
        let len = self.kv.llen(&key).await?;
        self.kv.del(&key).await?;
        info!(provider, purged = len, "purged active batch");
        Ok(len)
    }

    /// Providers whose main queue currently holds work.
    pub async fn providers_with_backlog(&self) -> Result<Vec<String>, QueueError> {
        let mut providers = Vec::new();
        for key in self.kv.scan_keys(keys::MAIN_QUEUE_PATTERN).await? {
            if let Some(provider) = keys::provider_from_main_queue_key(&key) {
                if self.kv.llen(&key).await? > 0 {
                    providers.push(provider.to_string());
                }
            }
        }
        providers.sort();
        Ok(providers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_script_checks_active_before_moving() {
        // The empty-active check has to precede any LPOP, otherwise two
        // concurrent loads could both move entries.
        let check = LOAD_BATCH_SCRIPT.find(r#"LLEN", KEYS[2]"#).unwrap();
        let pop = LOAD_BATCH_SCRIPT.find(r#"LPOP", KEYS[1]"#).unwrap();
        assert!(check < pop);
    }

    #[test]
    fn load_script_records_batch_metadata() {
        assert!(LOAD_BATCH_SCRIPT.contains(r#"HSET", KEYS[3]"#));
        assert!(LOAD_BATCH_SCRIPT.contains(r#"EXPIRE", KEYS[3]"#));
    }
}
