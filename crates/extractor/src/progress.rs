//! Progress fan-out: publish after every settled chapter so the single
//! subscriber process can push live updates to clients.

use chrono::Utc;
use tracing::debug;

use novelgraph_core::keys::PROGRESS_CHANNEL;
use novelgraph_core::progress::ProgressEvent;
use novelgraph_core::status::TaskCounters;
use novelgraph_kv::KvClient;

/// Publish a `kg_task_progress` event. Failures are logged and swallowed:
/// progress reporting must never take down the extraction path.
pub async fn publish_progress(kv: &KvClient, task_id: i64, status: &str, counters: &TaskCounters) {
    let event = ProgressEvent::new(task_id, status, counters, Utc::now());
    if let Err(e) = kv.publish(PROGRESS_CHANNEL, &event).await {
        debug!(task_id, error = %e, "progress publish skipped");
    }
}
