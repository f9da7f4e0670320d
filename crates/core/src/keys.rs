//! Normative KV key schema.
//!
//! Every Redis key the pipeline touches is built here so the layout can be
//! audited in one place. All provider-scoped keys use the normalized
//! (lowercased) provider name.

/// Synthetic provider backed by the deterministic rules extractor.
pub const RULES_PROVIDER: &str = "rules";

/// Pub/sub channel carrying `kg_task_progress` events.
pub const PROGRESS_CHANNEL: &str = "kg_progress";

/// TTLs, in seconds.
pub mod ttl {
    pub const BATCH_META: u64 = 86_400;
    pub const FAILURE_COUNT: u64 = 86_400;
    pub const SUSPENSION: u64 = 600;
    pub const LAST_REQUEST: u64 = 86_400;
    pub const WORKER: u64 = 3_600;
    pub const NODE: u64 = 180;
    pub const LOCK_DEFAULT: u64 = 30;
}

/// Lowercase and trim a provider name; empty input maps to `rules`.
pub fn normalize_provider(provider: &str) -> String {
    let p = provider.trim().to_lowercase();
    if p.is_empty() {
        RULES_PROVIDER.to_string()
    } else {
        p
    }
}

pub fn main_queue(provider: &str) -> String {
    format!("kg:main_queue:{}", normalize_provider(provider))
}

pub fn active_batch(provider: &str) -> String {
    format!("kg:active_batch:{}", normalize_provider(provider))
}

pub fn batch_meta(provider: &str) -> String {
    format!("kg:batch_meta:{}", normalize_provider(provider))
}

pub fn provider_fail(provider: &str) -> String {
    format!("kg:provider:fail:{}", normalize_provider(provider))
}

pub fn provider_suspend(provider: &str) -> String {
    format!("kg:provider:suspend:{}", normalize_provider(provider))
}

pub fn provider_last_request(provider: &str) -> String {
    format!("kg:provider:last_request:{}", normalize_provider(provider))
}

pub fn worker(pid: u32) -> String {
    format!("kg:worker:{pid}")
}

pub fn node(node_name: &str) -> String {
    format!("kg:nodes:{node_name}")
}

pub fn lock(name: &str) -> String {
    format!("kg:lock:{name}")
}

/// Pattern matching every provider main queue, for scheduler discovery.
pub const MAIN_QUEUE_PATTERN: &str = "kg:main_queue:*";

/// Pattern matching every worker hash, for the guard sweep.
pub const WORKER_PATTERN: &str = "kg:worker:*";

/// Extract the provider name back out of a main-queue key.
pub fn provider_from_main_queue_key(key: &str) -> Option<&str> {
    key.strip_prefix("kg:main_queue:")
}

/// Extract the pid back out of a worker key.
pub fn pid_from_worker_key(key: &str) -> Option<u32> {
    key.strip_prefix("kg:worker:")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_keys_are_lowercased() {
        assert_eq!(main_queue(" OpenAI "), "kg:main_queue:openai");
        assert_eq!(active_batch("DeepSeek"), "kg:active_batch:deepseek");
        assert_eq!(provider_fail("Claude"), "kg:provider:fail:claude");
        assert_eq!(provider_suspend("claude"), "kg:provider:suspend:claude");
    }

    #[test]
    fn empty_provider_falls_back_to_rules() {
        assert_eq!(normalize_provider(""), RULES_PROVIDER);
        assert_eq!(normalize_provider("  "), RULES_PROVIDER);
        assert_eq!(main_queue(""), "kg:main_queue:rules");
    }

    #[test]
    fn main_queue_key_round_trips() {
        let key = main_queue("openai");
        assert_eq!(provider_from_main_queue_key(&key), Some("openai"));
        assert_eq!(provider_from_main_queue_key("kg:active_batch:openai"), None);
    }

    #[test]
    fn worker_key_round_trips() {
        assert_eq!(pid_from_worker_key(&worker(4242)), Some(4242));
        assert_eq!(pid_from_worker_key("kg:worker:not-a-pid"), None);
    }
}
