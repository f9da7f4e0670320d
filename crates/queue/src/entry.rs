use serde::{Deserialize, Serialize};

use novelgraph_core::keys::normalize_provider;

/// One unit of queued work: a task assigned to a provider. The provider
/// field travels with the entry so reassignment can rewrite it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: i64,
    pub provider: String,
}

impl QueueEntry {
    pub fn new(task_id: i64, provider: &str) -> Self {
        Self {
            task_id,
            provider: normalize_provider(provider),
        }
    }

    /// Move the entry to another provider's queue.
    pub fn reassigned_to(&self, provider: &str) -> Self {
        Self::new(self.task_id, provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_normalizes_provider_case() {
        let entry = QueueEntry::new(5, " OpenAI ");
        assert_eq!(entry.provider, "openai");
    }

    #[test]
    fn entry_round_trips_as_json() {
        let entry = QueueEntry::new(42, "claude");
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"task_id":42,"provider":"claude"}"#);
        let back: QueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn reassignment_rewrites_provider_only() {
        let entry = QueueEntry::new(7, "openai");
        let moved = entry.reassigned_to("DeepSeek");
        assert_eq!(moved.task_id, 7);
        assert_eq!(moved.provider, "deepseek");
    }
}
