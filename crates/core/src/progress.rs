use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::TaskCounters;

/// Progress event published on the `kg_progress` channel after every chapter
/// settles. Consumers must tolerate at-least-once delivery and out-of-order
/// arrival, deduplicating on `(task_id, updated_at)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub task_id: i64,
    pub status: String,
    /// Completion percentage in `0..=100`, one decimal.
    pub progress: f64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
    pub updated_at: DateTime<Utc>,
}

impl ProgressEvent {
    pub const EVENT_TYPE: &'static str = "kg_task_progress";

    pub fn new(task_id: i64, status: &str, counters: &TaskCounters, updated_at: DateTime<Utc>) -> Self {
        Self {
            event_type: Self::EVENT_TYPE.to_string(),
            task_id,
            status: status.to_string(),
            progress: counters.progress_pct(),
            completed: counters.completed,
            failed: counters.failed,
            total: counters.total,
            updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ChapterState;

    #[test]
    fn event_serializes_with_type_tag() {
        let counters = TaskCounters::aggregate([
            ChapterState::Completed,
            ChapterState::Failed,
            ChapterState::Pending,
            ChapterState::Pending,
        ]);
        let event = ProgressEvent::new(7, "running", &counters, Utc::now());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "kg_task_progress");
        assert_eq!(json["task_id"], 7);
        assert_eq!(json["completed"], 1);
        assert_eq!(json["failed"], 1);
        assert_eq!(json["total"], 4);
        assert_eq!(json["progress"], 25.0);
    }

    #[test]
    fn event_round_trips() {
        let counters = TaskCounters::aggregate([ChapterState::Completed]);
        let event = ProgressEvent::new(3, "completed", &counters, Utc::now());
        let back: ProgressEvent =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(back.task_id, 3);
        assert_eq!(back.status, "completed");
        assert_eq!(back.progress, 100.0);
    }
}
