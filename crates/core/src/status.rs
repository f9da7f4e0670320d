use serde::{Deserialize, Serialize};

/// Lifecycle state of a knowledge-graph task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(TaskStatus::Created),
            "running" => Some(TaskStatus::Running),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether a direct transition `self -> to` is permitted.
    ///
    /// Restart (terminal -> created) is a separate administrative path,
    /// see [`TaskStatus::can_restart`].
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Created, Running) | (Created, Failed) | (Created, Completed) | (Created, Cancelled) => true,
            (Running, Paused) | (Running, Failed) | (Running, Completed) | (Running, Cancelled) => true,
            (Paused, Running) | (Paused, Failed) | (Paused, Cancelled) => true,
            (Failed, Running) | (Failed, Cancelled) => true,
            (Completed, Running) => true,
            _ => false,
        }
    }

    /// Terminal states that a restart may reset back to `created`.
    pub fn can_restart(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state of one (task, chapter) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChapterState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ChapterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChapterState::Pending => "pending",
            ChapterState::Running => "running",
            ChapterState::Completed => "completed",
            ChapterState::Failed => "failed",
            ChapterState::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ChapterState::Pending),
            "running" => Some(ChapterState::Running),
            "completed" => Some(ChapterState::Completed),
            "failed" => Some(ChapterState::Failed),
            "skipped" => Some(ChapterState::Skipped),
            _ => None,
        }
    }

    pub fn is_settled(self) -> bool {
        matches!(self, ChapterState::Completed | ChapterState::Failed | ChapterState::Skipped)
    }
}

impl std::fmt::Display for ChapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task chapter tallies, always recomputed from the full set of
/// chapter states so the stored counters cannot drift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounters {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl TaskCounters {
    pub fn aggregate<I: IntoIterator<Item = ChapterState>>(states: I) -> Self {
        let mut c = TaskCounters::default();
        for state in states {
            c.total += 1;
            match state {
                ChapterState::Pending => c.pending += 1,
                ChapterState::Running => c.running += 1,
                ChapterState::Completed => c.completed += 1,
                ChapterState::Failed => c.failed += 1,
                ChapterState::Skipped => c.skipped += 1,
            }
        }
        c
    }

    /// No chapter is pending or still claimed by a worker.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.running == 0
    }

    /// Every chapter finished successfully.
    pub fn all_completed(&self) -> bool {
        self.is_settled() && self.failed == 0 && self.completed + self.skipped == self.total
    }

    pub fn progress_pct(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed as f64 / self.total as f64 * 1000.0).round() / 10.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            TaskStatus::Created,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use TaskStatus::*;
        // claim, pause, resume, retry
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Failed.can_transition_to(Running));
        // cancelled is a dead end
        for to in [Running, Paused, Failed, Completed, Cancelled] {
            assert!(!Cancelled.can_transition_to(to));
        }
        // no skipping straight from created to paused
        assert!(!Created.can_transition_to(Paused));
        assert!(!Completed.can_transition_to(Failed));
        // restart path is separate
        assert!(Completed.can_restart());
        assert!(Failed.can_restart());
        assert!(!Running.can_restart());
    }

    #[test]
    fn counters_cover_every_state() {
        let counters = TaskCounters::aggregate([
            ChapterState::Pending,
            ChapterState::Running,
            ChapterState::Completed,
            ChapterState::Completed,
            ChapterState::Failed,
            ChapterState::Skipped,
        ]);
        assert_eq!(counters.total, 6);
        assert_eq!(
            counters.total,
            counters.pending + counters.running + counters.completed + counters.failed + counters.skipped
        );
        assert!(!counters.is_settled());
        assert!(!counters.all_completed());
    }

    #[test]
    fn settled_task_with_only_successes_is_complete() {
        let counters = TaskCounters::aggregate([
            ChapterState::Completed,
            ChapterState::Completed,
            ChapterState::Skipped,
        ]);
        assert!(counters.is_settled());
        assert!(counters.all_completed());
        let with_failure =
            TaskCounters::aggregate([ChapterState::Completed, ChapterState::Failed]);
        assert!(with_failure.is_settled());
        assert!(!with_failure.all_completed());
    }

    #[test]
    fn empty_task_counts_as_fully_completed() {
        let counters = TaskCounters::aggregate([]);
        assert!(counters.all_completed());
        assert_eq!(counters.progress_pct(), 0.0);
    }

    #[test]
    fn progress_is_rounded_to_one_decimal() {
        let counters = TaskCounters::aggregate([
            ChapterState::Completed,
            ChapterState::Pending,
            ChapterState::Pending,
        ]);
        assert_eq!(counters.progress_pct(), 33.3);
    }
}
