use chrono::{Duration, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{info, warn};

use novelgraph_core::status::{ChapterState, TaskCounters, TaskStatus};

use crate::error::StoreError;
use crate::models::{ChapterStatusRow, KgTask};

/// Result of [`TaskStore::try_start_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Task moved to `running`; carries the previous status.
    Started { from: TaskStatus },
    Refused(StartRefusal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartRefusal {
    NotFound,
    AlreadyRunning,
    AlreadyCompleted,
    Cancelled,
}

impl StartRefusal {
    pub fn reason(&self) -> &'static str {
        match self {
            StartRefusal::NotFound => "task_not_found",
            StartRefusal::AlreadyRunning => "already_running",
            StartRefusal::AlreadyCompleted => "already_completed",
            StartRefusal::Cancelled => "cancelled",
        }
    }
}

/// Pure start decision, factored out of the locked transaction.
fn start_decision(status: Option<TaskStatus>) -> Result<TaskStatus, StartRefusal> {
    match status {
        None => Err(StartRefusal::NotFound),
        Some(TaskStatus::Running) => Err(StartRefusal::AlreadyRunning),
        Some(TaskStatus::Completed) => Err(StartRefusal::AlreadyCompleted),
        Some(TaskStatus::Cancelled) => Err(StartRefusal::Cancelled),
        Some(other) => Ok(other),
    }
}

/// Terminal result of one chapter's extraction.
#[derive(Debug, Clone)]
pub enum ChapterOutcome {
    Completed { entities: i64, relations: i64 },
    Failed { error: String },
}

/// Relational task store: owns every status transition of tasks and their
/// chapter rows.
#[derive(Clone)]
pub struct TaskStore {
    pool: PgPool,
}

impl TaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ── creation ─────────────────────────────────────────────────────

    /// Create a task and one `pending` chapter-status row per target
    /// chapter. `chapter_ids = None` targets the whole novel. An empty
    /// target set is allowed; such a task completes on its first claim.
    pub async fn create_task(
        &self,
        novel_id: i64,
        task_name: Option<String>,
        chapter_ids: Option<Vec<i64>>,
        use_ai: bool,
    ) -> Result<KgTask, StoreError> {
        let mut tx = self.pool.begin().await?;

        let novel_title: Option<(String,)> =
            sqlx::query_as("SELECT title FROM novels WHERE id = $1 AND NOT is_deleted")
                .bind(novel_id)
                .fetch_optional(&mut *tx)
                .await?;
        let novel_title = novel_title.ok_or(StoreError::NotFound("novel", novel_id))?.0;

        let targets: Vec<(i64,)> = match &chapter_ids {
            Some(ids) => {
                sqlx::query_as(
                    "SELECT id FROM chapters WHERE novel_id = $1 AND id = ANY($2) ORDER BY chapter_number",
                )
                .bind(novel_id)
                .bind(ids)
                .fetch_all(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_as("SELECT id FROM chapters WHERE novel_id = $1 ORDER BY chapter_number")
                    .bind(novel_id)
                    .fetch_all(&mut *tx)
                    .await?
            }
        };

        let name = task_name.unwrap_or_else(|| {
            format!("kg_build_{}_{}", novel_title, Utc::now().format("%Y%m%d_%H%M%S"))
        });

        let task = sqlx::query_as::<_, KgTask>(
            "INSERT INTO kg_tasks (task_name, novel_id, chapter_ids, use_ai, status, total_chapters)
             VALUES ($1, $2, $3, $4, 'created', $5)
             RETURNING *",
        )
        .bind(&name)
        .bind(novel_id)
        .bind(chapter_ids.map(Json))
        .bind(use_ai)
        .bind(targets.len() as i64)
        .fetch_one(&mut *tx)
        .await?;

        for (chapter_id,) in &targets {
            sqlx::query(
                "INSERT INTO kg_chapter_status (kg_task_id, chapter_id, status)
                 VALUES ($1, $2, 'pending')",
            )
            .bind(task.id)
            .bind(chapter_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(task_id = task.id, novel_id, chapters = targets.len(), "created kg task");
        Ok(task)
    }

    // ── reads ────────────────────────────────────────────────────────

    pub async fn task(&self, task_id: i64) -> Result<Option<KgTask>, StoreError> {
        let task = sqlx::query_as::<_, KgTask>("SELECT * FROM kg_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(task)
    }

    pub async fn chapter_rows(&self, task_id: i64) -> Result<Vec<ChapterStatusRow>, StoreError> {
        let rows = sqlx::query_as::<_, ChapterStatusRow>(
            "SELECT cs.* FROM kg_chapter_status cs
             JOIN chapters c ON c.id = cs.chapter_id
             WHERE cs.kg_task_id = $1
             ORDER BY c.chapter_number",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn counters(&self, task_id: i64) -> Result<TaskCounters, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT status FROM kg_chapter_status WHERE kg_task_id = $1")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(TaskCounters::aggregate(
            rows.iter().filter_map(|(s,)| ChapterState::parse(s)),
        ))
    }

    /// Chapter ids still pending, in reading order.
    pub async fn pending_chapters(&self, task_id: i64) -> Result<Vec<i64>, StoreError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT cs.chapter_id FROM kg_chapter_status cs
             JOIN chapters c ON c.id = cs.chapter_id
             WHERE cs.kg_task_id = $1 AND cs.status = 'pending'
             ORDER BY c.chapter_number",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn is_fully_completed(&self, task_id: i64) -> Result<bool, StoreError> {
        Ok(self.counters(task_id).await?.all_completed())
    }

    pub async fn failed_chapters(&self, task_id: i64) -> Result<Vec<ChapterStatusRow>, StoreError> {
        let rows = sqlx::query_as::<_, ChapterStatusRow>(
            "SELECT * FROM kg_chapter_status WHERE kg_task_id = $1 AND status = 'failed'",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_tasks(
        &self,
        novel_id: Option<i64>,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> Result<Vec<KgTask>, StoreError> {
        let tasks = sqlx::query_as::<_, KgTask>(
            "SELECT * FROM kg_tasks
             WHERE ($1::bigint IS NULL OR novel_id = $1)
               AND ($2::text IS NULL OR status = $2)
             ORDER BY created_at DESC
             LIMIT $3",
        )
        .bind(novel_id)
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    pub async fn running_task_ids(&self) -> Result<Vec<i64>, StoreError> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM kg_tasks WHERE status = 'running'")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn created_tasks(&self, limit: i64) -> Result<Vec<KgTask>, StoreError> {
        let tasks = sqlx::query_as::<_, KgTask>(
            "SELECT * FROM kg_tasks WHERE status = 'created' ORDER BY created_at LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    // ── start / status transitions ───────────────────────────────────

    /// Atomically promote a task to `running` under a row lock. The only
    /// correct way to start a task under concurrency: exactly one of K
    /// concurrent callers succeeds.
    pub async fn try_start_task(&self, task_id: i64) -> Result<StartOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM kg_tasks WHERE id = $1 FOR UPDATE")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await?;

        let status = row.and_then(|(s,)| TaskStatus::parse(&s));
        let from = match start_decision(status) {
            Ok(from) => from,
            Err(refusal) => {
                tx.rollback().await?;
                return Ok(StartOutcome::Refused(refusal));
            }
        };

        sqlx::query(
            "UPDATE kg_tasks
             SET status = 'running',
                 started_at = CASE WHEN $2 THEN now() ELSE started_at END,
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(task_id)
        .bind(matches!(from, TaskStatus::Created | TaskStatus::Paused))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(task_id, from = %from, "task started");
        Ok(StartOutcome::Started { from })
    }

    /// Apply a validated status transition with its timestamp side effects.
    ///
    /// `failed` recomputes the retry backlog (pending + failed chapters) and
    /// arms the auto-retry timer when enabled; `completed` re-counts
    /// completed chapters so the stored tally cannot drift.
    pub async fn update_task_status(
        &self,
        task_id: i64,
        to: TaskStatus,
        totals: Option<(i64, i64)>,
    ) -> Result<(), StoreError> {
        let task = self
            .task(task_id)
            .await?
            .ok_or(StoreError::NotFound("task", task_id))?;
        let from = task
            .status()
            .ok_or_else(|| StoreError::InvalidState(format!("unknown status '{}'", task.status)))?;

        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(StoreError::InvalidState(format!(
                "transition {from} -> {to} not permitted for task {task_id}"
            )));
        }

        let mut tx = self.pool.begin().await?;

        match to {
            TaskStatus::Running => {
                sqlx::query(
                    "UPDATE kg_tasks
                     SET status = 'running',
                         started_at = CASE WHEN $2 THEN now() ELSE started_at END,
                         updated_at = now()
                     WHERE id = $1",
                )
                .bind(task_id)
                .bind(matches!(from, TaskStatus::Created | TaskStatus::Paused))
                .execute(&mut *tx)
                .await?;
            }
            TaskStatus::Completed => {
                sqlx::query(
                    "UPDATE kg_tasks
                     SET status = 'completed',
                         completed_at = now(),
                         completed_chapters = (SELECT count(*) FROM kg_chapter_status
                                               WHERE kg_task_id = $1 AND status = 'completed'),
                         updated_at = now()
                     WHERE id = $1",
                )
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            }
            TaskStatus::Paused => {
                sqlx::query(
                    "UPDATE kg_tasks SET status = 'paused', paused_at = now(), updated_at = now()
                     WHERE id = $1",
                )
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            }
            TaskStatus::Failed => {
                let retry_at = if task.auto_retry_enabled {
                    let minutes = task.retry_interval_minutes.max(1);
                    Some(Utc::now() + Duration::minutes(minutes))
                } else {
                    None
                };
                // pending + failed both need a re-run, so both count as the
                // retry backlog.
                sqlx::query(
                    "UPDATE kg_tasks
                     SET status = 'failed',
                         failed_at = now(),
                         retry_scheduled_at = $2,
                         failed_chapters = (SELECT count(*) FROM kg_chapter_status
                                            WHERE kg_task_id = $1 AND status IN ('pending', 'failed')),
                         updated_at = now()
                     WHERE id = $1",
                )
                .bind(task_id)
                .bind(retry_at)
                .execute(&mut *tx)
                .await?;
                if let Some(at) = retry_at {
                    info!(task_id, retry_at = %at, "task failed, auto-retry scheduled");
                }
            }
            TaskStatus::Cancelled => {
                sqlx::query(
                    "UPDATE kg_tasks SET status = 'cancelled', updated_at = now() WHERE id = $1",
                )
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
            }
            TaskStatus::Created => {
                return Err(StoreError::InvalidState(
                    "use restart_task_rows to return a task to created".into(),
                ));
            }
        }

        if let Some((entities, relations)) = totals {
            sqlx::query(
                "UPDATE kg_tasks SET total_entities = $2, total_relations = $3 WHERE id = $1",
            )
            .bind(task_id)
            .bind(entities)
            .bind(relations)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        info!(task_id, from = %from, to = %to, "task status updated");
        Ok(())
    }

    pub async fn pause_task(&self, task_id: i64) -> Result<(), StoreError> {
        self.update_task_status(task_id, TaskStatus::Paused, None).await
    }

    pub async fn cancel_task(&self, task_id: i64) -> Result<(), StoreError> {
        self.update_task_status(task_id, TaskStatus::Cancelled, None).await
    }

    // ── chapter transitions ──────────────────────────────────────────

    /// Claim one chapter: `pending -> running`, stamping `started_at` and the
    /// task's current chapter pointer.
    pub async fn mark_chapter_running(&self, task_id: i64, chapter_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE kg_chapter_status
             SET status = 'running', started_at = now(), updated_at = now()
             WHERE kg_task_id = $1 AND chapter_id = $2 AND status = 'pending'",
        )
        .bind(task_id)
        .bind(chapter_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE kg_tasks SET current_chapter_id = $2, updated_at = now() WHERE id = $1")
            .bind(task_id)
            .bind(chapter_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Return a claimed chapter to the backlog without counting a failure
    /// (used when the provider suspends mid-task).
    pub async fn release_chapter(&self, task_id: i64, chapter_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE kg_chapter_status
             SET status = 'pending', started_at = NULL, updated_at = now()
             WHERE kg_task_id = $1 AND chapter_id = $2 AND status = 'running'",
        )
        .bind(task_id)
        .bind(chapter_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Settle one chapter in a single transaction: terminal chapter state,
    /// freshly aggregated task counters, cumulative entity/relation totals
    /// on success, error bookkeeping on failure.
    ///
    /// The graph upsert has already happened by the time this runs; partial
    /// graph writes are never rolled back because the upserts are idempotent.
    pub async fn complete_chapter(
        &self,
        task_id: i64,
        chapter_id: i64,
        outcome: ChapterOutcome,
    ) -> Result<TaskCounters, StoreError> {
        let mut tx = self.pool.begin().await?;

        match &outcome {
            ChapterOutcome::Completed { entities, relations } => {
                sqlx::query(
                    "UPDATE kg_chapter_status
                     SET status = 'completed',
                         entities_extracted = $3,
                         relations_extracted = $4,
                         error_message = NULL,
                         completed_at = now(),
                         updated_at = now()
                     WHERE kg_task_id = $1 AND chapter_id = $2",
                )
                .bind(task_id)
                .bind(chapter_id)
                .bind(entities)
                .bind(relations)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE kg_tasks
                     SET total_entities = total_entities + $2,
                         total_relations = total_relations + $3,
                         updated_at = now()
                     WHERE id = $1",
                )
                .bind(task_id)
                .bind(entities)
                .bind(relations)
                .execute(&mut *tx)
                .await?;
            }
            ChapterOutcome::Failed { error } => {
                sqlx::query(
                    "UPDATE kg_chapter_status
                     SET status = 'failed',
                         error_message = $3,
                         completed_at = now(),
                         updated_at = now()
                     WHERE kg_task_id = $1 AND chapter_id = $2",
                )
                .bind(task_id)
                .bind(chapter_id)
                .bind(error)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    "UPDATE kg_tasks
                     SET error_message = $2, last_error_chapter_id = $3, updated_at = now()
                     WHERE id = $1",
                )
                .bind(task_id)
                .bind(error)
                .bind(chapter_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        let counters = Self::refresh_counters(&mut tx, task_id).await?;
        tx.commit().await?;
        Ok(counters)
    }

    /// Re-aggregate chapter counters inside an open transaction and write
    /// them back onto the task row.
    async fn refresh_counters(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        task_id: i64,
    ) -> Result<TaskCounters, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT status FROM kg_chapter_status WHERE kg_task_id = $1")
                .bind(task_id)
                .fetch_all(&mut **tx)
                .await?;
        let counters =
            TaskCounters::aggregate(rows.iter().filter_map(|(s,)| ChapterState::parse(s)));

        sqlx::query(
            "UPDATE kg_tasks
             SET completed_chapters = $2, failed_chapters = $3, skipped_chapters = $4,
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(task_id)
        .bind(counters.completed)
        .bind(counters.failed)
        .bind(counters.skipped)
        .execute(&mut **tx)
        .await?;

        Ok(counters)
    }

    // ── retry / restart / recovery ───────────────────────────────────

    /// Reset failed chapters (or the pending backlog when nothing failed) to
    /// `pending` and park the task in `paused` so `try_start_task` can
    /// promote it atomically. Returns how many chapters were queued.
    pub async fn retry_failed_chapters(
        &self,
        task_id: i64,
        chapter_ids: Option<&[i64]>,
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        let reset = sqlx::query(
            "UPDATE kg_chapter_status
             SET status = 'pending', error_message = NULL, started_at = NULL,
                 completed_at = NULL, updated_at = now()
             WHERE kg_task_id = $1 AND status = 'failed'
               AND ($2::bigint[] IS NULL OR chapter_id = ANY($2))",
        )
        .bind(task_id)
        .bind(chapter_ids)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        // A task can fail without any failed chapter rows (system error
        // before the first claim); in that case the pending backlog is the
        // retry set.
        let queued = if reset > 0 {
            reset
        } else {
            let pending: (i64,) = sqlx::query_as(
                "SELECT count(*) FROM kg_chapter_status
                 WHERE kg_task_id = $1 AND status = 'pending'
                   AND ($2::bigint[] IS NULL OR chapter_id = ANY($2))",
            )
            .bind(task_id)
            .bind(chapter_ids)
            .fetch_one(&mut *tx)
            .await?;
            pending.0 as u64
        };

        // Park in paused, not running: try_start_task owns the promotion.
        sqlx::query(
            "UPDATE kg_tasks
             SET status = 'paused',
                 error_message = NULL,
                 failed_chapters = greatest(0, failed_chapters - $2),
                 updated_at = now()
             WHERE id = $1 AND status IN ('failed', 'paused')",
        )
        .bind(task_id)
        .bind(reset as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(task_id, chapters = queued, "chapters queued for retry");
        Ok(queued as usize)
    }

    /// Guard-side half of auto-retry: bump the attempt counter, clear the
    /// schedule, then queue failed chapters.
    pub async fn execute_retry(&self, task_id: i64) -> Result<usize, StoreError> {
        sqlx::query(
            "UPDATE kg_tasks
             SET retry_count = retry_count + 1, retry_scheduled_at = NULL, updated_at = now()
             WHERE id = $1",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        self.retry_failed_chapters(task_id, None).await
    }

    /// Tasks whose auto-retry timer has elapsed.
    pub async fn tasks_pending_retry(&self) -> Result<Vec<KgTask>, StoreError> {
        let tasks = sqlx::query_as::<_, KgTask>(
            "SELECT * FROM kg_tasks
             WHERE status = 'failed' AND auto_retry_enabled AND retry_scheduled_at <= now()",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    pub async fn toggle_auto_retry(
        &self,
        task_id: i64,
        enabled: bool,
        retry_interval_minutes: i64,
    ) -> Result<(), StoreError> {
        let armed = sqlx::query(
            "UPDATE kg_tasks
             SET auto_retry_enabled = $2,
                 retry_interval_minutes = $3,
                 retry_scheduled_at = CASE
                     WHEN $2 AND status = 'failed' THEN now() + make_interval(mins => $3::int)
                     ELSE retry_scheduled_at
                 END,
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(task_id)
        .bind(enabled)
        .bind(retry_interval_minutes)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if armed == 0 {
            return Err(StoreError::NotFound("task", task_id));
        }
        Ok(())
    }

    /// Relational half of restart: reset every chapter row to `pending`,
    /// zero the counters, return the task to `created`, and drop derived
    /// plot-extraction data. Graph cleanup (task-id multiset removal) must
    /// run before this.
    pub async fn restart_task_rows(&self, task_id: i64) -> Result<(), StoreError> {
        let task = self
            .task(task_id)
            .await?
            .ok_or(StoreError::NotFound("task", task_id))?;
        let status = task
            .status()
            .ok_or_else(|| StoreError::InvalidState(format!("unknown status '{}'", task.status)))?;
        if !status.can_restart() {
            return Err(StoreError::InvalidState(format!(
                "cannot restart task {task_id} in status {status}"
            )));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM plot_extraction_tasks WHERE kg_task_id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE kg_chapter_status
             SET status = 'pending', error_message = NULL,
                 entities_extracted = 0, relations_extracted = 0,
                 started_at = NULL, completed_at = NULL, updated_at = now()
             WHERE kg_task_id = $1",
        )
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE kg_tasks
             SET status = 'created',
                 completed_chapters = 0, failed_chapters = 0, skipped_chapters = 0,
                 total_entities = 0, total_relations = 0,
                 current_chapter_id = NULL, error_message = NULL, last_error_chapter_id = NULL,
                 failed_at = NULL, retry_scheduled_at = NULL,
                 started_at = NULL, completed_at = NULL, paused_at = NULL,
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(task_id, "task restarted");
        Ok(())
    }

    /// Delete a terminal task and its rows. Graph cleanup must run first.
    pub async fn delete_task(&self, task_id: i64) -> Result<(), StoreError> {
        let task = self
            .task(task_id)
            .await?
            .ok_or(StoreError::NotFound("task", task_id))?;
        if task.status() == Some(TaskStatus::Running) {
            return Err(StoreError::InvalidState(format!(
                "cannot delete running task {task_id}"
            )));
        }

        sqlx::query("DELETE FROM kg_tasks WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        info!(task_id, "task deleted");
        Ok(())
    }

    /// Zombie path: a `running` task with no live worker and no settled
    /// failures goes back to `created` for re-enqueue. Orphaned `running`
    /// chapters return to `pending`.
    pub async fn reset_running_to_created(&self, task_id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE kg_chapter_status
             SET status = 'pending', started_at = NULL, updated_at = now()
             WHERE kg_task_id = $1 AND status = 'running'",
        )
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE kg_tasks
             SET status = 'created', current_chapter_id = NULL, updated_at = now()
             WHERE id = $1 AND status = 'running'",
        )
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        warn!(task_id, "running task reset to created");
        Ok(())
    }

    /// Startup sweep: every orphaned `running` chapter returns to `pending`
    /// and its task (if still `running`) to `created`. Returns
    /// (chapters, tasks) recovered.
    pub async fn recover_interrupted(&self) -> Result<(usize, usize), StoreError> {
        let mut tx = self.pool.begin().await?;

        let task_rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT DISTINCT kg_task_id FROM kg_chapter_status WHERE status = 'running'",
        )
        .fetch_all(&mut *tx)
        .await?;

        let chapters = sqlx::query(
            "UPDATE kg_chapter_status
             SET status = 'pending', started_at = NULL, updated_at = now()
             WHERE status = 'running'",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let mut tasks = 0usize;
        for (task_id,) in &task_rows {
            let updated = sqlx::query(
                "UPDATE kg_tasks
                 SET status = 'created', current_chapter_id = NULL, updated_at = now()
                 WHERE id = $1 AND status = 'running'",
            )
            .bind(task_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            tasks += updated as usize;
        }

        tx.commit().await?;
        if chapters > 0 {
            info!(chapters, tasks, "recovered interrupted chapter states");
        }
        Ok((chapters as usize, tasks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_decision_refuses_terminal_and_running() {
        assert_eq!(start_decision(None), Err(StartRefusal::NotFound));
        assert_eq!(
            start_decision(Some(TaskStatus::Running)),
            Err(StartRefusal::AlreadyRunning)
        );
        assert_eq!(
            start_decision(Some(TaskStatus::Completed)),
            Err(StartRefusal::AlreadyCompleted)
        );
        assert_eq!(
            start_decision(Some(TaskStatus::Cancelled)),
            Err(StartRefusal::Cancelled)
        );
    }

    #[test]
    fn start_decision_admits_created_paused_failed() {
        assert_eq!(start_decision(Some(TaskStatus::Created)), Ok(TaskStatus::Created));
        assert_eq!(start_decision(Some(TaskStatus::Paused)), Ok(TaskStatus::Paused));
        assert_eq!(start_decision(Some(TaskStatus::Failed)), Ok(TaskStatus::Failed));
    }

    #[test]
    fn refusal_reason_codes_are_stable() {
        assert_eq!(StartRefusal::AlreadyRunning.reason(), "already_running");
        assert_eq!(StartRefusal::NotFound.reason(), "task_not_found");
        assert_eq!(StartRefusal::AlreadyCompleted.reason(), "already_completed");
        assert_eq!(StartRefusal::Cancelled.reason(), "cancelled");
    }
}
