use sqlx::PgPool;
use tracing::info;

use crate::error::StoreError;

/// Derived plot-extraction bookkeeping. One row per extraction run, keyed
/// to the knowledge-graph task that produced the source entities; restart
/// and deletion of that task remove these rows wholesale.
#[derive(Clone)]
pub struct PlotStore {
    pool: PgPool,
}

impl PlotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a plot-extraction run for a task. Returns None when a run is
    /// already in flight or finished, so concurrent finalizers start at
    /// most one.
    pub async fn begin_for_task(&self, kg_task_id: i64) -> Result<Option<i64>, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO plot_extraction_tasks (kg_task_id, status)
             SELECT $1, 'running'
             WHERE NOT EXISTS (
                 SELECT 1 FROM plot_extraction_tasks
                 WHERE kg_task_id = $1 AND status IN ('running', 'completed')
             )
             RETURNING id",
        )
        .bind(kg_task_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = row {
            info!(kg_task_id, plot_task_id = id, "plot extraction run opened");
            Ok(Some(id))
        } else {
            Ok(None)
        }
    }

    pub async fn finish(&self, plot_task_id: i64, status: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE plot_extraction_tasks SET status = $2, updated_at = now() WHERE id = $1",
        )
        .bind(plot_task_id)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn log(&self, plot_task_id: i64, message: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO plot_extraction_logs (task_id, message) VALUES ($1, $2)")
            .bind(plot_task_id)
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
