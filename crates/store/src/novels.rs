use sqlx::PgPool;

use crate::error::StoreError;
use crate::models::{Chapter, Novel};

/// Read-side access to novels and chapter content.
#[derive(Clone)]
pub struct NovelStore {
    pool: PgPool,
}

impl NovelStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn novel(&self, novel_id: i64) -> Result<Option<Novel>, StoreError> {
        let novel = sqlx::query_as::<_, Novel>(
            "SELECT * FROM novels WHERE id = $1 AND NOT is_deleted",
        )
        .bind(novel_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(novel)
    }

    pub async fn chapter(&self, chapter_id: i64) -> Result<Option<Chapter>, StoreError> {
        let chapter = sqlx::query_as::<_, Chapter>("SELECT * FROM chapters WHERE id = $1")
            .bind(chapter_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(chapter)
    }

    pub async fn chapters_for_novel(&self, novel_id: i64) -> Result<Vec<Chapter>, StoreError> {
        let chapters = sqlx::query_as::<_, Chapter>(
            "SELECT * FROM chapters WHERE novel_id = $1 ORDER BY chapter_number",
        )
        .bind(novel_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(chapters)
    }

    /// Subset of a novel's chapters, ordered by chapter number. Ids not
    /// belonging to the novel are ignored.
    pub async fn chapters_by_ids(
        &self,
        novel_id: i64,
        chapter_ids: &[i64],
    ) -> Result<Vec<Chapter>, StoreError> {
        let chapters = sqlx::query_as::<_, Chapter>(
            "SELECT * FROM chapters
             WHERE novel_id = $1 AND id = ANY($2)
             ORDER BY chapter_number",
        )
        .bind(novel_id)
        .bind(chapter_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(chapters)
    }
}
