use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

use novelgraph_core::status::{ChapterState, TaskStatus};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Novel {
    pub id: i64,
    pub title: String,
    pub author: Option<String>,
    pub is_parsed: bool,
    pub is_deleted: bool,
    pub chapter_count: i64,
    pub word_count: i64,
    pub tags: Option<Json<Vec<String>>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Chapter {
    pub id: i64,
    pub novel_id: i64,
    pub chapter_number: i64,
    pub title: String,
    pub content: String,
    pub word_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An LLM backend definition. The synthetic `rules` provider has no row
/// here — it is injected by the worker pool.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AiProvider {
    pub id: i64,
    /// Unique lowercase name; doubles as the queue/throttle key component.
    pub name: String,
    pub display_name: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub models: Json<Vec<String>>,
    pub is_active: bool,
    /// Minimum seconds between requests; 0 = unlimited.
    pub rate_limit_interval: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AiProvider {
    /// The configured model if the provider supports it, else the
    /// provider's first model.
    pub fn resolve_model(&self, wanted: Option<&str>) -> Option<String> {
        match wanted {
            Some(m) if self.models.0.iter().any(|known| known == m) => Some(m.to_string()),
            _ => self.models.0.first().cloned(),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct KgTask {
    pub id: i64,
    pub task_name: String,
    pub novel_id: i64,
    /// Target chapters; None = every chapter of the novel.
    pub chapter_ids: Option<Json<Vec<i64>>>,
    pub use_ai: bool,
    pub status: String,
    pub total_chapters: i64,
    pub completed_chapters: i64,
    pub failed_chapters: i64,
    pub skipped_chapters: i64,
    pub current_chapter_id: Option<i64>,
    pub total_entities: i64,
    pub total_relations: i64,
    pub error_message: Option<String>,
    pub last_error_chapter_id: Option<i64>,
    pub auto_retry_enabled: bool,
    pub retry_interval_minutes: i64,
    pub retry_count: i64,
    pub failed_at: Option<DateTime<Utc>>,
    pub retry_scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KgTask {
    pub fn status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }

    pub fn progress_pct(&self) -> f64 {
        if self.total_chapters == 0 {
            return 0.0;
        }
        (self.completed_chapters as f64 / self.total_chapters as f64 * 1000.0).round() / 10.0
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChapterStatusRow {
    pub id: i64,
    pub kg_task_id: i64,
    pub chapter_id: i64,
    pub status: String,
    pub entities_extracted: i64,
    pub relations_extracted: i64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChapterStatusRow {
    pub fn state(&self) -> Option<ChapterState> {
        ChapterState::parse(&self.status)
    }
}

/// Extraction defaults read from the relational store, cached per process.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub id: i64,
    pub is_default: bool,
    pub use_ai: bool,
    pub ai_provider: Option<String>,
    pub ai_model: Option<String>,
    pub max_content_length: i64,
    pub rule_config: Option<Json<serde_json::Value>>,
}

impl ExtractionConfig {
    /// Fallback when no row is configured: rules-only extraction.
    pub fn fallback() -> Self {
        Self {
            id: 0,
            is_default: true,
            use_ai: false,
            ai_provider: None,
            ai_model: None,
            max_content_length: 4000,
            rule_config: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_with_models(models: &[&str]) -> AiProvider {
        AiProvider {
            id: 1,
            name: "openai".into(),
            display_name: "OpenAI".into(),
            api_key: Some("sk-test".into()),
            base_url: None,
            models: Json(models.iter().map(|m| m.to_string()).collect()),
            is_active: true,
            rate_limit_interval: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn resolve_model_prefers_configured_when_known() {
        let p = provider_with_models(&["gpt-4o", "gpt-4o-mini"]);
        assert_eq!(p.resolve_model(Some("gpt-4o-mini")).as_deref(), Some("gpt-4o-mini"));
    }

    #[test]
    fn resolve_model_falls_back_to_first() {
        let p = provider_with_models(&["gpt-4o", "gpt-4o-mini"]);
        assert_eq!(p.resolve_model(Some("unknown")).as_deref(), Some("gpt-4o"));
        assert_eq!(p.resolve_model(None).as_deref(), Some("gpt-4o"));
        assert_eq!(provider_with_models(&[]).resolve_model(None), None);
    }
}
