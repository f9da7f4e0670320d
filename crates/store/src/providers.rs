use sqlx::PgPool;

use novelgraph_core::keys::normalize_provider;

use crate::error::StoreError;
use crate::models::{AiProvider, ExtractionConfig};

/// Provider definitions and extraction defaults.
#[derive(Clone)]
pub struct ProviderStore {
    pool: PgPool,
}

impl ProviderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Names of active providers, lowercased, in a stable order.
    pub async fn active_provider_names(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM ai_providers WHERE is_active ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(n,)| normalize_provider(&n)).collect())
    }

    pub async fn provider_by_name(&self, name: &str) -> Result<Option<AiProvider>, StoreError> {
        let provider = sqlx::query_as::<_, AiProvider>(
            "SELECT * FROM ai_providers WHERE lower(name) = $1",
        )
        .bind(normalize_provider(name))
        .fetch_optional(&self.pool)
        .await?;
        Ok(provider)
    }

    /// Rate-limit interval in seconds for a provider; 0 when unlimited or
    /// the provider is unknown.
    pub async fn rate_limit_interval(&self, name: &str) -> Result<u64, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT rate_limit_interval FROM ai_providers WHERE lower(name) = $1",
        )
        .bind(normalize_provider(name))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(i,)| i.max(0) as u64).unwrap_or(0))
    }

    /// The default extraction config, or the rules-only fallback when none
    /// is configured.
    pub async fn default_extraction_config(&self) -> Result<ExtractionConfig, StoreError> {
        let config = sqlx::query_as::<_, ExtractionConfig>(
            "SELECT id, is_default, use_ai, ai_provider, ai_model, max_content_length, rule_config
             FROM kg_extraction_config
             WHERE is_default
             ORDER BY id
             LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(config.unwrap_or_else(ExtractionConfig::fallback))
    }
}
