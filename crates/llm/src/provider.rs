use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One completed generation, with token usage when the backend reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Connection settings for one backend, mapped from its provider row.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Lowercase provider name; also the queue/throttle key component.
    pub name: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub models: Vec<String>,
    pub request_timeout: Duration,
}

/// Trait for LLM backends — the worker selects one by the provider name
/// carried in the queue entry, never by concrete type.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send one prompt to the given model and return the response text.
    async fn generate(&self, prompt: &str, model: &str) -> Result<Completion, LlmError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} — {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("empty completion from model {0}")]
    Empty(String),
    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl LlmError {
    /// Whether the failure should count against the provider's consecutive
    /// failure budget. Configuration mistakes are the operator's problem,
    /// not the provider's.
    pub fn counts_as_provider_failure(&self) -> bool {
        !matches!(self, LlmError::NotConfigured(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_do_not_burn_the_failure_budget() {
        assert!(!LlmError::NotConfigured("x".into()).counts_as_provider_failure());
        assert!(LlmError::Api { status: 500, body: String::new() }.counts_as_provider_failure());
        assert!(LlmError::Parse("bad json".into()).counts_as_provider_failure());
        assert!(LlmError::Empty("gpt-4o".into()).counts_as_provider_failure());
    }
}
