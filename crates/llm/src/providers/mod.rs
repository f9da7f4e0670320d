pub mod claude;
pub mod openai;

use crate::provider::{LlmError, LlmProvider, ProviderConfig};

/// Create the appropriate LLM backend for a provider definition.
///
/// Providers named `claude`/`anthropic` speak the Anthropic messages API;
/// everything else is treated as OpenAI-compatible against its `base_url`.
pub fn create_provider(config: &ProviderConfig) -> Result<Box<dyn LlmProvider>, LlmError> {
    let api_key = config
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| LlmError::NotConfigured(format!("provider '{}' has no api key", config.name)))?;

    let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()?;

    match config.name.as_str() {
        "claude" | "anthropic" => Ok(Box::new(claude::ClaudeProvider::new(
            client,
            api_key,
            config.base_url.clone(),
        ))),
        _ => {
            let base_url = config
                .base_url
                .clone()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| {
                    LlmError::NotConfigured(format!("provider '{}' has no base url", config.name))
                })?;
            Ok(Box::new(openai::OpenAiProvider::new(client, api_key, base_url)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config(name: &str, api_key: Option<&str>, base_url: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            api_key: api_key.map(str::to_string),
            base_url: base_url.map(str::to_string),
            models: vec!["m1".to_string()],
            request_timeout: Duration::from_secs(120),
        }
    }

    #[test]
    fn missing_api_key_is_refused_not_crashed() {
        let err = create_provider(&config("openai", None, Some("https://api.openai.com")))
            .err()
            .unwrap();
        assert!(matches!(err, LlmError::NotConfigured(_)));
    }

    #[test]
    fn openai_compatible_requires_base_url() {
        let err = create_provider(&config("deepseek", Some("sk-x"), None)).err().unwrap();
        assert!(matches!(err, LlmError::NotConfigured(_)));
    }

    #[test]
    fn claude_works_without_base_url() {
        assert!(create_provider(&config("claude", Some("sk-ant"), None)).is_ok());
    }

    #[test]
    fn unknown_names_fall_back_to_openai_compatible() {
        assert!(create_provider(&config("deepseek", Some("sk-x"), Some("https://api.deepseek.com"))).is_ok());
    }
}
