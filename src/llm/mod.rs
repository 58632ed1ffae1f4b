//! Language-model backends.
//!
//! Implements [`LlmProvider`] for two chat APIs:
//! - **[`OpenAiProvider`]**: `POST /v1/chat/completions` with a
//!   `json_schema` response format when structured output is requested.
//! - **[`CohereProvider`]**: `POST /v2/chat` with a `json_object`
//!   response format carrying the schema.
//!
//! # Provider Selection
//!
//! [`create_provider`] picks the backend once at startup from
//! `[llm].provider`. API keys come from `OPENAI_API_KEY` / `COHERE_API_KEY`.
//!
//! # Retry Strategy
//!
//! Both backends share [`post_json_with_retry`]:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Independently of retries, every call made by the workflow is bounded by
//! [`complete_with_timeout`].

mod cohere;
mod openai;

pub use cohere::CohereProvider;
pub use openai::OpenAiProvider;

use anyhow::{bail, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use text_to_mql_core::llm::{Completion, LlmError, LlmProvider};

use crate::config::LlmConfig;

/// Instantiate the configured backend.
///
/// # Errors
///
/// Returns an error for unknown provider names or a missing API key.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        "cohere" => Ok(Arc::new(CohereProvider::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Run one completion, failing with [`LlmError::Timeout`] past `limit`.
pub async fn complete_with_timeout(
    provider: &dyn LlmProvider,
    prompt: &str,
    schema: Option<&Value>,
    limit: Duration,
) -> Result<Completion, LlmError> {
    match tokio::time::timeout(limit, provider.complete(prompt, schema)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(limit.as_secs())),
    }
}

/// Backoff before retry `attempt` (1-based): 1s, 2s, 4s, ... capped at 32s.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt.saturating_sub(1)).min(5))
}

/// POST a JSON body with bearer auth, retrying transient failures.
pub(crate) async fn post_json_with_retry(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    body: &Value,
    max_retries: u32,
    label: &str,
) -> Result<Value, LlmError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = backoff_delay(attempt);
            debug!(provider = label, attempt, ?delay, "retrying model request");
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(url)
            .bearer_auth(api_key)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json::<Value>().await.map_err(|e| {
                        LlmError::InvalidResponse(format!("{} returned invalid JSON: {}", label, e))
                    });
                }

                let body_text = response.text().await.unwrap_or_default();

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(provider = label, %status, "transient model API error");
                    last_err = Some(LlmError::Unavailable(format!(
                        "{} API error {}: {}",
                        label, status, body_text
                    )));
                    continue;
                }

                // Client error (not 429): fail now
                return Err(LlmError::Unavailable(format!(
                    "{} API error {}: {}",
                    label, status, body_text
                )));
            }
            Err(e) => {
                warn!(provider = label, error = %e, "model API unreachable");
                last_err = Some(LlmError::Unavailable(format!("{}: {}", label, e)));
                continue;
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| LlmError::Unavailable(format!("{} request failed after retries", label))))
}

/// Interpret reply text: structured when a schema was requested and the
/// text parses as JSON, otherwise plain text for lenient decoding later.
pub(crate) fn completion_from_text(text: String, structured: bool) -> Completion {
    if structured {
        if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
            return Completion::Structured(value);
        }
    }
    Completion::Text(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(20), Duration::from_secs(32));
    }

    #[test]
    fn test_completion_from_text() {
        assert_eq!(
            completion_from_text("{\"a\": 1}".into(), true),
            Completion::Structured(json!({"a": 1}))
        );
        assert_eq!(
            completion_from_text("{\"a\": 1}".into(), false),
            Completion::Text("{\"a\": 1}".into())
        );
        assert!(matches!(
            completion_from_text("```json\n{}\n```".into(), true),
            Completion::Text(_)
        ));
    }

    #[test]
    fn test_unknown_provider() {
        let config = LlmConfig {
            provider: "palm".into(),
            ..LlmConfig::default()
        };
        let err = create_provider(&config).err().unwrap();
        assert!(err.to_string().contains("Unknown llm provider"));
    }

    struct Sleepy;

    #[async_trait]
    impl LlmProvider for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn model(&self) -> &str {
            "none"
        }
        async fn complete(&self, _: &str, _: Option<&Value>) -> Result<Completion, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Completion::Text(String::new()))
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_error() {
        let err = complete_with_timeout(&Sleepy, "hi", None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
    }
}
