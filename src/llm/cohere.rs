//! Cohere v2 chat backend.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use text_to_mql_core::llm::{Completion, LlmError, LlmProvider};

use super::{completion_from_text, post_json_with_retry};
use crate::config::LlmConfig;

const DEFAULT_BASE_URL: &str = "https://api.cohere.com";

pub struct CohereProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    max_retries: u32,
}

impl CohereProvider {
    /// Create a provider reading `COHERE_API_KEY` from the environment.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let Ok(api_key) = std::env::var("COHERE_API_KEY") else {
            bail!("COHERE_API_KEY environment variable not set");
        };
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &LlmConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model_name(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
        })
    }

    fn request_body(&self, prompt: &str, schema: Option<&Value>) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if let Some(schema) = schema {
            body["response_format"] = json!({
                "type": "json_object",
                "json_schema": schema,
            });
        }
        body
    }
}

#[async_trait]
impl LlmProvider for CohereProvider {
    fn name(&self) -> &str {
        "cohere"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, schema: Option<&Value>) -> Result<Completion, LlmError> {
        let url = format!("{}/v2/chat", self.base_url);
        let body = self.request_body(prompt, schema);
        let json =
            post_json_with_retry(&self.client, &url, &self.api_key, &body, self.max_retries, "Cohere")
                .await?;
        let text = parse_cohere_response(&json)?;
        Ok(completion_from_text(text, schema.is_some()))
    }
}

/// Concatenate the `text` parts of `message.content`.
fn parse_cohere_response(json: &Value) -> Result<String, LlmError> {
    let parts = json
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .ok_or_else(|| LlmError::InvalidResponse("missing message.content".into()))?;

    let text: String = parts
        .iter()
        .filter(|p| p.get("type").and_then(Value::as_str).unwrap_or("text") == "text")
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();

    if text.trim().is_empty() {
        return Err(LlmError::InvalidResponse("empty message content".into()));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body() {
        let p = CohereProvider::with_api_key(&LlmConfig::default(), "key".into()).unwrap();
        let body = p.request_body("q", Some(&json!({"type": "object"})));
        assert_eq!(body["model"], "command-r-plus");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn test_parse_response_joins_text_parts() {
        let json = json!({
            "id": "x",
            "message": {
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "{\"collections\": "},
                    {"type": "text", "text": "[\"students\"]}"}
                ]
            }
        });
        assert_eq!(
            parse_cohere_response(&json).unwrap(),
            "{\"collections\": [\"students\"]}"
        );
    }

    #[test]
    fn test_parse_response_rejects_empty() {
        let json = json!({"message": {"content": []}});
        assert!(parse_cohere_response(&json).is_err());
        assert!(parse_cohere_response(&json!({})).is_err());
    }
}
