//! OpenAI chat-completions backend.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use text_to_mql_core::llm::{Completion, LlmError, LlmProvider};

use super::{completion_from_text, post_json_with_retry};
use crate::config::LlmConfig;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const SYSTEM_PROMPT: &str =
    "You are a precise MongoDB assistant. Follow the output format you are given exactly.";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    max_retries: u32,
}

impl OpenAiProvider {
    /// Create a provider reading `OPENAI_API_KEY` from the environment.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let Ok(api_key) = std::env::var("OPENAI_API_KEY") else {
            bail!("OPENAI_API_KEY environment variable not set");
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
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if let Some(schema) = schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "response",
                    "schema": schema,
                    "strict": false,
                },
            });
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str, schema: Option<&Value>) -> Result<Completion, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(prompt, schema);
        let json =
            post_json_with_retry(&self.client, &url, &self.api_key, &body, self.max_retries, "OpenAI")
                .await?;
        let text = parse_openai_response(&json)?;
        Ok(completion_from_text(text, schema.is_some()))
    }
}

/// Extract `choices[0].message.content`.
fn parse_openai_response(json: &Value) -> Result<String, LlmError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message.content".into()))
}
