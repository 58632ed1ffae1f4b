//! Language-model abstraction.
//!
//! The workflow only ever asks a model for one thing: complete this prompt,
//! optionally constrained to a JSON schema. [`LlmProvider`] is that single
//! capability; concrete HTTP backends live in the application crate.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Output of one completion call.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Free-form text.
    Text(String),
    /// A JSON value, returned when a schema was requested and honored.
    Structured(Value),
}

impl Completion {
    /// The completion as text. Structured values are rendered as JSON.
    pub fn into_text(self) -> String {
        match self {
            Completion::Text(text) => text,
            Completion::Structured(value) => value.to_string(),
        }
    }

    /// The completion as JSON, parsing text leniently when needed.
    pub fn into_json(self) -> Result<Value, LlmError> {
        match self {
            Completion::Structured(value) => Ok(value),
            Completion::Text(text) => crate::pipeline::extract_json(&text)
                .map_err(|e| LlmError::InvalidResponse(e.to_string())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    /// Network failure, non-success status, or missing credentials.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider timed out after {0}s")]
    Timeout(u64),

    /// The provider answered, but not in a usable shape.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// True when the backend could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, LlmError::Unavailable(_) | LlmError::Timeout(_))
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Backend name, e.g. `"openai"`.
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    /// Complete `prompt`. When `schema` is given the backend requests
    /// structured output and should return [`Completion::Structured`].
    async fn complete(&self, prompt: &str, schema: Option<&Value>)
        -> Result<Completion, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_completion_into_json() {
        let c = Completion::Text("```json\n{\"collections\": [\"students\"]}\n```".into());
        assert_eq!(c.into_json().unwrap(), json!({"collections": ["students"]}));
    }

    #[test]
    fn test_text_without_json_is_invalid() {
        let err = Completion::Text("no idea".into()).into_json().unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
        assert!(!err.is_unreachable());
        assert!(LlmError::Timeout(30).is_unreachable());
    }

    #[test]
    fn test_structured_into_text() {
        let c = Completion::Structured(json!({"a": 1}));
        assert_eq!(c.into_text(), r#"{"a":1}"#);
    }
}
