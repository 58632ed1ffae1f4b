//! Natural language to aggregation pipeline.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use text_to_mql_core::llm::{Completion, LlmError, LlmProvider};
use text_to_mql_core::models::CollectionSchema;
use text_to_mql_core::pipeline::{decode_pipeline, decode_pipeline_text, DecodeError, Pipeline};
use text_to_mql_core::WorkflowError;

use crate::llm::complete_with_timeout;
use crate::prompts;

pub struct PipelineGenerator {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
}

impl PipelineGenerator {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Generate a pipeline for `query` against `target`, with `schemas` as
    /// prompt context. The result is decoded but not yet validated.
    pub async fn generate(
        &self,
        query: &str,
        target: &str,
        schemas: &[CollectionSchema],
    ) -> Result<Pipeline, WorkflowError> {
        let prompt = prompts::generation_prompt(query, target, schemas);
        let schema = prompts::pipeline_schema();
        let completion =
            complete_with_timeout(self.llm.as_ref(), &prompt, Some(&schema), self.timeout)
                .await
                .map_err(provider_error)?;

        let pipeline = decode_completion(completion).map_err(|e| {
            warn!(error = %e, "model output is not a pipeline");
            WorkflowError::GenerationFailed(e.to_string())
        })?;
        debug!(stages = pipeline.len(), operators = ?pipeline.operators(), "generated pipeline");
        Ok(pipeline)
    }
}

/// Decode either completion shape into a [`Pipeline`].
pub fn decode_completion(completion: Completion) -> Result<Pipeline, DecodeError> {
    match completion {
        Completion::Structured(value) => decode_pipeline(&value),
        Completion::Text(text) => decode_pipeline_text(&text),
    }
}

/// Map a model failure onto the workflow error kinds.
pub fn provider_error(err: LlmError) -> WorkflowError {
    if err.is_unreachable() {
        WorkflowError::ProviderUnavailable(err.to_string())
    } else {
        WorkflowError::GenerationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct FixedLlm(Result<Completion, LlmError>);

    #[async_trait]
    impl LlmProvider for FixedLlm {
        fn name(&self) -> &str {
            "fixed"
        }
        fn model(&self) -> &str {
            "fixed"
        }
        async fn complete(&self, prompt: &str, schema: Option<&Value>) -> Result<Completion, LlmError> {
            assert!(prompt.starts_with(prompts::GENERATION_HEADING));
            assert!(schema.is_some());
            self.0.clone()
        }
    }

    async fn generate(reply: Result<Completion, LlmError>) -> Result<Pipeline, WorkflowError> {
        PipelineGenerator::new(Arc::new(FixedLlm(reply)), Duration::from_secs(5))
            .generate("How many students?", "students", &[])
            .await
    }

    #[tokio::test]
    async fn test_structured_output() {
        let p = generate(Ok(Completion::Structured(json!({
            "pipeline": [{"operator": "$count", "body": "count"}]
        }))))
        .await
        .unwrap();
        assert_eq!(p.operators(), vec!["$count"]);
    }

    #[tokio::test]
    async fn test_shell_text_output() {
        let p = generate(Ok(Completion::Text(
            "```\ndb.students.aggregate([{$match: {gpa: {$gt: 3.5}}}, {$count: 'n'}])\n```".into(),
        )))
        .await
        .unwrap();
        assert_eq!(p.operators(), vec!["$match", "$count"]);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let err = generate(Err(LlmError::Timeout(5))).await.unwrap_err();
        assert_eq!(err.code(), "provider_unavailable");

        let err = generate(Err(LlmError::InvalidResponse("empty".into())))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "generation_failed");

        let err = generate(Ok(Completion::Text("I cannot help with that.".into())))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "generation_failed");
    }
}
