//! Pipeline validation with a bounded model-driven repair loop.
//!
//! A pipeline that fails [`check_pipeline`] is sent back to the model along
//! with the first violation. The corrected answer is decoded and checked
//! again, up to `max_repair_attempts` times. A repair answer that does not
//! decode still spends an attempt.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use text_to_mql_core::llm::LlmProvider;
use text_to_mql_core::models::CollectionSchema;
use text_to_mql_core::pipeline::{check_pipeline, Pipeline, Violation};
use text_to_mql_core::WorkflowError;

use crate::generator::decode_completion;
use crate::llm::complete_with_timeout;
use crate::prompts;

/// A pipeline that passed validation, possibly after repairs.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPipeline {
    pub pipeline: Pipeline,
    pub repairs: u32,
}

pub struct PipelineValidator {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
    max_repair_attempts: u32,
}

impl PipelineValidator {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration, max_repair_attempts: u32) -> Self {
        Self {
            llm,
            timeout,
            max_repair_attempts,
        }
    }

    pub async fn validate(
        &self,
        query: &str,
        pipeline: Pipeline,
        schemas: &[CollectionSchema],
    ) -> Result<ValidatedPipeline, WorkflowError> {
        let mut current = pipeline;
        let mut violation = match check_pipeline(&current) {
            Ok(()) => {
                return Ok(ValidatedPipeline {
                    pipeline: current,
                    repairs: 0,
                })
            }
            Err(v) => v,
        };

        for attempt in 1..=self.max_repair_attempts {
            warn!(attempt, %violation, "pipeline invalid, requesting repair");
            let prompt = prompts::repair_prompt(query, &current, &violation, schemas);
            let schema = prompts::pipeline_schema();
            let completion =
                match complete_with_timeout(self.llm.as_ref(), &prompt, Some(&schema), self.timeout)
                    .await
                {
                    Ok(c) => c,
                    Err(e) if e.is_unreachable() => {
                        return Err(WorkflowError::ProviderUnavailable(e.to_string()))
                    }
                    Err(e) => {
                        violation = Violation::pipeline(format!("repair request failed: {}", e));
                        continue;
                    }
                };

            match decode_completion(completion) {
                Ok(repaired) => {
                    current = repaired;
                    match check_pipeline(&current) {
                        Ok(()) => {
                            info!(repairs = attempt, "pipeline repaired");
                            return Ok(ValidatedPipeline {
                                pipeline: current,
                                repairs: attempt,
                            });
                        }
                        Err(v) => violation = v,
                    }
                }
                Err(e) => {
                    violation =
                        Violation::pipeline(format!("repair response could not be decoded: {}", e));
                }
            }
        }

        Err(WorkflowError::PipelineInvalid(violation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use text_to_mql_core::llm::{Completion, LlmError};
    use text_to_mql_core::pipeline::decode_pipeline;

    /// Replies with the same completion every time and counts calls.
    struct RepeatLlm {
        reply: Result<Completion, LlmError>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for RepeatLlm {
        fn name(&self) -> &str {
            "repeat"
        }
        fn model(&self) -> &str {
            "repeat"
        }
        async fn complete(&self, prompt: &str, _: Option<&Value>) -> Result<Completion, LlmError> {
            assert!(prompt.starts_with(prompts::REPAIR_HEADING));
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    fn validator(reply: Result<Completion, LlmError>) -> (Arc<RepeatLlm>, PipelineValidator) {
        let llm = Arc::new(RepeatLlm {
            reply,
            calls: AtomicU32::new(0),
        });
        let v = PipelineValidator::new(llm.clone(), Duration::from_secs(5), 2);
        (llm, v)
    }

    fn invalid() -> Pipeline {
        decode_pipeline(&json!([{"$where": "this.gpa > 3"}])).unwrap()
    }

    #[tokio::test]
    async fn test_valid_pipeline_needs_no_model() {
        let (llm, v) = validator(Err(LlmError::Unavailable("unused".into())));
        let p = decode_pipeline(&json!([{"$count": "n"}])).unwrap();
        let out = v.validate("q", p.clone(), &[]).await.unwrap();
        assert_eq!(out, ValidatedPipeline { pipeline: p, repairs: 0 });
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_one_repair() {
        let (llm, v) = validator(Ok(Completion::Structured(json!({
            "pipeline": [{"operator": "$match", "body": {"gpa": {"$gt": 3}}}]
        }))));
        let out = v.validate("q", invalid(), &[]).await.unwrap();
        assert_eq!(out.repairs, 1);
        assert_eq!(out.pipeline.operators(), vec!["$match"]);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_repair_loop_is_bounded() {
        let (llm, v) = validator(Ok(Completion::Structured(json!({
            "pipeline": [{"operator": "$out", "body": "copy"}]
        }))));
        let err = v.validate("q", invalid(), &[]).await.unwrap_err();
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
        match err {
            WorkflowError::PipelineInvalid(violation) => {
                assert_eq!(violation.operator, "$out");
                assert_eq!(violation.message, "write stages are not permitted");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_undecodable_repair_counts_as_attempt() {
        let (llm, v) = validator(Ok(Completion::Text("sorry".into())));
        let err = v.validate("q", invalid(), &[]).await.unwrap_err();
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
        assert!(err.to_string().contains("repair response could not be decoded"));
    }

    #[tokio::test]
    async fn test_unreachable_provider() {
        let (_, v) = validator(Err(LlmError::Unavailable("connection refused".into())));
        let err = v.validate("q", invalid(), &[]).await.unwrap_err();
        assert_eq!(err.code(), "provider_unavailable");
    }

    #[tokio::test]
    async fn test_zero_attempts_reports_original_violation() {
        let llm = Arc::new(RepeatLlm {
            reply: Err(LlmError::Unavailable("unused".into())),
            calls: AtomicU32::new(0),
        });
        let v = PipelineValidator::new(llm, Duration::from_secs(5), 0);
        let err = v.validate("q", invalid(), &[]).await.unwrap_err();
        match err {
            WorkflowError::PipelineInvalid(violation) => assert_eq!(violation.operator, "$where"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
