//! Error kinds for the query-generation workflow.
//!
//! Every stage reports failure through [`WorkflowError`]. The orchestrator
//! uses [`WorkflowError::is_fatal`] to decide whether to stop the request or
//! continue with a degraded result.

use thiserror::Error;

use crate::pipeline::Violation;

/// Failure of a single workflow stage.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    /// The named collection does not exist in the database.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// Neither the model nor the keyword fallback matched any collection.
    #[error("no relevant collections found for the query")]
    NoRelevantCollections,

    /// The model output could not be turned into a pipeline.
    #[error("pipeline generation failed: {0}")]
    GenerationFailed(String),

    /// The pipeline stayed invalid after the repair budget was spent.
    #[error("pipeline invalid: {0}")]
    PipelineInvalid(Violation),

    /// The database rejected or timed out on the pipeline.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The language-model backend could not be reached.
    #[error("language model unavailable: {0}")]
    ProviderUnavailable(String),

    /// Listing or sampling collections failed at the transport level.
    #[error("database unavailable: {0}")]
    DatabaseUnavailable(String),

    /// The answer was replaced by a templated summary. Never fatal.
    #[error("answer formatting degraded: {0}")]
    FormattingDegraded(String),
}

impl WorkflowError {
    /// Stable machine-readable code, used in response envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::CollectionNotFound(_) => "collection_not_found",
            WorkflowError::NoRelevantCollections => "no_relevant_collections",
            WorkflowError::GenerationFailed(_) => "generation_failed",
            WorkflowError::PipelineInvalid(_) => "pipeline_invalid",
            WorkflowError::ExecutionFailed(_) => "execution_failed",
            WorkflowError::ProviderUnavailable(_) => "provider_unavailable",
            WorkflowError::DatabaseUnavailable(_) => "database_unavailable",
            WorkflowError::FormattingDegraded(_) => "formatting_degraded",
        }
    }

    /// Whether this error ends the request.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WorkflowError::FormattingDegraded(_))
    }
}
