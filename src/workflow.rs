//! The query workflow as an explicit state machine.
//!
//! ```text
//! SelectCollections → RetrieveSchemas → GeneratePipeline
//!     → ValidatePipeline → Execute → FormatResult → Done
//!                  (any stage) ──fatal error──→ Errored
//! ```
//!
//! Each attempted stage appends exactly one [`WorkflowStep`] to the log.
//! A fatal [`WorkflowError`] stops progression and is reported in the
//! envelope together with the partial log; a non-fatal one (degraded
//! formatting) is logged as a failed step and the run continues.
//!
//! Nothing is retried here. The only retry in the system is the validator's
//! bounded repair loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, info_span, warn, Instrument};

use text_to_mql_core::llm::LlmProvider;
use text_to_mql_core::models::{
    CollectionSchema, QueryRequest, QueryResult, ResponseEnvelope, WorkflowStep,
};
use text_to_mql_core::pipeline::{check_pipeline, Pipeline};
use text_to_mql_core::store::Database;
use text_to_mql_core::WorkflowError;

use crate::catalog::SchemaCatalog;
use crate::config::Config;
use crate::executor::QueryExecutor;
use crate::formatter::ResultFormatter;
use crate::generator::PipelineGenerator;
use crate::selector::CollectionSelector;
use crate::validator::PipelineValidator;

/// Workflow states, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SelectCollections,
    RetrieveSchemas,
    GeneratePipeline,
    ValidatePipeline,
    Execute,
    FormatResult,
    Done,
    Errored,
}

impl Stage {
    /// Step-log name of the stage.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::SelectCollections => "select_collections",
            Stage::RetrieveSchemas => "retrieve_schemas",
            Stage::GeneratePipeline => "generate_pipeline",
            Stage::ValidatePipeline => "validate_pipeline",
            Stage::Execute => "execute",
            Stage::FormatResult => "format_result",
            Stage::Done => "done",
            Stage::Errored => "errored",
        }
    }

    /// The stage after a successful (or non-fatally failed) one.
    pub fn next(&self) -> Stage {
        match self {
            Stage::SelectCollections => Stage::RetrieveSchemas,
            Stage::RetrieveSchemas => Stage::GeneratePipeline,
            Stage::GeneratePipeline => Stage::ValidatePipeline,
            Stage::ValidatePipeline => Stage::Execute,
            Stage::Execute => Stage::FormatResult,
            Stage::FormatResult => Stage::Done,
            Stage::Done => Stage::Done,
            Stage::Errored => Stage::Errored,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Errored)
    }
}

/// Append-only record of stage outcomes.
#[derive(Debug, Default)]
pub struct StepLog {
    steps: Vec<WorkflowStep>,
}

impl StepLog {
    pub fn success(&mut self, stage: Stage, detail: Option<String>) {
        self.steps.push(WorkflowStep::success(stage.label(), detail));
    }

    pub fn failed(&mut self, stage: Stage, detail: impl Into<String>) {
        self.steps.push(WorkflowStep::failed(stage.label(), detail));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_steps(self) -> Vec<WorkflowStep> {
        self.steps
    }
}

/// Values accumulated while the run advances.
#[derive(Debug, Default)]
struct RunContext {
    known: Vec<String>,
    selected: Vec<String>,
    schemas: Vec<CollectionSchema>,
    generated: Option<Pipeline>,
    validated: Option<Pipeline>,
    result: Option<QueryResult>,
    answer: Option<String>,
    error: Option<WorkflowError>,
}

impl RunContext {
    fn primary(&self) -> Result<&str, WorkflowError> {
        self.selected
            .first()
            .map(String::as_str)
            .ok_or(WorkflowError::NoRelevantCollections)
    }
}

pub struct Workflow {
    catalog: SchemaCatalog,
    selector: CollectionSelector,
    generator: PipelineGenerator,
    validator: PipelineValidator,
    executor: QueryExecutor,
    formatter: ResultFormatter,
}

impl Workflow {
    /// Wire every component from `config` around one database and one model.
    pub fn new(config: &Config, db: Arc<dyn Database>, llm: Arc<dyn LlmProvider>) -> Self {
        let llm_timeout = Duration::from_secs(config.llm.timeout_secs);
        let db_timeout = Duration::from_secs(config.database.timeout_secs);
        let wf = &config.workflow;

        Self::from_parts(
            SchemaCatalog::new(db.clone(), &config.database),
            CollectionSelector::new(llm.clone(), llm_timeout, wf.max_selected_collections),
            PipelineGenerator::new(llm.clone(), llm_timeout),
            PipelineValidator::new(llm.clone(), llm_timeout, wf.max_repair_attempts),
            QueryExecutor::new(
                db,
                wf.max_results,
                db_timeout,
                config.database.redacted_fields.clone(),
            ),
            ResultFormatter::new(llm, llm_timeout, wf.preview_rows, wf.preview_chars),
        )
    }

    pub fn from_parts(
        catalog: SchemaCatalog,
        selector: CollectionSelector,
        generator: PipelineGenerator,
        validator: PipelineValidator,
        executor: QueryExecutor,
        formatter: ResultFormatter,
    ) -> Self {
        Self {
            catalog,
            selector,
            generator,
            validator,
            executor,
            formatter,
        }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn executor(&self) -> &QueryExecutor {
        &self.executor
    }

    /// Run a caller-supplied pipeline on `collection` with no model involved.
    ///
    /// The collection must exist and the pipeline must pass validation as
    /// written; there is no repair. Execution is capped like a workflow run.
    pub async fn run_pipeline(
        &self,
        collection: &str,
        pipeline: &Pipeline,
    ) -> Result<QueryResult, WorkflowError> {
        self.catalog.require_collection(collection).await?;
        check_pipeline(pipeline).map_err(WorkflowError::PipelineInvalid)?;
        info!(collection, stages = pipeline.len(), "running supplied pipeline");
        self.executor.execute(pipeline, collection).await
    }

    /// Run one request to completion. Always returns an envelope; failures
    /// are reported inside it.
    pub async fn run(&self, request: &QueryRequest) -> ResponseEnvelope {
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("query", request_id = %request_id);
        self.run_inner(request_id, request).instrument(span).await
    }

    async fn run_inner(&self, request_id: String, request: &QueryRequest) -> ResponseEnvelope {
        let started = Instant::now();
        let query = request.text.trim();
        info!(query, "workflow started");

        let mut ctx = RunContext::default();
        let mut log = StepLog::default();
        let mut stage = Stage::SelectCollections;

        while !stage.is_terminal() {
            match self.step(stage, query, &mut ctx).await {
                Ok(detail) => {
                    log.success(stage, detail);
                    stage = stage.next();
                }
                Err(err) if !err.is_fatal() => {
                    warn!(stage = stage.label(), error = %err, "stage degraded");
                    log.failed(stage, err.to_string());
                    stage = stage.next();
                }
                Err(err) => {
                    warn!(stage = stage.label(), code = err.code(), error = %err, "stage failed");
                    log.failed(stage, err.to_string());
                    ctx.error = Some(err);
                    stage = Stage::Errored;
                }
            }
        }

        let execution_time = started.elapsed().as_secs_f64();
        info!(
            success = ctx.error.is_none(),
            steps = log.len(),
            elapsed = execution_time,
            "workflow finished"
        );
        envelope(request_id, query, ctx, log, execution_time)
    }

    /// Run one stage, returning the success detail for the step log.
    async fn step(
        &self,
        stage: Stage,
        query: &str,
        ctx: &mut RunContext,
    ) -> Result<Option<String>, WorkflowError> {
        match stage {
            Stage::SelectCollections => {
                ctx.known = self.catalog.list_collections().await?;
                let selection = self
                    .selector
                    .select(query, &ctx.known, Some(&self.catalog))
                    .await?;
                ctx.selected = selection.collections;
                info!(collections = ?ctx.selected, method = selection.method.as_str(), "collections selected");
                let mut detail = format!(
                    "{} via {} from {} collection(s)",
                    ctx.selected.join(", "),
                    selection.method.as_str(),
                    ctx.known.len()
                );
                if !selection.related.is_empty() {
                    detail.push_str(&format!("; related: {}", selection.related.join(", ")));
                }
                Ok(Some(detail))
            }
            Stage::RetrieveSchemas => {
                ctx.schemas = self.catalog.get_schemas(&ctx.selected).await?;
                Ok(Some(format!("{} schema(s)", ctx.schemas.len())))
            }
            Stage::GeneratePipeline => {
                let primary = ctx.primary()?;
                let pipeline = self.generator.generate(query, primary, &ctx.schemas).await?;
                let detail = format!("{} stage(s): {}", pipeline.len(), pipeline.operators().join(", "));
                ctx.generated = Some(pipeline);
                Ok(Some(detail))
            }
            Stage::ValidatePipeline => {
                let generated = ctx
                    .generated
                    .clone()
                    .ok_or_else(|| WorkflowError::GenerationFailed("no pipeline generated".into()))?;
                let validated = self.validator.validate(query, generated, &ctx.schemas).await?;
                ctx.validated = Some(validated.pipeline);
                Ok(Some(match validated.repairs {
                    0 => "valid".to_string(),
                    1 => "valid after 1 repair".to_string(),
                    n => format!("valid after {} repairs", n),
                }))
            }
            Stage::Execute => {
                let primary = ctx.primary()?.to_string();
                let pipeline = ctx
                    .validated
                    .as_ref()
                    .ok_or_else(|| WorkflowError::ExecutionFailed("no validated pipeline".into()))?;
                let result = self.executor.execute(pipeline, &primary).await?;
                let detail = format!(
                    "{} row(s) in {:.3}s",
                    result.rows.len(),
                    result.execution_time_seconds
                );
                ctx.result = Some(result);
                Ok(Some(detail))
            }
            Stage::FormatResult => {
                let rows = ctx.result.as_ref().map(|r| r.rows.as_slice()).unwrap_or(&[]);
                let formatted = self.formatter.format(query, rows).await;
                ctx.answer = Some(formatted.answer);
                match formatted.degraded {
                    Some(reason) => Err(WorkflowError::FormattingDegraded(reason)),
                    None => Ok(None),
                }
            }
            Stage::Done | Stage::Errored => Ok(None),
        }
    }
}

fn envelope(
    request_id: String,
    query: &str,
    ctx: RunContext,
    log: StepLog,
    execution_time: f64,
) -> ResponseEnvelope {
    let target_collection = ctx.selected.first().cloned();
    let generated_mql = ctx.validated.or(ctx.generated);
    let generated_command = match (&generated_mql, &target_collection) {
        (Some(p), Some(c)) => Some(p.to_shell_command(c)),
        _ => None,
    };
    let (results, query_execution_time) = match ctx.result {
        Some(r) => (r.rows, Some(r.execution_time_seconds)),
        None => (Vec::new(), None),
    };

    ResponseEnvelope {
        request_id,
        success: ctx.error.is_none(),
        query: query.to_string(),
        formatted_answer: ctx.answer,
        generated_mql,
        generated_command,
        target_collection,
        selected_collections: ctx.selected,
        results,
        workflow_steps: log.into_steps(),
        execution_time,
        query_execution_time,
        collections_found: ctx.known.len(),
        schema_retrieved: ctx.schemas.len(),
        error_kind: ctx.error.as_ref().map(|e| e.code().to_string()),
        error: ctx.error.map(|e| e.to_string()),
    }
}
