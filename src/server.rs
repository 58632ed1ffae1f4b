//! HTTP API for the query workflow.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/query` | Run the workflow for `{ "query": "..." }` |
//! | `GET`  | `/api/collections` | List user collections with document counts |
//! | `GET`  | `/api/collections/{name}/schema` | Inferred schema of one collection |
//! | `POST` | `/api/collections/{name}/aggregate` | Validate and run a supplied pipeline |
//! | `GET`  | `/api/search?q=...` | Keyword search across collections |
//! | `GET`  | `/health` | Database reachability and version |
//! | `GET`  | `/demo-queries` | Example questions |
//!
//! # Error Contract
//!
//! Errors outside the workflow envelope use one shape:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400, including malformed JSON bodies),
//! `pipeline_invalid` (400), `collection_not_found` (404),
//! `database_unavailable` (503), and any other workflow code (500).
//!
//! `POST /api/query` answers 200 for every non-empty query. Workflow
//! failures are reported inside the envelope (`success: false`).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser front-ends
//! can call the API directly.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use text_to_mql_core::models::{CollectionSchema, CollectionStats, QueryRequest, ResponseEnvelope};
use text_to_mql_core::pipeline::{decode_pipeline, Pipeline};
use text_to_mql_core::WorkflowError;

use crate::config::Config;
use crate::db::with_timeout;
use crate::search::search_collections;
use crate::workflow::Workflow;

const DEFAULT_SEARCH_LIMIT: usize = 5;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    workflow: Arc<Workflow>,
    health_timeout: Duration,
    search_limit: usize,
}

impl AppState {
    pub fn new(workflow: Arc<Workflow>, health_timeout: Duration) -> Self {
        Self {
            workflow,
            health_timeout,
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    /// Rows per collection returned by `/api/search`.
    pub fn with_search_limit(mut self, search_limit: usize) -> Self {
        self.search_limit = search_limit;
        self
    }
}

/// Routes with CORS applied, ready to serve.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/query", post(handle_query))
        .route("/api/collections", get(handle_collections))
        .route("/api/collections/{name}/schema", get(handle_schema))
        .route("/api/collections/{name}/aggregate", post(handle_aggregate))
        .route("/api/search", get(handle_search))
        .route("/health", get(handle_health))
        .route("/demo-queries", get(handle_demo_queries))
        .layer(cors)
        .with_state(state)
}

/// Bind `[server].bind` and serve until the process is terminated.
pub async fn run_server(config: &Config, workflow: Arc<Workflow>) -> anyhow::Result<()> {
    let state = AppState::new(workflow, Duration::from_secs(config.database.timeout_secs))
        .with_search_limit(config.workflow.search_limit);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "query server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<WorkflowError> for AppError {
    fn from(err: WorkflowError) -> Self {
        let status = match &err {
            WorkflowError::CollectionNotFound(_) => StatusCode::NOT_FOUND,
            WorkflowError::PipelineInvalid(_) => StatusCode::BAD_REQUEST,
            WorkflowError::DatabaseUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ POST /api/query ============

async fn handle_query(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<ResponseEnvelope>, AppError> {
    let Json(request) = payload.map_err(|rejection| bad_request(rejection.body_text()))?;
    if request.is_blank() {
        return Err(bad_request("query must not be empty"));
    }
    Ok(Json(state.workflow.run(&request).await))
}

// ============ GET /api/collections ============

#[derive(Serialize)]
struct CollectionsResponse {
    collections: Vec<String>,
    stats: Vec<CollectionStats>,
}

async fn handle_collections(
    State(state): State<AppState>,
) -> Result<Json<CollectionsResponse>, AppError> {
    let stats = state.workflow.catalog().collection_stats().await?;
    let collections = stats.iter().map(|s| s.name.clone()).collect();
    Ok(Json(CollectionsResponse { collections, stats }))
}

// ============ GET /api/collections/{name}/schema ============

async fn handle_schema(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CollectionSchema>, AppError> {
    let schema = state.workflow.catalog().get_schema(&name).await?;
    Ok(Json(schema))
}

// ============ POST /api/collections/{name}/aggregate ============

#[derive(Serialize)]
struct AggregateResponse {
    collection: String,
    pipeline: Pipeline,
    command: String,
    results: Vec<Value>,
    execution_time: f64,
}

/// Body: `{ "pipeline": [...] }` or a bare stage list.
async fn handle_aggregate(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<AggregateResponse>, AppError> {
    let Json(body) = payload.map_err(|rejection| bad_request(rejection.body_text()))?;
    let pipeline = decode_pipeline(&body).map_err(|e| bad_request(e.to_string()))?;
    let result = state.workflow.run_pipeline(&name, &pipeline).await?;
    Ok(Json(AggregateResponse {
        command: pipeline.to_shell_command(&name),
        collection: name,
        pipeline,
        results: result.rows,
        execution_time: result.execution_time_seconds,
    }))
}

// ============ GET /api/search ============

#[derive(Deserialize)]
struct SearchParams {
    q: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    count: usize,
    results: Vec<Value>,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, AppError> {
    let term = params.q.unwrap_or_default().trim().to_string();
    if term.is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    let results = search_collections(
        state.workflow.catalog(),
        state.workflow.executor(),
        &term,
        state.search_limit,
    )
    .await?;
    Ok(Json(SearchResponse {
        query: term,
        count: results.len(),
        results,
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// `"healthy"` or `"unhealthy"`.
    status: String,
    version: String,
    /// `"connected"` or the connection error.
    database: String,
    collections_count: usize,
}

/// Pings the database and counts collections; 503 when either fails.
async fn handle_health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let catalog = state.workflow.catalog();
    let ping = with_timeout(state.health_timeout, catalog.database().ping()).await;

    let checked = match ping {
        Ok(()) => catalog.list_collections().await.map_err(|e| e.to_string()),
        Err(e) => Err(format!("{:#}", e)),
    };

    match checked {
        Ok(collections) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                database: "connected".to_string(),
                collections_count: collections.len(),
            }),
        ),
        Err(message) => {
            warn!(error = %message, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    database: message,
                    collections_count: 0,
                }),
            )
        }
    }
}

// ============ GET /demo-queries ============

#[derive(Serialize)]
struct DemoQueries {
    basic_queries: &'static [&'static str],
    analytical_queries: &'static [&'static str],
    complex_queries: &'static [&'static str],
}

const BASIC_QUERIES: &[&str] = &[
    "Find all students in Computer Science department",
    "List all teachers with their departments",
    "Show me courses offered this semester",
    "What departments do we have?",
    "Find students with GPA above 3.5",
];

const ANALYTICAL_QUERIES: &[&str] = &[
    "What's the average GPA of students in each department?",
    "Which courses have the highest enrollment?",
    "List teachers with highest salaries",
    "Find students enrolled in Machine Learning courses",
    "Show departments with most students",
];

const COMPLEX_QUERIES: &[&str] = &[
    "Find the top 3 students by GPA in Computer Science who are enrolled in at least 2 courses",
    "List teachers teaching more than 3 courses this semester",
    "What's the average salary of teachers in each department?",
    "Find courses with enrollment less than 10 students",
    "Show students who haven't enrolled in any courses",
];

async fn handle_demo_queries() -> Json<DemoQueries> {
    Json(DemoQueries {
        basic_queries: BASIC_QUERIES,
        analytical_queries: ANALYTICAL_QUERIES,
        complex_queries: COMPLEX_QUERIES,
    })
}
