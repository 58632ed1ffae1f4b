//! Capped, timed pipeline execution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use text_to_mql_core::models::{redact, QueryResult};
use text_to_mql_core::pipeline::Pipeline;
use text_to_mql_core::store::Database;
use text_to_mql_core::WorkflowError;

use crate::db::with_timeout;

pub struct QueryExecutor {
    db: Arc<dyn Database>,
    max_results: usize,
    timeout: Duration,
    redacted_fields: Vec<String>,
}

impl QueryExecutor {
    pub fn new(
        db: Arc<dyn Database>,
        max_results: usize,
        timeout: Duration,
        redacted_fields: Vec<String>,
    ) -> Self {
        Self {
            db,
            max_results,
            timeout,
            redacted_fields,
        }
    }

    /// Run `pipeline` on `collection`, returning at most `max_results` rows.
    ///
    /// The row cap is enforced three times: as a trailing `$limit`, as the
    /// cursor limit handed to the database, and by truncating the rows.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        collection: &str,
    ) -> Result<QueryResult, WorkflowError> {
        let capped = pipeline.with_row_cap(self.max_results as u64);
        let started = Instant::now();

        let mut rows = with_timeout(
            self.timeout,
            self.db.run_aggregation(collection, &capped, self.max_results),
        )
        .await
        .map_err(|e| {
            let message = format!("{:#}", e);
            warn!(collection, error = %message, "aggregation failed");
            WorkflowError::ExecutionFailed(message)
        })?;

        let elapsed = started.elapsed().as_secs_f64();
        rows.truncate(self.max_results);
        for row in &mut rows {
            redact(row, &self.redacted_fields);
        }
        debug!(collection, rows = rows.len(), elapsed, "aggregation finished");

        Ok(QueryResult {
            rows,
            execution_time_seconds: elapsed,
        })
    }
}
