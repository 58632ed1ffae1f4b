use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use text_to_mql_core::store::Database;
use text_to_mql_core::InMemoryDatabase;

use crate::config::Config;
use crate::mongo::MongoDatabase;

/// Open the configured database, or an in-memory one loaded from
/// `fixtures` (a `{ collection: [documents] }` JSON file) when given.
pub async fn connect(config: &Config, fixtures: Option<&Path>) -> Result<Arc<dyn Database>> {
    match fixtures {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read fixtures: {}", path.display()))?;
            Ok(Arc::new(InMemoryDatabase::from_json(&text)?))
        }
        None => Ok(Arc::new(MongoDatabase::connect(&config.database).await?)),
    }
}

/// Bound a database call; expiry is reported as an error like any other.
pub async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| anyhow!("database call timed out after {}s", limit.as_secs()))?
}
