//! Collection listing, document counts, and on-demand schema inference.

use std::sync::Arc;
use std::time::Duration;

use text_to_mql_core::models::{CollectionSchema, CollectionStats};
use text_to_mql_core::schema::infer_schema;
use text_to_mql_core::store::Database;
use text_to_mql_core::WorkflowError;
use tracing::debug;

use crate::config::DatabaseConfig;
use crate::db::with_timeout;

pub struct SchemaCatalog {
    db: Arc<dyn Database>,
    sample_size: usize,
    excluded_prefixes: Vec<String>,
    redacted_fields: Vec<String>,
    timeout: Duration,
}

impl SchemaCatalog {
    pub fn new(db: Arc<dyn Database>, config: &DatabaseConfig) -> Self {
        Self {
            db,
            sample_size: config.sample_size,
            excluded_prefixes: config.excluded_prefixes.clone(),
            redacted_fields: config.redacted_fields.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn redacted_fields(&self) -> &[String] {
        &self.redacted_fields
    }

    /// Sorted user collection names, without excluded prefixes.
    pub async fn list_collections(&self) -> Result<Vec<String>, WorkflowError> {
        let mut names = with_timeout(self.timeout, self.db.list_collections())
            .await
            .map_err(|e| WorkflowError::DatabaseUnavailable(format!("{:#}", e)))?;
        names.retain(|n| !self.excluded_prefixes.iter().any(|p| n.starts_with(p.as_str())));
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Document count of every user collection, in listing order.
    pub async fn collection_stats(&self) -> Result<Vec<CollectionStats>, WorkflowError> {
        let names = self.list_collections().await?;
        let mut stats = Vec::with_capacity(names.len());
        for name in names {
            let document_count = with_timeout(self.timeout, self.db.count_documents(&name))
                .await
                .map_err(|e| WorkflowError::DatabaseUnavailable(format!("{:#}", e)))?;
            stats.push(CollectionStats {
                name,
                document_count,
            });
        }
        Ok(stats)
    }

    /// Fails with `CollectionNotFound` unless `name` is a user collection.
    pub async fn require_collection(&self, name: &str) -> Result<(), WorkflowError> {
        if self.list_collections().await?.iter().any(|k| k == name) {
            Ok(())
        } else {
            Err(WorkflowError::CollectionNotFound(name.to_string()))
        }
    }

    /// Schema of one collection, checked against the live listing.
    pub async fn get_schema(&self, name: &str) -> Result<CollectionSchema, WorkflowError> {
        let known = self.list_collections().await?;
        self.schema_of(name, &known).await
    }

    /// Schemas for `names` in order, listing collections once.
    pub async fn get_schemas(&self, names: &[String]) -> Result<Vec<CollectionSchema>, WorkflowError> {
        let known = self.list_collections().await?;
        let mut schemas = Vec::with_capacity(names.len());
        for name in names {
            schemas.push(self.schema_of(name, &known).await?);
        }
        Ok(schemas)
    }

    async fn schema_of(&self, name: &str, known: &[String]) -> Result<CollectionSchema, WorkflowError> {
        if !known.iter().any(|k| k == name) {
            return Err(WorkflowError::CollectionNotFound(name.to_string()));
        }
        let docs = with_timeout(self.timeout, self.db.sample_documents(name, self.sample_size))
            .await
            .map_err(|e| WorkflowError::DatabaseUnavailable(format!("{:#}", e)))?;
        debug!(collection = name, sampled = docs.len(), "inferred schema");
        Ok(infer_schema(name, &docs, &self.redacted_fields))
    }
}
