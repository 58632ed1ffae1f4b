//! MongoDB backend for the [`Database`] trait.
//!
//! Documents cross the trait boundary as relaxed extended JSON: outbound
//! pipelines are parsed with `Bson::try_from(serde_json::Value)` (so
//! `{"$date": ..}` and `{"$oid": ..}` become native BSON), and results are
//! rendered back with `into_relaxed_extjson`.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use text_to_mql_core::pipeline::{normalize_dates, Pipeline};
use text_to_mql_core::store::Database;

use crate::config::DatabaseConfig;

pub struct MongoDatabase {
    db: mongodb::Database,
}

impl MongoDatabase {
    /// Build a client for `config.uri`. No I/O happens until first use.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.uri)
            .await
            .with_context(|| format!("Invalid MongoDB URI: {}", config.uri))?;
        options.server_selection_timeout = Some(Duration::from_secs(config.timeout_secs));
        options.connect_timeout = Some(Duration::from_secs(config.timeout_secs));
        options.app_name = Some("text-to-mql".to_string());

        let client = Client::with_options(options).context("Failed to create MongoDB client")?;
        Ok(Self {
            db: client.database(&config.name),
        })
    }
}

/// Convert one stage (or any JSON object) into a BSON document.
///
/// `{"$date": ..}` strings are normalized first; the driver only accepts
/// RFC 3339 with an offset.
fn to_document(value: &Value) -> Result<Document> {
    let mut value = value.clone();
    normalize_dates(&mut value);
    match Bson::try_from(value).map_err(|e| anyhow!("invalid extended JSON: {}", e))? {
        Bson::Document(doc) => Ok(doc),
        other => Err(anyhow!("expected a document, got {:?}", other.element_type())),
    }
}

fn to_json(doc: Document) -> Value {
    Bson::Document(doc).into_relaxed_extjson()
}

#[async_trait]
impl Database for MongoDatabase {
    async fn list_collections(&self) -> Result<Vec<String>> {
        self.db
            .list_collection_names()
            .await
            .context("Failed to list collections")
    }

    async fn sample_documents(&self, collection: &str, limit: usize) -> Result<Vec<Value>> {
        let coll = self.db.collection::<Document>(collection);
        let cursor = coll
            .find(doc! {})
            .limit(limit as i64)
            .await
            .with_context(|| format!("Failed to sample {}", collection))?;
        let docs: Vec<Document> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(to_json).collect())
    }

    async fn run_aggregation(
        &self,
        collection: &str,
        pipeline: &Pipeline,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let stages = pipeline
            .to_documents()
            .iter()
            .map(to_document)
            .collect::<Result<Vec<_>>>()?;
        debug!(collection, stages = stages.len(), "running aggregation");

        let coll = self.db.collection::<Document>(collection);
        let mut cursor = coll.aggregate(stages).await?;
        let mut rows = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            rows.push(to_json(doc));
            if rows.len() >= limit {
                break;
            }
        }
        Ok(rows)
    }

    async fn count_documents(&self, collection: &str) -> Result<u64> {
        self.db
            .collection::<Document>(collection)
            .count_documents(doc! {})
            .await
            .with_context(|| format!("Failed to count {}", collection))
    }

    async fn ping(&self) -> Result<()> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use text_to_mql_core::pipeline::decode_pipeline_text;

    #[test]
    fn test_extended_json_stage_conversion() {
        let stage = json!({"$match": {"hired": {"$gte": {"$date": "2020-01-01T00:00:00Z"}}}});
        let doc = to_document(&stage).unwrap();
        let inner = doc.get_document("$match").unwrap().get_document("hired").unwrap();
        assert!(matches!(inner.get("$gte"), Some(Bson::DateTime(_))));
    }

    #[test]
    fn test_date_only_values_convert() {
        let stage = json!({"$match": {"hire_date": {"$gte": {"$date": "2020-01-01"}}}});
        let doc = to_document(&stage).unwrap();
        let inner = doc.get_document("$match").unwrap().get_document("hire_date").unwrap();
        assert_eq!(
            inner.get_datetime("$gte").unwrap().timestamp_millis(),
            1_577_836_800_000
        );
    }

    #[test]
    fn test_shell_dates_convert() {
        let pipeline = decode_pipeline_text(
            r#"db.teachers.aggregate([{$match: {hire_date: {$gte: ISODate("2020-01-01")}}}])"#,
        )
        .unwrap();
        let stages = pipeline
            .to_documents()
            .iter()
            .map(to_document)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let inner = stages[0].get_document("$match").unwrap().get_document("hire_date").unwrap();
        assert!(matches!(inner.get("$gte"), Some(Bson::DateTime(_))));
    }

    #[test]
    fn test_non_document_rejected() {
        assert!(to_document(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_results_render_as_relaxed_json() {
        let doc = doc! { "name": "Ann", "n": 3_i32 };
        assert_eq!(to_json(doc), json!({"name": "Ann", "n": 3}));
    }
}
