//! In-memory [`Database`] implementation for tests and offline runs.
//!
//! Collections are `Vec<Value>` behind `std::sync::RwLock`. Aggregations are
//! evaluated by [`aggregate::run_pipeline`](super::aggregate::run_pipeline).

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::aggregate::run_pipeline;
use super::Database;
use crate::pipeline::Pipeline;

pub struct InMemoryDatabase {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Load fixtures shaped as `{ "<collection>": [ <document>, ... ] }`.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).context("fixtures are not valid JSON")?;
        let Value::Object(map) = value else {
            bail!("fixtures must be an object mapping collection names to document lists");
        };
        let db = Self::new();
        for (name, docs) in map {
            let Value::Array(docs) = docs else {
                bail!("fixture collection `{}` must be a list of documents", name);
            };
            db.insert_collection(&name, docs);
        }
        Ok(db)
    }

    /// Create or replace a collection.
    pub fn insert_collection(&self, name: &str, docs: Vec<Value>) {
        let mut collections = self.collections.write().unwrap();
        collections.insert(name.to_string(), docs);
    }
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn list_collections(&self) -> Result<Vec<String>> {
        let collections = self.collections.read().unwrap();
        Ok(collections.keys().cloned().collect())
    }

    async fn sample_documents(&self, collection: &str, limit: usize) -> Result<Vec<Value>> {
        let collections = self.collections.read().unwrap();
        Ok(collections
            .get(collection)
            .map(|docs| docs.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn run_aggregation(
        &self,
        collection: &str,
        pipeline: &Pipeline,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let collections = self.collections.read().unwrap();
        let docs = collections.get(collection).cloned().unwrap_or_default();
        let foreign = |name: &str| collections.get(name).cloned().unwrap_or_default();
        let mut rows = run_pipeline(docs, pipeline, &foreign)?;
        rows.truncate(limit);
        Ok(rows)
    }

    async fn count_documents(&self, collection: &str) -> Result<u64> {
        let collections = self.collections.read().unwrap();
        Ok(collections.get(collection).map_or(0, |docs| docs.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::decode_pipeline;
    use serde_json::json;

    #[tokio::test]
    async fn test_fixtures_roundtrip() {
        let db = InMemoryDatabase::from_json(
            r#"{"students": [{"name": "Ann"}, {"name": "Bo"}], "courses": []}"#,
        )
        .unwrap();
        let mut names = db.list_collections().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["courses", "students"]);
        assert_eq!(db.sample_documents("students", 1).await.unwrap().len(), 1);
        assert!(db.sample_documents("missing", 5).await.unwrap().is_empty());
    }

    #[test]
    fn test_fixtures_reject_bad_shape() {
        assert!(InMemoryDatabase::from_json("[1, 2]").is_err());
        assert!(InMemoryDatabase::from_json(r#"{"students": 3}"#).is_err());
    }

    #[tokio::test]
    async fn test_count_documents() {
        let db = InMemoryDatabase::new();
        db.insert_collection("n", (0..7).map(|i| json!({"i": i})).collect());
        assert_eq!(db.count_documents("n").await.unwrap(), 7);
        assert_eq!(db.count_documents("missing").await.unwrap(), 0);
    }

    /// The trait's default counts through a `$count` aggregation.
    struct AggregateOnly(InMemoryDatabase);

    #[async_trait]
    impl Database for AggregateOnly {
        async fn list_collections(&self) -> Result<Vec<String>> {
            self.0.list_collections().await
        }

        async fn sample_documents(&self, collection: &str, limit: usize) -> Result<Vec<Value>> {
            self.0.sample_documents(collection, limit).await
        }

        async fn run_aggregation(
            &self,
            collection: &str,
            pipeline: &Pipeline,
            limit: usize,
        ) -> Result<Vec<Value>> {
            self.0.run_aggregation(collection, pipeline, limit).await
        }
    }

    #[tokio::test]
    async fn test_default_count_uses_aggregation() {
        let inner = InMemoryDatabase::new();
        inner.insert_collection("n", (0..12).map(|i| json!({"i": i})).collect());
        inner.insert_collection("empty", vec![]);
        let db = AggregateOnly(inner);
        assert_eq!(db.count_documents("n").await.unwrap(), 12);
        assert_eq!(db.count_documents("empty").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_aggregation_respects_limit() {
        let db = InMemoryDatabase::new();
        db.insert_collection("n", (0..50).map(|i| json!({"i": i})).collect());
        let p = decode_pipeline(&json!([{"$sort": {"i": -1}}])).unwrap();
        let rows = db.run_aggregation("n", &p, 10).await.unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0]["i"], 49);
    }
}
