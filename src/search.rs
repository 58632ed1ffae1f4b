//! Keyword search across every user collection.
//!
//! For each collection the sampled schema gives the string fields; a
//! case-insensitive `$regex` on each of them is OR-ed into one `$match`.
//! The term is escaped, so it always matches literally. Collections with no
//! string fields are skipped, and a collection whose search fails is logged
//! and skipped rather than failing the whole search.

use serde_json::{json, Value};
use tracing::{debug, warn};

use text_to_mql_core::models::{CollectionSchema, FieldType};
use text_to_mql_core::pipeline::{Pipeline, Stage};
use text_to_mql_core::WorkflowError;

use crate::catalog::SchemaCatalog;
use crate::executor::QueryExecutor;

/// Field added to every hit naming the collection it came from.
pub const COLLECTION_FIELD: &str = "_collection";

/// Documents containing `term` in any string field, at most `per_collection`
/// from each collection, in collection order.
pub async fn search_collections(
    catalog: &SchemaCatalog,
    executor: &QueryExecutor,
    term: &str,
    per_collection: usize,
) -> Result<Vec<Value>, WorkflowError> {
    let names = catalog.list_collections().await?;
    let schemas = catalog.get_schemas(&names).await?;

    let mut hits = Vec::new();
    for schema in &schemas {
        let Some(pipeline) = search_pipeline(schema, term, per_collection) else {
            continue;
        };
        match executor.execute(&pipeline, &schema.name).await {
            Ok(result) => {
                debug!(collection = %schema.name, hits = result.rows.len(), "searched collection");
                hits.extend(result.rows.into_iter().map(|mut row| {
                    if let Value::Object(map) = &mut row {
                        map.insert(COLLECTION_FIELD.to_string(), Value::from(schema.name.clone()));
                    }
                    row
                }));
            }
            Err(e) => warn!(collection = %schema.name, error = %e, "search skipped collection"),
        }
    }
    Ok(hits)
}

/// `$match` over the string fields of `schema`, then `$limit`. `None` when
/// the collection has no string fields.
pub fn search_pipeline(schema: &CollectionSchema, term: &str, limit: usize) -> Option<Pipeline> {
    let pattern = regex::escape(term.trim());
    let branches: Vec<Value> = schema
        .fields
        .iter()
        .filter(|f| f.field_type == FieldType::String)
        .map(|f| json!({ (f.name.clone()): {"$regex": pattern, "$options": "i"} }))
        .collect();
    if branches.is_empty() {
        return None;
    }
    Some(Pipeline::new(vec![
        Stage::new("$match", json!({ "$or": branches })),
        Stage::new("$limit", Value::from(limit)),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use text_to_mql_core::pipeline::check_pipeline;
    use text_to_mql_core::InMemoryDatabase;

    use crate::config::DatabaseConfig;

    fn fixtures() -> (SchemaCatalog, QueryExecutor) {
        let db = Arc::new(InMemoryDatabase::new());
        db.insert_collection(
            "courses",
            vec![
                json!({"code": "CS440", "title": "Machine Learning", "enrollment": 25}),
                json!({"code": "MA201", "title": "Linear Algebra", "enrollment": 8}),
            ],
        );
        db.insert_collection(
            "teachers",
            vec![
                json!({"name": "Ada", "specialization": "machine learning", "vector_embedding": [0.1]}),
                json!({"name": "Carl", "specialization": "algebra", "vector_embedding": [0.2]}),
            ],
        );
        db.insert_collection("rooms", vec![json!({"capacity": 30})]);
        let config = DatabaseConfig::default();
        let catalog = SchemaCatalog::new(db.clone(), &config);
        let executor = QueryExecutor::new(
            db,
            100,
            Duration::from_secs(5),
            config.redacted_fields.clone(),
        );
        (catalog, executor)
    }

    #[tokio::test]
    async fn test_search_spans_collections() {
        let (catalog, executor) = fixtures();
        let hits = search_collections(&catalog, &executor, "Machine", 5).await.unwrap();
        assert_eq!(
            hits,
            vec![
                json!({"code": "CS440", "title": "Machine Learning", "enrollment": 25, "_collection": "courses"}),
                json!({"name": "Ada", "specialization": "machine learning", "_collection": "teachers"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_search_limit_per_collection() {
        let (catalog, executor) = fixtures();
        let hits = search_collections(&catalog, &executor, "a", 1).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0][COLLECTION_FIELD], "courses");
        assert_eq!(hits[1][COLLECTION_FIELD], "teachers");
    }

    #[tokio::test]
    async fn test_search_term_is_literal() {
        let (catalog, executor) = fixtures();
        let hits = search_collections(&catalog, &executor, ".*", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_search_pipeline_is_valid() {
        let schema = text_to_mql_core::schema::infer_schema(
            "courses",
            &[json!({"code": "CS101", "enrollment": 40})],
            &[],
        );
        let pipeline = search_pipeline(&schema, "cs", 3).unwrap();
        assert_eq!(check_pipeline(&pipeline), Ok(()));
        assert_eq!(
            pipeline.to_documents()[0],
            json!({"$match": {"$or": [{"code": {"$regex": "cs", "$options": "i"}}]}})
        );

        let numeric = text_to_mql_core::schema::infer_schema("rooms", &[json!({"capacity": 1})], &[]);
        assert!(search_pipeline(&numeric, "cs", 3).is_none());
    }
}
