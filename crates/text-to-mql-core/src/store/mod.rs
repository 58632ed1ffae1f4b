//! Database abstraction for the query workflow.
//!
//! The [`Database`] trait is the only surface the workflow needs from a
//! document store: list and count collections, sample documents, and run
//! one aggregation pipeline. Backends:
//!
//! | Backend | Location |
//! |---------|----------|
//! | [`InMemoryDatabase`](memory::InMemoryDatabase) | this crate; tests and offline runs |
//! | `MongoDatabase` | application crate; official driver |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod aggregate;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::pipeline::{Pipeline, Stage};

/// Read-only access to a document database.
///
/// Documents cross this boundary as relaxed extended JSON
/// (`{"$oid": ..}`, `{"$date": ..}`).
#[async_trait]
pub trait Database: Send + Sync {
    /// Names of every collection, in no particular order.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Up to `limit` documents from `collection`, in natural order.
    async fn sample_documents(&self, collection: &str, limit: usize) -> Result<Vec<Value>>;

    /// Run `pipeline` against `collection` and return at most `limit` rows.
    async fn run_aggregation(
        &self,
        collection: &str,
        pipeline: &Pipeline,
        limit: usize,
    ) -> Result<Vec<Value>>;

    /// Number of documents in `collection`; 0 when it does not exist.
    async fn count_documents(&self, collection: &str) -> Result<u64> {
        let pipeline = Pipeline::new(vec![Stage::new("$count", Value::from("n"))]);
        let rows = self.run_aggregation(collection, &pipeline, 1).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("n"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    /// Cheap reachability check.
    async fn ping(&self) -> Result<()> {
        self.list_collections().await.map(|_| ())
    }
}
