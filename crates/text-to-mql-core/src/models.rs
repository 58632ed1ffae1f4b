//! Core data models for the query workflow.
//!
//! These types carry data between workflow stages and back out to callers.
//! All of them are request-scoped; nothing here is cached across requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pipeline::Pipeline;

/// An inbound natural-language question.
///
/// Deserializes from `{ "query": "..." }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(rename = "query")]
    pub text: String,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// True when the text is empty or whitespace-only.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Inferred type of a top-level document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Array,
    Object,
    ObjectId,
    /// Every sampled value was null.
    Null,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::ObjectId => "objectId",
            FieldType::Null => "null",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_value: Option<Value>,
}

/// Lightweight schema of one collection, inferred from a document sample.
///
/// This is a hint for prompting, not a contract: fields missing from the
/// sample are simply absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub sampled_documents: usize,
    pub fields: Vec<FieldInfo>,
}

impl CollectionSchema {
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Size of one collection, as listed by the collections endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub name: String,
    pub document_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Success,
    Failed,
}

/// One entry in the workflow step log. Appended once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WorkflowStep {
    pub fn success(name: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Success,
            detail,
        }
    }

    pub fn failed(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Failed,
            detail: Some(detail.into()),
        }
    }
}

/// Rows returned by one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<Value>,
    pub execution_time_seconds: f64,
}

/// The outbound result of one workflow run.
///
/// Always produced, on success and on failure; `error` and `error_kind` are
/// set only when `success` is false.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub success: bool,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_mql: Option<Pipeline>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_collection: Option<String>,
    pub selected_collections: Vec<String>,
    pub results: Vec<Value>,
    pub workflow_steps: Vec<WorkflowStep>,
    pub execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_execution_time: Option<f64>,
    pub collections_found: usize,
    /// Number of collection schemas retrieved.
    pub schema_retrieved: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

/// Remove `fields` from the top level of a document, in place.
pub fn redact(doc: &mut Value, fields: &[String]) {
    if let Value::Object(map) = doc {
        for field in fields {
            map.remove(field);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_request_wire_name() {
        let req: QueryRequest = serde_json::from_value(json!({"query": "  "})).unwrap();
        assert!(req.is_blank());
        assert!(!QueryRequest::new("how many?").is_blank());
    }

    #[test]
    fn test_field_type_wire_names() {
        assert_eq!(serde_json::to_value(FieldType::ObjectId).unwrap(), json!("objectId"));
        assert_eq!(FieldType::ObjectId.as_str(), "objectId");
        assert_eq!(serde_json::to_value(FieldType::Date).unwrap(), json!("date"));
    }

    #[test]
    fn test_step_serialization_omits_empty_detail() {
        let step = WorkflowStep::success("execute", None);
        assert_eq!(
            serde_json::to_value(&step).unwrap(),
            json!({"name": "execute", "status": "success"})
        );
        let failed = WorkflowStep::failed("execute", "timeout");
        assert_eq!(failed.detail.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_redact_top_level_only() {
        let mut doc = json!({"a": 1, "vector_embedding": [0.1], "n": {"vector_embedding": 1}});
        redact(&mut doc, &["vector_embedding".to_string()]);
        assert_eq!(doc, json!({"a": 1, "n": {"vector_embedding": 1}}));
    }
}
