//! Schema inference from sampled documents.
//!
//! Schemas are rebuilt on every request from a handful of documents: the
//! union of top-level keys in first-seen order, each tagged with a coarse
//! type and one example value.

use serde_json::{Map, Value};

use crate::models::{CollectionSchema, FieldInfo, FieldType};

const SAMPLE_VALUE_MAX_CHARS: usize = 80;

/// Coarse type of a JSON (or extended-JSON) value. `None` for null.
pub fn infer_field_type(value: &Value) -> Option<FieldType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(FieldType::Boolean),
        Value::Number(_) => Some(FieldType::Number),
        Value::String(s) => Some(if looks_like_date(s) {
            FieldType::Date
        } else {
            FieldType::String
        }),
        Value::Array(_) => Some(FieldType::Array),
        Value::Object(map) => Some(extended_json_type(map).unwrap_or(FieldType::Object)),
    }
}

fn extended_json_type(map: &Map<String, Value>) -> Option<FieldType> {
    if map.len() != 1 {
        return None;
    }
    let key = map.keys().next()?;
    match key.as_str() {
        "$date" => Some(FieldType::Date),
        "$oid" => Some(FieldType::ObjectId),
        "$numberLong" | "$numberInt" | "$numberDouble" | "$numberDecimal" => {
            Some(FieldType::Number)
        }
        _ => None,
    }
}

fn looks_like_date(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
}

/// Build a schema from sampled documents, skipping `redacted` fields.
pub fn infer_schema(name: &str, docs: &[Value], redacted: &[String]) -> CollectionSchema {
    let mut fields: Vec<FieldInfo> = Vec::new();

    for doc in docs {
        let Some(map) = doc.as_object() else {
            continue;
        };
        for (key, value) in map {
            if redacted.iter().any(|r| r == key) {
                continue;
            }
            let inferred = infer_field_type(value);
            match fields.iter_mut().find(|f| &f.name == key) {
                Some(existing) => {
                    if existing.field_type == FieldType::Null {
                        if let Some(t) = inferred {
                            existing.field_type = t;
                            existing.sample_value = Some(value.clone());
                        }
                    }
                }
                None => fields.push(FieldInfo {
                    name: key.clone(),
                    field_type: inferred.unwrap_or(FieldType::Null),
                    sample_value: inferred.map(|_| value.clone()),
                }),
            }
        }
    }

    CollectionSchema {
        name: name.to_string(),
        sampled_documents: docs.len(),
        fields,
    }
}

/// Compact prompt rendering of one or more schemas.
pub fn render_schema_context(schemas: &[CollectionSchema]) -> String {
    let mut out = String::new();
    for schema in schemas {
        out.push_str(&format!(
            "Collection: {} ({} sampled documents)\n",
            schema.name, schema.sampled_documents
        ));
        if schema.fields.is_empty() {
            out.push_str("  (no fields observed)\n");
        }
        for field in &schema.fields {
            match &field.sample_value {
                Some(sample) => out.push_str(&format!(
                    "  - {}: {} (e.g. {})\n",
                    field.name,
                    field.field_type.as_str(),
                    truncate(&sample.to_string(), SAMPLE_VALUE_MAX_CHARS)
                )),
                None => out.push_str(&format!(
                    "  - {}: {}\n",
                    field.name,
                    field.field_type.as_str()
                )),
            }
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Truncate to at most `max` characters, marking the cut with `...`.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max).collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infer_types() {
        assert_eq!(infer_field_type(&json!("Ann")), Some(FieldType::String));
        assert_eq!(infer_field_type(&json!(3.5)), Some(FieldType::Number));
        assert_eq!(infer_field_type(&json!(true)), Some(FieldType::Boolean));
        assert_eq!(infer_field_type(&json!([1])), Some(FieldType::Array));
        assert_eq!(infer_field_type(&json!({"a": 1})), Some(FieldType::Object));
        assert_eq!(infer_field_type(&json!(null)), None);
        assert_eq!(
            infer_field_type(&json!("2023-09-01T00:00:00Z")),
            Some(FieldType::Date)
        );
        assert_eq!(
            infer_field_type(&json!({"$date": "2023-09-01T00:00:00Z"})),
            Some(FieldType::Date)
        );
        assert_eq!(
            infer_field_type(&json!({"$oid": "64b7f0c2a1b2c3d4e5f60718"})),
            Some(FieldType::ObjectId)
        );
        assert_eq!(
            infer_field_type(&json!({"$numberLong": "7"})),
            Some(FieldType::Number)
        );
    }

    #[test]
    fn test_fields_are_union_in_first_seen_order() {
        let docs = vec![
            json!({"name": "Ann", "gpa": 3.9}),
            json!({"name": "Bo", "major": "CS", "vector_embedding": [0.1, 0.2]}),
        ];
        let schema = infer_schema("students", &docs, &["vector_embedding".to_string()]);
        let names: Vec<&str> = schema.field_names().collect();
        assert_eq!(names, vec!["name", "gpa", "major"]);
        assert_eq!(schema.sampled_documents, 2);

        for name in &names {
            assert!(docs.iter().any(|d| d.get(*name).is_some()));
        }
    }

    #[test]
    fn test_null_only_until_a_value_appears() {
        let docs = vec![json!({"advisor": null}), json!({"advisor": "Dr. X"})];
        let schema = infer_schema("s", &docs, &[]);
        let advisor = schema.field("advisor").unwrap();
        assert_eq!(advisor.field_type, FieldType::String);
        assert_eq!(advisor.sample_value, Some(json!("Dr. X")));

        let all_null = infer_schema("s", &[json!({"x": null})], &[]);
        assert_eq!(all_null.fields[0].field_type, FieldType::Null);
        assert!(all_null.fields[0].sample_value.is_none());
    }

    #[test]
    fn test_render_truncates_samples() {
        let long = "x".repeat(200);
        let schema = infer_schema("notes", &[json!({"body": long})], &[]);
        let text = render_schema_context(&[schema]);
        assert!(text.starts_with("Collection: notes (1 sampled documents)"));
        assert!(text.contains("- body: string"));
        assert!(text.contains("..."));
        assert!(text.len() < 200);
    }

    #[test]
    fn test_render_empty_collection() {
        let schema = infer_schema("empty", &[], &[]);
        assert!(render_schema_context(&[schema]).contains("(no fields observed)"));
    }
}
