//! Prompt templates and structured-output schemas.
//!
//! Every prompt opens with a fixed `# ...` heading so transcripts (and test
//! doubles) can tell the four request kinds apart.

use serde_json::{json, Value};

use text_to_mql_core::models::CollectionSchema;
use text_to_mql_core::pipeline::{Pipeline, Violation, ALLOWED_OPERATORS};
use text_to_mql_core::schema::render_schema_context;

pub const SELECTION_HEADING: &str = "# Collection Selection";
pub const GENERATION_HEADING: &str = "# Pipeline Generation";
pub const REPAIR_HEADING: &str = "# Pipeline Repair";
pub const FORMATTING_HEADING: &str = "# Answer Formatting";

const PIPELINE_RULES: &str = "\
- Output read-only aggregation stages only; never use $out or $merge.
- Use field names exactly as they appear in the schema. Do not prefix field names with '$' except when referencing a field inside an expression.
- Match value types to the schema: numbers as numbers, dates as {\"$date\": \"<RFC 3339 UTC, e.g. 2020-01-01T00:00:00Z>\"}, ObjectIds as {\"$oid\": \"<hex>\"}.
- Use case-insensitive {\"$regex\": \"...\", \"$options\": \"i\"} for names and descriptive text; keep codes and identifiers exact.
- For \"how many\", \"count\" or \"total\" questions end with a $count stage.
- For \"first\"/\"earliest\" sort ascending and $limit 1; for \"last\"/\"latest\" sort descending and $limit 1.
- Exclude _id in $project (\"_id\": 0) unless the question asks for ids.
- $lookup must come before any stage that references the joined field.";

/// Structured-output schema for collection selection.
pub fn selection_schema(known: &[String]) -> Value {
    json!({
        "type": "object",
        "properties": {
            "collections": {
                "type": "array",
                "items": {"type": "string", "enum": known},
            }
        },
        "required": ["collections"],
    })
}

/// Structured-output schema for generated and repaired pipelines.
pub fn pipeline_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "pipeline": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "operator": {"type": "string", "enum": ALLOWED_OPERATORS},
                        "body": {},
                    },
                    "required": ["operator", "body"],
                }
            }
        },
        "required": ["pipeline"],
    })
}

pub fn selection_prompt(query: &str, known: &[String], max_selected: usize) -> String {
    format!(
        "{SELECTION_HEADING}

You are a MongoDB analyst. Decide which collections are needed to answer the question.

## Available Collections
{collections}

## Question
\"{query}\"

## Rules
- Return only names that exactly match the list above.
- Order them by relevance, most relevant first.
- Include a related collection only if a join is needed to answer the question.
- Return at most {max_selected} collections.

Respond with JSON: {{\"collections\": [\"name\", ...]}}",
        collections = known.join(", "),
    )
}

pub fn generation_prompt(query: &str, target: &str, schemas: &[CollectionSchema]) -> String {
    format!(
        "{GENERATION_HEADING}

Convert the question into a MongoDB aggregation pipeline that runs on the collection \"{target}\".
Other collections listed below may be joined with $lookup.

## Schema
{schema}

## Question
\"{query}\"

## Rules
{PIPELINE_RULES}
- Use only these stage operators: {operators}.

Respond with JSON: {{\"pipeline\": [{{\"operator\": \"$match\", \"body\": {{...}}}}, ...]}}",
        schema = render_schema_context(schemas),
        operators = ALLOWED_OPERATORS.join(", "),
    )
}

pub fn repair_prompt(
    query: &str,
    pipeline: &Pipeline,
    violation: &Violation,
    schemas: &[CollectionSchema],
) -> String {
    format!(
        "{REPAIR_HEADING}

The aggregation pipeline below was generated for the question but failed validation.
Fix the reported problem and return the complete corrected pipeline.

## Question
\"{query}\"

## Pipeline
{pipeline}

## Problem
{violation}

## Schema
{schema}

## Rules
{PIPELINE_RULES}
- Use only these stage operators: {operators}.

Respond with JSON: {{\"pipeline\": [{{\"operator\": \"$match\", \"body\": {{...}}}}, ...]}}",
        pipeline = pipeline.to_json_string(),
        schema = render_schema_context(schemas),
        operators = ALLOWED_OPERATORS.join(", "),
    )
}

pub fn formatting_prompt(query: &str, preview: &str, total_rows: usize) -> String {
    format!(
        "{FORMATTING_HEADING}

Answer the question in clear, concise prose using only the query results below.
State counts and figures exactly as they appear. If there are no results, say that nothing matched.
Do not mention MongoDB, pipelines or JSON.

## Question
\"{query}\"

## Results ({total_rows} row(s))
{preview}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use text_to_mql_core::pipeline::decode_pipeline;

    #[test]
    fn test_prompts_start_with_headings() {
        let known = vec!["students".to_string()];
        assert!(selection_prompt("q", &known, 4).starts_with(SELECTION_HEADING));
        assert!(generation_prompt("q", "students", &[]).starts_with(GENERATION_HEADING));
        assert!(formatting_prompt("q", "[]", 0).starts_with(FORMATTING_HEADING));

        let p = decode_pipeline(&json!([{"$nope": 1}])).unwrap();
        let v = Violation::new(1, "$nope", "unsupported operator");
        let prompt = repair_prompt("q", &p, &v, &[]);
        assert!(prompt.starts_with(REPAIR_HEADING));
        assert!(prompt.contains("stage 1 ($nope): unsupported operator"));
        assert!(prompt.contains(r#"[{"$nope":1}]"#));
    }

    #[test]
    fn test_generation_prompt_asks_for_rfc3339_dates() {
        let prompt = generation_prompt("Teachers hired since 2020", "teachers", &[]);
        assert!(prompt.contains("RFC 3339 UTC"));
        assert!(!prompt.contains("ISO-8601"));
    }

    #[test]
    fn test_selection_schema_constrains_names() {
        let schema = selection_schema(&["a".into(), "b".into()]);
        assert_eq!(
            schema["properties"]["collections"]["items"]["enum"],
            json!(["a", "b"])
        );
    }

    #[test]
    fn test_selection_prompt_lists_collections() {
        let prompt = selection_prompt(
            "How many students?",
            &["courses".into(), "students".into()],
            3,
        );
        assert!(prompt.contains("courses, students"));
        assert!(prompt.contains("at most 3"));
    }
}
