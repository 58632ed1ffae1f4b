//! End-to-end workflow runs over the in-memory database with a scripted
//! language model.

mod common;

use serde_json::json;
use std::sync::Arc;

use common::{school_db, ScriptedLlm};
use text_to_mql::config::Config;
use text_to_mql::prompts::{FORMATTING_HEADING, REPAIR_HEADING, SELECTION_HEADING, GENERATION_HEADING};
use text_to_mql::workflow::Workflow;
use text_to_mql_core::llm::{Completion, LlmError};
use text_to_mql_core::models::{QueryRequest, ResponseEnvelope, StepStatus};
use text_to_mql_core::pipeline::decode_pipeline;
use text_to_mql_core::WorkflowError;

async fn run(config: &Config, llm: ScriptedLlm, question: &str) -> (ResponseEnvelope, Arc<ScriptedLlm>) {
    let llm = Arc::new(llm);
    let workflow = Workflow::new(config, Arc::new(school_db()), llm.clone());
    let envelope = workflow.run(&QueryRequest::new(question)).await;
    (envelope, llm)
}

fn step_names(envelope: &ResponseEnvelope) -> Vec<&str> {
    envelope
        .workflow_steps
        .iter()
        .map(|s| s.name.as_str())
        .collect()
}

const ALL_STEPS: [&str; 6] = [
    "select_collections",
    "retrieve_schemas",
    "generate_pipeline",
    "validate_pipeline",
    "execute",
    "format_result",
];

#[tokio::test]
async fn test_count_students() {
    let llm = ScriptedLlm::new()
        .selects(&["students"])
        .generates(json!([{"operator": "$count", "body": "count"}]))
        .answers("There are 120 students enrolled in total.");

    let (env, _) = run(&Config::default(), llm, "How many students are enrolled in total?").await;

    assert!(env.success, "unexpected failure: {:?}", env.error);
    assert_eq!(env.selected_collections, vec!["students"]);
    assert_eq!(env.target_collection.as_deref(), Some("students"));
    let pipeline = env.generated_mql.as_ref().unwrap();
    assert_eq!(pipeline.operators().last(), Some(&"$count"));
    assert_eq!(env.results, vec![json!({"count": 120})]);
    assert!(env.formatted_answer.as_ref().unwrap().contains("120"));
    assert_eq!(
        env.generated_command.as_deref(),
        Some(r#"db.students.aggregate([{"$count":"count"}])"#)
    );
    assert_eq!(step_names(&env), ALL_STEPS);
    assert!(env
        .workflow_steps
        .iter()
        .all(|s| s.status == StepStatus::Success));
    assert_eq!(env.collections_found, 3);
    assert_eq!(env.schema_retrieved, 1);
    assert!(env.query_execution_time.is_some());
    assert!(env.error.is_none() && env.error_kind.is_none());
    assert!(!env.request_id.is_empty());
}

#[tokio::test]
async fn test_keyword_fallback_when_selection_fails() {
    let llm = ScriptedLlm::new()
        .on(SELECTION_HEADING, Err(LlmError::Timeout(30)))
        .generates(json!([{"$count": "count"}]))
        .answers("120 students.");

    let (env, _) = run(&Config::default(), llm, "How many students are enrolled in total?").await;

    assert!(env.success);
    assert_eq!(env.selected_collections, vec!["students"]);
    let detail = env.workflow_steps[0].detail.as_deref().unwrap();
    assert!(detail.contains("keyword fallback"), "{}", detail);
}

#[tokio::test]
async fn test_no_relevant_collections() {
    let llm = ScriptedLlm::new().selects(&[]);

    let (env, llm) = run(&Config::default(), llm, "List all spaceships").await;

    assert!(!env.success);
    assert_eq!(env.error_kind.as_deref(), Some("no_relevant_collections"));
    assert_eq!(env.workflow_steps.len(), 1);
    assert_eq!(env.workflow_steps[0].name, "select_collections");
    assert_eq!(env.workflow_steps[0].status, StepStatus::Failed);
    assert!(env.generated_mql.is_none());
    assert!(env.results.is_empty());
    assert_eq!(llm.calls(GENERATION_HEADING), 0);
}

#[tokio::test]
async fn test_one_repair_then_success() {
    let llm = ScriptedLlm::new()
        .selects(&["students"])
        .generates(json!([{"$where": "this.gpa >= 3.5"}]))
        .repairs(json!([
            {"$match": {"gpa": {"$gte": 3.5}}},
            {"$count": "count"}
        ]))
        .answers("30 students have a GPA of at least 3.5.");

    let (env, llm) = run(&Config::default(), llm, "How many students have a GPA of 3.5 or more?").await;

    assert!(env.success, "unexpected failure: {:?}", env.error);
    assert_eq!(llm.calls(REPAIR_HEADING), 1);
    let validate = &env.workflow_steps[3];
    assert_eq!(validate.name, "validate_pipeline");
    assert_eq!(validate.status, StepStatus::Success);
    assert_eq!(validate.detail.as_deref(), Some("valid after 1 repair"));
    assert_eq!(env.generated_mql.unwrap().operators(), vec!["$match", "$count"]);
    assert_eq!(env.results, vec![json!({"count": 30})]);
}

#[tokio::test]
async fn test_repair_loop_terminates() {
    let llm = ScriptedLlm::new()
        .selects(&["students"])
        .generates(json!([{"$out": "copy"}]))
        .repairs(json!([{"$merge": {"into": "copy"}}]));

    let (env, llm) = run(&Config::default(), llm, "Copy the students").await;

    assert!(!env.success);
    assert_eq!(env.error_kind.as_deref(), Some("pipeline_invalid"));
    assert_eq!(llm.calls(REPAIR_HEADING), 2);
    assert_eq!(step_names(&env), ALL_STEPS[..4]);
    assert_eq!(env.workflow_steps[3].status, StepStatus::Failed);
    assert!(env.error.unwrap().contains("write stages are not permitted"));
    assert_eq!(llm.calls(FORMATTING_HEADING), 0);
}

#[tokio::test]
async fn test_large_limit_is_capped() {
    let mut config = Config::default();
    config.workflow.max_results = 10;
    let llm = ScriptedLlm::new()
        .selects(&["students"])
        .generates(json!([{"$project": {"_id": 0, "name": 1}}, {"$limit": 1000}]))
        .answers("Here are the students.");

    let (env, _) = run(&config, llm, "List every student").await;

    assert!(env.success);
    assert_eq!(env.results.len(), 10);
    assert_eq!(env.results[0], json!({"name": "Student 0"}));
    // The reported pipeline is the one the model produced, before capping.
    assert_eq!(
        env.generated_mql.unwrap().stages[1].body,
        json!(1000)
    );
}

#[tokio::test]
async fn test_rows_are_redacted() {
    let llm = ScriptedLlm::new()
        .selects(&["students"])
        .generates(json!([{"$limit": 1}]))
        .answers("One student.");

    let (env, _) = run(&Config::default(), llm, "Show one student").await;

    assert!(env.success);
    assert!(env.results[0].get("vector_embedding").is_none());
    assert_eq!(env.results[0]["student_id"], json!("S000"));
}

#[tokio::test]
async fn test_formatting_fallback_is_not_fatal() {
    let llm = ScriptedLlm::new()
        .selects(&["teachers"])
        .generates(json!([
            {"$sort": {"salary": -1}},
            {"$limit": 1},
            {"$project": {"_id": 0, "name": 1, "salary": 1}}
        ]))
        .on(FORMATTING_HEADING, Err(LlmError::Timeout(30)));

    let (env, _) = run(&Config::default(), llm, "Who is the best paid teacher?").await;

    assert!(env.success);
    assert!(env.error_kind.is_none());
    let format_step = env.workflow_steps.last().unwrap();
    assert_eq!(format_step.name, "format_result");
    assert_eq!(format_step.status, StepStatus::Failed);
    assert!(format_step.detail.as_deref().unwrap().contains("timed out"));
    assert_eq!(
        env.formatted_answer.as_deref(),
        Some(r#"Found 1 result(s). Raw data: [{"name":"Ada","salary":98000}]"#)
    );
}

#[tokio::test]
async fn test_unknown_selected_collection_is_ignored() {
    let llm = ScriptedLlm::new()
        .selects(&["Teachers", "payroll"])
        .generates(json!([{"$count": "n"}]))
        .answers("Three teachers.");

    let (env, _) = run(&Config::default(), llm, "How many teachers?").await;

    assert!(env.success);
    assert_eq!(env.selected_collections, vec!["teachers"]);
    assert_eq!(env.results, vec![json!({"n": 3})]);
}

#[tokio::test]
async fn test_unreachable_provider_stops_at_generation() {
    let llm = ScriptedLlm::new()
        .selects(&["courses"])
        .on(GENERATION_HEADING, Err(LlmError::Unavailable("connection refused".into())));

    let (env, _) = run(&Config::default(), llm, "Which courses have the highest enrollment?").await;

    assert!(!env.success);
    assert_eq!(env.error_kind.as_deref(), Some("provider_unavailable"));
    assert_eq!(step_names(&env), ALL_STEPS[..3]);
    assert_eq!(env.schema_retrieved, 1);
}

#[tokio::test]
async fn test_execution_failure() {
    let llm = ScriptedLlm::new()
        .selects(&["courses"])
        .generates(json!([{"$bucketAuto": {"groupBy": "$enrollment", "buckets": 2}}]));

    let (env, _) = run(&Config::default(), llm, "Bucket courses by enrollment").await;

    assert!(!env.success);
    assert_eq!(env.error_kind.as_deref(), Some("execution_failed"));
    assert_eq!(step_names(&env), ALL_STEPS[..5]);
    assert!(env.generated_mql.is_some());
}

#[tokio::test]
async fn test_text_pipeline_after_bracketed_prose() {
    let llm = ScriptedLlm::new()
        .selects(&["teachers"])
        .on(
            GENERATION_HEADING,
            Ok(Completion::Text(
                "Here is the pipeline [checked against the schema]:\n```json\n{\"pipeline\": [{\"$count\": \"n\"}]}\n```".into(),
            )),
        )
        .answers("Three teachers.");

    let (env, _) = run(&Config::default(), llm, "How many teachers are there?").await;

    assert!(env.success, "unexpected failure: {:?}", env.error);
    assert_eq!(env.results, vec![json!({"n": 3})]);
}

#[tokio::test]
async fn test_related_collection_joins_selection() {
    let db = school_db();
    db.insert_collection(
        "departments",
        vec![
            json!({"name": "Computer Science", "building": "Turing Hall"}),
            json!({"name": "Mathematics", "building": "Noether Hall"}),
            json!({"name": "Physics", "building": "Curie Hall"}),
        ],
    );
    let llm = Arc::new(
        ScriptedLlm::new()
            .selects(&["students"])
            .generates(json!([
                {"$group": {"_id": "$department", "n": {"$sum": 1}}},
                {"$sort": {"_id": 1}}
            ]))
            .answers("Forty students in each department."),
    );
    let workflow = Workflow::new(&Config::default(), Arc::new(db), llm);

    let env = workflow
        .run(&QueryRequest::new("How many students are in each department?"))
        .await;

    assert!(env.success, "unexpected failure: {:?}", env.error);
    assert_eq!(env.selected_collections, vec!["students", "departments"]);
    assert_eq!(env.target_collection.as_deref(), Some("students"));
    assert_eq!(env.schema_retrieved, 2);
    let detail = env.workflow_steps[0].detail.as_deref().unwrap();
    assert!(detail.ends_with("; related: departments"), "{}", detail);
    assert_eq!(env.results.len(), 3);
    assert_eq!(env.results[0], json!({"_id": "Computer Science", "n": 40}));
}

#[tokio::test]
async fn test_supplied_pipeline_runs_without_model() {
    let llm = Arc::new(ScriptedLlm::new());
    let workflow = Workflow::new(&Config::default(), Arc::new(school_db()), llm.clone());

    let pipeline = decode_pipeline(&json!([
        {"$match": {"gpa": {"$gte": 3.5}}},
        {"$count": "n"}
    ]))
    .unwrap();
    let result = workflow.run_pipeline("students", &pipeline).await.unwrap();
    assert_eq!(result.rows, vec![json!({"n": 30})]);

    let err = workflow.run_pipeline("spaceships", &pipeline).await.unwrap_err();
    assert_eq!(err, WorkflowError::CollectionNotFound("spaceships".into()));

    let write = decode_pipeline(&json!([{"$out": "copy"}])).unwrap();
    let err = workflow.run_pipeline("students", &write).await.unwrap_err();
    assert_eq!(err.code(), "pipeline_invalid");
    assert_eq!(llm.calls(REPAIR_HEADING), 0);
}

/// One step per attempted stage, whichever stage ends the run.
#[tokio::test]
async fn test_step_log_matches_attempted_stages() {
    let cases: Vec<(ScriptedLlm, &str, usize)> = vec![
        (ScriptedLlm::new().selects(&[]), "List all spaceships", 1),
        (
            ScriptedLlm::new()
                .selects(&["courses"])
                .on(GENERATION_HEADING, Err(LlmError::InvalidResponse("garbled".into()))),
            "Which courses?",
            3,
        ),
        (
            ScriptedLlm::new()
                .selects(&["courses"])
                .generates(json!([{"$count": "n"}]))
                .answers("Four."),
            "How many courses?",
            6,
        ),
    ];

    for (llm, question, expected) in cases {
        let (env, _) = run(&Config::default(), llm, question).await;
        assert_eq!(env.workflow_steps.len(), expected, "{}", question);
        let failed = env
            .workflow_steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count();
        assert_eq!(failed, usize::from(!env.success));
    }
}

#[tokio::test]
async fn test_demo_fixtures_answer_offline() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/school.json");
    let config = Config::default();
    let db = text_to_mql::db::connect(&config, Some(path.as_path())).await.unwrap();
    let llm = Arc::new(
        ScriptedLlm::new()
            .selects(&["courses"])
            .generates(json!([
                {"$match": {"enrollment": {"$lt": 10}}},
                {"$project": {"_id": 0, "title": 1}}
            ]))
            .answers("Linear Algebra has fewer than 10 students."),
    );
    let workflow = Workflow::new(&config, db, llm);

    let env = workflow
        .run(&QueryRequest::new("Find courses with enrollment less than 10 students"))
        .await;

    assert!(env.success, "unexpected failure: {:?}", env.error);
    assert_eq!(env.collections_found, 4);
    assert_eq!(env.results, vec![json!({"title": "Linear Algebra"})]);
}
