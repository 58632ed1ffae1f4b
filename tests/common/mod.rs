//! Shared fixtures for the integration tests: a school database and a
//! language model that answers from a script.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use text_to_mql::prompts::{
    FORMATTING_HEADING, GENERATION_HEADING, REPAIR_HEADING, SELECTION_HEADING,
};
use text_to_mql_core::llm::{Completion, LlmError, LlmProvider};
use text_to_mql_core::InMemoryDatabase;

pub type Reply = Result<Completion, LlmError>;

/// Replies by prompt heading. Each heading has a list of replies used in
/// order; the last one repeats once the list is exhausted.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: HashMap<&'static str, Vec<Reply>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, heading: &'static str, reply: Reply) -> Self {
        self.replies.entry(heading).or_default().push(reply);
        self
    }

    pub fn selects(self, collections: &[&str]) -> Self {
        self.on(
            SELECTION_HEADING,
            Ok(Completion::Structured(json!({ "collections": collections }))),
        )
    }

    pub fn generates(self, pipeline: Value) -> Self {
        self.on(
            GENERATION_HEADING,
            Ok(Completion::Structured(json!({ "pipeline": pipeline }))),
        )
    }

    pub fn repairs(self, pipeline: Value) -> Self {
        self.on(
            REPAIR_HEADING,
            Ok(Completion::Structured(json!({ "pipeline": pipeline }))),
        )
    }

    pub fn answers(self, text: &str) -> Self {
        self.on(FORMATTING_HEADING, Ok(Completion::Text(text.to_string())))
    }

    /// Number of calls made with prompts under `heading`.
    pub fn calls(&self, heading: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(heading)
            .copied()
            .unwrap_or(0)
    }
}

static HEADINGS: [&str; 4] = [
    SELECTION_HEADING,
    GENERATION_HEADING,
    REPAIR_HEADING,
    FORMATTING_HEADING,
];

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-1"
    }

    async fn complete(&self, prompt: &str, _schema: Option<&Value>) -> Result<Completion, LlmError> {
        let heading = HEADINGS
            .iter()
            .find(|h| prompt.starts_with(**h))
            .copied()
            .ok_or_else(|| LlmError::InvalidResponse("unrecognized prompt".into()))?;

        let index = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(heading).or_insert(0);
            *count += 1;
            *count - 1
        };

        match self.replies.get(heading) {
            Some(replies) if !replies.is_empty() => replies[index.min(replies.len() - 1)].clone(),
            _ => Err(LlmError::Unavailable(format!("no scripted reply for {}", heading))),
        }
    }
}

/// 120 students, 4 courses, 3 teachers.
pub fn school_db() -> InMemoryDatabase {
    let departments = ["Computer Science", "Mathematics", "Physics"];
    let db = InMemoryDatabase::new();
    db.insert_collection(
        "students",
        (0..120)
            .map(|i| {
                json!({
                    "student_id": format!("S{:03}", i),
                    "name": format!("Student {}", i),
                    "department": departments[i % 3],
                    "gpa": 2.0 + (i % 20) as f64 / 10.0,
                    "vector_embedding": [0.1, 0.2],
                })
            })
            .collect(),
    );
    db.insert_collection(
        "courses",
        vec![
            json!({"code": "CS101", "title": "Intro to Programming", "enrollment": 40}),
            json!({"code": "CS440", "title": "Machine Learning", "enrollment": 25}),
            json!({"code": "MA201", "title": "Linear Algebra", "enrollment": 8}),
            json!({"code": "PH110", "title": "Mechanics", "enrollment": 30}),
        ],
    );
    db.insert_collection(
        "teachers",
        vec![
            json!({"name": "Ada", "department": "Computer Science", "salary": 98000}),
            json!({"name": "Carl", "department": "Mathematics", "salary": 87000}),
            json!({"name": "Marie", "department": "Physics", "salary": 91000}),
        ],
    );
    db
}
