//! Collection selection: ask the model, fall back to keyword matching.
//!
//! The model sees the known collection names and the question and returns a
//! ranked subset. Its answer is mapped back onto canonical names; anything
//! unknown is dropped. When the model fails, times out, or picks nothing
//! usable, the question is tokenized and matched against collection names,
//! then against sampled field names.
//!
//! The pick is then widened with related collections: a known collection
//! joins the selection when a selected collection has a field referring to
//! it (`department`, `course_id`, `enrolled_courses`) and the question
//! names it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use text_to_mql_core::llm::LlmProvider;
use text_to_mql_core::WorkflowError;

use crate::catalog::SchemaCatalog;
use crate::llm::complete_with_timeout;
use crate::prompts;

const STOPWORDS: &[&str] = &[
    "about", "all", "and", "any", "are", "average", "can", "count", "did", "does", "each", "every",
    "find", "for", "from", "give", "has", "have", "how", "in", "is", "list", "many", "me", "more",
    "most", "much", "number", "of", "show", "than", "that", "the", "their", "there", "these",
    "this", "those", "top", "total", "what", "when", "where", "which", "who", "whose", "with",
];

/// How the collections were picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMethod {
    Model,
    Keyword,
    Field,
}

impl SelectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMethod::Model => "model",
            SelectionMethod::Keyword => "keyword fallback",
            SelectionMethod::Field => "field-name fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// Relevance order; the first entry is the primary collection.
    pub collections: Vec<String>,
    pub method: SelectionMethod,
    /// Entries of `collections` added as related, not picked directly.
    pub related: Vec<String>,
}

pub struct CollectionSelector {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
    max_selected: usize,
}

impl CollectionSelector {
    pub fn new(llm: Arc<dyn LlmProvider>, timeout: Duration, max_selected: usize) -> Self {
        Self {
            llm,
            timeout,
            max_selected,
        }
    }

    /// Pick the collections relevant to `query` from `known`.
    ///
    /// `catalog`, when given, enables the field-name fallback and the
    /// related-collection expansion.
    pub async fn select(
        &self,
        query: &str,
        known: &[String],
        catalog: Option<&SchemaCatalog>,
    ) -> Result<Selection, WorkflowError> {
        if known.is_empty() {
            return Err(WorkflowError::NoRelevantCollections);
        }

        let tokens = tokenize(query);
        let (mut collections, method) = self.pick(query, &tokens, known, catalog).await?;
        let related = match catalog {
            Some(catalog) => {
                self.expand_related(&tokens, &mut collections, known, catalog)
                    .await
            }
            None => Vec::new(),
        };

        Ok(Selection {
            collections,
            method,
            related,
        })
    }

    async fn pick(
        &self,
        query: &str,
        tokens: &[String],
        known: &[String],
        catalog: Option<&SchemaCatalog>,
    ) -> Result<(Vec<String>, SelectionMethod), WorkflowError> {
        match self.ask_model(query, known).await {
            Some(collections) if !collections.is_empty() => {
                return Ok((collections, SelectionMethod::Model))
            }
            _ => info!("model selection empty, falling back to keyword matching"),
        }

        let mut collections: Vec<String> = known
            .iter()
            .filter(|name| tokens.iter().any(|t| names_match(t, name)))
            .cloned()
            .collect();
        collections.truncate(self.max_selected);
        if !collections.is_empty() {
            return Ok((collections, SelectionMethod::Keyword));
        }

        if let Some(catalog) = catalog {
            let collections = self.match_fields(tokens, known, catalog).await;
            if !collections.is_empty() {
                return Ok((collections, SelectionMethod::Field));
            }
        }

        Err(WorkflowError::NoRelevantCollections)
    }

    /// Append related collections named in the question, up to
    /// `max_selected`. Returns the ones added.
    async fn expand_related(
        &self,
        tokens: &[String],
        selected: &mut Vec<String>,
        known: &[String],
        catalog: &SchemaCatalog,
    ) -> Vec<String> {
        let schemas = match catalog.get_schemas(selected.as_slice()).await {
            Ok(schemas) => schemas,
            Err(e) => {
                warn!(error = %e, "related-collection expansion skipped");
                return Vec::new();
            }
        };

        let mut added = Vec::new();
        for schema in &schemas {
            for candidate in known {
                if selected.len() >= self.max_selected {
                    return added;
                }
                if selected.contains(candidate) {
                    continue;
                }
                let referenced = schema.field_names().any(|f| references(f, candidate));
                if referenced && tokens.iter().any(|t| names_match(t, candidate)) {
                    info!(from = %schema.name, related = %candidate, "added related collection");
                    selected.push(candidate.clone());
                    added.push(candidate.clone());
                }
            }
        }
        added
    }

    async fn ask_model(&self, query: &str, known: &[String]) -> Option<Vec<String>> {
        let prompt = prompts::selection_prompt(query, known, self.max_selected);
        let schema = prompts::selection_schema(known);
        let value = match complete_with_timeout(self.llm.as_ref(), &prompt, Some(&schema), self.timeout)
            .await
            .and_then(|c| c.into_json())
        {
            Ok(value) => value,
            Err(e) => {
                warn!(provider = self.llm.name(), error = %e, "collection selection call failed");
                return None;
            }
        };

        let picked = match &value {
            Value::Object(map) => map.get("collections").and_then(Value::as_array),
            Value::Array(items) => Some(items),
            _ => None,
        }?;

        let mut seen = HashSet::new();
        let collections: Vec<String> = picked
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|name| canonical_name(name.trim(), known))
            .filter(|name| seen.insert(name.clone()))
            .take(self.max_selected)
            .collect();
        debug!(?collections, "model selected collections");
        Some(collections)
    }

    async fn match_fields(
        &self,
        tokens: &[String],
        known: &[String],
        catalog: &SchemaCatalog,
    ) -> Vec<String> {
        let schemas = match catalog.get_schemas(known).await {
            Ok(schemas) => schemas,
            Err(e) => {
                warn!(error = %e, "field-name fallback could not sample schemas");
                return Vec::new();
            }
        };
        schemas
            .into_iter()
            .filter(|schema| {
                schema
                    .field_names()
                    .any(|field| tokens.iter().any(|t| names_match(t, field)))
            })
            .map(|schema| schema.name)
            .take(self.max_selected)
            .collect()
    }
}

fn canonical_name(name: &str, known: &[String]) -> Option<String> {
    known
        .iter()
        .find(|k| k.eq_ignore_ascii_case(name))
        .cloned()
}

/// Lowercase alphanumeric/underscore runs, minus stopwords and short tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 3 && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Naive English singular: `courses` -> `course`, `facilities` -> `facility`.
pub fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        if !stem.is_empty() {
            return format!("{}y", stem);
        }
    }
    if word.ends_with('s') && !word.ends_with("ss") && word.len() > 3 {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

/// True when `field` looks like a reference to `collection`:
/// `department`, `course_id`, `teacher_ids`, `enrolled_courses`.
pub fn references(field: &str, collection: &str) -> bool {
    let field = field.to_lowercase();
    let stem = ["_ids", "_id", "_codes", "_code"]
        .iter()
        .find_map(|suffix| field.strip_suffix(*suffix))
        .unwrap_or(&field);
    names_match(stem, collection)
}

/// Token/name match: equal after singularization, or containment when the
/// shorter side has at least four characters.
pub fn names_match(token: &str, name: &str) -> bool {
    let token = singularize(&token.to_lowercase());
    let name = singularize(&name.to_lowercase());
    if token == name {
        return true;
    }
    let (short, long) = if token.len() <= name.len() {
        (&token, &name)
    } else {
        (&name, &token)
    };
    short.len() >= 4 && long.contains(short.as_str())
}
