//! Turn result rows into a prose answer.
//!
//! Only a bounded preview of the rows is shown to the model. If the model
//! cannot be used, a templated summary stands in and the degradation is
//! reported alongside the answer rather than as a failure.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use text_to_mql_core::llm::LlmProvider;
use text_to_mql_core::schema::truncate;

use crate::llm::complete_with_timeout;
use crate::prompts;

#[derive(Debug, Clone, PartialEq)]
pub struct FormattedAnswer {
    pub answer: String,
    /// Why the templated summary was used, when it was.
    pub degraded: Option<String>,
}

pub struct ResultFormatter {
    llm: Arc<dyn LlmProvider>,
    timeout: Duration,
    preview_rows: usize,
    preview_chars: usize,
}

impl ResultFormatter {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        timeout: Duration,
        preview_rows: usize,
        preview_chars: usize,
    ) -> Self {
        Self {
            llm,
            timeout,
            preview_rows,
            preview_chars,
        }
    }

    pub async fn format(&self, query: &str, rows: &[Value]) -> FormattedAnswer {
        let preview = render_preview(rows, self.preview_rows, self.preview_chars);
        let prompt = prompts::formatting_prompt(query, &preview, rows.len());

        let reason = match complete_with_timeout(self.llm.as_ref(), &prompt, None, self.timeout).await {
            Ok(completion) => {
                let answer = completion.into_text().trim().to_string();
                if !answer.is_empty() {
                    return FormattedAnswer {
                        answer,
                        degraded: None,
                    };
                }
                "model returned an empty answer".to_string()
            }
            Err(e) => e.to_string(),
        };

        warn!(reason = %reason, "using templated answer");
        FormattedAnswer {
            answer: template_answer(rows, self.preview_chars),
            degraded: Some(reason),
        }
    }
}

/// JSON preview of at most `max_rows` rows and `max_chars` characters, with
/// a "showing N of M" note when anything was left out.
pub fn render_preview(rows: &[Value], max_rows: usize, max_chars: usize) -> String {
    let shown = &rows[..rows.len().min(max_rows)];
    let json = serde_json::to_string_pretty(shown).unwrap_or_else(|_| "[]".to_string());
    let clipped = json.chars().count() > max_chars;
    let mut preview = if clipped {
        truncate(&json, max_chars)
    } else {
        json
    };
    if shown.len() < rows.len() || clipped {
        preview.push_str(&format!(
            "\n(showing {} of {} rows)",
            shown.len(),
            rows.len()
        ));
    }
    preview
}

/// Model-free answer used when formatting degrades.
pub fn template_answer(rows: &[Value], max_chars: usize) -> String {
    if rows.is_empty() {
        return "No matching records were found.".to_string();
    }
    let raw = Value::Array(rows.to_vec()).to_string();
    format!(
        "Found {} result(s). Raw data: {}",
        rows.len(),
        truncate(&raw, max_chars)
    )
}
