//! Aggregation pipelines: typed model, decoding, and structural validation.
//!
//! Model output goes through two separate passes:
//!
//! 1. [`decode_pipeline`] / [`decode_pipeline_text`] turn loosely shaped JSON
//!    (or a `db.coll.aggregate([...])` shell command) into a typed [`Pipeline`].
//!    Only the *shape* is checked here: a list of single-operator stages.
//! 2. [`check_pipeline`] walks the decoded stages and reports the first
//!    [`Violation`] against the operator allow-list and per-operator body rules.
//!
//! The split keeps "the model said something unparseable" (a generation
//! failure) apart from "the model said something parseable but wrong" (which
//! the validator can ask the model to repair).

use chrono::{NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Aggregation stage operators the workflow accepts.
///
/// Write stages (`$out`, `$merge`) are absent: generated
/// pipelines are read-only.
pub const ALLOWED_OPERATORS: &[&str] = &[
    "$match",
    "$project",
    "$group",
    "$sort",
    "$limit",
    "$skip",
    "$count",
    "$unwind",
    "$lookup",
    "$addFields",
    "$set",
    "$unset",
    "$replaceRoot",
    "$replaceWith",
    "$facet",
    "$bucket",
    "$bucketAuto",
    "$sortByCount",
    "$sample",
];

const QUERY_OPERATORS: &[&str] = &[
    "$eq",
    "$ne",
    "$gt",
    "$gte",
    "$lt",
    "$lte",
    "$in",
    "$nin",
    "$exists",
    "$regex",
    "$options",
    "$not",
    "$elemMatch",
    "$size",
    "$all",
    "$type",
    "$mod",
];

const ACCUMULATORS: &[&str] = &[
    "$sum",
    "$avg",
    "$min",
    "$max",
    "$first",
    "$last",
    "$push",
    "$addToSet",
    "$count",
    "$stdDevPop",
    "$stdDevSamp",
    "$mergeObjects",
];

/// Returns true if `operator` is in [`ALLOWED_OPERATORS`].
pub fn is_allowed_operator(operator: &str) -> bool {
    ALLOWED_OPERATORS.contains(&operator)
}

/// One pipeline stage: an operator name and its body.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub operator: String,
    pub body: Value,
}

impl Stage {
    pub fn new(operator: impl Into<String>, body: Value) -> Self {
        Self {
            operator: operator.into(),
            body,
        }
    }

    /// The MongoDB-native document form: `{ "<operator>": <body> }`.
    pub fn to_document(&self) -> Value {
        let mut map = Map::new();
        map.insert(self.operator.clone(), self.body.clone());
        Value::Object(map)
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.operator, &self.body)?;
        map.end()
    }
}

/// An ordered sequence of stages. Stage N's output is stage N+1's input.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages in MongoDB-native document form, ready for a driver.
    pub fn to_documents(&self) -> Vec<Value> {
        self.stages.iter().map(Stage::to_document).collect()
    }

    /// Compact JSON rendering of the native form.
    pub fn to_json_string(&self) -> String {
        Value::Array(self.to_documents()).to_string()
    }

    /// Shell rendering, e.g. `db.students.aggregate([{"$count":"total"}])`.
    pub fn to_shell_command(&self, collection: &str) -> String {
        format!("db.{}.aggregate({})", collection, self.to_json_string())
    }

    /// Returns a copy whose final stage limits output to at most `max_rows`.
    ///
    /// A trailing `$limit` is lowered to `max_rows` when larger; otherwise a
    /// `$limit` stage is appended.
    pub fn with_row_cap(&self, max_rows: u64) -> Pipeline {
        let mut stages = self.stages.clone();
        match stages.last_mut() {
            Some(last) if last.operator == "$limit" => {
                let current = whole_number(&last.body).unwrap_or(i64::MAX);
                if current < 1 || current as u64 > max_rows {
                    last.body = Value::from(max_rows);
                }
            }
            _ => stages.push(Stage::new("$limit", Value::from(max_rows))),
        }
        Pipeline { stages }
    }

    /// Operators in stage order.
    pub fn operators(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.operator.as_str()).collect()
    }
}

// ============ Decoding ============

/// The model output could not be read as a pipeline at all.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("no JSON found in model output")]
    NoJson,

    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("expected a list of stages, found {0}")]
    NotAList(&'static str),

    #[error("stage {index} is not an object")]
    StageNotObject { index: usize },

    #[error("stage {index} must have exactly one operator key, found {keys}")]
    StageKeyCount { index: usize, keys: usize },

    #[error("stage {index} operator `{operator}` must start with '$'")]
    BadOperatorName { index: usize, operator: String },
}

/// Decode a structured value into a [`Pipeline`].
///
/// Accepted shapes:
/// - `{ "pipeline": [ ... ] }`
/// - a bare array of stages
///
/// Each stage is either `{ "operator": "$x", "body": ... }` or the native
/// `{ "$x": ... }` form.
pub fn decode_pipeline(value: &Value) -> Result<Pipeline, DecodeError> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("pipeline") {
            Some(Value::Array(items)) => items,
            Some(other) => return Err(DecodeError::NotAList(kind_name(other))),
            None => return Err(DecodeError::NotAList("an object without `pipeline`")),
        },
        other => return Err(DecodeError::NotAList(kind_name(other))),
    };

    let mut stages = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let index = i + 1;
        let map = item
            .as_object()
            .ok_or(DecodeError::StageNotObject { index })?;

        let mut stage = match (map.get("operator"), map.get("body")) {
            (Some(Value::String(op)), Some(body)) if map.len() == 2 => {
                Stage::new(op.clone(), body.clone())
            }
            _ => {
                let mut entries = map.iter();
                match (entries.next(), entries.next()) {
                    (Some((op, body)), None) => Stage::new(op.clone(), body.clone()),
                    _ => {
                        return Err(DecodeError::StageKeyCount {
                            index,
                            keys: map.len(),
                        })
                    }
                }
            }
        };

        if !stage.operator.starts_with('$') {
            return Err(DecodeError::BadOperatorName {
                index,
                operator: stage.operator,
            });
        }
        normalize_dates(&mut stage.body);
        stages.push(stage);
    }

    Ok(Pipeline { stages })
}

/// Decode free-form model text into a [`Pipeline`].
///
/// Tolerates markdown fences, surrounding prose, and mongo shell syntax
/// (`db.c.aggregate([...])`, unquoted keys, single quotes, `ISODate(...)`,
/// `ObjectId(...)`).
pub fn decode_pipeline_text(text: &str) -> Result<Pipeline, DecodeError> {
    let value = extract_json(text)?;
    decode_pipeline(&value)
}

/// Pull a JSON object or array out of `text`.
///
/// Fenced code blocks are tried first, then the whole text. Within each,
/// every `{`/`[` is tried as a start position until a balanced slice parses,
/// strictly or after shell-syntax relaxation.
pub fn extract_json(text: &str) -> Result<Value, DecodeError> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Ok(v);
    }

    let mut first_error: Option<String> = None;
    for region in fenced_blocks(trimmed).into_iter().chain(std::iter::once(trimmed)) {
        for (start, _) in region.match_indices(['{', '[']) {
            let rest = &region[start..];
            let candidate = balanced_slice(rest).unwrap_or(rest);
            match parse_candidate(candidate) {
                Ok(v) => return Ok(v),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
    }

    Err(first_error.map(DecodeError::Json).unwrap_or(DecodeError::NoJson))
}

fn parse_candidate(candidate: &str) -> Result<Value, String> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(v) => Ok(v),
        Err(strict_err) => serde_json::from_str::<Value>(&relax_shell_syntax(candidate))
            .map_err(|_| strict_err.to_string()),
    }
}

/// Bodies of markdown code fences, in order. The info string is skipped.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
        let body = &after[body_start..];
        let Some(close) = body.find("```") else {
            blocks.push(body);
            break;
        };
        blocks.push(&body[..close]);
        rest = &body[close + 3..];
    }
    blocks
}

/// Returns the prefix of `text` up to the bracket closing its first one.
fn balanced_slice(text: &str) -> Option<&str> {
    let mut depth: i64 = 0;
    let mut quote: Option<char> = None;
    let mut escape = false;

    for (idx, ch) in text.char_indices() {
        if let Some(q) = quote {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..=idx]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Rewrite mongo shell literals into strict JSON.
fn relax_shell_syntax(text: &str) -> String {
    let text = rewrite_constructor(text, "ISODate", "$date");
    let text = rewrite_constructor(&text, "new Date", "$date");
    let text = rewrite_constructor(&text, "ObjectId", "$oid");

    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut i = 0;
    let mut last_significant = ' ';

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            '"' | '\'' => {
                let quote = ch;
                out.push('"');
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        out.push('\\');
                        out.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    if chars[i] == '"' {
                        out.push('\\');
                    }
                    out.push(chars[i]);
                    i += 1;
                }
                out.push('"');
                last_significant = '"';
                i += 1;
            }
            c if (c.is_alphabetic() || c == '$' || c == '_')
                && matches!(last_significant, '{' | ',' | ':' | '[') =>
            {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '$' | '_' | '.'))
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                let mut j = i;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ':' {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else {
                    out.push_str(literal_keyword(&ident));
                }
                last_significant = 'a';
            }
            c => {
                out.push(c);
                if !c.is_whitespace() {
                    last_significant = c;
                }
                i += 1;
            }
        }
    }
    out
}

/// Python-style literals that models sometimes emit.
fn literal_keyword(ident: &str) -> &str {
    match ident {
        "True" => "true",
        "False" => "false",
        "None" => "null",
        other => other,
    }
}

/// `Name("x")` → `{"<key>": "x"}`.
fn rewrite_constructor(text: &str, name: &str, key: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(name) {
        let after = &rest[pos + name.len()..];
        let Some(open) = after.strip_prefix('(') else {
            out.push_str(&rest[..pos + name.len()]);
            rest = after;
            continue;
        };
        let Some(close) = open.find(')') else {
            out.push_str(&rest[..pos + name.len()]);
            rest = after;
            continue;
        };
        let arg = open[..close].trim().trim_matches(|c| c == '"' || c == '\'');
        let arg = match key {
            "$date" => normalize_date(arg).unwrap_or_else(|| arg.to_string()),
            _ => arg.to_string(),
        };
        out.push_str(&rest[..pos]);
        out.push_str(&format!("{{\"{}\": \"{}\"}}", key, arg));
        rest = &open[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Rewrite every `{"$date": "<string>"}` under `value` to RFC 3339 UTC.
///
/// Date-only (`2020-01-01`) and offset-less (`2020-01-01T08:30:00`) strings
/// are read as UTC; offsets are converted to `Z`. Strings that are not dates
/// are left alone.
pub fn normalize_dates(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(s)) = map.get_mut("$date") {
                    if let Some(normalized) = normalize_date(s) {
                        *s = normalized;
                    }
                    return;
                }
            }
            map.values_mut().for_each(normalize_dates);
        }
        Value::Array(items) => items.iter_mut().for_each(normalize_dates),
        _ => {}
    }
}

/// RFC 3339 UTC form of a timestamp or calendar date, if `s` is one.
pub fn normalize_date(s: &str) -> Option<String> {
    let s = s.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(
            dt.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );
    }
    let naive = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ]
    .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    Some(
        Utc.from_utc_datetime(&naive)
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
    )
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ============ Validation ============

/// The first structural problem found in a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    /// 1-based stage position; 0 refers to the pipeline as a whole.
    pub position: usize,
    /// Offending operator; empty for whole-pipeline problems.
    pub operator: String,
    pub message: String,
}

impl Violation {
    pub fn new(position: usize, operator: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            position,
            operator: operator.into(),
            message: message.into(),
        }
    }

    /// A problem with the pipeline as a whole rather than one stage.
    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::new(0, "", message)
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operator.is_empty() {
            write!(f, "pipeline: {}", self.message)
        } else {
            write!(
                f,
                "stage {} ({}): {}",
                self.position, self.operator, self.message
            )
        }
    }
}

/// Check every stage in order and return the first violation.
pub fn check_pipeline(pipeline: &Pipeline) -> Result<(), Violation> {
    if pipeline.is_empty() {
        return Err(Violation::pipeline("pipeline has no stages"));
    }
    for (i, stage) in pipeline.stages.iter().enumerate() {
        let position = i + 1;
        if !is_allowed_operator(&stage.operator) {
            let message = if matches!(stage.operator.as_str(), "$out" | "$merge") {
                "write stages are not permitted".to_string()
            } else {
                format!(
                    "unsupported operator; use one of: {}",
                    ALLOWED_OPERATORS.join(", ")
                )
            };
            return Err(Violation::new(position, &stage.operator, message));
        }
        check_stage_body(&stage.operator, &stage.body)
            .map_err(|message| Violation::new(position, &stage.operator, message))?;
    }
    Ok(())
}

fn check_stage_body(operator: &str, body: &Value) -> Result<(), String> {
    match operator {
        "$match" => {
            let obj = body.as_object().ok_or("body must be an object")?;
            check_condition(obj)
        }
        "$group" => check_group(body),
        "$sort" => check_sort(body),
        "$limit" => match whole_number(body) {
            Some(n) if n > 0 => Ok(()),
            _ => Err("limit must be a positive integer".into()),
        },
        "$skip" => match whole_number(body) {
            Some(n) if n >= 0 => Ok(()),
            _ => Err("skip must be a non-negative integer".into()),
        },
        "$count" => match body.as_str() {
            Some(name) if !name.is_empty() && !name.starts_with('$') && !name.contains('.') => {
                Ok(())
            }
            _ => Err("count takes a non-empty field name without '$' or '.'".into()),
        },
        "$project" | "$addFields" | "$set" => non_empty_object(body).map(|_| ()),
        "$unset" => match body {
            Value::String(s) if !s.is_empty() => Ok(()),
            Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_string) => {
                Ok(())
            }
            _ => Err("unset takes a field name or a list of field names".into()),
        },
        "$unwind" => {
            let path = match body {
                Value::String(s) => Some(s.as_str()),
                Value::Object(obj) => obj.get("path").and_then(Value::as_str),
                _ => None,
            };
            match path {
                Some(p) if p.starts_with('$') && p.len() > 1 => Ok(()),
                _ => Err("unwind needs a field path starting with '$'".into()),
            }
        }
        "$lookup" => check_lookup(body),
        "$replaceRoot" => {
            let obj = body.as_object().ok_or("body must be an object")?;
            if obj.contains_key("newRoot") {
                Ok(())
            } else {
                Err("replaceRoot requires `newRoot`".into())
            }
        }
        "$replaceWith" => {
            if body.is_null() {
                Err("replaceWith requires an expression".into())
            } else {
                Ok(())
            }
        }
        "$facet" => {
            let obj = non_empty_object(body)?;
            for (name, sub) in obj {
                let sub = decode_pipeline(sub)
                    .map_err(|e| format!("facet `{}` is not a pipeline: {}", name, e))?;
                check_pipeline(&sub).map_err(|v| format!("facet `{}` {}", name, v))?;
            }
            Ok(())
        }
        "$bucket" => {
            let obj = body.as_object().ok_or("body must be an object")?;
            if !obj.contains_key("groupBy") {
                return Err("bucket requires `groupBy`".into());
            }
            match obj.get("boundaries") {
                Some(Value::Array(b)) if b.len() >= 2 => Ok(()),
                _ => Err("bucket requires `boundaries` with at least two values".into()),
            }
        }
        "$bucketAuto" => {
            let obj = body.as_object().ok_or("body must be an object")?;
            if !obj.contains_key("groupBy") {
                return Err("bucketAuto requires `groupBy`".into());
            }
            match obj.get("buckets").and_then(whole_number) {
                Some(n) if n > 0 => Ok(()),
                _ => Err("bucketAuto requires a positive integer `buckets`".into()),
            }
        }
        "$sample" => match body.get("size").and_then(whole_number) {
            Some(n) if n > 0 => Ok(()),
            _ => Err("sample requires a positive integer `size`".into()),
        },
        "$sortByCount" => match body {
            Value::String(s) if s.starts_with('$') => Ok(()),
            Value::Object(obj) if !obj.is_empty() => Ok(()),
            _ => Err("sortByCount takes a '$field' path or an expression object".into()),
        },
        _ => Ok(()),
    }
}

fn non_empty_object(body: &Value) -> Result<&Map<String, Value>, String> {
    match body.as_object() {
        Some(obj) if !obj.is_empty() => Ok(obj),
        Some(_) => Err("body must not be empty".into()),
        None => Err("body must be an object".into()),
    }
}

fn check_condition(cond: &Map<String, Value>) -> Result<(), String> {
    for (key, value) in cond {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let items = match value.as_array() {
                    Some(items) if !items.is_empty() => items,
                    _ => return Err(format!("`{}` takes a non-empty list of conditions", key)),
                };
                for item in items {
                    let sub = item
                        .as_object()
                        .ok_or_else(|| format!("every `{}` branch must be an object", key))?;
                    check_condition(sub)?;
                }
            }
            "$expr" | "$comment" => {}
            "$text" => {
                if value.get("$search").and_then(Value::as_str).is_none() {
                    return Err("`$text` requires a `$search` string".into());
                }
            }
            k if k.starts_with('$') => {
                return Err(format!("unknown top-level query operator `{}`", k));
            }
            field => check_field_condition(field, value)?,
        }
    }
    Ok(())
}

fn check_field_condition(field: &str, value: &Value) -> Result<(), String> {
    let Some(obj) = value.as_object() else {
        return Ok(());
    };
    let operator_keys = obj.keys().filter(|k| k.starts_with('$')).count();
    if operator_keys == 0 {
        return Ok(());
    }
    if operator_keys != obj.len() {
        return Err(format!(
            "condition on `{}` mixes query operators and plain fields",
            field
        ));
    }
    for (op, operand) in obj {
        if !QUERY_OPERATORS.contains(&op.as_str()) {
            return Err(format!("unknown query operator `{}` on `{}`", op, field));
        }
        match op.as_str() {
            "$in" | "$nin" | "$all" if !operand.is_array() => {
                return Err(format!("`{}` on `{}` takes a list", op, field));
            }
            "$not" => match operand {
                Value::Object(inner) => check_field_condition(field, &Value::Object(inner.clone()))?,
                Value::String(_) => {}
                _ => return Err(format!("`$not` on `{}` takes an operator object", field)),
            },
            "$elemMatch" if !operand.is_object() => {
                return Err(format!("`$elemMatch` on `{}` takes an object", field));
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_group(body: &Value) -> Result<(), String> {
    let obj = body.as_object().ok_or("body must be an object")?;
    if !obj.contains_key("_id") {
        return Err("missing grouping key `_id`".into());
    }
    for (name, acc) in obj.iter().filter(|(k, _)| k.as_str() != "_id") {
        let acc = acc
            .as_object()
            .ok_or_else(|| format!("field `{}` must be an accumulator object", name))?;
        if acc.len() != 1 {
            return Err(format!(
                "field `{}` must use exactly one accumulator, found {}",
                name,
                acc.len()
            ));
        }
        let op = acc.keys().next().map(String::as_str).unwrap_or_default();
        if !ACCUMULATORS.contains(&op) {
            return Err(format!("field `{}` uses unknown accumulator `{}`", name, op));
        }
    }
    Ok(())
}

fn check_sort(body: &Value) -> Result<(), String> {
    let obj = non_empty_object(body)?;
    for (field, dir) in obj {
        let ok = match dir {
            Value::Object(meta) => meta.contains_key("$meta"),
            other => matches!(whole_number(other), Some(1) | Some(-1)),
        };
        if !ok {
            return Err(format!("sort direction for `{}` must be 1 or -1", field));
        }
    }
    Ok(())
}

fn check_lookup(body: &Value) -> Result<(), String> {
    let obj = body.as_object().ok_or("body must be an object")?;
    for key in ["from", "as"] {
        if obj.get(key).and_then(Value::as_str).is_none() {
            return Err(format!("lookup requires a string `{}`", key));
        }
    }
    let has_fields = obj.get("localField").and_then(Value::as_str).is_some()
        && obj.get("foreignField").and_then(Value::as_str).is_some();
    let has_pipeline = obj.get("pipeline").map(Value::is_array).unwrap_or(false);
    if has_fields || has_pipeline {
        Ok(())
    } else {
        Err("lookup requires `localField` and `foreignField`, or a `pipeline`".into())
    }
}

/// Integer value of a JSON number, accepting floats with no fraction.
pub fn whole_number(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}
