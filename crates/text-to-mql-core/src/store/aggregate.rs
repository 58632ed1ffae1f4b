//! A small aggregation engine over JSON documents.
//!
//! Evaluates the common subset of MongoDB's pipeline semantics: query
//! matching with array fan-out, field paths, expression operators, grouping
//! accumulators, and the BSON cross-type sort order. Stages and operators
//! outside that subset return an error rather than a wrong answer.

use std::cmp::Ordering;

use anyhow::{anyhow, bail, Result};
use regex::RegexBuilder;
use serde_json::{Map, Value};

use crate::pipeline::{decode_pipeline, whole_number, Pipeline, Stage};

/// Run `pipeline` over `docs`. `foreign` resolves `$lookup` targets.
pub fn run_pipeline(
    docs: Vec<Value>,
    pipeline: &Pipeline,
    foreign: &dyn Fn(&str) -> Vec<Value>,
) -> Result<Vec<Value>> {
    let mut current = docs;
    for stage in &pipeline.stages {
        current = apply_stage(current, stage, foreign)?;
    }
    Ok(current)
}

fn apply_stage(
    docs: Vec<Value>,
    stage: &Stage,
    foreign: &dyn Fn(&str) -> Vec<Value>,
) -> Result<Vec<Value>> {
    let body = &stage.body;
    match stage.operator.as_str() {
        "$match" => {
            let cond = body
                .as_object()
                .ok_or_else(|| anyhow!("$match body must be an object"))?;
            let mut out = Vec::new();
            for doc in docs {
                if matches(&doc, cond)? {
                    out.push(doc);
                }
            }
            Ok(out)
        }
        "$project" => {
            let spec = body
                .as_object()
                .ok_or_else(|| anyhow!("$project body must be an object"))?;
            docs.iter().map(|doc| project(doc, spec)).collect()
        }
        "$addFields" | "$set" => {
            let spec = body
                .as_object()
                .ok_or_else(|| anyhow!("{} body must be an object", stage.operator))?;
            docs.into_iter()
                .map(|mut doc| -> Result<Value> {
                    for (path, expr) in spec {
                        let value = eval_expr(&doc, expr)?;
                        set_path(&mut doc, path, value);
                    }
                    Ok(doc)
                })
                .collect()
        }
        "$unset" => {
            let fields: Vec<&str> = match body {
                Value::String(s) => vec![s.as_str()],
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => bail!("$unset takes a field name or list of names"),
            };
            Ok(docs
                .into_iter()
                .map(|mut doc| {
                    for f in &fields {
                        remove_path(&mut doc, f);
                    }
                    doc
                })
                .collect())
        }
        "$group" => group_stage(&docs, body),
        "$sort" => {
            let spec = body
                .as_object()
                .ok_or_else(|| anyhow!("$sort body must be an object"))?;
            let keys: Vec<(&str, bool)> = spec
                .iter()
                .map(|(k, v)| (k.as_str(), whole_number(v) != Some(-1)))
                .collect();
            let mut docs = docs;
            docs.sort_by(|a, b| {
                for (path, ascending) in &keys {
                    let av = get_path(a, path).unwrap_or(Value::Null);
                    let bv = get_path(b, path).unwrap_or(Value::Null);
                    let ord = compare_values(&av, &bv);
                    if ord != Ordering::Equal {
                        return if *ascending { ord } else { ord.reverse() };
                    }
                }
                Ordering::Equal
            });
            Ok(docs)
        }
        "$limit" => {
            let n = whole_number(body).ok_or_else(|| anyhow!("$limit must be an integer"))?;
            Ok(docs.into_iter().take(n.max(0) as usize).collect())
        }
        "$skip" => {
            let n = whole_number(body).ok_or_else(|| anyhow!("$skip must be an integer"))?;
            Ok(docs.into_iter().skip(n.max(0) as usize).collect())
        }
        "$count" => {
            let name = body
                .as_str()
                .ok_or_else(|| anyhow!("$count takes a field name"))?;
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let mut out = Map::new();
            out.insert(name.to_string(), Value::from(docs.len()));
            Ok(vec![Value::Object(out)])
        }
        "$unwind" => unwind_stage(docs, body),
        "$lookup" => lookup_stage(docs, body, foreign),
        "$replaceRoot" => {
            let new_root = body
                .get("newRoot")
                .ok_or_else(|| anyhow!("$replaceRoot requires newRoot"))?;
            docs.iter().map(|doc| replace_root(doc, new_root)).collect()
        }
        "$replaceWith" => docs.iter().map(|doc| replace_root(doc, body)).collect(),
        "$facet" => {
            let spec = body
                .as_object()
                .ok_or_else(|| anyhow!("$facet body must be an object"))?;
            let mut out = Map::new();
            for (name, sub) in spec {
                let sub = decode_pipeline(sub).map_err(|e| anyhow!("facet `{}`: {}", name, e))?;
                let rows = run_pipeline(docs.clone(), &sub, foreign)?;
                out.insert(name.clone(), Value::Array(rows));
            }
            Ok(vec![Value::Object(out)])
        }
        "$sortByCount" => {
            let groups = group_by(&docs, |doc| eval_expr(doc, body))?;
            let mut rows: Vec<Value> = groups
                .into_iter()
                .map(|(key, members)| {
                    let mut row = Map::new();
                    row.insert("_id".into(), key);
                    row.insert("count".into(), Value::from(members.len()));
                    Value::Object(row)
                })
                .collect();
            rows.sort_by(|a, b| {
                let ac = a.get("count").and_then(Value::as_u64).unwrap_or(0);
                let bc = b.get("count").and_then(Value::as_u64).unwrap_or(0);
                bc.cmp(&ac)
            });
            Ok(rows)
        }
        "$sample" => {
            // Deterministic: the first `size` documents.
            let n = body
                .get("size")
                .and_then(whole_number)
                .ok_or_else(|| anyhow!("$sample requires size"))?;
            Ok(docs.into_iter().take(n.max(0) as usize).collect())
        }
        "$bucket" => bucket_stage(&docs, body),
        other => bail!("stage `{}` is not supported by the in-memory backend", other),
    }
}

// ============ Stages ============

fn project(doc: &Value, spec: &Map<String, Value>) -> Result<Value> {
    let inclusion = spec
        .iter()
        .any(|(k, v)| k != "_id" && !is_exclusion_flag(v));

    if !inclusion {
        let mut out = doc.clone();
        for (path, _) in spec {
            remove_path(&mut out, path);
        }
        return Ok(out);
    }

    let mut out = Value::Object(Map::new());
    let drop_id = spec.get("_id").map(is_exclusion_flag).unwrap_or(false);
    if !drop_id && !spec.contains_key("_id") {
        if let Some(id) = doc.get("_id") {
            set_path(&mut out, "_id", id.clone());
        }
    }
    for (path, v) in spec {
        if path == "_id" && drop_id {
            continue;
        }
        if is_inclusion_flag(v) {
            if let Some(value) = get_path(doc, path) {
                set_path(&mut out, path, value);
            }
        } else {
            let value = eval_expr(doc, v)?;
            set_path(&mut out, path, value);
        }
    }
    Ok(out)
}

fn is_inclusion_flag(v: &Value) -> bool {
    matches!(v, Value::Bool(true)) || (v.is_number() && whole_number(v).map(|n| n != 0) == Some(true))
}

fn is_exclusion_flag(v: &Value) -> bool {
    matches!(v, Value::Bool(false)) || (v.is_number() && whole_number(v) == Some(0))
}

fn group_stage(docs: &[Value], body: &Value) -> Result<Vec<Value>> {
    let spec = body
        .as_object()
        .ok_or_else(|| anyhow!("$group body must be an object"))?;
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| anyhow!("$group requires _id"))?;

    let groups = group_by(docs, |doc| eval_expr(doc, id_expr))?;
    let mut rows = Vec::with_capacity(groups.len());
    for (key, members) in groups {
        let mut row = Map::new();
        row.insert("_id".into(), key);
        for (name, acc) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
            row.insert(name.clone(), accumulate(acc, &members)?);
        }
        rows.push(Value::Object(row));
    }
    Ok(rows)
}

/// Partition documents by key, preserving first-seen key order.
fn group_by<'a>(
    docs: &'a [Value],
    key_fn: impl Fn(&Value) -> Result<Value>,
) -> Result<Vec<(Value, Vec<&'a Value>)>> {
    let mut groups: Vec<(Value, Vec<&Value>)> = Vec::new();
    for doc in docs {
        let key = key_fn(doc)?;
        match groups.iter_mut().find(|(k, _)| values_equal(k, &key)) {
            Some((_, members)) => members.push(doc),
            None => groups.push((key, vec![doc])),
        }
    }
    Ok(groups)
}

fn accumulate(spec: &Value, members: &[&Value]) -> Result<Value> {
    let map = spec
        .as_object()
        .filter(|m| m.len() == 1)
        .ok_or_else(|| anyhow!("accumulator must be an object with one operator"))?;
    let Some((op, expr)) = map.iter().next() else {
        bail!("accumulator must be an object with one operator");
    };

    let values = || -> Result<Vec<Value>> {
        members.iter().map(|doc| eval_expr(doc, expr)).collect()
    };

    match op.as_str() {
        "$sum" => Ok(number_value(values()?.iter().filter_map(as_f64).sum())),
        "$avg" => Ok(average(&values()?)),
        "$min" => Ok(extreme(values()?, Ordering::Less)),
        "$max" => Ok(extreme(values()?, Ordering::Greater)),
        "$first" => match members.first() {
            Some(doc) => eval_expr(doc, expr),
            None => Ok(Value::Null),
        },
        "$last" => match members.last() {
            Some(doc) => eval_expr(doc, expr),
            None => Ok(Value::Null),
        },
        "$push" => Ok(Value::Array(
            values()?.into_iter().filter(|v| !v.is_null()).collect(),
        )),
        "$addToSet" => {
            let mut set: Vec<Value> = Vec::new();
            for v in values()?.into_iter().filter(|v| !v.is_null()) {
                if !set.iter().any(|s| values_equal(s, &v)) {
                    set.push(v);
                }
            }
            Ok(Value::Array(set))
        }
        "$count" => Ok(Value::from(members.len())),
        "$stdDevPop" | "$stdDevSamp" => {
            let nums: Vec<f64> = values()?.iter().filter_map(as_f64).collect();
            let sample = op == "$stdDevSamp";
            let n = nums.len() as f64;
            if nums.is_empty() || (sample && nums.len() < 2) {
                return Ok(Value::Null);
            }
            let mean = nums.iter().sum::<f64>() / n;
            let var = nums.iter().map(|x| (x - mean).powi(2)).sum::<f64>()
                / if sample { n - 1.0 } else { n };
            Ok(number_value(var.sqrt()))
        }
        "$mergeObjects" => {
            let mut merged = Map::new();
            for v in values()? {
                if let Value::Object(m) = v {
                    merged.extend(m);
                }
            }
            Ok(Value::Object(merged))
        }
        other => bail!("accumulator `{}` is not supported by the in-memory backend", other),
    }
}

fn unwind_stage(docs: Vec<Value>, body: &Value) -> Result<Vec<Value>> {
    let (path, preserve) = match body {
        Value::String(s) => (s.as_str(), false),
        Value::Object(obj) => (
            obj.get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("$unwind requires path"))?,
            obj.get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        _ => bail!("$unwind takes a path or an object"),
    };
    let field = path
        .strip_prefix('$')
        .ok_or_else(|| anyhow!("$unwind path must start with '$'"))?;

    let mut out = Vec::new();
    for doc in docs {
        match get_path(&doc, field) {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    set_path(&mut copy, field, item);
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

fn lookup_stage(
    docs: Vec<Value>,
    body: &Value,
    foreign: &dyn Fn(&str) -> Vec<Value>,
) -> Result<Vec<Value>> {
    if body.get("pipeline").is_some() {
        bail!("$lookup with a sub-pipeline is not supported by the in-memory backend");
    }
    let from = lookup_field(body, "from")?;
    let local = lookup_field(body, "localField")?;
    let foreign_field = lookup_field(body, "foreignField")?;
    let as_field = lookup_field(body, "as")?;

    let candidates = foreign(from);
    Ok(docs
        .into_iter()
        .map(|mut doc| {
            let local_value = get_path(&doc, local).unwrap_or(Value::Null);
            let joined: Vec<Value> = candidates
                .iter()
                .filter(|f| {
                    let fv = get_path(f, foreign_field).unwrap_or(Value::Null);
                    eq_matches(Some(&fv), &local_value)
                        || match &local_value {
                            Value::Array(items) => {
                                items.iter().any(|i| eq_matches(Some(&fv), i))
                            }
                            _ => false,
                        }
                })
                .cloned()
                .collect();
            set_path(&mut doc, as_field, Value::Array(joined));
            doc
        })
        .collect())
}

fn lookup_field<'a>(body: &'a Value, key: &str) -> Result<&'a str> {
    body.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("$lookup requires `{}`", key))
}

fn replace_root(doc: &Value, expr: &Value) -> Result<Value> {
    match eval_expr(doc, expr)? {
        obj @ Value::Object(_) => Ok(obj),
        other => bail!("replacement root must be a document, got {}", other),
    }
}

fn bucket_stage(docs: &[Value], body: &Value) -> Result<Vec<Value>> {
    let group_by_expr = body
        .get("groupBy")
        .ok_or_else(|| anyhow!("$bucket requires groupBy"))?;
    let boundaries = body
        .get("boundaries")
        .and_then(Value::as_array)
        .filter(|b| b.len() >= 2)
        .ok_or_else(|| anyhow!("$bucket requires boundaries"))?;
    let default = body.get("default");
    let default_output = serde_json::json!({"count": {"$sum": 1}});
    let output = body
        .get("output")
        .and_then(Value::as_object)
        .or_else(|| default_output.as_object())
        .ok_or_else(|| anyhow!("$bucket output must be an object"))?;

    let mut buckets: Vec<(Value, Vec<&Value>)> = boundaries[..boundaries.len() - 1]
        .iter()
        .map(|b| (b.clone(), Vec::new()))
        .collect();
    let mut overflow: Vec<&Value> = Vec::new();

    for doc in docs {
        let v = eval_expr(doc, group_by_expr)?;
        let slot = boundaries.windows(2).position(|w| {
            compare_values(&v, &w[0]) != Ordering::Less
                && compare_values(&v, &w[1]) == Ordering::Less
        });
        match slot {
            Some(i) => buckets[i].1.push(doc),
            None if default.is_some() => overflow.push(doc),
            None => bail!("$bucket value {} falls outside boundaries and no default is set", v),
        }
    }
    if let Some(d) = default {
        if !overflow.is_empty() {
            buckets.push((d.clone(), overflow));
        }
    }

    let mut rows = Vec::new();
    for (key, members) in buckets.into_iter().filter(|(_, m)| !m.is_empty()) {
        let mut row = Map::new();
        row.insert("_id".into(), key);
        for (name, acc) in output {
            row.insert(name.clone(), accumulate(acc, &members)?);
        }
        rows.push(Value::Object(row));
    }
    Ok(rows)
}

// ============ Query matching ============

/// Evaluate a `$match` condition against one document.
pub fn matches(doc: &Value, cond: &Map<String, Value>) -> Result<bool> {
    for (key, value) in cond {
        let ok = match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let branches = value
                    .as_array()
                    .ok_or_else(|| anyhow!("{} takes a list", key))?;
                let mut results = Vec::with_capacity(branches.len());
                for branch in branches {
                    let branch = branch
                        .as_object()
                        .ok_or_else(|| anyhow!("{} branches must be objects", key))?;
                    results.push(matches(doc, branch)?);
                }
                match key.as_str() {
                    "$and" => results.iter().all(|r| *r),
                    "$or" => results.iter().any(|r| *r),
                    _ => !results.iter().any(|r| *r),
                }
            }
            "$expr" => truthy(&eval_expr(doc, value)?),
            "$comment" => true,
            k if k.starts_with('$') => {
                bail!("query operator `{}` is not supported by the in-memory backend", k)
            }
            path => match_field(get_path(doc, path).as_ref(), value)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn is_operator_object(value: &Value) -> Option<&Map<String, Value>> {
    let map = value.as_object()?;
    if map.is_empty() || !map.keys().all(|k| k.starts_with('$')) {
        return None;
    }
    if map.len() == 1 && (map.contains_key("$date") || map.contains_key("$oid")) {
        return None;
    }
    Some(map)
}

fn match_field(actual: Option<&Value>, cond: &Value) -> Result<bool> {
    let Some(ops) = is_operator_object(cond) else {
        return Ok(eq_matches(actual, cond));
    };
    for (op, operand) in ops {
        let ok = match op.as_str() {
            "$eq" => eq_matches(actual, operand),
            "$ne" => !eq_matches(actual, operand),
            "$gt" => cmp_matches(actual, operand, |o| o == Ordering::Greater),
            "$gte" => cmp_matches(actual, operand, |o| o != Ordering::Less),
            "$lt" => cmp_matches(actual, operand, |o| o == Ordering::Less),
            "$lte" => cmp_matches(actual, operand, |o| o != Ordering::Greater),
            "$in" => in_list(actual, operand)?,
            "$nin" => !in_list(actual, operand)?,
            "$exists" => truthy(operand) == actual.is_some(),
            "$regex" => regex_matches(actual, operand, ops.get("$options"))?,
            "$options" => true,
            "$not" => match operand {
                Value::String(_) => !regex_matches(actual, operand, None)?,
                other => !match_field(actual, other)?,
            },
            "$size" => match (actual, whole_number(operand)) {
                (Some(Value::Array(items)), Some(n)) => items.len() as i64 == n,
                _ => false,
            },
            "$all" => {
                let wanted = operand
                    .as_array()
                    .ok_or_else(|| anyhow!("$all takes a list"))?;
                !wanted.is_empty() && wanted.iter().all(|w| eq_matches(actual, w))
            }
            "$elemMatch" => match actual {
                Some(Value::Array(items)) => {
                    let mut any = false;
                    for item in items {
                        let hit = match (item, operand.as_object()) {
                            (Value::Object(_), Some(m)) if is_operator_object(operand).is_none() => {
                                matches(item, m)?
                            }
                            _ => match_field(Some(item), operand)?,
                        };
                        if hit {
                            any = true;
                            break;
                        }
                    }
                    any
                }
                _ => false,
            },
            "$type" => {
                let names: Vec<&str> = match operand {
                    Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                    Value::String(s) => vec![s.as_str()],
                    _ => bail!("$type takes a type name"),
                };
                actual
                    .map(|a| names.iter().any(|n| type_matches(a, n)))
                    .unwrap_or(false)
            }
            "$mod" => {
                let args = operand
                    .as_array()
                    .filter(|a| a.len() == 2)
                    .ok_or_else(|| anyhow!("$mod takes [divisor, remainder]"))?;
                match (actual.and_then(as_f64), as_f64(&args[0]), as_f64(&args[1])) {
                    (Some(v), Some(d), Some(r)) if d != 0.0 => (v.trunc() % d.trunc()) == r,
                    _ => false,
                }
            }
            other => bail!("query operator `{}` is not supported by the in-memory backend", other),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality with array fan-out; a missing field equals null.
fn eq_matches(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(a) => {
            values_equal(a, expected)
                || matches!(a, Value::Array(items) if items.iter().any(|i| values_equal(i, expected)))
        }
    }
}

fn cmp_matches(actual: Option<&Value>, operand: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
    let Some(a) = actual else {
        return false;
    };
    let candidates: Vec<&Value> = match a {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    candidates
        .into_iter()
        .any(|c| type_rank(c) == type_rank(operand) && pred(compare_values(c, operand)))
}

fn in_list(actual: Option<&Value>, operand: &Value) -> Result<bool> {
    let items = operand
        .as_array()
        .ok_or_else(|| anyhow!("$in/$nin take a list"))?;
    Ok(items.iter().any(|i| eq_matches(actual, i)))
}

fn regex_matches(actual: Option<&Value>, pattern: &Value, options: Option<&Value>) -> Result<bool> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| anyhow!("$regex takes a string pattern"))?;
    let flags = options.and_then(Value::as_str).unwrap_or("");
    let re = RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .build()
        .map_err(|e| anyhow!("invalid $regex: {}", e))?;
    Ok(match actual {
        Some(Value::String(s)) => re.is_match(s),
        Some(Value::Array(items)) => items
            .iter()
            .any(|i| i.as_str().map(|s| re.is_match(s)).unwrap_or(false)),
        _ => false,
    })
}

fn type_matches(value: &Value, name: &str) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => as_f64(value).is_some(),
        "double" => value.is_f64(),
        "int" | "long" => value.is_i64() || value.is_u64(),
        "bool" => value.is_boolean(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        "date" => type_rank(value) == RANK_DATE,
        "objectId" => type_rank(value) == RANK_OBJECT_ID,
        "object" => type_rank(value) == RANK_OBJECT,
        _ => false,
    }
}

// ============ Expressions ============

/// Evaluate an aggregation expression against a document.
pub fn eval_expr(doc: &Value, expr: &Value) -> Result<Value> {
    match expr {
        Value::String(s) if s == "$$ROOT" || s == "$$CURRENT" => Ok(doc.clone()),
        Value::String(s) if s.starts_with("$$") => Ok(Value::Null),
        Value::String(s) if s.starts_with('$') => Ok(get_path(doc, &s[1..]).unwrap_or(Value::Null)),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|i| eval_expr(doc, i))
                .collect::<Result<_>>()?,
        )),
        Value::Object(map) => {
            if let Some(ops) = is_operator_object(expr) {
                if ops.len() == 1 {
                    if let Some((op, arg)) = ops.iter().next() {
                        return eval_operator(doc, op, arg);
                    }
                }
            }
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), eval_expr(doc, v)?);
            }
            Ok(Value::Object(out))
        }
        literal => Ok(literal.clone()),
    }
}

fn eval_args(doc: &Value, arg: &Value) -> Result<Vec<Value>> {
    match arg {
        Value::Array(items) => items.iter().map(|i| eval_expr(doc, i)).collect(),
        other => Ok(vec![eval_expr(doc, other)?]),
    }
}

fn eval_operator(doc: &Value, op: &str, arg: &Value) -> Result<Value> {
    if op == "$literal" {
        return Ok(arg.clone());
    }
    if op == "$cond" {
        let (cond, then, otherwise) = match arg {
            Value::Array(a) if a.len() == 3 => (&a[0], &a[1], &a[2]),
            Value::Object(m) => (
                m.get("if").ok_or_else(|| anyhow!("$cond requires if"))?,
                m.get("then").ok_or_else(|| anyhow!("$cond requires then"))?,
                m.get("else").ok_or_else(|| anyhow!("$cond requires else"))?,
            ),
            _ => bail!("$cond takes [if, then, else] or an object"),
        };
        let branch = if truthy(&eval_expr(doc, cond)?) { then } else { otherwise };
        return eval_expr(doc, branch);
    }

    let args = eval_args(doc, arg)?;
    let nums = || -> Option<Vec<f64>> { args.iter().map(as_f64).collect() };
    let pair = || -> Result<(&Value, &Value)> {
        match args.as_slice() {
            [a, b] => Ok((a, b)),
            _ => bail!("{} takes two arguments", op),
        }
    };

    let value = match op {
        "$add" => nums().map(|n| number_value(n.iter().sum())).unwrap_or(Value::Null),
        "$multiply" => nums()
            .map(|n| number_value(n.iter().product()))
            .unwrap_or(Value::Null),
        "$subtract" => match nums().as_deref() {
            Some([a, b]) => number_value(a - b),
            _ => Value::Null,
        },
        "$divide" => match nums().as_deref() {
            Some([_, b]) if *b == 0.0 => bail!("$divide by zero"),
            Some([a, b]) => number_value(a / b),
            _ => Value::Null,
        },
        "$mod" => match nums().as_deref() {
            Some([a, b]) if *b != 0.0 => number_value(a % b),
            _ => Value::Null,
        },
        "$abs" => match nums().as_deref() {
            Some([a]) => number_value(a.abs()),
            _ => Value::Null,
        },
        "$round" => match nums().as_deref() {
            Some([a]) => number_value(a.round()),
            Some([a, places]) => {
                let factor = 10f64.powi(*places as i32);
                number_value((a * factor).round() / factor)
            }
            _ => Value::Null,
        },
        "$sum" => number_value(flatten_single(&args).iter().filter_map(as_f64).sum()),
        "$avg" => average(&flatten_single(&args)),
        "$min" => extreme(flatten_single(&args), Ordering::Less),
        "$max" => extreme(flatten_single(&args), Ordering::Greater),
        "$concat" => {
            let mut out = String::new();
            for a in &args {
                match a {
                    Value::String(s) => out.push_str(s),
                    _ => return Ok(Value::Null),
                }
            }
            Value::String(out)
        }
        "$toUpper" | "$toLower" => match args.first() {
            Some(Value::String(s)) if op == "$toUpper" => Value::String(s.to_uppercase()),
            Some(Value::String(s)) => Value::String(s.to_lowercase()),
            _ => Value::String(String::new()),
        },
        "$toString" => match args.first() {
            Some(Value::String(s)) => Value::String(s.clone()),
            Some(Value::Null) | None => Value::Null,
            Some(other) => Value::String(other.to_string()),
        },
        "$size" => match args.first() {
            Some(Value::Array(items)) => Value::from(items.len()),
            _ => bail!("$size requires an array"),
        },
        "$arrayElemAt" => {
            let (arr, idx) = pair()?;
            match (arr, whole_number(idx)) {
                (Value::Array(items), Some(i)) => {
                    let i = if i < 0 { items.len() as i64 + i } else { i };
                    usize::try_from(i)
                        .ok()
                        .and_then(|i| items.get(i).cloned())
                        .unwrap_or(Value::Null)
                }
                _ => Value::Null,
            }
        }
        "$ifNull" => args
            .iter()
            .find(|a| !a.is_null())
            .cloned()
            .unwrap_or(Value::Null),
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            let (a, b) = pair()?;
            let ord = compare_values(a, b);
            Value::Bool(match op {
                "$eq" => ord == Ordering::Equal,
                "$ne" => ord != Ordering::Equal,
                "$gt" => ord == Ordering::Greater,
                "$gte" => ord != Ordering::Less,
                "$lt" => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            })
        }
        "$and" => Value::Bool(args.iter().all(truthy)),
        "$or" => Value::Bool(args.iter().any(truthy)),
        "$not" => Value::Bool(!args.first().map(truthy).unwrap_or(false)),
        "$in" => {
            let (needle, hay) = pair()?;
            match hay {
                Value::Array(items) => Value::Bool(items.iter().any(|i| values_equal(i, needle))),
                _ => bail!("$in requires an array as its second argument"),
            }
        }
        "$year" | "$month" | "$dayOfMonth" => {
            use chrono::Datelike;
            match args.first().and_then(parse_date) {
                Some(d) => Value::from(match op {
                    "$year" => d.year() as i64,
                    "$month" => d.month() as i64,
                    _ => d.day() as i64,
                }),
                None => Value::Null,
            }
        }
        other => bail!("expression operator `{}` is not supported by the in-memory backend", other),
    };
    Ok(value)
}

/// `{$sum: "$scores"}` over one array argument sums the array.
fn flatten_single(args: &[Value]) -> Vec<Value> {
    match args {
        [Value::Array(items)] => items.clone(),
        _ => args.to_vec(),
    }
}

fn average(values: &[Value]) -> Value {
    let nums: Vec<f64> = values.iter().filter_map(as_f64).collect();
    if nums.is_empty() {
        Value::Null
    } else {
        Value::from(nums.iter().sum::<f64>() / nums.len() as f64)
    }
}

fn extreme(values: Vec<Value>, want: Ordering) -> Value {
    values
        .into_iter()
        .filter(|v| !v.is_null())
        .reduce(|best, v| {
            if compare_values(&v, &best) == want {
                v
            } else {
                best
            }
        })
        .unwrap_or(Value::Null)
}

fn parse_date(value: &Value) -> Option<chrono::NaiveDate> {
    let s = match value {
        Value::String(s) => s.as_str(),
        Value::Object(m) => m.get("$date")?.as_str()?,
        _ => return None,
    };
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|d| d.date_naive())
        .ok()
        .or_else(|| chrono::NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => true,
    }
}

// ============ Values ============

const RANK_NULL: u8 = 1;
const RANK_NUMBER: u8 = 2;
const RANK_STRING: u8 = 3;
const RANK_OBJECT: u8 = 4;
const RANK_ARRAY: u8 = 5;
const RANK_OBJECT_ID: u8 = 7;
const RANK_BOOL: u8 = 8;
const RANK_DATE: u8 = 9;

/// Position of a value's type in the BSON cross-type sort order.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => RANK_NULL,
        Value::Number(_) => RANK_NUMBER,
        Value::String(_) => RANK_STRING,
        Value::Array(_) => RANK_ARRAY,
        Value::Bool(_) => RANK_BOOL,
        Value::Object(m) if m.len() == 1 => {
            if m.contains_key("$date") {
                RANK_DATE
            } else if m.contains_key("$oid") {
                RANK_OBJECT_ID
            } else if as_f64(value).is_some() {
                RANK_NUMBER
            } else {
                RANK_OBJECT
            }
        }
        Value::Object(_) => RANK_OBJECT,
    }
}

/// Numeric value of a JSON number or a `$numberX` wrapper.
fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Object(m) if m.len() == 1 => {
            let (k, v) = m.iter().next()?;
            match k.as_str() {
                "$numberInt" | "$numberLong" | "$numberDouble" | "$numberDecimal" => {
                    v.as_str()?.parse().ok()
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Integral results stay integers so counts render as `120`, not `120.0`.
fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Total order over values, following BSON comparison rules.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match ra {
        RANK_NUMBER => as_f64(a)
            .partial_cmp(&as_f64(b))
            .unwrap_or(Ordering::Equal),
        RANK_STRING => a.as_str().cmp(&b.as_str()),
        RANK_BOOL => a.as_bool().cmp(&b.as_bool()),
        RANK_DATE => wrapped_str(a, "$date").cmp(&wrapped_str(b, "$date")),
        RANK_OBJECT_ID => wrapped_str(a, "$oid").cmp(&wrapped_str(b, "$oid")),
        RANK_ARRAY => {
            let (xs, ys) = (a.as_array(), b.as_array());
            let (xs, ys) = (xs.map(Vec::as_slice).unwrap_or(&[]), ys.map(Vec::as_slice).unwrap_or(&[]));
            for (x, y) in xs.iter().zip(ys) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        RANK_OBJECT => {
            let (Some(xm), Some(ym)) = (a.as_object(), b.as_object()) else {
                return Ordering::Equal;
            };
            for ((xk, xv), (yk, yv)) in xm.iter().zip(ym) {
                let ord = xk.cmp(yk).then_with(|| compare_values(xv, yv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xm.len().cmp(&ym.len())
        }
        _ => Ordering::Equal,
    }
}

fn wrapped_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b) && compare_values(a, b) == Ordering::Equal
}

// ============ Paths ============

/// Resolve a dotted path. Arrays fan out over non-numeric segments.
pub fn get_path(doc: &Value, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    lookup(doc, &segments)
}

fn lookup(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => map.get(*head).and_then(|v| lookup(v, rest)),
        Value::Array(items) => {
            if let Ok(i) = head.parse::<usize>() {
                return items.get(i).and_then(|v| lookup(v, rest));
            }
            let found: Vec<Value> = items.iter().filter_map(|v| lookup(v, segments)).collect();
            if found.is_empty() {
                None
            } else {
                Some(Value::Array(found))
            }
        }
        _ => None,
    }
}

fn set_path(doc: &mut Value, path: &str, value: Value) {
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let Value::Object(map) = doc else {
        return;
    };
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            set_path(child, rest, value);
        }
    }
}

fn remove_path(doc: &mut Value, path: &str) {
    match path.split_once('.') {
        None => {
            if let Value::Object(map) = doc {
                map.remove(path);
            }
        }
        Some((head, rest)) => {
            if let Some(child) = doc.get_mut(head) {
                remove_path(child, rest);
            }
        }
    }
}
