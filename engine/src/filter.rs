//! `where` clause evaluation.
//!
//! Conditions are JSON documents: field paths (dot notation or shape-mirrored
//! nested objects) map to expectations, `$or`/`$and`/`$not` combine them, and
//! `$search` runs tokenized full-text matching. The scan path here and the
//! index path in the query layer share the same tokenizer, so both agree.

use crate::error::Result;
use crate::index::tokenize;
use crate::value::{compare, get_path, range_comparable, type_name};
use crate::{Entity, Error};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A plugin-supplied filter operator: `(field value, argument) → matches`.
pub type PluginOperator = Arc<dyn Fn(Option<&Value>, &Value) -> bool + Send + Sync>;

/// Evaluation context: plugin operators and the full-text configuration.
#[derive(Clone, Default)]
pub struct FilterContext {
    /// Custom `$`-operators from plugins
    pub operators: BTreeMap<String, PluginOperator>,
    /// String fields `$search` consults at top scope
    pub search_fields: Vec<String>,
    /// Stop words shared with the search index
    pub stop_words: BTreeSet<String>,
}

impl FilterContext {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Evaluate a condition document against an entity.
pub fn matches(entity: &Entity, condition: &Value, ctx: &FilterContext) -> Result<bool> {
    let Some(object) = condition.as_object() else {
        return Err(Error::validation(
            "",
            format!("where clause must be an object, got {}", type_name(condition)),
        ));
    };

    for (key, expectation) in object {
        let ok = match key.as_str() {
            "$or" => {
                let branches = logical_branches(key, expectation)?;
                // An empty $or matches nothing
                let mut any = false;
                for branch in branches {
                    if matches(entity, branch, ctx)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$and" => {
                let branches = logical_branches(key, expectation)?;
                // An empty $and matches everything
                let mut all = true;
                for branch in branches {
                    if !matches(entity, branch, ctx)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$not" => !matches(entity, expectation, ctx)?,
            "$search" => {
                let query = search_string(expectation)?;
                top_level_search(entity, &query, ctx)
            }
            other if other.starts_with('$') => {
                return Err(Error::validation(
                    other,
                    format!("unknown logical operator '{other}'"),
                ))
            }
            field => field_matches(entity, field, expectation, ctx)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_branches<'a>(op: &str, value: &'a Value) -> Result<&'a Vec<Value>> {
    value.as_array().ok_or_else(|| {
        Error::validation(op, format!("{op} requires an array of conditions"))
    })
}

fn search_string(value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::validation("$search", "$search requires a string query"))
}

fn field_matches(
    entity: &Entity,
    path: &str,
    expectation: &Value,
    ctx: &FilterContext,
) -> Result<bool> {
    let actual = get_path(entity, path);

    let Some(object) = expectation.as_object() else {
        return Ok(eq_matches(actual, expectation));
    };
    let has_operator = object.keys().any(|k| k.starts_with('$'));
    if !has_operator {
        // Shape-mirrored nested condition: {address: {city: "x"}}
        for (field, nested) in object {
            if !field_matches(entity, &format!("{path}.{field}"), nested, ctx)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    for (op, arg) in object {
        if !operator_matches(actual, op, arg, path, ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn operator_matches(
    actual: Option<&Value>,
    op: &str,
    arg: &Value,
    path: &str,
    ctx: &FilterContext,
) -> Result<bool> {
    let result = match op {
        "$eq" => eq_matches(actual, arg),
        "$ne" => match actual {
            // A missing field never satisfies $ne
            None => false,
            Some(value) => !eq_matches(Some(value), arg),
        },
        "$gt" => range(actual, arg, |o| o == Ordering::Greater),
        "$gte" => range(actual, arg, |o| o != Ordering::Less),
        "$lt" => range(actual, arg, |o| o == Ordering::Less),
        "$lte" => range(actual, arg, |o| o != Ordering::Greater),
        "$in" => {
            let candidates = arg
                .as_array()
                .ok_or_else(|| Error::validation(path, "$in requires an array"))?;
            actual.is_some_and(|value| candidates.contains(value))
        }
        "$nin" => {
            let candidates = arg
                .as_array()
                .ok_or_else(|| Error::validation(path, "$nin requires an array"))?;
            actual.is_some_and(|value| !candidates.contains(value))
        }
        "$startsWith" => string_pair(actual, arg, |s, p| s.starts_with(p)),
        "$endsWith" => string_pair(actual, arg, |s, p| s.ends_with(p)),
        "$contains" => match actual {
            Some(Value::String(s)) => arg.as_str().is_some_and(|needle| s.contains(needle)),
            Some(Value::Array(items)) => items.contains(arg),
            _ => false,
        },
        "$all" => {
            let required = arg
                .as_array()
                .ok_or_else(|| Error::validation(path, "$all requires an array"))?;
            match actual {
                Some(Value::Array(items)) => required.iter().all(|r| items.contains(r)),
                _ => false,
            }
        }
        "$size" => match (actual, arg.as_u64()) {
            (Some(Value::Array(items)), Some(expected)) => items.len() as u64 == expected,
            _ => false,
        },
        "$search" => {
            let query = search_string(arg)?;
            match actual {
                Some(Value::String(text)) => {
                    field_search(text, &query, &ctx.stop_words)
                }
                _ => false,
            }
        }
        "$not" => !operator_set_matches(actual, arg, path, ctx)?,
        custom => match ctx.operators.get(custom) {
            Some(operator) => operator(actual, arg),
            None => {
                return Err(Error::validation(
                    path,
                    format!("unknown filter operator '{custom}'"),
                ))
            }
        },
    };
    Ok(result)
}

/// Evaluate a `$not` argument: either an operator object or a bare equality.
fn operator_set_matches(
    actual: Option<&Value>,
    arg: &Value,
    path: &str,
    ctx: &FilterContext,
) -> Result<bool> {
    let Some(object) = arg.as_object() else {
        return Ok(eq_matches(actual, arg));
    };
    for (op, nested_arg) in object {
        if !operator_matches(actual, op, nested_arg, path, ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn eq_matches(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        // A missing field equals null
        None => expected.is_null(),
        Some(value) => value == expected,
    }
}

fn range(actual: Option<&Value>, arg: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match actual {
        Some(value) if range_comparable(value, arg) => accept(compare(value, arg)),
        _ => false,
    }
}

fn string_pair(actual: Option<&Value>, arg: &Value, test: impl Fn(&str, &str) -> bool) -> bool {
    match (actual.and_then(Value::as_str), arg.as_str()) {
        (Some(s), Some(p)) => test(s, p),
        _ => false,
    }
}

/// Field-scope `$search`: every query token must match one of the field's
/// tokens exactly or by prefix.
fn field_search(text: &str, query: &str, stop_words: &BTreeSet<String>) -> bool {
    let field_tokens = tokenize(text, stop_words);
    let query_tokens = tokenize(query, stop_words);
    query_tokens.iter().all(|q| {
        field_tokens
            .iter()
            .any(|t| t == q || t.starts_with(q.as_str()))
    })
}

/// Top-scope `$search`: any configured field may satisfy each query token.
fn top_level_search(entity: &Entity, query: &str, ctx: &FilterContext) -> bool {
    let mut all_tokens: BTreeSet<String> = BTreeSet::new();
    for field in &ctx.search_fields {
        if let Some(Value::String(text)) = get_path(entity, field) {
            all_tokens.extend(tokenize(text, &ctx.stop_words));
        }
    }
    let query_tokens = tokenize(query, &ctx.stop_words);
    query_tokens.iter().all(|q| {
        all_tokens
            .iter()
            .any(|t| t == q || t.starts_with(q.as_str()))
    })
}

/// Best-effort expectation match against a single value, used by the
/// `$remove` array predicate. Unknown operators simply do not match.
pub fn value_matches(value: &Value, expectation: &Value) -> bool {
    let Some(object) = expectation.as_object() else {
        return value == expectation;
    };
    let has_operator = object.keys().any(|k| k.starts_with('$'));
    if has_operator {
        object.iter().all(|(op, arg)| {
            operator_matches(Some(value), op, arg, "", &FilterContext::empty())
                .unwrap_or(false)
        })
    } else {
        match value.as_object() {
            Some(inner) => object.iter().all(|(field, nested)| {
                inner
                    .get(field)
                    .map(|v| value_matches(v, nested))
                    .unwrap_or(nested.is_null())
            }),
            None => false,
        }
    }
}

/// Equality constraints usable for index candidate resolution: top-level
/// bare values, `$eq` operators, and shape-mirrored nested paths. `$and`
/// branches contribute; `$or`/`$not` scopes do not.
pub fn equality_constraints(condition: &Value) -> BTreeMap<String, Value> {
    let mut constraints = BTreeMap::new();
    collect_constraints(condition, "", &mut constraints);
    constraints
}

fn collect_constraints(condition: &Value, prefix: &str, out: &mut BTreeMap<String, Value>) {
    let Some(object) = condition.as_object() else {
        return;
    };
    for (key, expectation) in object {
        match key.as_str() {
            "$and" => {
                if let Some(branches) = expectation.as_array() {
                    for branch in branches {
                        collect_constraints(branch, prefix, out);
                    }
                }
            }
            "$or" | "$not" | "$search" => {}
            field if !field.starts_with('$') => {
                let path = if prefix.is_empty() {
                    field.to_string()
                } else {
                    format!("{prefix}.{field}")
                };
                match expectation {
                    Value::Object(inner) => {
                        if let Some(eq) = inner.get("$eq") {
                            if inner.len() == 1 {
                                out.insert(path, eq.clone());
                            }
                        } else if !inner.keys().any(|k| k.starts_with('$')) {
                            collect_constraints(expectation, &path, out);
                        }
                    }
                    bare => {
                        out.insert(path, bare.clone());
                    }
                }
            }
            _ => {}
        }
    }
}

/// The first full-text query in the condition, with its field scope.
///
/// Returns `(None, query)` for a top-scope `$search` and
/// `(Some(field), query)` for a field-scope one.
pub fn search_constraint(condition: &Value) -> Option<(Option<String>, String)> {
    let object = condition.as_object()?;
    if let Some(query) = object.get("$search").and_then(Value::as_str) {
        return Some((None, query.to_string()));
    }
    for (field, expectation) in object {
        if field.starts_with('$') {
            continue;
        }
        if let Some(query) = expectation
            .as_object()
            .and_then(|o| o.get("$search"))
            .and_then(Value::as_str)
        {
            return Some((Some(field.clone()), query.to_string()));
        }
    }
    None
}
