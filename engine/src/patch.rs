//! Update documents.
//!
//! A patch is parsed from a JSON object into a recursive [`Patch`] structure
//! before it touches any entity: `{$op: …}` objects become operators, plain
//! objects become nested deep-merge patches, everything else is a plain set.
//! Parsing and application are separate so a malformed patch fails before
//! the mutation pipeline starts.

use crate::error::Result;
use crate::value::type_name;
use crate::{Entity, Error};
use serde_json::Value;
use std::collections::BTreeMap;

/// Operation applied to a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPatch {
    /// Replace the value
    Set(Value),
    /// Add to a number
    Increment(Value),
    /// Subtract from a number
    Decrement(Value),
    /// Multiply a number
    Multiply(Value),
    /// Append to a string or array (an array argument appends element-wise)
    Append(Value),
    /// Prepend to a string or array
    Prepend(Value),
    /// Remove array elements equal to the value, or matching a predicate
    /// condition object
    Remove(Value),
    /// Negate a boolean
    Toggle,
    /// Deep-merge into a nested object
    Nested(BTreeMap<String, FieldPatch>),
}

/// A parsed update document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Patch {
    pub fields: BTreeMap<String, FieldPatch>,
}

impl Patch {
    /// Parse a JSON update document.
    pub fn parse(document: &Value) -> Result<Patch> {
        let object = document.as_object().ok_or_else(|| {
            Error::validation(
                "",
                format!("update document must be an object, got {}", type_name(document)),
            )
        })?;
        Ok(Patch {
            fields: parse_fields(object, "")?,
        })
    }

    /// Fields touched at the top level.
    pub fn top_level_fields(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Whether the patch explicitly assigns this top-level field.
    pub fn sets_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Apply the patch to an entity, producing the patched copy.
    pub fn apply(&self, entity: &Entity) -> Result<Entity> {
        let mut out = entity.clone();
        apply_fields(&self.fields, &mut out, "")?;
        Ok(out)
    }
}

fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}

fn parse_fields(
    object: &serde_json::Map<String, Value>,
    prefix: &str,
) -> Result<BTreeMap<String, FieldPatch>> {
    let mut fields = BTreeMap::new();
    for (name, value) in object {
        let path = join_path(prefix, name);
        fields.insert(name.clone(), parse_field(value, &path)?);
    }
    Ok(fields)
}

fn parse_field(value: &Value, path: &str) -> Result<FieldPatch> {
    let Some(object) = value.as_object() else {
        return Ok(FieldPatch::Set(value.clone()));
    };

    let has_operator = object.keys().any(|k| k.starts_with('$'));
    if !has_operator {
        return Ok(FieldPatch::Nested(parse_fields(object, path)?));
    }
    if object.len() != 1 {
        return Err(Error::validation(
            path,
            "an operator object must contain exactly one $-key",
        ));
    }
    let (op, arg) = object
        .iter()
        .next()
        .map(|(k, v)| (k.as_str(), v))
        .unwrap_or(("", &Value::Null));

    match op {
        "$set" => Ok(FieldPatch::Set(arg.clone())),
        "$increment" => numeric_arg(op, arg, path).map(FieldPatch::Increment),
        "$decrement" => numeric_arg(op, arg, path).map(FieldPatch::Decrement),
        "$multiply" => numeric_arg(op, arg, path).map(FieldPatch::Multiply),
        "$append" => Ok(FieldPatch::Append(arg.clone())),
        "$prepend" => Ok(FieldPatch::Prepend(arg.clone())),
        "$remove" => Ok(FieldPatch::Remove(arg.clone())),
        "$toggle" => Ok(FieldPatch::Toggle),
        other => Err(Error::validation(
            path,
            format!("unknown update operator '{other}'"),
        )),
    }
}

fn numeric_arg(op: &str, arg: &Value, path: &str) -> Result<Value> {
    if arg.is_number() {
        Ok(arg.clone())
    } else {
        Err(Error::validation(
            path,
            format!("{op} requires a numeric argument, got {}", type_name(arg)),
        ))
    }
}

fn apply_fields(
    fields: &BTreeMap<String, FieldPatch>,
    target: &mut Entity,
    prefix: &str,
) -> Result<()> {
    for (name, patch) in fields {
        let path = join_path(prefix, name);
        match patch {
            FieldPatch::Set(value) => {
                target.insert(name.clone(), value.clone());
            }
            FieldPatch::Increment(delta) => {
                let current = target.get(name).cloned().unwrap_or(Value::Null);
                target.insert(name.clone(), arithmetic(&current, delta, &path, |a, b| a + b)?);
            }
            FieldPatch::Decrement(delta) => {
                let current = target.get(name).cloned().unwrap_or(Value::Null);
                target.insert(name.clone(), arithmetic(&current, delta, &path, |a, b| a - b)?);
            }
            FieldPatch::Multiply(factor) => {
                let current = target.get(name).cloned().unwrap_or(Value::Null);
                target.insert(
                    name.clone(),
                    arithmetic(&current, factor, &path, |a, b| a * b)?,
                );
            }
            FieldPatch::Append(value) => {
                let current = target.get(name).cloned().unwrap_or(Value::Null);
                target.insert(name.clone(), concat(&current, value, &path, false)?);
            }
            FieldPatch::Prepend(value) => {
                let current = target.get(name).cloned().unwrap_or(Value::Null);
                target.insert(name.clone(), concat(&current, value, &path, true)?);
            }
            FieldPatch::Remove(criteria) => {
                let current = target.get(name).cloned().unwrap_or(Value::Null);
                target.insert(name.clone(), remove_elements(&current, criteria, &path)?);
            }
            FieldPatch::Toggle => {
                let current = target.get(name);
                let Some(Value::Bool(flag)) = current else {
                    return Err(Error::validation(
                        &path,
                        format!(
                            "$toggle requires a boolean, got {}",
                            current.map(type_name).unwrap_or("missing field")
                        ),
                    ));
                };
                target.insert(name.clone(), Value::Bool(!flag));
            }
            FieldPatch::Nested(nested) => {
                let slot = target
                    .entry(name.clone())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                if !slot.is_object() {
                    return Err(Error::validation(
                        &path,
                        format!("cannot deep-merge into {}", type_name(slot)),
                    ));
                }
                let Value::Object(inner) = slot else {
                    unreachable!()
                };
                apply_fields(nested, inner, &path)?;
            }
        }
    }
    Ok(())
}

/// Numeric operator application. Integer operands stay integers; a missing
/// field behaves as zero.
fn arithmetic(
    current: &Value,
    operand: &Value,
    path: &str,
    op: impl Fn(f64, f64) -> f64,
) -> Result<Value> {
    let base = match current {
        Value::Null => 0.0,
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        other => {
            return Err(Error::validation(
                path,
                format!("numeric operator on {}", type_name(other)),
            ))
        }
    };
    let operand_f64 = operand.as_f64().unwrap_or(0.0);
    let result = op(base, operand_f64);

    let both_integral = matches!(current, Value::Null | Value::Number(_))
        && current.as_f64().map(|f| f.fract() == 0.0).unwrap_or(true)
        && operand_f64.fract() == 0.0
        && result.fract() == 0.0
        && result.abs() < i64::MAX as f64;
    if both_integral {
        Ok(Value::Number((result as i64).into()))
    } else {
        serde_json::Number::from_f64(result)
            .map(Value::Number)
            .ok_or_else(|| Error::validation(path, "numeric operator produced a non-finite value"))
    }
}

/// `$append`/`$prepend` on strings and arrays. A missing field starts from
/// the operand's empty counterpart.
fn concat(current: &Value, operand: &Value, path: &str, prepend: bool) -> Result<Value> {
    match (current, operand) {
        (Value::Null, Value::String(_)) => Ok(operand.clone()),
        (Value::Null, _) => Ok(Value::Array(flatten(operand))),
        (Value::String(base), Value::String(extra)) => {
            let combined = if prepend {
                format!("{extra}{base}")
            } else {
                format!("{base}{extra}")
            };
            Ok(Value::String(combined))
        }
        (Value::String(_), other) => Err(Error::validation(
            path,
            format!("cannot append {} to a string", type_name(other)),
        )),
        (Value::Array(base), _) => {
            let extra = flatten(operand);
            let mut combined = Vec::with_capacity(base.len() + extra.len());
            if prepend {
                combined.extend(extra);
                combined.extend(base.iter().cloned());
            } else {
                combined.extend(base.iter().cloned());
                combined.extend(extra);
            }
            Ok(Value::Array(combined))
        }
        (other, _) => Err(Error::validation(
            path,
            format!("append/prepend on {}", type_name(other)),
        )),
    }
}

fn flatten(operand: &Value) -> Vec<Value> {
    match operand {
        Value::Array(items) => items.clone(),
        single => vec![single.clone()],
    }
}

/// `$remove` on arrays: drop elements equal to the criteria value, or
/// matching a predicate condition object.
fn remove_elements(current: &Value, criteria: &Value, path: &str) -> Result<Value> {
    let Value::Array(items) = current else {
        return Err(Error::validation(
            path,
            format!(
                "$remove requires an array, got {}",
                if current.is_null() { "missing field" } else { type_name(current) }
            ),
        ));
    };

    let is_predicate = criteria
        .as_object()
        .map(|o| !o.is_empty())
        .unwrap_or(false);
    let kept: Vec<Value> = if is_predicate {
        items
            .iter()
            .filter(|item| !crate::filter::value_matches(item, criteria))
            .cloned()
            .collect()
    } else {
        items.iter().filter(|item| *item != criteria).cloned().collect()
    };
    Ok(Value::Array(kept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(value: Value) -> Entity {
        value.as_object().cloned().unwrap()
    }

    fn apply(base: Value, patch_doc: Value) -> Result<Value> {
        let patch = Patch::parse(&patch_doc)?;
        patch.apply(&entity(base)).map(Value::Object)
    }

    #[test]
    fn plain_values_are_sets() {
        let out = apply(json!({"a": 1}), json!({"a": 2, "b": "x"})).unwrap();
        assert_eq!(out, json!({"a": 2, "b": "x"}));
    }

    #[test]
    fn numeric_operators() {
        let out = apply(
            json!({"count": 10, "price": 2.5}),
            json!({"count": {"$increment": 5}, "price": {"$multiply": 2}}),
        )
        .unwrap();
        assert_eq!(out["count"], json!(15));
        assert_eq!(out["price"], json!(5.0));

        let out = apply(json!({"count": 10}), json!({"count": {"$decrement": 3}})).unwrap();
        assert_eq!(out["count"], json!(7));
    }

    #[test]
    fn integer_arithmetic_stays_integral() {
        let out = apply(json!({"n": 2}), json!({"n": {"$multiply": 3}})).unwrap();
        assert_eq!(out["n"], json!(6));
        assert!(out["n"].is_i64());
    }

    #[test]
    fn numeric_operator_on_string_fails() {
        let err = apply(json!({"name": "x"}), json!({"name": {"$increment": 1}})).unwrap_err();
        assert!(matches!(err, Error::Validation { issues } if issues[0].path == "name"));
    }

    #[test]
    fn string_append_prepend() {
        let out = apply(
            json!({"title": "Dune"}),
            json!({"title": {"$append": "!"}}),
        )
        .unwrap();
        assert_eq!(out["title"], json!("Dune!"));

        let out = apply(
            json!({"title": "Dune"}),
            json!({"title": {"$prepend": "* "}}),
        )
        .unwrap();
        assert_eq!(out["title"], json!("* Dune"));
    }

    #[test]
    fn array_append_value_and_array() {
        let out = apply(
            json!({"tags": ["a"]}),
            json!({"tags": {"$append": "b"}}),
        )
        .unwrap();
        assert_eq!(out["tags"], json!(["a", "b"]));

        let out = apply(
            json!({"tags": ["a"]}),
            json!({"tags": {"$append": ["b", "c"]}}),
        )
        .unwrap();
        assert_eq!(out["tags"], json!(["a", "b", "c"]));

        let out = apply(
            json!({"tags": ["c"]}),
            json!({"tags": {"$prepend": ["a", "b"]}}),
        )
        .unwrap();
        assert_eq!(out["tags"], json!(["a", "b", "c"]));
    }

    #[test]
    fn array_remove_by_value_and_predicate() {
        let out = apply(
            json!({"tags": ["a", "b", "a"]}),
            json!({"tags": {"$remove": "a"}}),
        )
        .unwrap();
        assert_eq!(out["tags"], json!(["b"]));

        let out = apply(
            json!({"scores": [1, 5, 10]}),
            json!({"scores": {"$remove": {"$gte": 5}}}),
        )
        .unwrap();
        assert_eq!(out["scores"], json!([1]));
    }

    #[test]
    fn toggle() {
        let out = apply(json!({"active": true}), json!({"active": {"$toggle": null}})).unwrap();
        assert_eq!(out["active"], json!(false));

        let err = apply(json!({"active": 1}), json!({"active": {"$toggle": null}})).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn nested_deep_merge() {
        let out = apply(
            json!({"profile": {"name": "A", "stats": {"wins": 1}}}),
            json!({"profile": {"stats": {"wins": {"$increment": 1}}, "bio": "hi"}}),
        )
        .unwrap();
        assert_eq!(
            out["profile"],
            json!({"name": "A", "stats": {"wins": 2}, "bio": "hi"})
        );
    }

    #[test]
    fn nested_set_replaces_whole_object() {
        let out = apply(
            json!({"profile": {"name": "A", "bio": "hi"}}),
            json!({"profile": {"$set": {"name": "B"}}}),
        )
        .unwrap();
        assert_eq!(out["profile"], json!({"name": "B"}));
    }

    #[test]
    fn mixed_operator_object_rejected() {
        let err = Patch::parse(&json!({"n": {"$increment": 1, "$set": 2}})).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn unknown_operator_rejected() {
        let err = Patch::parse(&json!({"n": {"$frob": 1}})).unwrap_err();
        assert!(matches!(err, Error::Validation { issues } if issues[0].message.contains("$frob")));
    }

    #[test]
    fn append_to_missing_field_creates_it() {
        let out = apply(json!({}), json!({"tags": {"$append": "a"}})).unwrap();
        assert_eq!(out["tags"], json!(["a"]));

        let out = apply(json!({}), json!({"note": {"$append": "hi"}})).unwrap();
        assert_eq!(out["note"], json!("hi"));
    }
}
