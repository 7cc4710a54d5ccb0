//! JSON value helpers shared by the index, filter, query, and aggregation
//! layers.
//!
//! Entities are plain JSON objects; every layer that inspects them goes
//! through the dotted-path and comparison helpers here so that index lookups
//! and full scans agree on semantics.

use serde_json::Value;
use std::cmp::Ordering;

/// Resolve a dotted field path (`"address.city"`) against an object.
///
/// Returns `None` when any segment is missing or a non-object is traversed.
pub fn get_path<'a>(object: &'a serde_json::Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = object.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set a dotted field path on an object, creating intermediate objects.
pub fn set_path(object: &mut serde_json::Map<String, Value>, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().unwrap_or(path);
    let mut current = object;
    for segment in segments {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(serde_json::Map::new());
        }
        let Value::Object(next) = slot else {
            unreachable!()
        };
        current = next;
    }
    current.insert(last.to_string(), value);
}

/// Compare two JSON values by natural order.
///
/// Numbers compare numerically, strings by code point, booleans false < true.
/// Values of different types are ordered by a fixed type rank
/// (null < bool < number < string < array < object) so sorting is total.
pub fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                match compare(xi, yi) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Whether two values are comparable for range operators (`$gt` and friends).
///
/// Range comparisons only apply within numbers or within strings; anything
/// else does not match.
pub fn range_comparable(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_))
    )
}

/// Canonical string key for a tuple of field values.
///
/// Used as the bucket key of equality indexes and as group-by keys, so two
/// tuples collide exactly when their JSON representations are equal.
pub fn tuple_key(values: &[Value]) -> String {
    // serde_json never fails on Value input
    serde_json::to_string(&Value::Array(values.to_vec())).unwrap_or_default()
}

/// Extract the tuple of values at `fields` from an entity, substituting
/// `null` for missing fields.
pub fn field_tuple(entity: &serde_json::Map<String, Value>, fields: &[String]) -> Vec<Value> {
    fields
        .iter()
        .map(|f| get_path(entity, f).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Human-oriented JSON type name, used in validation issues.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn get_nested_path() {
        let entity = obj(json!({"address": {"city": "Oslo", "geo": {"lat": 59.9}}}));
        assert_eq!(get_path(&entity, "address.city"), Some(&json!("Oslo")));
        assert_eq!(get_path(&entity, "address.geo.lat"), Some(&json!(59.9)));
        assert_eq!(get_path(&entity, "address.zip"), None);
        assert_eq!(get_path(&entity, "address.city.x"), None);
    }

    #[test]
    fn set_creates_intermediates() {
        let mut entity = obj(json!({}));
        set_path(&mut entity, "a.b.c", json!(1));
        assert_eq!(Value::Object(entity), json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn compare_numbers_and_strings() {
        assert_eq!(compare(&json!(1), &json!(2)), Ordering::Less);
        assert_eq!(compare(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(compare(&json!("a"), &json!("b")), Ordering::Less);
        // Code point order, not locale order
        assert_eq!(compare(&json!("Z"), &json!("a")), Ordering::Less);
    }

    #[test]
    fn compare_mixed_types_is_total() {
        assert_eq!(compare(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(compare(&json!(true), &json!(0)), Ordering::Less);
        assert_eq!(compare(&json!(9), &json!("a")), Ordering::Less);
    }

    #[test]
    fn tuple_keys_collide_on_equal_values() {
        let a = tuple_key(&[json!("x"), json!(1)]);
        let b = tuple_key(&[json!("x"), json!(1)]);
        let c = tuple_key(&[json!("x"), json!(2)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn field_tuple_substitutes_null() {
        let entity = obj(json!({"a": 1}));
        let tuple = field_tuple(&entity, &["a".into(), "b".into()]);
        assert_eq!(tuple, vec![json!(1), json!(null)]);
    }
}
