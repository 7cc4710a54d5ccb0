//! Aggregation over filtered entity streams.
//!
//! Counts are always computed; `sum`/`avg`/`min`/`max` take one field or
//! many and the result shape mirrors the request (a scalar for one field, a
//! field-keyed object for many). Absent or non-numeric fields are ignored,
//! not treated as zero.

use crate::error::Result;
use crate::value::{field_tuple, get_path, tuple_key};
use crate::{Entity, Error};
use serde_json::Value;
use std::collections::BTreeMap;

/// Fields an aggregate operation applies to: one or many.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldArg {
    One(String),
    Many(Vec<String>),
}

impl FieldArg {
    fn fields(&self) -> Vec<&str> {
        match self {
            FieldArg::One(field) => vec![field.as_str()],
            FieldArg::Many(fields) => fields.iter().map(String::as_str).collect(),
        }
    }
}

impl From<&str> for FieldArg {
    fn from(field: &str) -> Self {
        FieldArg::One(field.to_string())
    }
}

impl From<Vec<String>> for FieldArg {
    fn from(fields: Vec<String>) -> Self {
        FieldArg::Many(fields)
    }
}

/// An aggregation request.
#[derive(Debug, Clone, Default)]
pub struct AggregateConfig {
    /// `where` condition document applied before aggregation
    pub filter: Option<Value>,
    /// Partition by the tuple of these (dot-path) fields
    pub group_by: Vec<String>,
    pub sum: Option<FieldArg>,
    pub avg: Option<FieldArg>,
    pub min: Option<FieldArg>,
    pub max: Option<FieldArg>,
}

impl AggregateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, condition: Value) -> Self {
        self.filter = Some(condition);
        self
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by.push(field.into());
        self
    }

    pub fn sum(mut self, fields: impl Into<FieldArg>) -> Self {
        self.sum = Some(fields.into());
        self
    }

    pub fn avg(mut self, fields: impl Into<FieldArg>) -> Self {
        self.avg = Some(fields.into());
        self
    }

    pub fn min(mut self, fields: impl Into<FieldArg>) -> Self {
        self.min = Some(fields.into());
        self
    }

    pub fn max(mut self, fields: impl Into<FieldArg>) -> Self {
        self.max = Some(fields.into());
        self
    }
}

fn number_value(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        Value::Number((number as i64).into())
    } else {
        serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn numeric_values<'a>(items: &'a [&Entity], field: &str) -> impl Iterator<Item = f64> + 'a {
    let field = field.to_string();
    items
        .iter()
        .filter_map(move |entity| get_path(entity, &field).and_then(Value::as_f64))
}

fn fold_field(items: &[&Entity], field: &str, kind: &str) -> Value {
    match kind {
        "sum" => number_value(numeric_values(items, field).sum()),
        "avg" => {
            let values: Vec<f64> = numeric_values(items, field).collect();
            if values.is_empty() {
                Value::Null
            } else {
                let sum: f64 = values.iter().sum();
                serde_json::Number::from_f64(sum / values.len() as f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        "min" => numeric_values(items, field)
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.min(v))))
            .map(number_value)
            .unwrap_or(Value::Null),
        "max" => numeric_values(items, field)
            .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |a| a.max(v))))
            .map(number_value)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn fold_arg(items: &[&Entity], arg: &FieldArg, kind: &str) -> Value {
    match arg {
        FieldArg::One(field) => fold_field(items, field, kind),
        FieldArg::Many(fields) => {
            let mut out = serde_json::Map::new();
            for field in fields {
                out.insert(field.clone(), fold_field(items, field, kind));
            }
            Value::Object(out)
        }
    }
}

fn aggregates_for(items: &[&Entity], config: &AggregateConfig) -> serde_json::Map<String, Value> {
    let mut out = serde_json::Map::new();
    out.insert("count".to_string(), Value::Number(items.len().into()));
    for (kind, arg) in [
        ("sum", &config.sum),
        ("avg", &config.avg),
        ("min", &config.min),
        ("max", &config.max),
    ] {
        if let Some(arg) = arg {
            out.insert(kind.to_string(), fold_arg(items, arg, kind));
        }
    }
    out
}

/// Run an aggregation over a filtered stream of entities.
///
/// Without `group_by` the result is a single object
/// (`{"count": …, "sum": …}`); with it, an array of group objects each
/// carrying its `group` key tuple and aggregates, ordered by group key.
pub fn aggregate(items: &[Entity], config: &AggregateConfig) -> Result<Value> {
    if config.group_by.is_empty() {
        let refs: Vec<&Entity> = items.iter().collect();
        return Ok(Value::Object(aggregates_for(&refs, config)));
    }

    for field in &config.group_by {
        if field.is_empty() {
            return Err(Error::validation("groupBy", "empty group field"));
        }
    }

    let mut groups: BTreeMap<String, (Vec<Value>, Vec<&Entity>)> = BTreeMap::new();
    for entity in items {
        let tuple = field_tuple(entity, &config.group_by);
        let key = tuple_key(&tuple);
        groups
            .entry(key)
            .or_insert_with(|| (tuple, Vec::new()))
            .1
            .push(entity);
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_, (tuple, members)) in groups {
        let mut object = serde_json::Map::new();
        let mut group_key = serde_json::Map::new();
        for (field, value) in config.group_by.iter().zip(tuple) {
            group_key.insert(field.clone(), value);
        }
        object.insert("group".to_string(), Value::Object(group_key));
        object.extend(aggregates_for(&members, config));
        out.push(Value::Object(object));
    }
    Ok(Value::Array(out))
}
