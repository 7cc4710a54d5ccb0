//! The query pipeline: sort, populate, select, and pagination stages.
//!
//! Stages here are pure functions over entity snapshots; candidate
//! resolution (index vs full scan) happens in the collection layer, which
//! owns the locks. Every stage preserves the incoming order, so a query
//! answered from an index matches the same query answered by a full scan.

use crate::collection::{RelationKind, Relationship};
use crate::error::Result;
use crate::value::{compare, get_path};
use crate::{CollectionName, Entity, EntityId, Error};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Sort direction for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Cursor pagination request over a single sort key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CursorConfig {
    /// Field whose stringified value is the cursor
    pub key: String,
    /// Page size; must be positive
    pub limit: usize,
    /// Return items after this cursor (forward paging)
    pub after: Option<String>,
    /// Return items before this cursor (backward paging)
    pub before: Option<String>,
}

/// A composed query.
#[derive(Debug, Clone, Default)]
pub struct QueryConfig {
    /// `where` condition document
    pub filter: Option<Value>,
    pub sort: Vec<SortKey>,
    /// Shape-mirrored populate spec (`{"author": true}`)
    pub populate: Option<Value>,
    /// Shape-mirrored projection (`{"id": true, "title": true}`)
    pub select: Option<Value>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl QueryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, condition: Value) -> Self {
        self.filter = Some(condition);
        self
    }

    pub fn sort(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn populate(mut self, spec: Value) -> Self {
        self.populate = Some(spec);
        self
    }

    pub fn select(mut self, spec: Value) -> Self {
        self.select = Some(spec);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Cursor page result.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub page_info: PageInfo,
}

/// Cursor page boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

/// Stable multi-key sort. Missing fields sort as null; ties keep the
/// incoming pipeline order.
pub fn apply_sort(items: &mut [Entity], sort: &[SortKey]) {
    if sort.is_empty() {
        return;
    }
    items.sort_by(|a, b| {
        for key in sort {
            let left = get_path(a, &key.field).unwrap_or(&Value::Null);
            let right = get_path(b, &key.field).unwrap_or(&Value::Null);
            let ordering = match key.direction {
                SortDirection::Asc => compare(left, right),
                SortDirection::Desc => compare(right, left),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Offset/limit as simple stream combinators.
pub fn apply_offset_limit(items: Vec<Entity>, offset: Option<usize>, limit: Option<usize>) -> Vec<Entity> {
    let iter = items.into_iter().skip(offset.unwrap_or(0));
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}

/// Shape-mirroring projection: `true` keeps a field, a nested object keeps
/// and recurses. Arrays project element-wise so populated inverse relations
/// can be narrowed too.
pub fn apply_select(entity: &Entity, spec: &Value) -> Result<Entity> {
    let Some(shape) = spec.as_object() else {
        return Err(Error::validation(
            "",
            "select must be a shape-mirroring object",
        ));
    };
    let mut out = Entity::new();
    for (field, selector) in shape {
        let Some(value) = entity.get(field) else {
            continue;
        };
        match selector {
            Value::Bool(true) => {
                out.insert(field.clone(), value.clone());
            }
            Value::Bool(false) => {}
            Value::Object(_) => {
                out.insert(field.clone(), select_value(value, selector)?);
            }
            other => {
                return Err(Error::validation(
                    field,
                    format!("select values must be true or nested objects, got {other}"),
                ))
            }
        }
    }
    Ok(out)
}

fn select_value(value: &Value, spec: &Value) -> Result<Value> {
    match value {
        Value::Object(inner) => Ok(Value::Object(apply_select(inner, spec)?)),
        Value::Array(items) => {
            let projected: Result<Vec<Value>> =
                items.iter().map(|item| select_value(item, spec)).collect();
            Ok(Value::Array(projected?))
        }
        other => Ok(other.clone()),
    }
}

/// Read access to other collections' relations and snapshots, for populate.
pub(crate) trait PopulateSource {
    fn relation(&self, collection: &str, name: &str) -> Option<Relationship>;
    fn snapshot(&self, collection: &str) -> Option<Arc<BTreeMap<EntityId, Entity>>>;
}

/// Default foreign key of an inverse relation: the singularized source
/// collection name plus `Id` (`users → userId`, `companies → companyId`).
pub fn inverse_foreign_key(source_collection: &str) -> String {
    let singular = if let Some(stem) = source_collection.strip_suffix("ies") {
        format!("{stem}y")
    } else {
        source_collection
            .strip_suffix('s')
            .unwrap_or(source_collection)
            .to_string()
    };
    format!("{singular}Id")
}

/// Materialize relations into the items, recursing through nested specs.
pub(crate) fn apply_populate(
    items: &mut [Entity],
    collection: &CollectionName,
    spec: &Value,
    source: &dyn PopulateSource,
) -> Result<()> {
    let Some(shape) = spec.as_object() else {
        return Err(Error::validation(
            "",
            "populate must be a shape-mirroring object",
        ));
    };

    for (name, nested) in shape {
        if matches!(nested, Value::Bool(false)) {
            continue;
        }
        let relation = source.relation(collection, name).ok_or_else(|| {
            Error::validation(name, format!("unknown relation '{name}' on {collection}"))
        })?;
        let target_snapshot = source.snapshot(&relation.target).ok_or_else(|| {
            Error::validation(
                name,
                format!("relation '{name}' targets unknown collection {}", relation.target),
            )
        })?;
        let nested_spec = nested.as_object().map(|_| nested);

        match relation.kind {
            RelationKind::Ref => {
                let fk = relation
                    .foreign_key
                    .clone()
                    .unwrap_or_else(|| format!("{name}Id"));
                for item in items.iter_mut() {
                    let resolved = item
                        .get(&fk)
                        .and_then(Value::as_str)
                        .and_then(|id| target_snapshot.get(id))
                        .cloned();
                    let value = match resolved {
                        Some(mut target_entity) => {
                            if let Some(spec) = nested_spec {
                                let mut one = vec![target_entity];
                                apply_populate(&mut one, &relation.target, spec, source)?;
                                target_entity = one.remove(0);
                            }
                            Value::Object(target_entity)
                        }
                        None => Value::Null,
                    };
                    item.insert(name.clone(), value);
                }
            }
            RelationKind::Inverse => {
                let fk = relation
                    .foreign_key
                    .clone()
                    .unwrap_or_else(|| inverse_foreign_key(collection));
                for item in items.iter_mut() {
                    let Some(id) = item.get("id").and_then(Value::as_str) else {
                        item.insert(name.clone(), Value::Array(Vec::new()));
                        continue;
                    };
                    let mut related: Vec<Entity> = target_snapshot
                        .values()
                        .filter(|target| {
                            target.get(&fk).and_then(Value::as_str) == Some(id)
                        })
                        .cloned()
                        .collect();
                    if let Some(spec) = nested_spec {
                        apply_populate(&mut related, &relation.target, spec, source)?;
                    }
                    item.insert(
                        name.clone(),
                        Value::Array(related.into_iter().map(Value::Object).collect()),
                    );
                }
            }
        }
    }
    Ok(())
}

/// The opaque cursor for an entity: the stringified value at the cursor key.
pub fn cursor_string(entity: &Entity, key: &str) -> String {
    match get_path(entity, key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => Value::Null.to_string(),
    }
}

/// Cursor pagination over an already-sorted item stream.
pub fn apply_cursor(items: Vec<Entity>, cursor: &CursorConfig) -> Result<Page> {
    if cursor.limit == 0 {
        return Err(Error::validation("cursor.limit", "limit must be positive"));
    }
    if cursor.after.is_some() && cursor.before.is_some() {
        return Err(Error::validation(
            "cursor",
            "after and before are mutually exclusive",
        ));
    }

    let keyed: Vec<(String, Entity)> = items
        .into_iter()
        .map(|entity| (cursor_string(&entity, &cursor.key), entity))
        .collect();

    let (window, has_next, has_previous) = if let Some(before) = &cursor.before {
        let filtered: Vec<(String, Entity)> = keyed
            .into_iter()
            .filter(|(key, _)| key < before)
            .collect();
        let overflow = filtered.len() > cursor.limit;
        let start = filtered.len().saturating_sub(cursor.limit);
        let window: Vec<(String, Entity)> = filtered.into_iter().skip(start).collect();
        // Paging backward from a cursor means newer items exist ahead
        (window, true, overflow)
    } else {
        let filtered: Vec<(String, Entity)> = match &cursor.after {
            Some(after) => keyed.into_iter().filter(|(key, _)| key > after).collect(),
            None => keyed,
        };
        let overflow = filtered.len() > cursor.limit;
        let window: Vec<(String, Entity)> =
            filtered.into_iter().take(cursor.limit).collect();
        (window, overflow, cursor.after.is_some())
    };

    let page_info = if window.is_empty() {
        PageInfo {
            start_cursor: None,
            end_cursor: None,
            has_next_page: false,
            has_previous_page: false,
        }
    } else {
        PageInfo {
            start_cursor: window.first().map(|(key, _)| key.clone()),
            end_cursor: window.last().map(|(key, _)| key.clone()),
            has_next_page: has_next,
            has_previous_page: has_previous,
        }
    };

    Ok(Page {
        items: window
            .into_iter()
            .map(|(_, entity)| Value::Object(entity))
            .collect(),
        page_info,
    })
}
