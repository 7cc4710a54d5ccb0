//! Secondary equality indexes and the full-text inverted index.
//!
//! Index maps are maintained in lockstep with the entity map: every mutation
//! updates them inside the same state transition, and a transaction rollback
//! rebuilds them from the restored map. Buckets that become empty are
//! removed, so the maps mirror the state exactly.

use crate::value::{field_tuple, get_path};
use crate::{Entity, EntityId};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Tokenize a string for full-text indexing and query decomposition.
///
/// Lowercase, split on ASCII whitespace, strip leading/trailing non-word
/// characters, drop empties and stop words. The same function serves the
/// index and the scan path so the two agree.
pub fn tokenize(text: &str, stop_words: &BTreeSet<String>) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| c.is_ascii_whitespace())
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric() && c != '_'))
        .filter(|word| !word.is_empty())
        .filter(|word| !stop_words.contains(*word))
        .map(str::to_string)
        .collect()
}

/// Bucket key for a value tuple: each element's JSON text terminated by a
/// unit separator. JSON escapes control characters, so the separator byte
/// only ever appears between elements — a tuple prefix is therefore exactly
/// a string prefix, and prefix lookups become bucket range scans.
fn bucket_key(values: &[Value]) -> String {
    let mut out = String::new();
    for value in values {
        out.push_str(&value.to_string());
        out.push('\u{1f}');
    }
    out
}

/// An equality index over an ordered field list.
///
/// The bucket key is the canonical tuple of the entity's values at those
/// fields; missing fields index as `null`.
#[derive(Debug, Clone, Default)]
pub struct EqualityIndex {
    /// Ordered field list forming the index key
    pub fields: Vec<String>,
    /// Whether this index enforces a unique constraint
    pub unique: bool,
    buckets: BTreeMap<String, BTreeSet<EntityId>>,
}

impl EqualityIndex {
    pub fn new(fields: Vec<String>, unique: bool) -> Self {
        Self {
            fields,
            unique,
            buckets: BTreeMap::new(),
        }
    }

    /// Bucket key for an entity under this index.
    pub fn key_for(&self, entity: &Entity) -> String {
        bucket_key(&field_tuple(entity, &self.fields))
    }

    /// Bucket key for an explicit value tuple.
    pub fn key_for_values(&self, values: &[Value]) -> String {
        bucket_key(values)
    }

    /// Ids currently in the bucket for a full value tuple.
    pub fn lookup(&self, values: &[Value]) -> Option<&BTreeSet<EntityId>> {
        self.buckets.get(&self.key_for_values(values))
    }

    /// Ids across every bucket whose key tuple starts with `values`.
    ///
    /// A full-length tuple hits exactly one bucket; a shorter tuple unions
    /// the buckets sharing that leading prefix.
    pub fn ids_with_prefix(&self, values: &[Value]) -> BTreeSet<EntityId> {
        let prefix = self.key_for_values(values);
        let mut ids = BTreeSet::new();
        for (key, bucket) in self.buckets.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            ids.extend(bucket.iter().cloned());
        }
        ids
    }

    /// An id in this bucket other than `exclude`, if any. Used for unique
    /// constraint checks.
    pub fn conflicting_id(&self, values: &[Value], exclude: Option<&str>) -> Option<&EntityId> {
        self.lookup(values)?
            .iter()
            .find(|id| Some(id.as_str()) != exclude)
    }

    fn insert(&mut self, id: &str, entity: &Entity) {
        self.buckets
            .entry(self.key_for(entity))
            .or_default()
            .insert(id.to_string());
    }

    fn remove(&mut self, id: &str, entity: &Entity) {
        let key = self.key_for(entity);
        if let Some(bucket) = self.buckets.get_mut(&key) {
            bucket.remove(id);
            if bucket.is_empty() {
                self.buckets.remove(&key);
            }
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Inverted full-text index: token to the set of ids whose indexed string
/// fields produce that token.
#[derive(Debug, Clone, Default)]
pub struct SearchIndex {
    /// String fields contributing tokens
    pub fields: Vec<String>,
    stop_words: BTreeSet<String>,
    buckets: BTreeMap<String, BTreeSet<EntityId>>,
}

impl SearchIndex {
    pub fn new(fields: Vec<String>, stop_words: BTreeSet<String>) -> Self {
        Self {
            fields,
            stop_words,
            buckets: BTreeMap::new(),
        }
    }

    /// All tokens an entity's indexed fields produce.
    pub fn tokens_for(&self, entity: &Entity) -> BTreeSet<String> {
        let mut tokens = BTreeSet::new();
        for field in &self.fields {
            if let Some(Value::String(text)) = get_path(entity, field) {
                tokens.extend(tokenize(text, &self.stop_words));
            }
        }
        tokens
    }

    /// Tokenize a query with the same rules as indexing.
    pub fn query_tokens(&self, query: &str) -> BTreeSet<String> {
        tokenize(query, &self.stop_words)
    }

    /// Ids whose indexed tokens match `token` exactly or by prefix.
    fn ids_matching(&self, token: &str) -> BTreeSet<EntityId> {
        let mut ids = BTreeSet::new();
        for (indexed, bucket) in self.buckets.range(token.to_string()..) {
            if !indexed.starts_with(token) {
                break;
            }
            ids.extend(bucket.iter().cloned());
        }
        ids
    }

    /// Intersect matches across all query tokens (AND semantics).
    ///
    /// Returns `None` when the query has no tokens, which constrains nothing.
    pub fn search(&self, query: &str) -> Option<BTreeSet<EntityId>> {
        let tokens = self.query_tokens(query);
        if tokens.is_empty() {
            return None;
        }
        let mut result: Option<BTreeSet<EntityId>> = None;
        for token in tokens {
            let matches = self.ids_matching(&token);
            result = Some(match result {
                None => matches,
                Some(acc) => acc.intersection(&matches).cloned().collect(),
            });
            if result.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }
        result
    }

    fn insert(&mut self, id: &str, entity: &Entity) {
        for token in self.tokens_for(entity) {
            self.buckets.entry(token).or_default().insert(id.to_string());
        }
    }

    fn remove(&mut self, id: &str, entity: &Entity) {
        for token in self.tokens_for(entity) {
            if let Some(bucket) = self.buckets.get_mut(&token) {
                bucket.remove(id);
                if bucket.is_empty() {
                    self.buckets.remove(&token);
                }
            }
        }
    }

    fn update(&mut self, id: &str, old: &Entity, new: &Entity) {
        let old_tokens = self.tokens_for(old);
        let new_tokens = self.tokens_for(new);
        // Tokens contributed by unchanged fields appear in both sets and
        // cause no bucket traffic.
        for token in old_tokens.difference(&new_tokens) {
            if let Some(bucket) = self.buckets.get_mut(token) {
                bucket.remove(id);
                if bucket.is_empty() {
                    self.buckets.remove(token);
                }
            }
        }
        for token in new_tokens.difference(&old_tokens) {
            self.buckets
                .entry(token.clone())
                .or_default()
                .insert(id.to_string());
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// The full index state of one collection: declared equality indexes, unique
/// constraints (equality indexes flagged unique), and the optional FTS index.
#[derive(Debug, Clone, Default)]
pub struct IndexSet {
    pub equality: Vec<EqualityIndex>,
    pub search: Option<SearchIndex>,
}

impl IndexSet {
    pub fn new(
        index_fields: &[Vec<String>],
        unique_fields: &[Vec<String>],
        search_fields: &[String],
        stop_words: &BTreeSet<String>,
    ) -> Self {
        let mut equality = Vec::new();
        for fields in unique_fields {
            equality.push(EqualityIndex::new(fields.clone(), true));
        }
        for fields in index_fields {
            // A unique constraint over the same fields already indexes them
            if !equality.iter().any(|idx| &idx.fields == fields) {
                equality.push(EqualityIndex::new(fields.clone(), false));
            }
        }
        let search = if search_fields.is_empty() {
            None
        } else {
            Some(SearchIndex::new(
                search_fields.to_vec(),
                stop_words.clone(),
            ))
        };
        Self { equality, search }
    }

    pub fn insert(&mut self, id: &str, entity: &Entity) {
        for index in &mut self.equality {
            index.insert(id, entity);
        }
        if let Some(search) = &mut self.search {
            search.insert(id, entity);
        }
    }

    pub fn remove(&mut self, id: &str, entity: &Entity) {
        for index in &mut self.equality {
            index.remove(id, entity);
        }
        if let Some(search) = &mut self.search {
            search.remove(id, entity);
        }
    }

    pub fn update(&mut self, id: &str, old: &Entity, new: &Entity) {
        for index in &mut self.equality {
            let old_key = index.key_for(old);
            let new_key = index.key_for(new);
            if old_key != new_key {
                index.remove(id, old);
                index.insert(id, new);
            }
        }
        if let Some(search) = &mut self.search {
            search.update(id, old, new);
        }
    }

    /// Rebuild every index from scratch. Used at load time and after a
    /// transaction rollback restores the entity map.
    pub fn rebuild(&mut self, entities: &BTreeMap<EntityId, Entity>) {
        for index in &mut self.equality {
            index.buckets.clear();
        }
        if let Some(search) = &mut self.search {
            search.buckets.clear();
        }
        for (id, entity) in entities {
            self.insert(id, entity);
        }
    }

    /// The equality index whose leading fields are best covered by the given
    /// equality constraints, with the covered prefix length.
    ///
    /// Any non-empty prefix qualifies for a bucket lookup; the longest
    /// covered prefix wins.
    pub fn covering_prefix(
        &self,
        eq_fields: &BTreeMap<String, Value>,
    ) -> Option<(&EqualityIndex, usize)> {
        self.equality
            .iter()
            .filter_map(|index| {
                let covered = index
                    .fields
                    .iter()
                    .take_while(|f| eq_fields.contains_key(f.as_str()))
                    .count();
                (covered > 0).then_some((index, covered))
            })
            .max_by_key(|(_, covered)| *covered)
    }

    /// Unique indexes, for constraint checks.
    pub fn unique_indexes(&self) -> impl Iterator<Item = &EqualityIndex> {
        self.equality.iter().filter(|index| index.unique)
    }
}
