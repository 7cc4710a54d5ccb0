//! Collections and the CRUD core.
//!
//! Every mutation funnels through one canonical pipeline:
//!
//! ```text
//! validate-immutable-fields → strip-computed → lookup-or-generate-id
//!   → timestamps → run-before-hooks → schema-decode → unique-check
//!   → foreign-key-check → atomic-state-update → index-update
//!   → run-after-hooks → onChange → publish-change-event
//!   → schedule-persistence
//! ```
//!
//! State checks and the map replacement happen under one write lock per
//! collection, so a second mutation observes the full effect of the first.
//! Hooks run outside the lock: before-hooks ahead of it, after-hooks once
//! the transition is committed.

use crate::aggregate::{aggregate as run_aggregate, AggregateConfig};
use crate::codec::Codec;
use crate::error::Result;
use crate::events::{ChangeEvent, ChangeOp, Watch};
use crate::filter::{matches, FilterContext};
use crate::hooks::{run_after, run_before, run_on_change, EntityChange, HookContext, Hooks};
use crate::index::IndexSet;
use crate::migrate::Migration;
use crate::patch::Patch;
use crate::plugin::IdGenerator;
use crate::query::{
    apply_cursor, apply_offset_limit, apply_populate, apply_select, apply_sort, CursorConfig,
    Page, QueryConfig, SortKey,
};
use crate::schema::EntitySchema;
use crate::transaction::MutationSink;
use crate::value::field_tuple;
use crate::{CollectionName, Entity, EntityId, Error, SchemaVersion};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

/// Which side of a relationship stores the foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// This side stores the key (default field `<relationName>Id`)
    Ref,
    /// The other side stores the key
    Inverse,
}

/// A named relationship to another collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub kind: RelationKind,
    pub target: CollectionName,
    pub foreign_key: Option<String>,
}

impl Relationship {
    pub fn reference(target: impl Into<CollectionName>) -> Self {
        Self {
            kind: RelationKind::Ref,
            target: target.into(),
            foreign_key: None,
        }
    }

    pub fn inverse(target: impl Into<CollectionName>) -> Self {
        Self {
            kind: RelationKind::Inverse,
            target: target.into(),
            foreign_key: None,
        }
    }

    pub fn with_foreign_key(mut self, field: impl Into<String>) -> Self {
        self.foreign_key = Some(field.into());
        self
    }
}

/// A pure derivation evaluated at query time, never stored.
#[derive(Clone)]
pub struct ComputedField {
    pub name: String,
    compute: Arc<dyn Fn(&Entity) -> Value + Send + Sync>,
}

impl ComputedField {
    pub fn new(
        name: impl Into<String>,
        compute: impl Fn(&Entity) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            compute: Arc::new(compute),
        }
    }
}

impl std::fmt::Debug for ComputedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedField").field("name", &self.name).finish()
    }
}

/// How a collection reaches its file.
pub(crate) struct PersistencePlan {
    pub path: String,
    pub codec: Arc<dyn Codec>,
    pub version: SchemaVersion,
    pub migrations: Vec<Migration>,
    pub append_only: bool,
    pub prose_template: Option<String>,
    /// Other collections share this path
    pub shared: bool,
}

/// The live state of one collection: the copy-on-write entity map and its
/// indexes, replaced together under the write lock.
pub(crate) struct CollectionState {
    pub entities: Arc<BTreeMap<EntityId, Entity>>,
    pub indexes: IndexSet,
}

/// Everything that defines a collection, shared by all handles.
pub(crate) struct CollectionCore {
    pub name: CollectionName,
    pub schema: Arc<dyn EntitySchema>,
    pub relationships: BTreeMap<String, Relationship>,
    pub computed: Vec<ComputedField>,
    pub hooks: Hooks,
    pub id_generator: IdGenerator,
    pub persistence: Option<PersistencePlan>,
    pub search_fields: Vec<String>,
    pub stop_words: BTreeSet<String>,
    pub state: RwLock<CollectionState>,
}

impl CollectionCore {
    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, CollectionState>> {
        self.state
            .read()
            .map_err(|_| Error::operation(format!("state lock poisoned for {}", self.name)))
    }

    fn write_state(&self) -> Result<std::sync::RwLockWriteGuard<'_, CollectionState>> {
        self.state
            .write()
            .map_err(|_| Error::operation(format!("state lock poisoned for {}", self.name)))
    }

    pub(crate) fn snapshot(&self) -> Result<Arc<BTreeMap<EntityId, Entity>>> {
        Ok(Arc::clone(&self.read_state()?.entities))
    }

    /// Evaluate computed fields into a copy of the entity.
    fn materialize(&self, entity: &Entity) -> Entity {
        if self.computed.is_empty() {
            return entity.clone();
        }
        let mut out = entity.clone();
        for field in &self.computed {
            out.insert(field.name.clone(), (field.compute)(entity));
        }
        out
    }

    fn strip_computed(&self, object: &mut serde_json::Map<String, Value>) {
        for field in &self.computed {
            object.remove(&field.name);
        }
    }
}

/// Options for `create_many`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateManyOptions {
    /// Report duplicate ids as skipped instead of failing the batch
    pub skip_duplicates: bool,
}

/// Result of `create_many`.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateManyResult {
    pub created: Vec<Value>,
    pub skipped: Vec<EntityId>,
}

/// Options for delete operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    /// Set `deletedAt` instead of removing; requires the schema to declare
    /// that field
    pub soft: bool,
}

/// An upsert request: find by `filter`, update if found, otherwise create
/// from `filter` merged with `create`.
#[derive(Debug, Clone)]
pub struct UpsertConfig {
    /// Must identify rows by `id` or a declared unique-constraint field set
    pub filter: Value,
    pub create: Value,
    pub update: Value,
}

/// What an upsert did.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(Value),
    Updated(Value),
    /// The update would not change any value
    Unchanged(Value),
}

impl UpsertOutcome {
    pub fn entity(&self) -> &Value {
        match self {
            UpsertOutcome::Created(e) | UpsertOutcome::Updated(e) | UpsertOutcome::Unchanged(e) => e,
        }
    }
}

const IMMUTABLE_FIELDS: &[&str] = &["id", "createdAt"];
const CREATED_AT: &str = "createdAt";
const UPDATED_AT: &str = "updatedAt";
const DELETED_AT: &str = "deletedAt";

/// A handle to one collection, bound to an execution context (normal or
/// transactional) through its [`MutationSink`].
#[derive(Clone)]
pub struct Collection {
    inner: Arc<crate::database::DatabaseInner>,
    core: Arc<CollectionCore>,
    sink: Arc<dyn MutationSink>,
}

impl Collection {
    pub(crate) fn new(
        inner: Arc<crate::database::DatabaseInner>,
        core: Arc<CollectionCore>,
        sink: Arc<dyn MutationSink>,
    ) -> Self {
        Self { inner, core, sink }
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    fn now(&self) -> String {
        (self.inner.clock)()
    }

    fn filter_ctx(&self) -> FilterContext {
        FilterContext {
            operators: self.inner.plugins.operators.clone(),
            search_fields: self.core.search_fields.clone(),
            stop_words: self.core.stop_words.clone(),
        }
    }

    fn not_found(&self, id: &str) -> Error {
        Error::NotFound {
            collection: self.core.name.clone(),
            id: id.to_string(),
        }
    }

    fn reject_append_only(&self, operation: &str) -> Result<()> {
        if self
            .core
            .persistence
            .as_ref()
            .is_some_and(|plan| plan.append_only)
        {
            return Err(Error::operation(format!(
                "append-only collection {} does not support {operation}",
                self.core.name
            )));
        }
        Ok(())
    }

    /// Foreign-key targets of this collection's `ref` relations, with
    /// point-in-time snapshots of their entity maps.
    fn fk_targets(&self) -> Result<Vec<FkTarget>> {
        let mut targets = Vec::new();
        for (name, relation) in &self.core.relationships {
            if relation.kind != RelationKind::Ref {
                continue;
            }
            let field = relation
                .foreign_key
                .clone()
                .unwrap_or_else(|| format!("{name}Id"));
            let target_core =
                self.inner.collections.get(&relation.target).ok_or_else(|| {
                    Error::validation(
                        name,
                        format!("relation targets unknown collection {}", relation.target),
                    )
                })?;
            targets.push(FkTarget {
                field,
                collection: relation.target.clone(),
                entities: target_core.snapshot()?,
                is_self: relation.target == self.core.name,
            });
        }
        Ok(targets)
    }

    fn check_foreign_keys(
        &self,
        entity: &Entity,
        targets: &[FkTarget],
        staged_ids: &BTreeSet<EntityId>,
    ) -> Result<()> {
        for target in targets {
            let Some(value) = entity.get(&target.field) else {
                continue;
            };
            let id = match value {
                Value::Null => continue,
                Value::String(id) => id.clone(),
                other => other.to_string(),
            };
            let exists = target.entities.contains_key(&id)
                || (target.is_self && staged_ids.contains(&id));
            if !exists {
                return Err(Error::ForeignKey {
                    collection: self.core.name.clone(),
                    field: target.field.clone(),
                    target_collection: target.collection.clone(),
                    value: id,
                });
            }
        }
        Ok(())
    }

    fn unique_violation(
        &self,
        state: &CollectionState,
        entity: &Entity,
        exclude: Option<&str>,
        staged: &[Entity],
    ) -> Option<Error> {
        for index in state.indexes.unique_indexes() {
            let values = field_tuple(entity, &index.fields);
            let conflict = index.conflicting_id(&values, exclude).is_some()
                || staged.iter().any(|other| {
                    field_tuple(other, &index.fields) == values
                        && other.get("id") != entity.get("id")
                });
            if conflict {
                return Some(Error::UniqueConstraint {
                    collection: self.core.name.clone(),
                    fields: index.fields.clone(),
                    values,
                });
            }
        }
        None
    }

    /// Prepare a create candidate: strip computed, settle id and
    /// timestamps, run before-hooks, schema-decode.
    fn prepare_create(&self, input: &Value) -> Result<Entity> {
        let Some(object) = input.as_object() else {
            return Err(Error::validation("", "create input must be an object"));
        };
        let mut object = object.clone();
        self.core.strip_computed(&mut object);

        if !object.contains_key("id") {
            let id = (self.core.id_generator)();
            object.insert("id".to_string(), Value::String(id));
        }
        let now = self.now();
        object
            .entry(CREATED_AT.to_string())
            .or_insert_with(|| Value::String(now.clone()));
        object
            .entry(UPDATED_AT.to_string())
            .or_insert_with(|| Value::String(now.clone()));

        let id_for_ctx = object
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        let ctx = HookContext {
            collection: &self.core.name,
            id: Some(&id_for_ctx),
            existing: None,
        };
        let transformed = run_before(
            &self.core.hooks.before_create,
            "beforeCreate",
            &ctx,
            Value::Object(object),
        )?;

        self.core.schema.decode(&transformed)
    }

    fn entity_id(entity: &Entity) -> EntityId {
        entity
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    async fn append_line(&self, entity: &Entity) -> Result<()> {
        let Some(plan) = &self.core.persistence else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(&Value::Object(entity.clone())).map_err(|e| {
            Error::Serialization {
                format: "jsonl".to_string(),
                message: e.to_string(),
            }
        })?;
        line.push(b'\n');
        self.inner.storage.append(&plan.path, &line).await
    }

    fn finish_mutation(&self, change: EntityChange, op: ChangeOp, id: &EntityId) {
        let (hooks, hook_name, value) = match &change {
            EntityChange::Created { entity, .. } => {
                (&self.core.hooks.after_create, "afterCreate", entity.clone())
            }
            EntityChange::Updated { after, .. } => {
                (&self.core.hooks.after_update, "afterUpdate", after.clone())
            }
            EntityChange::Deleted { entity, .. } => {
                (&self.core.hooks.after_delete, "afterDelete", entity.clone())
            }
        };
        let ctx = HookContext {
            collection: &self.core.name,
            id: Some(id),
            existing: None,
        };
        run_after(hooks, hook_name, &ctx, &value);
        run_on_change(&self.core.hooks.on_change, &change);

        self.sink.add_mutation(&self.core.name);
        self.sink.publish_change(ChangeEvent {
            collection: self.core.name.clone(),
            operation: op,
            id: id.clone(),
        });
    }

    fn schedule_persistence(&self) {
        if self
            .core
            .persistence
            .as_ref()
            .is_some_and(|plan| !plan.append_only)
        {
            self.sink.schedule_save(&self.core.name);
        }
    }

    /// Create one entity.
    pub async fn create(&self, input: Value) -> Result<Value> {
        self.sink.ensure_active()?;
        let entity = self.prepare_create(&input)?;
        let id = Self::entity_id(&entity);
        let fk_targets = self.fk_targets()?;

        {
            let mut state = self.core.write_state()?;
            if state.entities.contains_key(&id) {
                return Err(Error::DuplicateKey {
                    collection: self.core.name.clone(),
                    id,
                });
            }
            if let Some(err) = self.unique_violation(&state, &entity, None, &[]) {
                return Err(err);
            }
            self.check_foreign_keys(&entity, &fk_targets, &BTreeSet::new())?;

            Arc::make_mut(&mut state.entities).insert(id.clone(), entity.clone());
            state.indexes.insert(&id, &entity);
        }

        let value = Value::Object(entity.clone());
        self.finish_mutation(
            EntityChange::Created {
                collection: self.core.name.clone(),
                entity: value.clone(),
            },
            ChangeOp::Create,
            &id,
        );

        if self
            .core
            .persistence
            .as_ref()
            .is_some_and(|plan| plan.append_only)
        {
            self.append_line(&entity).await?;
        } else {
            self.schedule_persistence();
        }
        Ok(value)
    }

    /// Create a batch atomically. Validation covers the current state and
    /// intra-batch conflicts before anything is applied.
    pub async fn create_many(
        &self,
        inputs: Vec<Value>,
        options: CreateManyOptions,
    ) -> Result<CreateManyResult> {
        self.sink.ensure_active()?;
        let mut candidates = Vec::with_capacity(inputs.len());
        for input in &inputs {
            candidates.push(self.prepare_create(input)?);
        }
        let fk_targets = self.fk_targets()?;

        let mut created: Vec<Entity> = Vec::new();
        let mut skipped: Vec<EntityId> = Vec::new();
        {
            let mut state = self.core.write_state()?;
            let mut staged: Vec<Entity> = Vec::new();
            let mut staged_ids: BTreeSet<EntityId> = BTreeSet::new();

            for candidate in candidates {
                let id = Self::entity_id(&candidate);
                let duplicate =
                    state.entities.contains_key(&id) || staged_ids.contains(&id);
                if duplicate {
                    if options.skip_duplicates {
                        skipped.push(id);
                        continue;
                    }
                    return Err(Error::DuplicateKey {
                        collection: self.core.name.clone(),
                        id,
                    });
                }
                if let Some(err) = self.unique_violation(&state, &candidate, None, &staged) {
                    return Err(err);
                }
                self.check_foreign_keys(&candidate, &fk_targets, &staged_ids)?;
                staged_ids.insert(id);
                staged.push(candidate);
            }

            let entities = Arc::make_mut(&mut state.entities);
            for entity in &staged {
                entities.insert(Self::entity_id(entity), entity.clone());
            }
            for entity in &staged {
                state.indexes.insert(&Self::entity_id(entity), entity);
            }
            created = staged;
        }

        let mut created_values = Vec::with_capacity(created.len());
        for entity in &created {
            let id = Self::entity_id(entity);
            let value = Value::Object(entity.clone());
            self.finish_mutation(
                EntityChange::Created {
                    collection: self.core.name.clone(),
                    entity: value.clone(),
                },
                ChangeOp::Create,
                &id,
            );
            created_values.push(value);
        }

        if self
            .core
            .persistence
            .as_ref()
            .is_some_and(|plan| plan.append_only)
        {
            for entity in &created {
                self.append_line(entity).await?;
            }
        } else if !created.is_empty() {
            self.schedule_persistence();
        }

        Ok(CreateManyResult {
            created: created_values,
            skipped,
        })
    }

    fn validate_patch_document(&self, patch_doc: &Value) -> Result<()> {
        let Some(object) = patch_doc.as_object() else {
            return Err(Error::validation("", "update patch must be an object"));
        };
        for field in IMMUTABLE_FIELDS {
            if object.contains_key(*field) {
                return Err(Error::validation(
                    *field,
                    format!("{field} is immutable after creation"),
                ));
            }
        }
        Ok(())
    }

    /// Run before-update hooks over the patch document and parse it.
    fn prepare_update(&self, id: &str, existing: &Entity, patch_doc: &Value) -> Result<Patch> {
        self.validate_patch_document(patch_doc)?;
        let mut doc = patch_doc
            .as_object()
            .cloned()
            .unwrap_or_default();
        self.core.strip_computed(&mut doc);

        let existing_value = Value::Object(existing.clone());
        let ctx = HookContext {
            collection: &self.core.name,
            id: Some(id),
            existing: Some(&existing_value),
        };
        let transformed = run_before(
            &self.core.hooks.before_update,
            "beforeUpdate",
            &ctx,
            Value::Object(doc),
        )?;
        self.validate_patch_document(&transformed)?;
        Patch::parse(&transformed)
    }

    /// Apply a parsed patch to the current entity: timestamps refreshed
    /// unless supplied, candidate schema-decoded.
    fn patched_entity(&self, current: &Entity, patch: &Patch) -> Result<Entity> {
        let mut candidate = patch.apply(current)?;
        if !patch.sets_field(UPDATED_AT) {
            candidate.insert(UPDATED_AT.to_string(), Value::String(self.now()));
        }
        self.core.schema.decode(&Value::Object(candidate))
    }

    /// Update one entity.
    pub async fn update(&self, id: &str, patch_doc: Value) -> Result<Value> {
        self.sink.ensure_active()?;
        self.reject_append_only("update")?;

        let existing = self
            .core
            .snapshot()?
            .get(id)
            .cloned()
            .ok_or_else(|| self.not_found(id))?;
        let patch = self.prepare_update(id, &existing, &patch_doc)?;
        let fk_targets = self.fk_targets()?;

        let (before, after) = {
            let mut state = self.core.write_state()?;
            let current = state
                .entities
                .get(id)
                .cloned()
                .ok_or_else(|| self.not_found(id))?;
            let candidate = self.patched_entity(&current, &patch)?;

            if let Some(err) = self.unique_violation(&state, &candidate, Some(id), &[]) {
                return Err(err);
            }
            self.check_foreign_keys(&candidate, &fk_targets, &BTreeSet::new())?;

            state.indexes.update(id, &current, &candidate);
            Arc::make_mut(&mut state.entities).insert(id.to_string(), candidate.clone());
            (current, candidate)
        };

        let after_value = Value::Object(after);
        self.finish_mutation(
            EntityChange::Updated {
                collection: self.core.name.clone(),
                before: Value::Object(before),
                after: after_value.clone(),
            },
            ChangeOp::Update,
            &id.to_string(),
        );
        self.schedule_persistence();
        Ok(after_value)
    }

    /// Update every entity matching the condition; the batch validates
    /// before anything is applied.
    pub async fn update_many(&self, condition: Value, patch_doc: Value) -> Result<Vec<Value>> {
        self.sink.ensure_active()?;
        self.reject_append_only("updateMany")?;

        let ctx = self.filter_ctx();
        let snapshot = self.core.snapshot()?;
        let mut ids = Vec::new();
        for (id, entity) in snapshot.iter() {
            if matches(entity, &condition, &ctx)? {
                ids.push(id.clone());
            }
        }

        let mut patches = Vec::with_capacity(ids.len());
        for id in &ids {
            let existing = snapshot.get(id).cloned().ok_or_else(|| self.not_found(id))?;
            patches.push(self.prepare_update(id, &existing, &patch_doc)?);
        }
        let fk_targets = self.fk_targets()?;

        let mut transitions: Vec<(EntityId, Entity, Entity)> = Vec::new();
        {
            let mut state = self.core.write_state()?;
            let mut staged: Vec<Entity> = Vec::new();
            for (id, patch) in ids.iter().zip(&patches) {
                let current = state
                    .entities
                    .get(id)
                    .cloned()
                    .ok_or_else(|| self.not_found(id))?;
                let candidate = self.patched_entity(&current, patch)?;
                if let Some(err) = self.unique_violation(&state, &candidate, Some(id), &staged) {
                    return Err(err);
                }
                self.check_foreign_keys(&candidate, &fk_targets, &BTreeSet::new())?;
                staged.push(candidate.clone());
                transitions.push((id.clone(), current, candidate));
            }

            for (id, old, new) in &transitions {
                state.indexes.update(id, old, new);
            }
            let entities = Arc::make_mut(&mut state.entities);
            for (id, _, new) in &transitions {
                entities.insert(id.clone(), new.clone());
            }
        }

        let mut results = Vec::with_capacity(transitions.len());
        for (id, before, after) in transitions {
            let after_value = Value::Object(after);
            self.finish_mutation(
                EntityChange::Updated {
                    collection: self.core.name.clone(),
                    before: Value::Object(before),
                    after: after_value.clone(),
                },
                ChangeOp::Update,
                &id,
            );
            results.push(after_value);
        }
        if !results.is_empty() {
            self.schedule_persistence();
        }
        Ok(results)
    }

    fn soft_delete_allowed(&self) -> Result<()> {
        if self.core.schema.has_field(DELETED_AT) {
            Ok(())
        } else {
            Err(Error::validation(
                DELETED_AT,
                format!(
                    "soft delete requires a {DELETED_AT} field in the {} schema",
                    self.core.name
                ),
            ))
        }
    }

    fn run_before_delete(&self, id: &str, existing: &Entity) -> Result<()> {
        let existing_value = Value::Object(existing.clone());
        let ctx = HookContext {
            collection: &self.core.name,
            id: Some(id),
            existing: Some(&existing_value),
        };
        run_before(
            &self.core.hooks.before_delete,
            "beforeDelete",
            &ctx,
            existing_value.clone(),
        )?;
        Ok(())
    }

    /// Delete one entity (hard by default, soft when requested and the
    /// schema allows it).
    pub async fn delete(&self, id: &str, options: DeleteOptions) -> Result<Value> {
        self.sink.ensure_active()?;
        self.reject_append_only("delete")?;
        if options.soft {
            self.soft_delete_allowed()?;
        }

        let existing = self
            .core
            .snapshot()?
            .get(id)
            .cloned()
            .ok_or_else(|| self.not_found(id))?;
        self.run_before_delete(id, &existing)?;

        let removed = {
            let mut state = self.core.write_state()?;
            let current = state
                .entities
                .get(id)
                .cloned()
                .ok_or_else(|| self.not_found(id))?;
            if options.soft {
                let mut candidate = current.clone();
                candidate.insert(DELETED_AT.to_string(), Value::String(self.now()));
                let candidate = self.core.schema.decode(&Value::Object(candidate))?;
                state.indexes.update(id, &current, &candidate);
                Arc::make_mut(&mut state.entities).insert(id.to_string(), candidate.clone());
                candidate
            } else {
                state.indexes.remove(id, &current);
                Arc::make_mut(&mut state.entities).remove(id);
                current
            }
        };

        let value = Value::Object(removed);
        self.finish_mutation(
            EntityChange::Deleted {
                collection: self.core.name.clone(),
                entity: value.clone(),
            },
            ChangeOp::Delete,
            &id.to_string(),
        );
        self.schedule_persistence();
        Ok(value)
    }

    /// Delete every entity matching the condition.
    pub async fn delete_many(&self, condition: Value, options: DeleteOptions) -> Result<Vec<Value>> {
        self.sink.ensure_active()?;
        self.reject_append_only("deleteMany")?;
        if options.soft {
            self.soft_delete_allowed()?;
        }

        let ctx = self.filter_ctx();
        let snapshot = self.core.snapshot()?;
        let mut victims = Vec::new();
        for (id, entity) in snapshot.iter() {
            if matches(entity, &condition, &ctx)? {
                victims.push((id.clone(), entity.clone()));
            }
        }
        for (id, entity) in &victims {
            self.run_before_delete(id, entity)?;
        }

        let removed: Vec<(EntityId, Entity)> = {
            let mut state = self.core.write_state()?;
            let mut removed = Vec::with_capacity(victims.len());
            for (id, _) in &victims {
                let current = state
                    .entities
                    .get(id)
                    .cloned()
                    .ok_or_else(|| self.not_found(id))?;
                removed.push((id.clone(), current));
            }
            for (id, current) in &removed {
                if options.soft {
                    let mut candidate = current.clone();
                    candidate.insert(DELETED_AT.to_string(), Value::String(self.now()));
                    state.indexes.update(id, current, &candidate);
                    Arc::make_mut(&mut state.entities).insert(id.clone(), candidate);
                } else {
                    state.indexes.remove(id, current);
                    Arc::make_mut(&mut state.entities).remove(id);
                }
            }
            removed
        };

        let mut results = Vec::with_capacity(removed.len());
        for (id, entity) in removed {
            let value = Value::Object(entity);
            self.finish_mutation(
                EntityChange::Deleted {
                    collection: self.core.name.clone(),
                    entity: value.clone(),
                },
                ChangeOp::Delete,
                &id,
            );
            results.push(value);
        }
        if !results.is_empty() {
            self.schedule_persistence();
        }
        Ok(results)
    }

    /// Delete an entity and, first, everything reachable from it through
    /// inverse relations (dependents before the root). Soft cascades soft.
    pub async fn delete_cascading(&self, id: &str, options: DeleteOptions) -> Result<Vec<Value>> {
        self.sink.ensure_active()?;

        // Depth-first discovery across inverse relations
        let mut queue: Vec<(CollectionName, EntityId)> =
            vec![(self.core.name.clone(), id.to_string())];
        let mut ordered: Vec<(CollectionName, EntityId)> = Vec::new();
        let mut seen: BTreeSet<(CollectionName, EntityId)> = BTreeSet::new();
        seen.insert((self.core.name.clone(), id.to_string()));

        while let Some((collection_name, entity_id)) = queue.pop() {
            ordered.push((collection_name.clone(), entity_id.clone()));
            let core = self
                .inner
                .collections
                .get(&collection_name)
                .ok_or_else(|| self.not_found(&entity_id))?;
            for (relation_name, relation) in &core.relationships {
                if relation.kind != RelationKind::Inverse {
                    continue;
                }
                let fk = relation.foreign_key.clone().unwrap_or_else(|| {
                    crate::query::inverse_foreign_key(&collection_name)
                });
                let target_core = self
                    .inner
                    .collections
                    .get(&relation.target)
                    .ok_or_else(|| {
                        Error::validation(
                            relation_name,
                            format!("relation targets unknown collection {}", relation.target),
                        )
                    })?;
                for (child_id, child) in target_core.snapshot()?.iter() {
                    if child.get(&fk).and_then(Value::as_str) == Some(entity_id.as_str()) {
                        let key = (relation.target.clone(), child_id.clone());
                        if seen.insert(key.clone()) {
                            queue.push(key);
                        }
                    }
                }
            }
        }

        // Dependents first, root last
        let mut deleted = Vec::with_capacity(ordered.len());
        for (collection_name, entity_id) in ordered.into_iter().rev() {
            let handle = if collection_name == self.core.name {
                self.clone()
            } else {
                let core = self
                    .inner
                    .collections
                    .get(&collection_name)
                    .cloned()
                    .ok_or_else(|| self.not_found(&entity_id))?;
                Collection::new(Arc::clone(&self.inner), core, Arc::clone(&self.sink))
            };
            deleted.push(handle.delete(&entity_id, options).await?);
        }
        deleted.reverse();
        Ok(deleted)
    }

    fn upsert_filter_fields(&self, filter: &Value) -> Result<Vec<String>> {
        let Some(object) = filter.as_object() else {
            return Err(Error::validation("where", "upsert where must be an object"));
        };
        let fields: Vec<String> = object.keys().cloned().collect();
        if fields.iter().any(|f| f.starts_with('$')) {
            return Err(Error::validation(
                "where",
                "upsert where supports only plain field equality",
            ));
        }
        if fields == ["id"] {
            return Ok(fields);
        }
        let state = self.core.read_state()?;
        let is_unique_set = state
            .indexes
            .unique_indexes()
            .any(|index| {
                let mut declared = index.fields.clone();
                declared.sort();
                let mut given = fields.clone();
                given.sort();
                declared == given
            });
        if !is_unique_set {
            return Err(Error::validation(
                "where",
                "upsert where must identify rows by id or a unique-constraint field set",
            ));
        }
        Ok(fields)
    }

    fn find_upsert_match(&self, filter: &Value) -> Result<Option<Entity>> {
        let object = filter.as_object().cloned().unwrap_or_default();
        let snapshot = self.core.snapshot()?;
        if let Some(id) = object.get("id").and_then(Value::as_str) {
            return Ok(snapshot.get(id).cloned());
        }
        for entity in snapshot.values() {
            let all_match = object
                .iter()
                .all(|(field, expected)| entity.get(field) == Some(expected));
            if all_match {
                return Ok(Some(entity.clone()));
            }
        }
        Ok(None)
    }

    /// Update the entity matching `filter`, or create it from
    /// `filter` merged with the create payload.
    pub async fn upsert(&self, config: UpsertConfig) -> Result<UpsertOutcome> {
        self.sink.ensure_active()?;
        self.reject_append_only("upsert")?;
        self.upsert_filter_fields(&config.filter)?;

        if let Some(existing) = self.find_upsert_match(&config.filter)? {
            let id = Self::entity_id(&existing);
            // Change detection runs against the bare patch, before the
            // automatic updatedAt refresh
            let patch = Patch::parse(&config.update)?;
            let unchanged = patch.apply(&existing)? == existing;
            if unchanged {
                return Ok(UpsertOutcome::Unchanged(Value::Object(
                    self.core.materialize(&existing),
                )));
            }
            let updated = self.update(&id, config.update).await?;
            return Ok(UpsertOutcome::Updated(updated));
        }

        let mut merged = config
            .filter
            .as_object()
            .cloned()
            .unwrap_or_default();
        if let Some(payload) = config.create.as_object() {
            for (key, value) in payload {
                merged.insert(key.clone(), value.clone());
            }
        }
        let created = self.create(Value::Object(merged)).await?;
        Ok(UpsertOutcome::Created(created))
    }

    /// Upsert a batch, one outcome per request.
    ///
    /// Items apply in order; on the first failure the collection's state is
    /// restored to its checkpoint at entry, so the batch is all-or-nothing.
    pub async fn upsert_many(&self, configs: Vec<UpsertConfig>) -> Result<Vec<UpsertOutcome>> {
        self.sink.ensure_active()?;
        self.reject_append_only("upsertMany")?;

        let checkpoint = self.core.snapshot()?;
        let mut outcomes = Vec::with_capacity(configs.len());
        for config in configs {
            match self.upsert(config).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => {
                    let mut state = self.core.write_state()?;
                    if !Arc::ptr_eq(&state.entities, &checkpoint) {
                        state.entities = checkpoint;
                        let entities = Arc::clone(&state.entities);
                        state.indexes.rebuild(&entities);
                    }
                    return Err(error);
                }
            }
        }
        Ok(outcomes)
    }

    /// Fetch one entity by id, with computed fields materialized.
    pub fn find_by_id(&self, id: &str) -> Result<Option<Value>> {
        let snapshot = self.core.snapshot()?;
        Ok(snapshot
            .get(id)
            .map(|entity| Value::Object(self.core.materialize(entity))))
    }

    /// Candidate resolution: FTS index, then an equality-index prefix
    /// bucket lookup, then full scan in id order.
    fn resolve_candidates(&self, condition: Option<&Value>) -> Result<Vec<Entity>> {
        let state = self.core.read_state()?;

        if let Some(condition) = condition {
            if let Some((scope, query)) = crate::filter::search_constraint(condition) {
                if let Some(search) = &state.indexes.search {
                    let scope_indexed = match &scope {
                        None => true,
                        Some(field) => search.fields.contains(field),
                    };
                    if scope_indexed {
                        if let Some(ids) = search.search(&query) {
                            return Ok(ids
                                .iter()
                                .filter_map(|id| state.entities.get(id).cloned())
                                .collect());
                        }
                    }
                }
            }

            let constraints = crate::filter::equality_constraints(condition);
            if !constraints.is_empty() {
                if let Some((index, covered)) = state.indexes.covering_prefix(&constraints) {
                    let values: Vec<Value> = index
                        .fields
                        .iter()
                        .take(covered)
                        .map(|f| constraints.get(f).cloned().unwrap_or(Value::Null))
                        .collect();
                    return Ok(index
                        .ids_with_prefix(&values)
                        .iter()
                        .filter_map(|id| state.entities.get(id).cloned())
                        .collect());
                }
            }
        }

        Ok(state.entities.values().cloned().collect())
    }

    fn run_query_pipeline(&self, config: &QueryConfig) -> Result<Vec<Entity>> {
        let candidates = self.resolve_candidates(config.filter.as_ref())?;
        let ctx = self.filter_ctx();

        let mut items = Vec::with_capacity(candidates.len());
        for entity in candidates {
            let keep = match &config.filter {
                Some(condition) => matches(&entity, condition, &ctx)?,
                None => true,
            };
            if keep {
                items.push(entity);
            }
        }

        apply_sort(&mut items, &config.sort);
        if let Some(populate) = &config.populate {
            apply_populate(&mut items, &self.core.name, populate, self.inner.as_ref())?;
        }
        if !self.core.computed.is_empty() {
            items = items.iter().map(|e| self.core.materialize(e)).collect();
        }
        Ok(items)
    }

    /// Run a query, returning the terminal item list.
    pub fn query(&self, config: QueryConfig) -> Result<Vec<Value>> {
        let mut items = self.run_query_pipeline(&config)?;
        if let Some(select) = &config.select {
            items = items
                .iter()
                .map(|entity| apply_select(entity, select))
                .collect::<Result<Vec<_>>>()?;
        }
        let items = apply_offset_limit(items, config.offset, config.limit);
        Ok(items.into_iter().map(Value::Object).collect())
    }

    /// Run a query with cursor pagination.
    ///
    /// Requires at most one sort key, matching the cursor key; the cursor
    /// key orders the stream when no sort is given.
    pub fn query_page(&self, mut config: QueryConfig, cursor: CursorConfig) -> Result<Page> {
        match config.sort.len() {
            0 => config.sort.push(SortKey::asc(cursor.key.clone())),
            1 => {
                if config.sort[0].field != cursor.key {
                    return Err(Error::validation(
                        "cursor.key",
                        "cursor key must match the query's sort key",
                    ));
                }
            }
            _ => {
                return Err(Error::validation(
                    "sort",
                    "cursor pagination requires a single sort key",
                ))
            }
        }

        let select = config.select.take();
        let items = self.run_query_pipeline(&config)?;
        let mut page = apply_cursor(items, &cursor)?;
        if let Some(select) = select {
            let mut projected = Vec::with_capacity(page.items.len());
            for item in &page.items {
                let Some(entity) = item.as_object() else {
                    continue;
                };
                projected.push(Value::Object(apply_select(entity, &select)?));
            }
            page.items = projected;
        }
        Ok(page)
    }

    /// Run an aggregation over the filtered stream.
    pub fn aggregate(&self, config: AggregateConfig) -> Result<Value> {
        let query = QueryConfig {
            filter: config.filter.clone(),
            ..QueryConfig::default()
        };
        let items = self.run_query_pipeline(&query)?;
        run_aggregate(&items, &config)
    }

    /// Collections this query depends on: the collection itself plus every
    /// populate target, transitively.
    fn dependencies(&self, populate: Option<&Value>) -> BTreeSet<CollectionName> {
        let mut deps = BTreeSet::new();
        deps.insert(self.core.name.clone());
        let mut stack = vec![(self.core.name.clone(), populate.cloned())];
        while let Some((collection, spec)) = stack.pop() {
            let Some(spec) = spec else { continue };
            let Some(shape) = spec.as_object() else { continue };
            let Some(core) = self.inner.collections.get(&collection) else {
                continue;
            };
            for (name, nested) in shape {
                if let Some(relation) = core.relationships.get(name) {
                    if deps.insert(relation.target.clone()) || nested.is_object() {
                        stack.push((relation.target.clone(), Some(nested.clone())));
                    }
                }
            }
        }
        deps
    }

    /// Watch a query: emits the current result, then re-evaluates (after
    /// the reactive debounce) whenever a dependent collection changes.
    pub fn watch(&self, config: QueryConfig) -> Watch<Vec<Value>> {
        let deps = self.dependencies(config.populate.as_ref());
        let handle = self.clone();
        crate::events::spawn_watch(
            self.inner.bus.subscribe(),
            self.inner.reactive_debounce,
            move |event| deps.contains(&event.collection),
            move || handle.query(config.clone()),
        )
    }

    /// Watch one entity by id; emits on events touching that id only.
    pub fn watch_by_id(&self, id: &str) -> Watch<Option<Value>> {
        let name = self.core.name.clone();
        let id_owned = id.to_string();
        let handle = self.clone();
        let eval_id = id_owned.clone();
        crate::events::spawn_watch(
            self.inner.bus.subscribe(),
            self.inner.reactive_debounce,
            move |event| event.collection == name && event.id == id_owned,
            move || handle.find_by_id(&eval_id),
        )
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.core.name)
            .finish()
    }
}

struct FkTarget {
    field: String,
    collection: CollectionName,
    entities: Arc<BTreeMap<EntityId, Entity>>,
    is_self: bool,
}
