//! Loading and saving collections through codecs, and the debounced writer.
//!
//! A persisted file is an envelope object: entity ids map to wire values,
//! and reserved `_`-prefixed keys carry metadata (`_version`, the prose
//! `_template`). Shared files nest one envelope per collection. Saves funnel
//! through [`DebouncedWriter`], which coalesces bursts per key and drains
//! everything on flush.

use crate::codec::Codec;
use crate::error::Result;
use crate::migrate::{apply_chain, Migration, RawEntities};
use crate::schema::EntitySchema;
use crate::{CollectionName, Entity, EntityId, Error, SchemaVersion};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Reserved envelope key holding the schema version of the file.
pub const VERSION_KEY: &str = "_version";

/// Default writer debounce window.
pub const DEFAULT_WRITE_DEBOUNCE: Duration = Duration::from_millis(100);

fn envelope_version(object: &serde_json::Map<String, Value>) -> SchemaVersion {
    object
        .get(VERSION_KEY)
        .and_then(Value::as_u64)
        .map(|v| v as SchemaVersion)
        .unwrap_or(0)
}

fn split_envelope(value: Value, path: &str, codec: &dyn Codec) -> Result<(RawEntities, SchemaVersion)> {
    let Value::Object(object) = value else {
        return Err(Error::Serialization {
            format: codec.name().to_string(),
            message: format!("file '{path}' did not decode to an object"),
        });
    };
    let version = envelope_version(&object);
    let mut raw = RawEntities::new();
    for (key, entity) in object {
        if key.starts_with('_') {
            continue;
        }
        raw.insert(key, entity);
    }
    Ok((raw, version))
}

pub(crate) fn decode_entities(
    collection: &str,
    target_version: SchemaVersion,
    stored_version: SchemaVersion,
    schema: &dyn EntitySchema,
    raw: RawEntities,
) -> Result<BTreeMap<EntityId, Entity>> {
    let mut entities = BTreeMap::new();
    for (id, value) in raw {
        let entity = schema.decode(&value).map_err(|e| Error::Migration {
            collection: collection.to_string(),
            from_version: stored_version,
            to_version: target_version,
            step: -1,
            reason: format!("entity '{id}': {e}"),
        })?;
        entities.insert(id, entity);
    }
    Ok(entities)
}

/// Load one collection's file: decode, migrate, schema-decode.
///
/// A missing file is an empty collection at the target version.
#[allow(clippy::too_many_arguments)]
pub async fn load_data(
    storage: &dyn crate::storage::StorageAdapter,
    path: &str,
    codec: &dyn Codec,
    schema: &dyn EntitySchema,
    collection: &str,
    target_version: SchemaVersion,
    migrations: &[Migration],
) -> Result<BTreeMap<EntityId, Entity>> {
    if !storage.exists(path).await? {
        return Ok(BTreeMap::new());
    }
    let bytes = storage.read(path).await?;
    let (raw, stored_version) = split_envelope(codec.decode(&bytes)?, path, codec)?;
    let migrated = apply_chain(collection, stored_version, target_version, migrations, raw)?;
    decode_entities(collection, target_version, stored_version, schema, migrated)
}

/// Save one collection's state to its file.
pub async fn save_data(
    storage: &dyn crate::storage::StorageAdapter,
    path: &str,
    codec: &dyn Codec,
    schema: &dyn EntitySchema,
    entities: &BTreeMap<EntityId, Entity>,
    version: SchemaVersion,
    prose_template: Option<&str>,
) -> Result<()> {
    let mut envelope = serde_json::Map::new();
    if version > 0 {
        envelope.insert(VERSION_KEY.to_string(), Value::Number(version.into()));
    }
    if let Some(template) = prose_template {
        envelope.insert(
            crate::prose::TEMPLATE_KEY.to_string(),
            Value::String(template.to_string()),
        );
    }
    for (id, entity) in entities {
        envelope.insert(id.clone(), schema.encode(entity)?);
    }

    let bytes = codec.encode(&Value::Object(envelope))?;
    if let Some((parent, _)) = path.rsplit_once('/') {
        storage.ensure_dir(parent).await?;
    }
    storage.write(path, &bytes).await
}

/// Load a shared file holding several collections:
/// `{collectionName: {id: entity}, _version}`.
///
/// Migration and schema decoding are per collection and happen in the
/// caller, which knows each member's chain.
pub async fn load_collections_from_file(
    storage: &dyn crate::storage::StorageAdapter,
    path: &str,
    codec: &dyn Codec,
) -> Result<(BTreeMap<CollectionName, RawEntities>, SchemaVersion)> {
    if !storage.exists(path).await? {
        return Ok((BTreeMap::new(), 0));
    }
    let bytes = storage.read(path).await?;
    let value = codec.decode(&bytes)?;
    let Value::Object(object) = value else {
        return Err(Error::Serialization {
            format: codec.name().to_string(),
            message: format!("file '{path}' did not decode to an object"),
        });
    };

    let version = envelope_version(&object);
    let mut collections = BTreeMap::new();
    for (name, entities) in object {
        if name.starts_with('_') {
            continue;
        }
        let Value::Object(entries) = entities else {
            return Err(Error::Serialization {
                format: codec.name().to_string(),
                message: format!("collection '{name}' in '{path}' is not an object"),
            });
        };
        collections.insert(name, entries.into_iter().collect());
    }
    Ok((collections, version))
}

/// Save several collections into one shared file.
pub async fn save_collections_to_file(
    storage: &dyn crate::storage::StorageAdapter,
    path: &str,
    codec: &dyn Codec,
    collections: &BTreeMap<CollectionName, Value>,
    version: SchemaVersion,
) -> Result<()> {
    let mut envelope = serde_json::Map::new();
    if version > 0 {
        envelope.insert(VERSION_KEY.to_string(), Value::Number(version.into()));
    }
    for (name, entities) in collections {
        envelope.insert(name.clone(), entities.clone());
    }

    let bytes = codec.encode(&Value::Object(envelope))?;
    if let Some((parent, _)) = path.rsplit_once('/') {
        storage.ensure_dir(parent).await?;
    }
    storage.write(path, &bytes).await
}

/// A deferred save, run once its debounce window closes.
pub type SaveEffect =
    Arc<dyn Fn() -> futures::future::BoxFuture<'static, Result<()>> + Send + Sync>;

struct PendingSave {
    effect: SaveEffect,
    generation: u64,
    timer: JoinHandle<()>,
}

/// Per-key coalescing writer.
///
/// `schedule` replaces any pending save for the same key and restarts its
/// timer; a save scheduled at time T runs no later than T plus the delay
/// unless superseded or flushed. `flush` drains everything immediately.
pub struct DebouncedWriter {
    delay: Duration,
    generations: AtomicU64,
    pending: Arc<Mutex<HashMap<String, PendingSave>>>,
}

impl DebouncedWriter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            generations: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule (or reschedule) the save for a key.
    pub fn schedule(&self, key: &str, effect: SaveEffect) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let timer_pending = Arc::clone(&self.pending);
        let timer_key = key.to_string();
        let delay = self.delay;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let effect = {
                let Ok(mut pending) = timer_pending.lock() else {
                    return;
                };
                match pending.get(&timer_key) {
                    Some(entry) if entry.generation == generation => {
                        pending.remove(&timer_key).map(|entry| entry.effect)
                    }
                    _ => None,
                }
            };
            if let Some(effect) = effect {
                if let Err(e) = effect().await {
                    tracing::error!(key = %timer_key, error = %e, "debounced save failed");
                }
            }
        });

        let Ok(mut pending) = pending.lock() else {
            timer.abort();
            return;
        };
        if let Some(previous) = pending.insert(
            key.to_string(),
            PendingSave {
                effect,
                generation,
                timer,
            },
        ) {
            previous.timer.abort();
        }
    }

    /// Drain the pending set: cancel all timers, run every effect now.
    ///
    /// One failing save does not prevent the others; the first error is
    /// returned after all effects ran.
    pub async fn flush(&self) -> Result<()> {
        let drained: Vec<(String, SaveEffect)> = {
            let Ok(mut pending) = self.pending.lock() else {
                return Ok(());
            };
            pending
                .drain()
                .map(|(key, entry)| {
                    entry.timer.abort();
                    (key, entry.effect)
                })
                .collect()
        };

        let mut first_error = None;
        for (key, effect) in drained {
            if let Err(e) = effect().await {
                tracing::error!(key = %key, error = %e, "flush save failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of saves currently pending.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecRegistry, JsonCodec, JsonlCodec};
    use crate::schema::{FieldDef, FieldType, Schema};
    use crate::storage::{MemoryStorage, StorageAdapter};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn book_schema() -> Schema {
        Schema::new(vec![FieldDef::required("title", FieldType::String)])
    }

    #[tokio::test]
    async fn load_missing_file_is_empty() {
        let storage = MemoryStorage::new();
        let entities = load_data(
            &storage,
            "books.json",
            &JsonCodec,
            &book_schema(),
            "books",
            0,
            &[],
        )
        .await
        .unwrap();
        assert!(entities.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trip() {
        let storage = MemoryStorage::new();
        let schema = book_schema();
        let mut entities = BTreeMap::new();
        entities.insert(
            "b1".to_string(),
            json!({"id": "b1", "title": "Dune"}).as_object().cloned().unwrap(),
        );

        save_data(&storage, "data/books.json", &JsonCodec, &schema, &entities, 0, None)
            .await
            .unwrap();
        let loaded = load_data(
            &storage,
            "data/books.json",
            &JsonCodec,
            &schema,
            "books",
            0,
            &[],
        )
        .await
        .unwrap();
        assert_eq!(loaded, entities);
    }

    #[tokio::test]
    async fn version_key_written_and_migrations_applied() {
        let storage = MemoryStorage::new();
        let schema = book_schema();

        // A version-0 file written by an older deployment
        storage
            .write(
                "books.json",
                json!({"b1": {"id": "b1", "name": "Dune"}}).to_string().as_bytes(),
            )
            .await
            .unwrap();

        let migrations = crate::migrate::validate_chain(
            "books",
            1,
            &[Migration::new(0, 1, |mut data: RawEntities| {
                for entity in data.values_mut() {
                    if let Some(object) = entity.as_object_mut() {
                        if let Some(name) = object.remove("name") {
                            object.insert("title".to_string(), name);
                        }
                    }
                }
                Ok(data)
            })],
        )
        .unwrap();

        let loaded = load_data(
            &storage,
            "books.json",
            &JsonCodec,
            &schema,
            "books",
            1,
            &migrations,
        )
        .await
        .unwrap();
        assert_eq!(loaded["b1"].get("title"), Some(&json!("Dune")));

        // Saving afterwards stamps the target version
        save_data(&storage, "books.json", &JsonCodec, &schema, &loaded, 1, None)
            .await
            .unwrap();
        let raw: Value =
            serde_json::from_slice(&storage.contents("books.json").unwrap()).unwrap();
        assert_eq!(raw[VERSION_KEY], json!(1));
    }

    #[tokio::test]
    async fn schema_failure_after_migration_is_migration_error() {
        let storage = MemoryStorage::new();
        storage
            .write("books.json", json!({"b1": {"id": "b1"}}).to_string().as_bytes())
            .await
            .unwrap();

        let err = load_data(
            &storage,
            "books.json",
            &JsonCodec,
            &book_schema(),
            "books",
            0,
            &[],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Migration { step: -1, .. }));
    }

    #[tokio::test]
    async fn jsonl_line_per_entity() {
        let storage = MemoryStorage::new();
        let schema = book_schema();
        let mut entities = BTreeMap::new();
        for (id, title) in [("e1", "first"), ("e2", "second")] {
            entities.insert(
                id.to_string(),
                json!({"id": id, "title": title}).as_object().cloned().unwrap(),
            );
        }

        save_data(&storage, "events.jsonl", &JsonlCodec, &schema, &entities, 0, None)
            .await
            .unwrap();
        let text = String::from_utf8(storage.contents("events.jsonl").unwrap()).unwrap();
        assert_eq!(text.lines().filter(|l| !l.trim().is_empty()).count(), 2);

        let loaded = load_data(
            &storage,
            "events.jsonl",
            &JsonlCodec,
            &schema,
            "events",
            0,
            &[],
        )
        .await
        .unwrap();
        assert_eq!(loaded, entities);
    }

    #[tokio::test]
    async fn shared_file_round_trip() {
        let storage = MemoryStorage::new();
        let registry = CodecRegistry::with_builtins();
        let codec = registry.by_path("db.json").unwrap();

        let mut collections = BTreeMap::new();
        collections.insert(
            "users".to_string(),
            json!({"u1": {"id": "u1", "name": "A"}}),
        );
        collections.insert(
            "companies".to_string(),
            json!({"c1": {"id": "c1", "name": "Acme"}}),
        );

        save_collections_to_file(&storage, "db.json", codec.as_ref(), &collections, 2)
            .await
            .unwrap();
        let (loaded, version) = load_collections_from_file(&storage, "db.json", codec.as_ref())
            .await
            .unwrap();

        assert_eq!(version, 2);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["users"]["u1"]["name"], json!("A"));
    }

    fn counting_effect(counter: &Arc<AtomicUsize>) -> SaveEffect {
        let counter = Arc::clone(counter);
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn debounce_coalesces_per_key() {
        let writer = DebouncedWriter::new(Duration::from_millis(20));
        let runs = Arc::new(AtomicUsize::new(0));

        writer.schedule("books", counting_effect(&runs));
        writer.schedule("books", counting_effect(&runs));
        writer.schedule("books", counting_effect(&runs));
        assert_eq!(writer.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(writer.pending_count(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let writer = DebouncedWriter::new(Duration::from_millis(10));
        let runs = Arc::new(AtomicUsize::new(0));

        writer.schedule("books", counting_effect(&runs));
        writer.schedule("authors", counting_effect(&runs));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn flush_drains_immediately_and_is_idempotent() {
        let writer = DebouncedWriter::new(Duration::from_secs(60));
        let runs = Arc::new(AtomicUsize::new(0));

        writer.schedule("books", counting_effect(&runs));
        writer.flush().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Nothing left to run
        writer.flush().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(writer.pending_count(), 0);
    }

    #[tokio::test]
    async fn one_failing_save_does_not_block_others() {
        let writer = DebouncedWriter::new(Duration::from_secs(60));
        let runs = Arc::new(AtomicUsize::new(0));

        writer.schedule(
            "bad",
            Arc::new(|| Box::pin(async { Err(Error::operation("disk on fire")) })),
        );
        writer.schedule("good", counting_effect(&runs));

        let result = writer.flush().await;
        assert!(result.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
