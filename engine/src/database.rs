//! Database assembly: configuration, initialization, and the top-level
//! handle.
//!
//! Construction order: validate plugins, validate collection references,
//! resolve the codec registry, load and migrate every persistent
//! collection, build the indexes, then wire the transaction flag, change
//! bus, and debounced writer.

use crate::codec::{Codec, CodecRegistry};
use crate::collection::{
    Collection, CollectionCore, CollectionState, ComputedField, PersistencePlan, Relationship,
};
use crate::error::Result;
use crate::events::ChangeBus;
use crate::hooks::Hooks;
use crate::index::IndexSet;
use crate::migrate::{self, DryRunReport, Migration};
use crate::persist::{self, DebouncedWriter, SaveEffect, DEFAULT_WRITE_DEBOUNCE};
use crate::plugin::{self, IdGenerator, Plugin, ResolvedPlugins};
use crate::query::PopulateSource;
use crate::schema::EntitySchema;
use crate::storage::{MemoryStorage, StorageAdapter};
use crate::transaction::{DirectSink, Transaction};
use crate::{CollectionName, Entity, EntityId, Error, SchemaVersion};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Timestamp source, injectable for tests.
pub type Clock = Arc<dyn Fn() -> String + Send + Sync>;

fn default_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

/// Reactive watch settings.
#[derive(Debug, Clone, Copy)]
pub struct ReactiveConfig {
    /// Debounce window for watch re-evaluation
    pub debounce: Duration,
}

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(10),
        }
    }
}

/// Persistence writer settings.
#[derive(Debug, Clone, Copy)]
pub struct PersistenceConfig {
    /// Debounce window for coalescing saves
    pub debounce: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_WRITE_DEBOUNCE,
        }
    }
}

/// Configuration of one collection.
pub struct CollectionConfig {
    schema: Arc<dyn EntitySchema>,
    relationships: BTreeMap<String, Relationship>,
    indexes: Vec<Vec<String>>,
    unique: Vec<Vec<String>>,
    search_fields: Vec<String>,
    hooks: Hooks,
    computed: Vec<ComputedField>,
    file: Option<String>,
    format: Option<String>,
    version: SchemaVersion,
    migrations: Vec<Migration>,
    append_only: bool,
    id_generator: Option<String>,
    prose_template: Option<String>,
}

impl CollectionConfig {
    pub fn new(schema: impl EntitySchema + 'static) -> Self {
        Self::with_schema(Arc::new(schema))
    }

    pub fn with_schema(schema: Arc<dyn EntitySchema>) -> Self {
        Self {
            schema,
            relationships: BTreeMap::new(),
            indexes: Vec::new(),
            unique: Vec::new(),
            search_fields: Vec::new(),
            hooks: Hooks::default(),
            computed: Vec::new(),
            file: None,
            format: None,
            version: 0,
            migrations: Vec::new(),
            append_only: false,
            id_generator: None,
            prose_template: None,
        }
    }

    /// Declare a named relationship.
    pub fn relationship(mut self, name: impl Into<String>, relation: Relationship) -> Self {
        self.relationships.insert(name.into(), relation);
        self
    }

    /// Declare a secondary equality index over an ordered field list.
    pub fn index(mut self, fields: &[&str]) -> Self {
        self.indexes.push(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// Declare a unique constraint over an ordered field list.
    pub fn unique(mut self, fields: &[&str]) -> Self {
        self.unique.push(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// Declare the string fields feeding the full-text index.
    pub fn search(mut self, fields: &[&str]) -> Self {
        self.search_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Add a computed field, evaluated at query time and never stored.
    pub fn computed(mut self, field: ComputedField) -> Self {
        self.computed.push(field);
        self
    }

    /// Mirror this collection to a file.
    pub fn file(mut self, path: impl Into<String>) -> Self {
        self.file = Some(path.into());
        self
    }

    /// Override the codec chosen from the file extension.
    pub fn format(mut self, extension: impl Into<String>) -> Self {
        self.format = Some(extension.into());
        self
    }

    /// Declare the schema version the migration chain upgrades to.
    pub fn version(mut self, version: SchemaVersion) -> Self {
        self.version = version;
        self
    }

    pub fn migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Creates append JSONL lines; updates and deletes are rejected.
    pub fn append_only(mut self) -> Self {
        self.append_only = true;
        self
    }

    /// Use a named id generator from the plugin registry.
    pub fn id_generator(mut self, name: impl Into<String>) -> Self {
        self.id_generator = Some(name.into());
        self
    }

    /// Headline template for the prose codec.
    pub fn prose_template(mut self, template: impl Into<String>) -> Self {
        self.prose_template = Some(template.into());
        self
    }
}

/// Configuration of a database.
pub struct DatabaseConfig {
    collections: BTreeMap<CollectionName, CollectionConfig>,
    plugins: Vec<Plugin>,
    storage: Arc<dyn StorageAdapter>,
    persistence: PersistenceConfig,
    reactive: ReactiveConfig,
    stop_words: BTreeSet<String>,
    clock: Clock,
}

impl DatabaseConfig {
    /// A database over in-memory storage; override with
    /// [`DatabaseConfig::storage`] for files.
    pub fn new() -> Self {
        Self {
            collections: BTreeMap::new(),
            plugins: Vec::new(),
            storage: Arc::new(MemoryStorage::new()),
            persistence: PersistenceConfig::default(),
            reactive: ReactiveConfig::default(),
            stop_words: BTreeSet::new(),
            clock: default_clock(),
        }
    }

    pub fn collection(mut self, name: impl Into<String>, config: CollectionConfig) -> Self {
        self.collections.insert(name.into(), config);
        self
    }

    pub fn plugin(mut self, plugin: Plugin) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = storage;
        self
    }

    pub fn persistence(mut self, config: PersistenceConfig) -> Self {
        self.persistence = config;
        self
    }

    pub fn reactive(mut self, config: ReactiveConfig) -> Self {
        self.reactive = config;
        self
    }

    /// Stop words dropped by the full-text tokenizer.
    pub fn stop_words(mut self, words: &[&str]) -> Self {
        self.stop_words = words.iter().map(|w| w.to_string()).collect();
        self
    }

    /// Override the timestamp source (tests pin time with this).
    pub fn clock(mut self, clock: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared interior of a database.
pub(crate) struct DatabaseInner {
    pub collections: BTreeMap<CollectionName, Arc<CollectionCore>>,
    pub writer: DebouncedWriter,
    pub bus: ChangeBus,
    pub tx_active: AtomicBool,
    pub reactive_debounce: Duration,
    pub storage: Arc<dyn StorageAdapter>,
    pub plugins: ResolvedPlugins,
    pub clock: Clock,
    /// File path to the collections persisted in it
    pub paths: BTreeMap<String, Vec<CollectionName>>,
}

impl PopulateSource for DatabaseInner {
    fn relation(&self, collection: &str, name: &str) -> Option<Relationship> {
        self.collections
            .get(collection)?
            .relationships
            .get(name)
            .cloned()
    }

    fn snapshot(&self, collection: &str) -> Option<Arc<BTreeMap<EntityId, Entity>>> {
        self.collections.get(collection)?.snapshot().ok()
    }
}

/// Write one path's file from the current state of its member collections.
pub(crate) async fn save_path(inner: &Arc<DatabaseInner>, path: &str) -> Result<()> {
    let members = inner.paths.get(path).cloned().unwrap_or_default();
    if members.len() > 1 {
        let mut collections = BTreeMap::new();
        let mut version = 0;
        let mut codec = None;
        for name in &members {
            let Some(core) = inner.collections.get(name) else {
                continue;
            };
            let Some(plan) = &core.persistence else {
                continue;
            };
            codec = Some(Arc::clone(&plan.codec));
            version = version.max(plan.version);
            let entities = core.snapshot()?;
            let mut encoded = serde_json::Map::new();
            for (id, entity) in entities.iter() {
                encoded.insert(id.clone(), core.schema.encode(entity)?);
            }
            collections.insert(name.clone(), Value::Object(encoded));
        }
        let Some(codec) = codec else { return Ok(()) };
        return persist::save_collections_to_file(
            inner.storage.as_ref(),
            path,
            codec.as_ref(),
            &collections,
            version,
        )
        .await;
    }

    let Some(name) = members.first() else {
        return Ok(());
    };
    let Some(core) = inner.collections.get(name) else {
        return Ok(());
    };
    let Some(plan) = &core.persistence else {
        return Ok(());
    };
    let entities = core.snapshot()?;
    persist::save_data(
        inner.storage.as_ref(),
        path,
        plan.codec.as_ref(),
        core.schema.as_ref(),
        &entities,
        plan.version,
        plan.prose_template.as_deref(),
    )
    .await
}

/// Schedule the debounced save covering one collection's file.
pub(crate) fn schedule_save(inner: &Arc<DatabaseInner>, collection: &str) {
    let Some(core) = inner.collections.get(collection) else {
        return;
    };
    let Some(plan) = &core.persistence else {
        return;
    };
    if plan.append_only {
        // Appends hit the file directly; flush writes the canonical form
        return;
    }
    let path = plan.path.clone();
    let effect_inner = Arc::clone(inner);
    let effect_path = path.clone();
    let effect: SaveEffect = Arc::new(move || {
        let inner = Arc::clone(&effect_inner);
        let path = effect_path.clone();
        Box::pin(async move { save_path(&inner, &path).await })
    });
    inner.writer.schedule(&path, effect);
}

/// An embedded ProseQL database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Build a database: validate plugins and collection references, load
    /// and migrate persistent collections, build indexes, wire the runtime.
    pub async fn open(config: DatabaseConfig) -> Result<Self> {
        let plugins = plugin::resolve(&config.plugins)?;

        // Collection references to plugin id generators
        for (name, collection) in &config.collections {
            if let Some(generator) = &collection.id_generator {
                if !plugins.id_generators.contains_key(generator) {
                    return Err(Error::Plugin {
                        plugin: generator.clone(),
                        reason: format!(
                            "collection {name} references unknown id generator '{generator}'"
                        ),
                    });
                }
            }
        }

        let mut registry = CodecRegistry::with_builtins();
        for codec in &plugins.codecs {
            registry.register(Arc::clone(codec));
        }

        // Group persistent collections by path so shared files load once
        let mut paths: BTreeMap<String, Vec<CollectionName>> = BTreeMap::new();
        for (name, collection) in &config.collections {
            if let Some(path) = &collection.file {
                paths.entry(path.clone()).or_default().push(name.clone());
            }
        }

        let mut loaded: BTreeMap<CollectionName, BTreeMap<EntityId, Entity>> = BTreeMap::new();
        let mut sorted_chains: BTreeMap<CollectionName, Vec<Migration>> = BTreeMap::new();

        for (path, members) in &paths {
            let mut codec: Option<Arc<dyn Codec>> = None;
            for name in members {
                let collection = &config.collections[name];
                let member_codec = match &collection.format {
                    Some(extension) => registry.by_extension(extension)?,
                    None => registry.by_path(path)?,
                };
                if let Some(existing) = &codec {
                    if existing.name() != member_codec.name() {
                        return Err(Error::validation(
                            "format",
                            format!("collections sharing '{path}' disagree on its format"),
                        ));
                    }
                } else {
                    codec = Some(member_codec);
                }
            }
            let Some(codec) = codec else { continue };

            for name in members {
                let collection = &config.collections[name];
                sorted_chains.insert(
                    name.clone(),
                    migrate::validate_chain(name, collection.version, &collection.migrations)?,
                );
            }

            if members.len() > 1 {
                let (raw_collections, stored_version) = persist::load_collections_from_file(
                    config.storage.as_ref(),
                    path,
                    codec.as_ref(),
                )
                .await?;
                for name in members {
                    let collection = &config.collections[name];
                    let raw = raw_collections.get(name).cloned().unwrap_or_default();
                    let migrated = migrate::apply_chain(
                        name,
                        stored_version,
                        collection.version,
                        &sorted_chains[name],
                        raw,
                    )?;
                    let entities = persist::decode_entities(
                        name,
                        collection.version,
                        stored_version,
                        collection.schema.as_ref(),
                        migrated,
                    )?;
                    loaded.insert(name.clone(), entities);
                }
            } else if let Some(name) = members.first() {
                let collection = &config.collections[name];
                let entities = persist::load_data(
                    config.storage.as_ref(),
                    path,
                    codec.as_ref(),
                    collection.schema.as_ref(),
                    name,
                    collection.version,
                    &sorted_chains[name],
                )
                .await?;
                loaded.insert(name.clone(), entities);
            }
        }

        // Assemble cores and build indexes from the loaded state
        let mut collections = BTreeMap::new();
        for (name, collection) in config.collections {
            let entities = loaded.remove(&name).unwrap_or_default();
            let mut indexes = IndexSet::new(
                &collection.indexes,
                &collection.unique,
                &collection.search_fields,
                &config.stop_words,
            );
            indexes.rebuild(&entities);

            let persistence = match &collection.file {
                Some(path) => {
                    let codec = match &collection.format {
                        Some(extension) => registry.by_extension(extension)?,
                        None => registry.by_path(path)?,
                    };
                    Some(PersistencePlan {
                        path: path.clone(),
                        codec,
                        version: collection.version,
                        migrations: sorted_chains.remove(&name).unwrap_or_default(),
                        append_only: collection.append_only,
                        prose_template: collection.prose_template.clone(),
                        shared: paths
                            .get(path)
                            .map(|members| members.len() > 1)
                            .unwrap_or(false),
                    })
                }
                None => None,
            };

            let id_generator: IdGenerator = match &collection.id_generator {
                Some(generator) => Arc::clone(&plugins.id_generators[generator]),
                None => Arc::new(|| uuid::Uuid::new_v4().to_string()),
            };

            tracing::debug!(
                collection = %name,
                entities = entities.len(),
                persistent = persistence.is_some(),
                "collection initialized"
            );

            collections.insert(
                name.clone(),
                Arc::new(CollectionCore {
                    name,
                    schema: collection.schema,
                    relationships: collection.relationships,
                    computed: collection.computed,
                    hooks: collection.hooks,
                    id_generator,
                    persistence,
                    search_fields: collection.search_fields,
                    stop_words: config.stop_words.clone(),
                    state: RwLock::new(CollectionState {
                        entities: Arc::new(entities),
                        indexes,
                    }),
                }),
            );
        }

        let inner = Arc::new(DatabaseInner {
            collections,
            writer: DebouncedWriter::new(config.persistence.debounce),
            bus: ChangeBus::new(256),
            tx_active: AtomicBool::new(false),
            reactive_debounce: config.reactive.debounce,
            storage: config.storage,
            plugins,
            clock: config.clock,
            paths,
        });
        tracing::info!(collections = inner.collections.len(), "database opened");
        Ok(Self { inner })
    }

    /// A handle to one collection.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        let core = self
            .inner
            .collections
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                collection: name.to_string(),
                id: String::new(),
            })?;
        Ok(Collection::new(
            Arc::clone(&self.inner),
            core,
            Arc::new(DirectSink {
                inner: Arc::clone(&self.inner),
            }),
        ))
    }

    /// Begin an explicit transaction.
    pub fn begin_transaction(&self) -> Result<Transaction> {
        Transaction::begin(Arc::clone(&self.inner))
    }

    /// Run a closure transactionally: commit on success, roll back on any
    /// failure, re-surfacing the original error.
    pub async fn transaction<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tx = self.begin_transaction()?;
        let handle = tx.clone();
        match f(tx).await {
            Ok(value) => {
                handle.commit()?;
                Ok(value)
            }
            Err(error) => {
                let _ = handle.rollback();
                Err(error)
            }
        }
    }

    /// Drain every pending save and write the canonical form of
    /// append-only collections.
    pub async fn flush(&self) -> Result<()> {
        let mut first_error = self.inner.writer.flush().await.err();

        for core in self.inner.collections.values() {
            let Some(plan) = &core.persistence else {
                continue;
            };
            if !plan.append_only {
                continue;
            }
            let entities = core.snapshot()?;
            let result = persist::save_data(
                self.inner.storage.as_ref(),
                &plan.path,
                plan.codec.as_ref(),
                core.schema.as_ref(),
                &entities,
                plan.version,
                plan.prose_template.as_deref(),
            )
            .await;
            if let Err(e) = result {
                tracing::error!(path = %plan.path, error = %e, "append-only flush failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Flush and release. Watches end when their handles drop.
    pub async fn close(self) -> Result<()> {
        self.flush().await
    }

    /// Report, per persistent collection, which migration steps a load
    /// would apply right now. Reads the files without touching state.
    pub async fn dry_run_migrations(&self) -> Result<Vec<DryRunReport>> {
        let mut reports = Vec::new();
        for (path, members) in &self.inner.paths {
            let stored_version = self.stored_version(path).await?;
            for name in members {
                let Some(core) = self.inner.collections.get(name) else {
                    continue;
                };
                let Some(plan) = &core.persistence else {
                    continue;
                };
                reports.push(migrate::dry_run(
                    name,
                    stored_version,
                    plan.version,
                    &plan.migrations,
                ));
            }
        }
        Ok(reports)
    }

    async fn stored_version(&self, path: &str) -> Result<SchemaVersion> {
        if !self.inner.storage.exists(path).await? {
            return Ok(0);
        }
        let members = self.inner.paths.get(path).cloned().unwrap_or_default();
        let Some(name) = members.first() else {
            return Ok(0);
        };
        let Some(core) = self.inner.collections.get(name) else {
            return Ok(0);
        };
        let Some(plan) = &core.persistence else {
            return Ok(0);
        };
        let bytes = self.inner.storage.read(path).await?;
        let value = plan.codec.decode(&bytes)?;
        Ok(value
            .get(persist::VERSION_KEY)
            .and_then(Value::as_u64)
            .map(|v| v as SchemaVersion)
            .unwrap_or(0))
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("collections", &self.inner.collections.keys().collect::<Vec<_>>())
            .finish()
    }
}
