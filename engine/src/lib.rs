//! # ProseQL Engine
//!
//! An embedded, schema-first document database for application processes.
//!
//! Collections of typed entities live in memory behind copy-on-write maps,
//! optionally mirrored to files in pluggable formats (JSON, JSONL, YAML,
//! MessagePack, and the line-oriented `prose` row format).
//!
//! ## Core Concepts
//!
//! ### Collections and entities
//!
//! An entity is a JSON object with a unique string `id` and optional
//! `createdAt`/`updatedAt` ISO-8601 timestamps. Each collection binds a
//! schema ([`Schema`] or any [`EntitySchema`]), relationship descriptors,
//! secondary indexes, unique constraints, full-text search fields, lifecycle
//! hooks, and an optional file.
//!
//! ### Queries
//!
//! [`QueryConfig`] composes filter, sort, populate, select, offset/limit,
//! and cursor pagination. Candidates come from the full-text index, a
//! covering equality index, or a full scan; every path yields the same
//! items in the same order.
//!
//! ### Mutations
//!
//! `create`/`update`/`delete`/`upsert` (and their batch variants) run one
//! canonical pipeline: validation, hooks, uniqueness and foreign-key
//! checks, an atomic state replacement with index maintenance, then events
//! and debounced persistence.
//!
//! ### Transactions
//!
//! [`Database::transaction`] runs a closure under the single-writer
//! transaction flag: reads observe the transaction's own writes, commit
//! schedules the deferred saves and publishes the buffered events, and a
//! rollback restores every collection to its snapshot at begin.
//!
//! ## Quick Start
//!
//! ```rust
//! use proseql_engine::{
//!     CollectionConfig, Database, DatabaseConfig, FieldDef, FieldType, QueryConfig, Schema,
//! };
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> proseql_engine::error::Result<()> {
//! let config = DatabaseConfig::new().collection(
//!     "books",
//!     CollectionConfig::new(Schema::new(vec![
//!         FieldDef::required("title", FieldType::String),
//!         FieldDef::optional("year", FieldType::Int),
//!     ]))
//!     .search(&["title"]),
//! );
//! let db = Database::open(config).await?;
//!
//! let books = db.collection("books")?;
//! books.create(json!({"id": "b1", "title": "Dune", "year": 1965})).await?;
//!
//! let hits = books.query(QueryConfig::new().filter(json!({"$search": "dune"})))?;
//! assert_eq!(hits.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod codec;
pub mod collection;
pub mod database;
pub mod error;
pub mod events;
pub mod filter;
pub mod hooks;
pub mod index;
pub mod migrate;
pub mod patch;
pub mod persist;
pub mod plugin;
pub mod prose;
pub mod query;
pub mod schema;
pub mod storage;
pub mod transaction;
pub mod value;

// Re-export main types at crate root
pub use aggregate::{AggregateConfig, FieldArg};
pub use codec::{Codec, CodecRegistry};
pub use collection::{
    Collection, ComputedField, CreateManyOptions, CreateManyResult, DeleteOptions, RelationKind,
    Relationship, UpsertConfig, UpsertOutcome,
};
pub use database::{
    Clock, CollectionConfig, Database, DatabaseConfig, PersistenceConfig, ReactiveConfig,
};
pub use error::{Error, Issue, Result, StorageOp};
pub use events::{ChangeEvent, ChangeOp, Watch};
pub use hooks::{EntityChange, HookContext, Hooks};
pub use migrate::{DryRunReport, Migration, MigrationStep};
pub use patch::Patch;
pub use plugin::Plugin;
pub use prose::ProseCodec;
pub use query::{CursorConfig, Page, PageInfo, QueryConfig, SortDirection, SortKey};
pub use schema::{EntitySchema, FieldDef, FieldType, Schema};
pub use storage::{FsStorage, MemoryStorage, StorageAdapter, StorageWatch};
pub use transaction::Transaction;

/// Type aliases for clarity
pub type EntityId = String;
pub type CollectionName = String;
pub type SchemaVersion = u32;
/// An entity is a canonical JSON object.
pub type Entity = serde_json::Map<String, serde_json::Value>;
