//! Persistence tests: debounced writes, restart cycles, append-only logs,
//! migrations on load, and the prose file format end to end.

use proseql_engine::{
    CollectionConfig, Database, DatabaseConfig, DeleteOptions, Error, FieldDef, FieldType,
    MemoryStorage, Migration, PersistenceConfig, Schema, StorageAdapter,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn book_schema() -> Schema {
    Schema::new(vec![
        FieldDef::required("title", FieldType::String),
        FieldDef::optional("year", FieldType::Int),
    ])
}

fn fast_writes() -> PersistenceConfig {
    PersistenceConfig {
        debounce: Duration::from_millis(10),
    }
}

async fn open_books(storage: Arc<MemoryStorage>, path: &str) -> Database {
    let config = DatabaseConfig::new()
        .storage(storage)
        .persistence(fast_writes())
        .collection("books", CollectionConfig::new(book_schema()).file(path));
    Database::open(config).await.unwrap()
}

#[tokio::test]
async fn debounced_write_lands_after_delay() {
    let storage = Arc::new(MemoryStorage::new());
    let db = open_books(Arc::clone(&storage), "books.json").await;
    let books = db.collection("books").unwrap();

    books.create(json!({"id": "b1", "title": "Dune"})).await.unwrap();
    // Within the debounce window nothing is on disk yet
    assert!(storage.contents("books.json").is_none());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let raw: Value = serde_json::from_slice(&storage.contents("books.json").unwrap()).unwrap();
    assert_eq!(raw["b1"]["title"], "Dune");
}

#[tokio::test]
async fn burst_of_mutations_coalesces_into_one_file_state() {
    let storage = Arc::new(MemoryStorage::new());
    let db = open_books(Arc::clone(&storage), "books.json").await;
    let books = db.collection("books").unwrap();

    for n in 0..5 {
        books
            .create(json!({"id": format!("b{n}"), "title": format!("T{n}")}))
            .await
            .unwrap();
    }
    db.flush().await.unwrap();

    let raw: Value = serde_json::from_slice(&storage.contents("books.json").unwrap()).unwrap();
    assert_eq!(raw.as_object().unwrap().len(), 5);
}

#[tokio::test]
async fn restart_reloads_state() {
    let storage = Arc::new(MemoryStorage::new());
    {
        let db = open_books(Arc::clone(&storage), "books.json").await;
        let books = db.collection("books").unwrap();
        books
            .create(json!({"id": "b1", "title": "Dune", "year": 1965}))
            .await
            .unwrap();
        books.create(json!({"id": "b2", "title": "Dune Messiah"})).await.unwrap();
        books.delete("b2", DeleteOptions::default()).await.unwrap();
        db.close().await.unwrap();
    }

    let db = open_books(Arc::clone(&storage), "books.json").await;
    let books = db.collection("books").unwrap();
    let reloaded = books.find_by_id("b1").unwrap().unwrap();
    assert_eq!(reloaded["title"], "Dune");
    assert_eq!(reloaded["year"], 1965);
    assert!(books.find_by_id("b2").unwrap().is_none());
}

#[tokio::test]
async fn flush_twice_equals_flush_once() {
    let storage = Arc::new(MemoryStorage::new());
    let db = open_books(Arc::clone(&storage), "books.json").await;
    let books = db.collection("books").unwrap();
    books.create(json!({"id": "b1", "title": "Dune"})).await.unwrap();

    db.flush().await.unwrap();
    let first = storage.contents("books.json").unwrap();
    db.flush().await.unwrap();
    let second = storage.contents("books.json").unwrap();
    assert_eq!(first, second);
}

// ============================================================================
// Scenario 4: Append-only collections
// ============================================================================

#[tokio::test]
async fn append_only_appends_lines_and_rejects_rewrites() {
    let storage = Arc::new(MemoryStorage::new());
    let config = DatabaseConfig::new()
        .storage(Arc::clone(&storage) as Arc<dyn StorageAdapter>)
        .collection(
            "events",
            CollectionConfig::new(Schema::new(vec![FieldDef::required(
                "kind",
                FieldType::String,
            )]))
            .file("events.jsonl")
            .append_only(),
        );
    let db = Database::open(config).await.unwrap();
    let events = db.collection("events").unwrap();

    events.create(json!({"id": "e1", "kind": "start"})).await.unwrap();
    events.create(json!({"id": "e2", "kind": "stop"})).await.unwrap();

    // Exactly two non-empty lines, in insertion order, parsing to e1 then e2
    let text = String::from_utf8(storage.contents("events.jsonl").unwrap()).unwrap();
    let lines: Vec<Value> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["id"], "e1");
    assert_eq!(lines[1]["id"], "e2");

    // Mutating operations fail
    let result = events.update("e1", json!({"kind": "changed"})).await;
    assert!(matches!(result, Err(Error::Operation { reason }) if reason.contains("append-only")));
    assert!(matches!(
        events.delete("e1", DeleteOptions::default()).await,
        Err(Error::Operation { .. })
    ));
    assert!(matches!(
        events
            .upsert(proseql_engine::UpsertConfig {
                filter: json!({"id": "e1"}),
                create: json!({"kind": "x"}),
                update: json!({"kind": "y"}),
            })
            .await,
        Err(Error::Operation { .. })
    ));

    // Restart: the log replays into state
    drop(db);
    let config = DatabaseConfig::new()
        .storage(Arc::clone(&storage) as Arc<dyn StorageAdapter>)
        .collection(
            "events",
            CollectionConfig::new(Schema::new(vec![FieldDef::required(
                "kind",
                FieldType::String,
            )]))
            .file("events.jsonl")
            .append_only(),
        );
    let db = Database::open(config).await.unwrap();
    let events = db.collection("events").unwrap();
    let replayed = events.find_by_id("e1").unwrap().unwrap();
    assert_eq!(replayed["kind"], "start");
    assert_eq!(replayed["id"], lines[0]["id"]);
}

#[tokio::test]
async fn append_only_flush_writes_canonical_jsonl() {
    let storage = Arc::new(MemoryStorage::new());
    let config = DatabaseConfig::new()
        .storage(Arc::clone(&storage) as Arc<dyn StorageAdapter>)
        .collection(
            "events",
            CollectionConfig::new(Schema::new(vec![FieldDef::required(
                "kind",
                FieldType::String,
            )]))
            .file("events.jsonl")
            .append_only(),
        );
    let db = Database::open(config).await.unwrap();
    let events = db.collection("events").unwrap();
    events.create(json!({"id": "e2", "kind": "b"})).await.unwrap();
    events.create(json!({"id": "e1", "kind": "a"})).await.unwrap();

    db.flush().await.unwrap();
    let text = String::from_utf8(storage.contents("events.jsonl").unwrap()).unwrap();
    let ids: Vec<String> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str::<Value>(l).unwrap()["id"].as_str().unwrap().to_string())
        .collect();
    // Canonical form is id-ordered
    assert_eq!(ids, vec!["e1", "e2"]);
}

// ============================================================================
// Formats
// ============================================================================

#[tokio::test]
async fn yaml_file_round_trip() {
    let storage = Arc::new(MemoryStorage::new());
    {
        let db = open_books(Arc::clone(&storage), "books.yaml").await;
        db.collection("books")
            .unwrap()
            .create(json!({"id": "b1", "title": "Dune"}))
            .await
            .unwrap();
        db.close().await.unwrap();
    }
    let text = String::from_utf8(storage.contents("books.yaml").unwrap()).unwrap();
    assert!(text.contains("title: Dune"));

    let db = open_books(Arc::clone(&storage), "books.yaml").await;
    assert!(db.collection("books").unwrap().find_by_id("b1").unwrap().is_some());
}

#[tokio::test]
async fn messagepack_file_round_trip() {
    let storage = Arc::new(MemoryStorage::new());
    {
        let db = open_books(Arc::clone(&storage), "books.msgpack").await;
        db.collection("books")
            .unwrap()
            .create(json!({"id": "b1", "title": "Dune", "year": 1965}))
            .await
            .unwrap();
        db.close().await.unwrap();
    }
    let db = open_books(Arc::clone(&storage), "books.msgpack").await;
    let book = db.collection("books").unwrap().find_by_id("b1").unwrap().unwrap();
    assert_eq!(book["year"], 1965);
}

#[tokio::test]
async fn format_override_beats_extension() {
    let storage = Arc::new(MemoryStorage::new());
    let config = DatabaseConfig::new()
        .storage(Arc::clone(&storage) as Arc<dyn StorageAdapter>)
        .collection(
            "books",
            CollectionConfig::new(book_schema()).file("books.dat").format("json"),
        );
    let db = Database::open(config).await.unwrap();
    db.collection("books")
        .unwrap()
        .create(json!({"id": "b1", "title": "Dune"}))
        .await
        .unwrap();
    db.flush().await.unwrap();

    let raw: Value = serde_json::from_slice(&storage.contents("books.dat").unwrap()).unwrap();
    assert_eq!(raw["b1"]["title"], "Dune");
}

#[tokio::test]
async fn unknown_extension_fails_at_open() {
    let config = DatabaseConfig::new().collection(
        "books",
        CollectionConfig::new(book_schema()).file("books.toml"),
    );
    let result = Database::open(config).await;
    assert!(matches!(result, Err(Error::UnsupportedFormat { format, .. }) if format == "toml"));
}

// ============================================================================
// Scenario 5: Prose files
// ============================================================================

#[tokio::test]
async fn prose_file_end_to_end() {
    let storage = Arc::new(MemoryStorage::new());
    let template = "#{id} \"{title}\" ({year})";
    let config = DatabaseConfig::new()
        .storage(Arc::clone(&storage) as Arc<dyn StorageAdapter>)
        .collection(
            "books",
            CollectionConfig::new(book_schema())
                .file("books.prose")
                .prose_template(template),
        );
    let db = Database::open(config).await.unwrap();
    db.collection("books")
        .unwrap()
        .create(json!({"id": "b1", "title": "Written by Me", "year": 2026}))
        .await
        .unwrap();
    db.flush().await.unwrap();

    let text = String::from_utf8(storage.contents("books.prose").unwrap()).unwrap();
    assert!(text.starts_with("@prose #{id} \"{title}\" ({year})\n"));
    assert!(text.contains("#b1 \"Written by Me\" (2026)\n"));

    // Reload through the same file
    let config = DatabaseConfig::new()
        .storage(Arc::clone(&storage) as Arc<dyn StorageAdapter>)
        .collection(
            "books",
            CollectionConfig::new(book_schema())
                .file("books.prose")
                .prose_template(template),
        );
    let db = Database::open(config).await.unwrap();
    let book = db.collection("books").unwrap().find_by_id("b1").unwrap().unwrap();
    assert_eq!(book["title"], "Written by Me");
    assert_eq!(book["year"], 2026);
}

// ============================================================================
// Shared files
// ============================================================================

#[tokio::test]
async fn collections_sharing_one_file() {
    let storage = Arc::new(MemoryStorage::new());
    let open = |storage: Arc<MemoryStorage>| async move {
        let config = DatabaseConfig::new()
            .storage(storage)
            .persistence(fast_writes())
            .collection(
                "users",
                CollectionConfig::new(Schema::new(vec![FieldDef::required(
                    "name",
                    FieldType::String,
                )]))
                .file("db.json"),
            )
            .collection(
                "companies",
                CollectionConfig::new(Schema::new(vec![FieldDef::required(
                    "name",
                    FieldType::String,
                )]))
                .file("db.json"),
            );
        Database::open(config).await.unwrap()
    };

    {
        let db = open(Arc::clone(&storage)).await;
        db.collection("users")
            .unwrap()
            .create(json!({"id": "u1", "name": "A"}))
            .await
            .unwrap();
        db.collection("companies")
            .unwrap()
            .create(json!({"id": "c1", "name": "Acme"}))
            .await
            .unwrap();
        db.close().await.unwrap();
    }

    let raw: Value = serde_json::from_slice(&storage.contents("db.json").unwrap()).unwrap();
    assert_eq!(raw["users"]["u1"]["name"], "A");
    assert_eq!(raw["companies"]["c1"]["name"], "Acme");

    let db = open(Arc::clone(&storage)).await;
    assert!(db.collection("users").unwrap().find_by_id("u1").unwrap().is_some());
    assert!(db.collection("companies").unwrap().find_by_id("c1").unwrap().is_some());
}

// ============================================================================
// Migrations on load
// ============================================================================

fn rename_migration(from: u32, old: &'static str, new: &'static str) -> Migration {
    Migration::new(from, from + 1, move |mut data| {
        for entity in data.values_mut() {
            if let Some(object) = entity.as_object_mut() {
                if let Some(value) = object.remove(old) {
                    object.insert(new.to_string(), value);
                }
            }
        }
        Ok(data)
    })
}

#[tokio::test]
async fn migrations_upgrade_old_files_on_load() {
    let storage = Arc::new(MemoryStorage::new());
    // A version-0 file from an older deployment using "name"
    storage
        .write(
            "books.json",
            json!({"b1": {"id": "b1", "name": "Dune"}}).to_string().as_bytes(),
        )
        .await
        .unwrap();

    let config = DatabaseConfig::new()
        .storage(Arc::clone(&storage) as Arc<dyn StorageAdapter>)
        .collection(
            "books",
            CollectionConfig::new(book_schema())
                .file("books.json")
                .version(1)
                .migration(rename_migration(0, "name", "title").with_description("rename name")),
        );
    let db = Database::open(config).await.unwrap();
    let book = db.collection("books").unwrap().find_by_id("b1").unwrap().unwrap();
    assert_eq!(book["title"], "Dune");

    // The next save stamps the target version (invariant 6)
    db.flush().await.unwrap();
    let raw: Value = serde_json::from_slice(&storage.contents("books.json").unwrap()).unwrap();
    assert_eq!(raw["_version"], 1);

    // Reopening the migrated file applies nothing further
    let config = DatabaseConfig::new()
        .storage(Arc::clone(&storage) as Arc<dyn StorageAdapter>)
        .collection(
            "books",
            CollectionConfig::new(book_schema())
                .file("books.json")
                .version(1)
                .migration(rename_migration(0, "name", "title")),
        );
    let db = Database::open(config).await.unwrap();
    let reports = db.dry_run_migrations().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].steps.is_empty());
    assert_eq!(reports[0].stored_version, 1);
}

#[tokio::test]
async fn invalid_chain_aborts_open() {
    let config = DatabaseConfig::new().collection(
        "books",
        CollectionConfig::new(book_schema())
            .file("books.json")
            .version(2)
            .migration(rename_migration(0, "a", "b")),
    );
    let result = Database::open(config).await;
    assert!(matches!(result, Err(Error::Migration { .. })));
}

#[tokio::test]
async fn failing_transform_aborts_open() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write("books.json", json!({"b1": {"id": "b1"}}).to_string().as_bytes())
        .await
        .unwrap();

    let config = DatabaseConfig::new()
        .storage(storage)
        .collection(
            "books",
            CollectionConfig::new(book_schema())
                .file("books.json")
                .version(1)
                .migration(Migration::new(0, 1, |_| Err(Error::operation("corrupt")))),
        );
    let result = Database::open(config).await;
    assert!(matches!(result, Err(Error::Migration { step: 0, .. })));
}

#[tokio::test]
async fn dry_run_reports_pending_steps() {
    let storage = Arc::new(MemoryStorage::new());
    storage
        .write(
            "books.json",
            json!({"_version": 1, "b1": {"id": "b1", "title": "Dune"}})
                .to_string()
                .as_bytes(),
        )
        .await
        .unwrap();

    let config = DatabaseConfig::new()
        .storage(storage)
        .collection(
            "books",
            CollectionConfig::new(book_schema())
                .file("books.json")
                .version(2)
                .migration(rename_migration(0, "a", "b"))
                .migration(rename_migration(1, "b", "c").with_description("second hop")),
        );
    let db = Database::open(config).await.unwrap();

    let reports = db.dry_run_migrations().await.unwrap();
    assert_eq!(reports.len(), 1);
    // flush has not run; the stored file is still at version 1, so only the
    // 1 -> 2 step is pending
    assert_eq!(reports[0].steps.len(), 1);
    assert_eq!(reports[0].steps[0].from, 1);
    assert_eq!(reports[0].steps[0].description.as_deref(), Some("second hop"));
}

// ============================================================================
// Local filesystem storage
// ============================================================================

#[tokio::test]
async fn fs_storage_full_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data/books.json").to_string_lossy().into_owned();
    let open = |path: String| async move {
        let config = DatabaseConfig::new()
            .storage(Arc::new(proseql_engine::FsStorage::new()))
            .persistence(fast_writes())
            .collection("books", CollectionConfig::new(book_schema()).file(path.clone()));
        Database::open(config).await.unwrap()
    };

    {
        let db = open(path.clone()).await;
        db.collection("books")
            .unwrap()
            .create(json!({"id": "b1", "title": "Dune"}))
            .await
            .unwrap();
        db.close().await.unwrap();
    }

    let db = open(path).await;
    assert!(db.collection("books").unwrap().find_by_id("b1").unwrap().is_some());
}
