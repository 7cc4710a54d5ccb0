//! Error types for the ProseQL engine.

use crate::{CollectionName, EntityId, SchemaVersion};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single schema or constraint violation, addressed by dotted field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    /// Dotted path to the offending field (`"address.city"`)
    pub path: String,
    /// Human-readable description of the problem
    pub message: String,
}

impl Issue {
    /// Create an issue for a field path.
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Storage operation that failed, carried inside [`Error::Storage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageOp {
    Read,
    Write,
    Append,
    Exists,
    Remove,
    EnsureDir,
    Watch,
}

impl std::fmt::Display for StorageOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageOp::Read => "read",
            StorageOp::Write => "write",
            StorageOp::Append => "append",
            StorageOp::Exists => "exists",
            StorageOp::Remove => "remove",
            StorageOp::EnsureDir => "ensureDir",
            StorageOp::Watch => "watch",
        };
        write!(f, "{name}")
    }
}

/// All possible errors from the ProseQL engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Schema and constraint errors
    #[error("validation failed: {}", format_issues(.issues))]
    Validation { issues: Vec<Issue> },

    #[error("entity not found: {collection}/{id}")]
    NotFound {
        collection: CollectionName,
        id: EntityId,
    },

    #[error("foreign key '{field}' on {collection} references missing {target_collection}/{value}")]
    ForeignKey {
        collection: CollectionName,
        field: String,
        target_collection: CollectionName,
        value: String,
    },

    #[error("unique constraint on {collection} ({}) violated by ({})", .fields.join(", "), format_values(.values))]
    UniqueConstraint {
        collection: CollectionName,
        fields: Vec<String>,
        values: Vec<serde_json::Value>,
    },

    #[error("duplicate key in {collection}: {id}")]
    DuplicateKey {
        collection: CollectionName,
        id: EntityId,
    },

    // Mutation pipeline errors
    #[error("hook '{hook}' failed on {collection}: {message}")]
    Hook {
        collection: CollectionName,
        hook: String,
        message: String,
    },

    #[error("operation not permitted: {reason}")]
    Operation { reason: String },

    #[error("transaction {operation} failed: {reason}")]
    Transaction { operation: String, reason: String },

    // Persistence errors
    #[error("storage {operation} failed for '{path}': {message}")]
    Storage {
        path: String,
        operation: StorageOp,
        message: String,
    },

    #[error("serialization failed in codec '{format}': {message}")]
    Serialization { format: String, message: String },

    #[error("unsupported format '{format}' (registered: {})", .registered.join(", "))]
    UnsupportedFormat {
        format: String,
        registered: Vec<String>,
    },

    #[error("migration of {collection} from v{from_version} to v{to_version} failed at step {step}: {reason}")]
    Migration {
        collection: CollectionName,
        from_version: SchemaVersion,
        to_version: SchemaVersion,
        /// Index of the failing step in the sorted chain; -1 for the
        /// post-migration schema decode.
        step: i64,
        reason: String,
    },

    #[error("plugin '{plugin}' rejected: {reason}")]
    Plugin { plugin: String, reason: String },
}

impl Error {
    /// Shorthand for a single-issue validation error.
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            issues: vec![Issue::new(path, message)],
        }
    }

    /// Shorthand for an operation error.
    pub fn operation(reason: impl Into<String>) -> Self {
        Error::Operation {
            reason: reason.into(),
        }
    }
}

fn format_issues(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(Issue::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_values(values: &[serde_json::Value]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_display() {
        let err = Error::NotFound {
            collection: "users".into(),
            id: "u1".into(),
        };
        assert_eq!(err.to_string(), "entity not found: users/u1");

        let err = Error::validation("age", "expected a number");
        assert_eq!(
            err.to_string(),
            "validation failed: age: expected a number"
        );

        let err = Error::UniqueConstraint {
            collection: "users".into(),
            fields: vec!["email".into()],
            values: vec![json!("a@b.c")],
        };
        assert_eq!(
            err.to_string(),
            "unique constraint on users (email) violated by (\"a@b.c\")"
        );
    }

    #[test]
    fn storage_error_fields() {
        let err = Error::Storage {
            path: "data/users.json".into(),
            operation: StorageOp::EnsureDir,
            message: "permission denied".into(),
        };
        assert_eq!(
            err.to_string(),
            "storage ensureDir failed for 'data/users.json': permission denied"
        );
    }

    #[test]
    fn migration_error_display() {
        let err = Error::Migration {
            collection: "books".into(),
            from_version: 0,
            to_version: 2,
            step: 1,
            reason: "transform dropped id".into(),
        };
        assert_eq!(
            err.to_string(),
            "migration of books from v0 to v2 failed at step 1: transform dropped id"
        );
    }
}
