//! Schema definition and validation.
//!
//! Every collection is bound to a schema that decodes untrusted input into a
//! canonical entity and encodes entities back into wire values. Schemas are
//! abstract behind [`EntitySchema`]; the runtime representation here
//! ([`Schema`] built from [`FieldDef`]s) is the default implementation.

use crate::error::{Issue, Result};
use crate::value::type_name;
use crate::{Entity, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field types supported in runtime schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// ISO-8601 / RFC 3339 timestamp string
    Timestamp,
    Array,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Int => write!(f, "int"),
            FieldType::Float => write!(f, "float"),
            FieldType::Bool => write!(f, "bool"),
            FieldType::Timestamp => write!(f, "timestamp"),
            FieldType::Array => write!(f, "array"),
            FieldType::Json => write!(f, "json"),
        }
    }
}

/// Definition of a field in a collection schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field must be present and non-null
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    fn check(&self, value: Option<&Value>, issues: &mut Vec<Issue>) {
        match value {
            None | Some(Value::Null) => {
                if self.required {
                    issues.push(Issue::new(&self.name, "required field is missing"));
                }
            }
            Some(v) => {
                if !self.accepts(v) {
                    issues.push(Issue::new(
                        &self.name,
                        format!("expected {}, got {}", self.field_type, type_name(v)),
                    ));
                }
            }
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value
                .as_str()
                .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
                .unwrap_or(false),
            FieldType::Array => value.is_array(),
            FieldType::Json => true,
        }
    }
}

/// Decode untrusted input into a canonical entity and encode entities back
/// into wire values.
///
/// Implementations must not mutate their input, must produce encodings every
/// registered codec accepts (plain JSON values), and must report problems as
/// dotted-path [`Issue`]s inside [`Error::Validation`].
pub trait EntitySchema: Send + Sync {
    /// Validate and canonicalize an input value into an entity.
    fn decode(&self, value: &Value) -> Result<Entity>;

    /// Encode an entity into a wire value.
    fn encode(&self, entity: &Entity) -> Result<Value>;

    /// Whether the schema declares a field with this name.
    ///
    /// Soft delete is only offered when the schema has a `deletedAt` field.
    fn has_field(&self, name: &str) -> bool;
}

/// Runtime schema for one collection.
///
/// Unknown fields pass through untouched; declared fields are type-checked.
/// `id` is always required as a string, `createdAt`/`updatedAt` are always
/// accepted as timestamps whether declared or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Field definitions
    pub fields: Vec<FieldDef>,
}

impl Schema {
    /// Create a schema from field definitions.
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    /// Builder-style method to add a field.
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }
}

const ID_FIELD: &str = "id";
const CREATED_AT_FIELD: &str = "createdAt";
const UPDATED_AT_FIELD: &str = "updatedAt";

fn check_timestamp(object: &Entity, name: &str, issues: &mut Vec<Issue>) {
    if let Some(value) = object.get(name) {
        let ok = value
            .as_str()
            .map(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok())
            .unwrap_or(false);
        if !ok {
            issues.push(Issue::new(name, "expected an ISO-8601 timestamp string"));
        }
    }
}

impl EntitySchema for Schema {
    fn decode(&self, value: &Value) -> Result<Entity> {
        let Some(object) = value.as_object() else {
            return Err(Error::validation(
                "",
                format!("expected an object, got {}", type_name(value)),
            ));
        };

        let mut issues = Vec::new();

        match object.get(ID_FIELD) {
            Some(Value::String(s)) if !s.is_empty() => {}
            Some(Value::String(_)) => issues.push(Issue::new(ID_FIELD, "id must be non-empty")),
            Some(v) => issues.push(Issue::new(
                ID_FIELD,
                format!("expected string id, got {}", type_name(v)),
            )),
            None => issues.push(Issue::new(ID_FIELD, "required field is missing")),
        }
        check_timestamp(object, CREATED_AT_FIELD, &mut issues);
        check_timestamp(object, UPDATED_AT_FIELD, &mut issues);

        for field in &self.fields {
            // id and timestamps were already checked above
            if field.name == ID_FIELD
                || field.name == CREATED_AT_FIELD
                || field.name == UPDATED_AT_FIELD
            {
                continue;
            }
            field.check(object.get(&field.name), &mut issues);
        }

        if issues.is_empty() {
            Ok(object.clone())
        } else {
            Err(Error::Validation { issues })
        }
    }

    fn encode(&self, entity: &Entity) -> Result<Value> {
        // Entities are already canonical JSON objects; encoding is the
        // identity mapping, which every registered codec accepts.
        Ok(Value::Object(entity.clone()))
    }

    fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn book_schema() -> Schema {
        Schema::new(vec![
            FieldDef::required("title", FieldType::String),
            FieldDef::optional("year", FieldType::Int),
            FieldDef::optional("tags", FieldType::Array),
        ])
    }

    #[test]
    fn decode_valid_entity() {
        let schema = book_schema();
        let input = json!({"id": "b1", "title": "Dune", "year": 1965});
        let entity = schema.decode(&input).unwrap();
        assert_eq!(entity.get("title"), Some(&json!("Dune")));
        // Input is untouched
        assert_eq!(input["id"], "b1");
    }

    #[test]
    fn decode_missing_id() {
        let schema = book_schema();
        let result = schema.decode(&json!({"title": "Dune"}));
        assert!(matches!(result, Err(Error::Validation { issues }) if issues[0].path == "id"));
    }

    #[test]
    fn decode_type_mismatch_reports_path() {
        let schema = book_schema();
        let result = schema.decode(&json!({"id": "b1", "title": 42}));
        match result {
            Err(Error::Validation { issues }) => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].path, "title");
                assert_eq!(issues[0].message, "expected string, got number");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn decode_collects_multiple_issues() {
        let schema = book_schema();
        let result = schema.decode(&json!({"title": 42, "year": "old"}));
        match result {
            Err(Error::Validation { issues }) => assert_eq!(issues.len(), 3),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_non_object() {
        let schema = book_schema();
        assert!(schema.decode(&json!([1, 2])).is_err());
    }

    #[test]
    fn decode_validates_timestamps() {
        let schema = book_schema();
        let bad = json!({"id": "b1", "title": "Dune", "createdAt": "yesterday"});
        assert!(schema.decode(&bad).is_err());

        let good = json!({"id": "b1", "title": "Dune", "createdAt": "2026-01-02T03:04:05Z"});
        assert!(schema.decode(&good).is_ok());
    }

    #[test]
    fn unknown_fields_pass_through() {
        let schema = book_schema();
        let entity = schema
            .decode(&json!({"id": "b1", "title": "Dune", "extra": {"a": 1}}))
            .unwrap();
        assert_eq!(entity.get("extra"), Some(&json!({"a": 1})));
    }

    #[test]
    fn encode_is_codec_safe() {
        let schema = book_schema();
        let entity = schema.decode(&json!({"id": "b1", "title": "Dune"})).unwrap();
        let wire = schema.encode(&entity).unwrap();
        assert!(wire.is_object());
        assert!(serde_json::to_string(&wire).is_ok());
    }

    #[test]
    fn has_field() {
        let schema =
            book_schema().with_field(FieldDef::optional("deletedAt", FieldType::Timestamp));
        assert!(schema.has_field("deletedAt"));
        assert!(!schema.has_field("publisher"));
    }
}
