//! File format codecs and the extension registry.
//!
//! A codec turns the top-level persisted value (an object keyed by entity id,
//! plus reserved `_`-prefixed envelope keys) into bytes and back. The
//! registry resolves codecs by file extension; plugin codecs may override the
//! built-ins, last registration wins.

use crate::error::Result;
use crate::Error;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A bidirectional encoder for one or more file extensions.
pub trait Codec: Send + Sync {
    /// Codec name used in serialization errors.
    fn name(&self) -> &str;

    /// File extensions (without the dot) this codec claims.
    fn extensions(&self) -> &[&str];

    /// Encode a top-level value into file bytes.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode file bytes into the top-level value.
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

fn serialization_error(codec: &dyn Codec, cause: impl std::fmt::Display) -> Error {
    Error::Serialization {
        format: codec.name().to_string(),
        message: cause.to_string(),
    }
}

/// Registry mapping file extensions to codecs.
pub struct CodecRegistry {
    by_extension: BTreeMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            by_extension: BTreeMap::new(),
        }
    }

    /// Create a registry with every built-in codec registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonCodec));
        registry.register(Arc::new(JsonlCodec));
        registry.register(Arc::new(YamlCodec));
        registry.register(Arc::new(MessagePackCodec));
        registry.register(Arc::new(crate::prose::ProseCodec::new()));
        registry
    }

    /// Register a codec for all of its extensions. Last registration wins.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        for ext in codec.extensions() {
            let ext = ext.to_ascii_lowercase();
            if let Some(previous) = self.by_extension.get(&ext) {
                tracing::warn!(
                    extension = %ext,
                    old = previous.name(),
                    new = codec.name(),
                    "codec extension overridden"
                );
            }
            self.by_extension.insert(ext, Arc::clone(&codec));
        }
    }

    /// Resolve a codec by bare extension (`"json"`).
    pub fn by_extension(&self, extension: &str) -> Result<Arc<dyn Codec>> {
        self.by_extension
            .get(&extension.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::UnsupportedFormat {
                format: extension.to_string(),
                registered: self.by_extension.keys().cloned().collect(),
            })
    }

    /// Resolve a codec from a file path's extension.
    pub fn by_path(&self, path: &str) -> Result<Arc<dyn Codec>> {
        let extension = path
            .rsplit('/')
            .next()
            .and_then(|file| file.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .unwrap_or("");
        self.by_extension(extension)
    }

    /// All registered extensions, sorted.
    pub fn extensions(&self) -> Vec<String> {
        self.by_extension.keys().cloned().collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// JSON codec: the whole file is one pretty-printed object.
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &str {
        "json"
    }

    fn extensions(&self) -> &[&str] {
        &["json"]
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(value).map_err(|e| serialization_error(self, e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| serialization_error(self, e))
    }
}

/// JSONL codec: one compact JSON object per line, keyed by each line's `id`.
///
/// The decoded top level is an object mapping id to entity; encoding walks
/// the object in key order and emits one line per entry.
pub struct JsonlCodec;

impl Codec for JsonlCodec {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn extensions(&self) -> &[&str] {
        &["jsonl", "ndjson"]
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let object = value
            .as_object()
            .ok_or_else(|| serialization_error(self, "top-level value must be an object"))?;
        let mut out = Vec::new();
        for (key, entity) in object {
            if key.starts_with('_') {
                continue;
            }
            let line =
                serde_json::to_vec(entity).map_err(|e| serialization_error(self, e))?;
            out.extend_from_slice(&line);
            out.push(b'\n');
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let text = std::str::from_utf8(bytes).map_err(|e| serialization_error(self, e))?;
        let mut object = serde_json::Map::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entity: Value = serde_json::from_str(line)
                .map_err(|e| serialization_error(self, format!("line {}: {e}", line_no + 1)))?;
            let id = entity
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    serialization_error(self, format!("line {}: missing string id", line_no + 1))
                })?
                .to_string();
            object.insert(id, entity);
        }
        Ok(Value::Object(object))
    }
}

/// YAML codec, structurally identical to JSON.
pub struct YamlCodec;

impl Codec for YamlCodec {
    fn name(&self) -> &str {
        "yaml"
    }

    fn extensions(&self) -> &[&str] {
        &["yaml", "yml"]
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_yaml::to_string(value)
            .map(String::into_bytes)
            .map_err(|e| serialization_error(self, e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_yaml::from_slice(bytes).map_err(|e| serialization_error(self, e))
    }
}

/// MessagePack codec, a compact binary mirror of the JSON envelope.
pub struct MessagePackCodec;

impl Codec for MessagePackCodec {
    fn name(&self) -> &str {
        "messagepack"
    }

    fn extensions(&self) -> &[&str] {
        &["msgpack", "mp"]
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| serialization_error(self, e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(bytes).map_err(|e| serialization_error(self, e))
    }
}
