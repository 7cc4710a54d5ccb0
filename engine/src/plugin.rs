//! Plugins: custom codecs, filter operators, and id generators.
//!
//! Plugins are validated together at database construction; a bad plugin
//! fails the build before any file is touched.

use crate::codec::Codec;
use crate::error::Result;
use crate::filter::PluginOperator;
use crate::Error;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Named id generator supplied by a plugin.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Operator names reserved by the engine: filter, logical, and update
/// operators a plugin may not shadow.
const BUILTIN_OPERATORS: &[&str] = &[
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$startsWith", "$endsWith",
    "$contains", "$all", "$size", "$search", "$or", "$and", "$not", "$set", "$increment",
    "$decrement", "$multiply", "$append", "$prepend", "$remove", "$toggle",
];

/// A plugin bundle.
#[derive(Clone, Default)]
pub struct Plugin {
    pub name: String,
    pub codecs: Vec<Arc<dyn Codec>>,
    pub operators: BTreeMap<String, PluginOperator>,
    pub id_generators: BTreeMap<String, IdGenerator>,
    pub depends_on: Vec<String>,
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("codecs", &self.codecs.len())
            .field("operators", &self.operators.keys().collect::<Vec<_>>())
            .field("id_generators", &self.id_generators.keys().collect::<Vec<_>>())
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

impl Plugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codecs.push(codec);
        self
    }

    pub fn with_operator(
        mut self,
        name: impl Into<String>,
        operator: impl Fn(Option<&Value>, &Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.operators.insert(name.into(), Arc::new(operator));
        self
    }

    pub fn with_id_generator(
        mut self,
        name: impl Into<String>,
        generator: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.id_generators.insert(name.into(), Arc::new(generator));
        self
    }

    pub fn with_dependency(mut self, plugin: impl Into<String>) -> Self {
        self.depends_on.push(plugin.into());
        self
    }
}

/// Everything the database keeps from the validated plugin set.
#[derive(Clone, Default)]
pub(crate) struct ResolvedPlugins {
    pub operators: BTreeMap<String, PluginOperator>,
    pub id_generators: BTreeMap<String, IdGenerator>,
    pub codecs: Vec<Arc<dyn Codec>>,
}

impl std::fmt::Debug for ResolvedPlugins {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedPlugins")
            .field("operators", &self.operators.keys().collect::<Vec<_>>())
            .field("id_generators", &self.id_generators.keys().collect::<Vec<_>>())
            .field("codecs", &self.codecs.iter().map(|c| c.name()).collect::<Vec<_>>())
            .finish()
    }
}

fn plugin_error(plugin: &str, reason: impl Into<String>) -> Error {
    Error::Plugin {
        plugin: plugin.to_string(),
        reason: reason.into(),
    }
}

/// Validate a plugin set and merge it into a resolved registry.
pub(crate) fn resolve(plugins: &[Plugin]) -> Result<ResolvedPlugins> {
    let mut names = BTreeSet::new();
    for plugin in plugins {
        if plugin.name.is_empty() {
            return Err(plugin_error("", "plugin name must be non-empty"));
        }
        if !names.insert(plugin.name.as_str()) {
            return Err(plugin_error(&plugin.name, "duplicate plugin name"));
        }
    }

    // Dependency closure: every dependency is a registered plugin
    for plugin in plugins {
        for dependency in &plugin.depends_on {
            if !names.contains(dependency.as_str()) {
                return Err(plugin_error(
                    &plugin.name,
                    format!("missing dependency '{dependency}'"),
                ));
            }
        }
    }

    let mut resolved = ResolvedPlugins::default();
    let mut operator_owner: BTreeMap<&str, &str> = BTreeMap::new();
    let mut generator_owner: BTreeMap<&str, &str> = BTreeMap::new();

    for plugin in plugins {
        for (name, operator) in &plugin.operators {
            if !name.starts_with('$') || name.len() < 2 {
                return Err(plugin_error(
                    &plugin.name,
                    format!("operator '{name}' must start with '$'"),
                ));
            }
            if BUILTIN_OPERATORS.contains(&name.as_str()) {
                return Err(plugin_error(
                    &plugin.name,
                    format!("operator '{name}' conflicts with a built-in"),
                ));
            }
            if let Some(owner) = operator_owner.insert(name, &plugin.name) {
                return Err(plugin_error(
                    &plugin.name,
                    format!("operator '{name}' already registered by plugin '{owner}'"),
                ));
            }
            resolved.operators.insert(name.clone(), Arc::clone(operator));
        }

        for (name, generator) in &plugin.id_generators {
            if name.is_empty() {
                return Err(plugin_error(&plugin.name, "id generator name must be non-empty"));
            }
            if let Some(owner) = generator_owner.insert(name, &plugin.name) {
                return Err(plugin_error(
                    &plugin.name,
                    format!("id generator '{name}' already registered by plugin '{owner}'"),
                ));
            }
            resolved.id_generators.insert(name.clone(), Arc::clone(generator));
        }

        for codec in &plugin.codecs {
            if codec.name().is_empty() || codec.extensions().is_empty() {
                return Err(plugin_error(
                    &plugin.name,
                    "codec must have a name and at least one extension",
                ));
            }
            resolved.codecs.push(Arc::clone(codec));
        }
    }

    Ok(resolved)
}
