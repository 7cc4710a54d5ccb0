//! Lifecycle hooks around mutations.
//!
//! Before-hooks run in registration order, each transforming the output of
//! the previous one; a failure aborts the mutation before any state change.
//! After-hooks and on-change listeners run once the state transition is
//! committed; their errors are logged and swallowed.

use crate::error::Result;
use crate::{CollectionName, Error};
use serde_json::Value;
use std::sync::Arc;

/// Context handed to every hook invocation.
pub struct HookContext<'a> {
    /// Collection the mutation targets
    pub collection: &'a str,
    /// Entity id, when known (update/delete)
    pub id: Option<&'a str>,
    /// Current entity for update/delete hooks
    pub existing: Option<&'a Value>,
}

/// A transforming, failable hook running before a mutation.
pub type BeforeHook = Arc<dyn Fn(&HookContext<'_>, Value) -> Result<Value> + Send + Sync>;

/// A fire-and-forget hook running after a committed mutation.
pub type AfterHook = Arc<dyn Fn(&HookContext<'_>, &Value) -> Result<()> + Send + Sync>;

/// A committed mutation, as seen by on-change listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange {
    Created {
        collection: CollectionName,
        entity: Value,
    },
    Updated {
        collection: CollectionName,
        before: Value,
        after: Value,
    },
    Deleted {
        collection: CollectionName,
        entity: Value,
    },
}

/// A fire-and-forget listener for committed changes.
pub type OnChangeHook = Arc<dyn Fn(&EntityChange) -> Result<()> + Send + Sync>;

/// The hook set of one collection.
#[derive(Default, Clone)]
pub struct Hooks {
    pub before_create: Vec<BeforeHook>,
    pub before_update: Vec<BeforeHook>,
    pub before_delete: Vec<BeforeHook>,
    pub after_create: Vec<AfterHook>,
    pub after_update: Vec<AfterHook>,
    pub after_delete: Vec<AfterHook>,
    pub on_change: Vec<OnChangeHook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("before_create", &self.before_create.len())
            .field("before_update", &self.before_update.len())
            .field("before_delete", &self.before_delete.len())
            .field("after_create", &self.after_create.len())
            .field("after_update", &self.after_update.len())
            .field("after_delete", &self.after_delete.len())
            .field("on_change", &self.on_change.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_create(
        mut self,
        hook: impl Fn(&HookContext<'_>, Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.before_create.push(Arc::new(hook));
        self
    }

    pub fn on_before_update(
        mut self,
        hook: impl Fn(&HookContext<'_>, Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.before_update.push(Arc::new(hook));
        self
    }

    pub fn on_before_delete(
        mut self,
        hook: impl Fn(&HookContext<'_>, Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.before_delete.push(Arc::new(hook));
        self
    }

    pub fn on_after_create(
        mut self,
        hook: impl Fn(&HookContext<'_>, &Value) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.after_create.push(Arc::new(hook));
        self
    }

    pub fn on_after_update(
        mut self,
        hook: impl Fn(&HookContext<'_>, &Value) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.after_update.push(Arc::new(hook));
        self
    }

    pub fn on_after_delete(
        mut self,
        hook: impl Fn(&HookContext<'_>, &Value) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.after_delete.push(Arc::new(hook));
        self
    }

    pub fn on_change(
        mut self,
        hook: impl Fn(&EntityChange) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_change.push(Arc::new(hook));
        self
    }
}

/// Run a before-hook chain, threading the value through each hook.
///
/// The first failure aborts with a [`Error::Hook`] naming the chain.
pub fn run_before(
    hooks: &[BeforeHook],
    hook_name: &str,
    ctx: &HookContext<'_>,
    mut value: Value,
) -> Result<Value> {
    for hook in hooks {
        value = hook(ctx, value).map_err(|e| match e {
            already @ Error::Hook { .. } => already,
            other => Error::Hook {
                collection: ctx.collection.to_string(),
                hook: hook_name.to_string(),
                message: other.to_string(),
            },
        })?;
    }
    Ok(value)
}

/// Run an after-hook chain, swallowing (and logging) failures.
pub fn run_after(hooks: &[AfterHook], hook_name: &str, ctx: &HookContext<'_>, value: &Value) {
    for hook in hooks {
        if let Err(e) = hook(ctx, value) {
            tracing::warn!(
                collection = ctx.collection,
                hook = hook_name,
                error = %e,
                "after-hook failed; mutation stands"
            );
        }
    }
}

/// Notify on-change listeners, swallowing (and logging) failures.
pub fn run_on_change(hooks: &[OnChangeHook], change: &EntityChange) {
    for hook in hooks {
        if let Err(e) = hook(change) {
            tracing::warn!(error = %e, "on-change listener failed; mutation stands");
        }
    }
}
