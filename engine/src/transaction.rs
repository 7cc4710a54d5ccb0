//! Transactions: single-writer snapshot, commit, and rollback.
//!
//! A mutation's side channel (mutation tracking, persistence scheduling,
//! event publication) is abstracted behind [`MutationSink`]; the normal
//! sink schedules saves and publishes immediately, the transactional sink
//! records collection names, defers saves to commit, and buffers events so
//! a rollback emits nothing.

use crate::database::DatabaseInner;
use crate::error::Result;
use crate::events::ChangeEvent;
use crate::{Collection, Entity, EntityId, Error};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Side channel of a mutation, chosen by execution context.
pub(crate) trait MutationSink: Send + Sync {
    /// Fail fast when the execution context is no longer usable.
    fn ensure_active(&self) -> Result<()>;

    /// Record that a collection was mutated.
    fn add_mutation(&self, collection: &str);

    /// Schedule the collection's debounced save.
    fn schedule_save(&self, collection: &str);

    /// Publish a committed change event.
    fn publish_change(&self, event: ChangeEvent);
}

/// Sink for ordinary (non-transactional) execution.
pub(crate) struct DirectSink {
    pub inner: Arc<DatabaseInner>,
}

impl MutationSink for DirectSink {
    fn ensure_active(&self) -> Result<()> {
        Ok(())
    }

    fn add_mutation(&self, _collection: &str) {}

    fn schedule_save(&self, collection: &str) {
        crate::database::schedule_save(&self.inner, collection);
    }

    fn publish_change(&self, event: ChangeEvent) {
        self.inner.bus.publish(event);
    }
}

struct TxState {
    active: AtomicBool,
    snapshots: Mutex<BTreeMap<String, Arc<BTreeMap<EntityId, Entity>>>>,
    mutated: Mutex<BTreeSet<String>>,
    buffered: Mutex<Vec<ChangeEvent>>,
}

fn tx_error(operation: &str, reason: impl Into<String>) -> Error {
    Error::Transaction {
        operation: operation.to_string(),
        reason: reason.into(),
    }
}

/// Sink for mutations inside a transaction: saves are deferred to commit,
/// events are buffered, and the touched collections are tracked.
pub(crate) struct TxSink {
    state: Arc<TxState>,
}

impl MutationSink for TxSink {
    fn ensure_active(&self) -> Result<()> {
        if self.state.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(tx_error("operation", "transaction is no longer active"))
        }
    }

    fn add_mutation(&self, collection: &str) {
        if let Ok(mut mutated) = self.state.mutated.lock() {
            mutated.insert(collection.to_string());
        }
    }

    fn schedule_save(&self, _collection: &str) {
        // Deferred to commit
    }

    fn publish_change(&self, event: ChangeEvent) {
        if let Ok(mut buffered) = self.state.buffered.lock() {
            buffered.push(event);
        }
    }
}

/// An active transaction.
///
/// Exactly one transaction may be live per database; reads inside observe
/// the transaction's own writes, and a rollback restores every collection
/// to its snapshot at begin.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<DatabaseInner>,
    state: Arc<TxState>,
}

impl Transaction {
    /// Begin a transaction: flip the database's transaction flag and capture
    /// an O(1) snapshot (a reference) of every collection's entity map.
    pub(crate) fn begin(inner: Arc<DatabaseInner>) -> Result<Self> {
        if inner
            .tx_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(tx_error("begin", "a transaction is already active"));
        }

        let mut snapshots = BTreeMap::new();
        for (name, core) in &inner.collections {
            let state = core.state.read().map_err(|_| {
                inner.tx_active.store(false, Ordering::SeqCst);
                tx_error("begin", format!("state lock poisoned for {name}"))
            })?;
            snapshots.insert(name.clone(), Arc::clone(&state.entities));
        }

        Ok(Self {
            inner,
            state: Arc::new(TxState {
                active: AtomicBool::new(true),
                snapshots: Mutex::new(snapshots),
                mutated: Mutex::new(BTreeSet::new()),
                buffered: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Access a collection inside this transaction.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        self.ensure_active()?;
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
            Arc::new(TxSink {
                state: Arc::clone(&self.state),
            }),
        ))
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(tx_error("operation", "transaction is no longer active"))
        }
    }

    fn deactivate(&self) -> Result<()> {
        if self
            .state
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(tx_error("end", "transaction is no longer active"));
        }
        Ok(())
    }

    /// Commit: schedule saves for every mutated collection, publish the
    /// buffered events in order, release the transaction flag.
    pub fn commit(&self) -> Result<()> {
        self.deactivate()?;

        let mutated = self
            .state
            .mutated
            .lock()
            .map(|m| m.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        for name in mutated {
            crate::database::schedule_save(&self.inner, &name);
        }

        let buffered = self
            .state
            .buffered
            .lock()
            .map(|mut b| std::mem::take(&mut *b))
            .unwrap_or_default();
        for event in buffered {
            self.inner.bus.publish(event);
        }

        self.inner.tx_active.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Roll back: restore every snapshot, rebuild the affected indexes,
    /// release the flag. Always returns the transaction error so callers
    /// short-circuit.
    pub fn rollback(&self) -> Error {
        if self.deactivate().is_err() {
            return tx_error("rollback", "transaction is no longer active");
        }

        let snapshots = self
            .state
            .snapshots
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default();
        for (name, snapshot) in snapshots {
            let Some(core) = self.inner.collections.get(&name) else {
                continue;
            };
            if let Ok(mut state) = core.state.write() {
                // Only rebuild where the map actually moved
                if !Arc::ptr_eq(&state.entities, &snapshot) {
                    state.entities = snapshot;
                    let entities = Arc::clone(&state.entities);
                    state.indexes.rebuild(&entities);
                }
            }
        }

        // Buffered events are discarded: a rolled-back transaction is silent
        if let Ok(mut buffered) = self.state.buffered.lock() {
            buffered.clear();
        }

        self.inner.tx_active.store(false, Ordering::SeqCst);
        tx_error("rollback", "rolled back")
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("active", &self.state.active.load(Ordering::SeqCst))
            .finish()
    }
}
