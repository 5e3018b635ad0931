//! Identity map scoped to one unit of work.
//!
//! A [`PersistenceContext`] guarantees one [`EntityInstance`] per
//! [`EntityKey`] for as long as the unit of work lives. It is an explicit
//! value passed by reference through query execution, never a process-wide
//! singleton. Alongside every registered instance it keeps the snapshot taken
//! when the instance was loaded, which later serves as the previous state of
//! an update.

use rowgraph_core::{EntityInstance, EntityKey, EntityRef, EntitySnapshot, Value};
use std::collections::HashMap;
use std::sync::Arc;

struct ManagedEntry {
    instance: EntityRef,
    loaded: EntitySnapshot,
}

/// Identity map plus loaded-state snapshots for one unit of work.
#[derive(Default)]
pub struct PersistenceContext {
    entries: HashMap<EntityKey, ManagedEntry>,
}

impl PersistenceContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Look up the managed instance for `key`.
    pub fn get(&self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.get(key).map(|e| Arc::clone(&e.instance))
    }

    /// Look up by entity name and identifier value.
    pub fn find(&self, entity: &str, id: &Value) -> Option<EntityRef> {
        self.get(&EntityKey::new(entity, id))
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Register an instance.
    ///
    /// If an instance with the same key is already managed, the existing
    /// reference is returned and `instance` is dropped.
    pub fn register(&mut self, instance: EntityRef) -> EntityRef {
        let key = instance.key().clone();
        if let Some(existing) = self.entries.get(&key) {
            return Arc::clone(&existing.instance);
        }
        tracing::trace!(key = %key, "Registering instance in identity map");
        let loaded = instance.snapshot();
        self.entries.insert(
            key,
            ManagedEntry {
                instance: Arc::clone(&instance),
                loaded,
            },
        );
        instance
    }

    /// The state captured when the instance for `key` was registered.
    pub fn loaded_state(&self, key: &EntityKey) -> Option<&EntitySnapshot> {
        self.entries.get(key).map(|e| &e.loaded)
    }

    /// Replace the loaded snapshot after the instance has been written.
    pub fn mark_synchronized(&mut self, key: &EntityKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.loaded = entry.instance.snapshot();
        }
    }

    /// Managed instances whose current state differs from the loaded state.
    pub fn dirty(&self) -> Vec<(EntitySnapshot, EntitySnapshot)> {
        let mut dirty: Vec<_> = self
            .entries
            .values()
            .filter_map(|entry| {
                let current = entry.instance.snapshot();
                (current != entry.loaded).then(|| (current, entry.loaded.clone()))
            })
            .collect();
        dirty.sort_by(|a, b| a.0.key().to_string().cmp(&b.0.key().to_string()));
        dirty
    }

    /// Stop managing `key`, returning the instance if it was present.
    pub fn evict(&mut self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.remove(key).map(|e| e.instance)
    }

    /// Managed instances of one entity type.
    pub fn instances_of<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a EntityInstance> + 'a {
        self.entries
            .values()
            .filter(move |e| e.instance.entity_name() == entity)
            .map(|e| e.instance.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// End the unit of work.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl std::fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("entries", &self.entries.len())
            .finish()
    }
}
