//! Entity keys, shared entity instances and state snapshots.
//!
//! Instances are shared as [`EntityRef`] (`Arc<EntityInstance>`): the
//! identity map, every association pointing at the instance and every
//! result tuple hold the same allocation, so reference equality is
//! identity. Interior state sits behind a `RwLock`; locks are never held
//! across a suspension point.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Identifier value plus entity-type tag.
///
/// Integer identifiers are normalized so that keys read from different
/// column types compare equal.
#[derive(Debug, Clone)]
pub struct EntityKey {
    entity: Arc<str>,
    id: Value,
}

impl EntityKey {
    pub fn new(entity: impl Into<Arc<str>>, id: &Value) -> Self {
        Self {
            entity: entity.into(),
            id: id.normalized(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    fn id_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.id.hash_into(&mut hasher);
        hasher.finish()
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.id.same_identity(&other.id)
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.id_hash().hash(state);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// A resolved embedded (value-typed) component.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Embedded {
    attributes: BTreeMap<String, Value>,
}

impl Embedded {
    pub fn new(attributes: BTreeMap<String, Value>) -> Self {
        Self { attributes }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }
}

/// A shared reference to an entity instance.
pub type EntityRef = Arc<EntityInstance>;

#[derive(Default)]
struct EntityData {
    attributes: BTreeMap<String, Value>,
    version: Option<Value>,
    associations: BTreeMap<String, Option<EntityRef>>,
    embedded: BTreeMap<String, Option<Embedded>>,
    collections: BTreeMap<String, Vec<EntityRef>>,
}

/// One materialized entity.
pub struct EntityInstance {
    key: EntityKey,
    data: RwLock<EntityData>,
}

impl EntityInstance {
    /// Allocate an instance with its basic attributes already populated.
    pub fn new(key: EntityKey, attributes: BTreeMap<String, Value>, version: Option<Value>) -> EntityRef {
        Arc::new(Self {
            key,
            data: RwLock::new(EntityData {
                attributes,
                version,
                ..EntityData::default()
            }),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, EntityData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntityData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn entity_name(&self) -> &str {
        self.key.entity()
    }

    pub fn id(&self) -> &Value {
        self.key.id()
    }

    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.read().attributes.get(name).cloned()
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: Value) {
        self.write().attributes.insert(name.into(), value);
    }

    pub fn version(&self) -> Option<Value> {
        self.read().version.clone()
    }

    pub fn set_version(&self, version: Value) {
        self.write().version = Some(version);
    }

    /// The associated instance, `None` when the association is unset or
    /// resolved as absent.
    pub fn association(&self, name: &str) -> Option<EntityRef> {
        self.read().associations.get(name).cloned().flatten()
    }

    /// Whether the association has been resolved (possibly to absent).
    pub fn has_association(&self, name: &str) -> bool {
        self.read().associations.contains_key(name)
    }

    pub fn set_association(&self, name: impl Into<String>, target: Option<EntityRef>) {
        self.write().associations.insert(name.into(), target);
    }

    pub fn embedded(&self, name: &str) -> Option<Embedded> {
        self.read().embedded.get(name).cloned().flatten()
    }

    pub fn has_embedded(&self, name: &str) -> bool {
        self.read().embedded.contains_key(name)
    }

    pub fn set_embedded(&self, name: impl Into<String>, value: Option<Embedded>) {
        self.write().embedded.insert(name.into(), value);
    }

    /// Elements of a collection, `None` when it has never been initialized.
    pub fn collection(&self, role: &str) -> Option<Vec<EntityRef>> {
        self.read().collections.get(role).cloned()
    }

    /// Ensure a collection exists, initialized empty if it was not yet.
    pub fn init_collection(&self, role: &str) {
        self.write().collections.entry(role.to_string()).or_default();
    }

    /// Add an element to a collection unless an element with the same key
    /// is already present. Returns whether the element was added.
    pub fn add_to_collection(&self, role: &str, element: EntityRef) -> bool {
        let mut data = self.write();
        let elements = data.collections.entry(role.to_string()).or_default();
        if elements.iter().any(|e| e.key() == element.key()) {
            return false;
        }
        elements.push(element);
        true
    }

    /// Capture the persistent state of this instance.
    pub fn snapshot(&self) -> EntitySnapshot {
        let data = self.read();
        EntitySnapshot {
            entity: self.key.entity().to_string(),
            id: self.key.id().clone(),
            version: data.version.clone(),
            attributes: data.attributes.clone(),
        }
    }
}

impl fmt::Debug for EntityInstance {
    // Associations may form cycles, so only keys are printed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.read();
        f.debug_struct("EntityInstance")
            .field("key", &self.key)
            .field("version", &data.version)
            .field("attributes", &data.attributes)
            .field("associations", &data.associations.keys().collect::<Vec<_>>())
            .field("collections", &data.collections.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Persistent state of one entity at a point in time.
///
/// Mutation coordinators consume a current snapshot and, for updates, the
/// snapshot taken when the entity was loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity: String,
    pub id: Value,
    pub version: Option<Value>,
    pub attributes: BTreeMap<String, Value>,
}

impl EntitySnapshot {
    pub fn new(entity: impl Into<String>, id: impl Into<Value>) -> Self {
        Self {
            entity: entity.into(),
            id: id.into(),
            version: None,
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(attribute.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<Value>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn attribute(&self, name: &str) -> &Value {
        self.attributes.get(name).unwrap_or(&Value::Null)
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity.as_str(), &self.id)
    }

    /// Names of attributes whose value differs from `previous`.
    pub fn changed_attributes(&self, previous: &EntitySnapshot) -> Vec<String> {
        let mut changed: Vec<String> = self
            .attributes
            .iter()
            .filter(|(name, value)| previous.attributes.get(*name) != Some(*value))
            .map(|(name, _)| name.clone())
            .collect();
        for name in previous.attributes.keys() {
            if !self.attributes.contains_key(name) {
                changed.push(name.clone());
            }
        }
        changed.sort();
        changed
    }
}
