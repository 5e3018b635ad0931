//! Per-row processing state.
//!
//! A [`RowProcessingState`] owns everything one pass over one row produces:
//! the lifecycle state and resolved value of every initializer, the instances
//! created for this row, and the ordered history of state transitions.
//! Nothing it creates is visible outside the pass until [`finish`] hands
//! back a [`StagedRow`] and that is applied to the persistence context. A
//! failure anywhere drops the state, and with it every partial instance.
//!
//! [`finish`]: RowProcessingState::finish

use crate::graph::InitializerGraph;
use crate::identity_map::PersistenceContext;
use crate::initializer::{
    CollectionKeySource, Initializer, InitializerId, ResolutionState, ToOneFetch, aliased_column,
};
use crate::loader::{instance_from_row, load_by_key};
use rowgraph_core::{
    Connection, Cx, Embedded, EntityKey, EntityRef, Error, Outcome, ResolutionError,
    ResolutionErrorKind, Result, Row, Value, try_outcome, try_result,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Key of one initializer for the current row.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedKey {
    /// Null key; the initializer short-circuits
    Absent,
    Entity(EntityKey),
    Embedded(Embedded),
    /// Collection key (owner or foreign-key entity key)
    Collection(EntityKey),
}

/// Instance of one initializer for the current row.
#[derive(Debug, Clone)]
pub enum ResolvedInstance {
    Absent,
    Entity(EntityRef),
    Embedded(Embedded),
    /// The collection element read from this row, if any
    Collection { element: Option<EntityRef> },
}

/// One lifecycle transition recorded during a row pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub initializer: InitializerId,
    pub state: ResolutionState,
}

#[derive(Debug)]
struct Slot {
    state: ResolutionState,
    key: Option<ResolvedKey>,
    instance: Option<ResolvedInstance>,
    /// Whether this pass allocated the instance
    created: bool,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: ResolutionState::Unresolved,
            key: None,
            instance: None,
            created: false,
        }
    }
}

/// State of one in-flight pass over one row.
pub struct RowProcessingState<'a, C: Connection> {
    graph: &'a InitializerGraph,
    conn: &'a C,
    context: &'a PersistenceContext,
    row: Row,
    slots: Vec<Slot>,
    staged: HashMap<EntityKey, EntityRef>,
    history: Vec<Transition>,
}

impl<'a, C: Connection> RowProcessingState<'a, C> {
    pub fn new(graph: &'a InitializerGraph, conn: &'a C, context: &'a PersistenceContext, row: Row) -> Self {
        Self {
            graph,
            conn,
            context,
            row,
            slots: (0..graph.len()).map(|_| Slot::new()).collect(),
            staged: HashMap::new(),
            history: Vec::new(),
        }
    }

    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn state(&self, id: InitializerId) -> ResolutionState {
        self.slots[id.0].state
    }

    pub fn key(&self, id: InitializerId) -> Option<&ResolvedKey> {
        self.slots[id.0].key.as_ref()
    }

    pub fn instance(&self, id: InitializerId) -> Option<&ResolvedInstance> {
        self.slots[id.0].instance.as_ref()
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    fn transition(&mut self, id: InitializerId, state: ResolutionState) {
        self.slots[id.0].state = state;
        self.history.push(Transition {
            initializer: id,
            state,
        });
        tracing::trace!(
            initializer = %id,
            path = self.graph.node(id).path(),
            state = state.as_str(),
            position = self.row.position(),
            "Initializer transition"
        );
    }

    fn is_absent(&self, id: InitializerId) -> bool {
        matches!(self.slots[id.0].key, Some(ResolvedKey::Absent))
    }

    fn entity_of(&self, id: InitializerId) -> Option<EntityRef> {
        match &self.slots[id.0].instance {
            Some(ResolvedInstance::Entity(instance)) => Some(Arc::clone(instance)),
            _ => None,
        }
    }

    /// An instance already created in this pass or managed by the context.
    fn lookup(&self, key: &EntityKey) -> Option<EntityRef> {
        self.staged
            .get(key)
            .map(Arc::clone)
            .or_else(|| self.context.get(key))
    }

    fn error(&self, id: InitializerId, kind: ResolutionErrorKind, message: String) -> Error {
        let node = self.graph.node(id);
        let mut err = ResolutionError::new(kind, node.path(), message);
        if let Some(entity) = node.entity_name() {
            err = err.entity(entity);
        }
        err.into()
    }

    /// Resolve every key in key order.
    pub fn resolve_keys(&mut self) -> Result<()> {
        let graph = self.graph;
        for &id in graph.key_order() {
            self.resolve_key(id)?;
        }
        Ok(())
    }

    /// Resolve the key of `id`. Idempotent within the pass.
    ///
    /// A null key resolves the initializer as absent: it moves straight on
    /// to `Instantiated` with no instance.
    pub fn resolve_key(&mut self, id: InitializerId) -> Result<()> {
        if self.slots[id.0].state != ResolutionState::Unresolved {
            return Ok(());
        }
        let graph = self.graph;
        for &dep in graph.key_dependencies(id) {
            if self.slots[dep.0].state == ResolutionState::Unresolved {
                return Err(self.error(
                    id,
                    ResolutionErrorKind::KeyUnavailable,
                    format!("key of '{}' is not resolved yet", graph.node(dep).path()),
                ));
            }
        }

        let key = match graph.node(id) {
            Initializer::Entity(init) => {
                let column = aliased_column(&init.alias, &init.mapping.identifier().column);
                let value = self.row.require(&column, &init.path)?;
                if value.is_null() {
                    ResolvedKey::Absent
                } else {
                    ResolvedKey::Entity(EntityKey::new(init.mapping.name(), value))
                }
            }
            Initializer::ToOne(init) => {
                if self.is_absent(init.owner) {
                    ResolvedKey::Absent
                } else {
                    let value = self.row.require(&init.key_column, &init.path)?;
                    if value.is_null() {
                        ResolvedKey::Absent
                    } else {
                        ResolvedKey::Entity(EntityKey::new(init.target.name(), value))
                    }
                }
            }
            Initializer::Embeddable(init) => {
                if init.owner.is_some_and(|owner| self.is_absent(owner)) {
                    ResolvedKey::Absent
                } else {
                    let mut attributes = BTreeMap::new();
                    for (attribute, column) in &init.columns {
                        let value = self.row.require(column, &init.path)?;
                        attributes.insert(attribute.clone(), value.clone());
                    }
                    if attributes.values().all(Value::is_null) {
                        ResolvedKey::Absent
                    } else {
                        ResolvedKey::Embedded(Embedded::new(attributes))
                    }
                }
            }
            Initializer::Collection(init) => {
                let source = match init.key_source {
                    CollectionKeySource::Owner => init.owner,
                    CollectionKeySource::Initializer(source) => source,
                };
                if self.is_absent(init.owner) || self.is_absent(source) {
                    ResolvedKey::Absent
                } else {
                    match &self.slots[source.0].key {
                        Some(ResolvedKey::Entity(key)) => ResolvedKey::Collection(key.clone()),
                        other => {
                            return Err(self.error(
                                id,
                                ResolutionErrorKind::KeyUnavailable,
                                format!(
                                    "collection key source '{}' resolved to {other:?}",
                                    graph.node(source).path()
                                ),
                            ));
                        }
                    }
                }
            }
        };

        let absent = key == ResolvedKey::Absent;
        self.slots[id.0].key = Some(key);
        self.transition(id, ResolutionState::KeyResolved);
        if absent {
            self.slots[id.0].instance = Some(ResolvedInstance::Absent);
            self.transition(id, ResolutionState::Instantiated);
        }
        Ok(())
    }

    /// Instantiate `id` after everything it depends on.
    pub async fn resolve_instance(&mut self, cx: &Cx, id: InitializerId) -> Outcome<(), Error> {
        let graph = self.graph;
        for &step in graph.instance_closure(id) {
            try_outcome!(self.instantiate(cx, step).await);
        }
        Outcome::Ok(())
    }

    /// Instantiate `id` and everything that must be complete before its
    /// value leaves the pass, including delayed associations it owns.
    pub async fn complete(&mut self, cx: &Cx, id: InitializerId) -> Outcome<(), Error> {
        let graph = self.graph;
        for &step in graph.completion(id) {
            try_outcome!(self.instantiate(cx, step).await);
        }
        Outcome::Ok(())
    }

    /// Instantiate every eager initializer in instance order.
    pub async fn resolve_eager(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let graph = self.graph;
        for &id in graph.instance_order() {
            if graph.node(id).is_eager() {
                try_outcome!(self.resolve_instance(cx, id).await);
            }
        }
        Outcome::Ok(())
    }

    /// Instantiate whatever is still only key-resolved.
    pub async fn force_remaining(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let graph = self.graph;
        for &id in graph.instance_order() {
            try_outcome!(self.instantiate(cx, id).await);
        }
        Outcome::Ok(())
    }

    async fn instantiate(&mut self, cx: &Cx, id: InitializerId) -> Outcome<(), Error> {
        match self.slots[id.0].state {
            ResolutionState::Instantiated => return Outcome::Ok(()),
            ResolutionState::Unresolved => {
                return Outcome::Err(self.error(
                    id,
                    ResolutionErrorKind::KeyUnavailable,
                    "instance demanded before the key was resolved".to_string(),
                ));
            }
            ResolutionState::KeyResolved => {}
        }

        let graph = self.graph;
        for &dep in graph.key_dependencies(id) {
            if self.slots[dep.0].state == ResolutionState::Unresolved {
                return Outcome::Err(self.error(
                    id,
                    ResolutionErrorKind::KeyUnavailable,
                    format!("key of '{}' is not resolved yet", graph.node(dep).path()),
                ));
            }
        }
        for &dep in graph.instance_dependencies(id) {
            if self.slots[dep.0].state != ResolutionState::Instantiated {
                return Outcome::Err(self.error(
                    id,
                    ResolutionErrorKind::InstanceUnavailable,
                    format!("'{}' is not instantiated yet", graph.node(dep).path()),
                ));
            }
        }

        let Some(key) = self.slots[id.0].key.clone() else {
            return Outcome::Err(self.error(
                id,
                ResolutionErrorKind::KeyUnavailable,
                "key-resolved initializer carries no key".to_string(),
            ));
        };

        let (instance, created) = match (graph.node(id), key) {
            (Initializer::Entity(init), ResolvedKey::Entity(key)) => match self.lookup(&key) {
                Some(existing) => (ResolvedInstance::Entity(existing), false),
                None => {
                    let instance = try_result!(instance_from_row(
                        &init.mapping,
                        key.clone(),
                        &self.row,
                        Some(&init.alias),
                        &init.path,
                    ));
                    self.staged.insert(key, Arc::clone(&instance));
                    (ResolvedInstance::Entity(instance), true)
                }
            },
            (Initializer::ToOne(init), ResolvedKey::Entity(key)) => match self.lookup(&key) {
                Some(existing) => (ResolvedInstance::Entity(existing), false),
                None => {
                    let instance = match &init.fetch {
                        ToOneFetch::Joined { alias } => try_result!(instance_from_row(
                            &init.target,
                            key.clone(),
                            &self.row,
                            Some(alias),
                            &init.path,
                        )),
                        ToOneFetch::Select => {
                            try_outcome!(load_by_key(cx, self.conn, &init.target, &key, &init.path).await)
                        }
                    };
                    self.staged.insert(key, Arc::clone(&instance));
                    (ResolvedInstance::Entity(instance), true)
                }
            },
            (Initializer::Embeddable(_), ResolvedKey::Embedded(value)) => {
                (ResolvedInstance::Embedded(value), false)
            }
            (Initializer::Collection(init), ResolvedKey::Collection(_)) => (
                ResolvedInstance::Collection {
                    element: self.entity_of(init.element),
                },
                false,
            ),
            (node, key) => {
                return Outcome::Err(self.error(
                    id,
                    ResolutionErrorKind::InstanceUnavailable,
                    format!("{} initializer cannot instantiate key {key:?}", node.kind_name()),
                ));
            }
        };

        let slot = &mut self.slots[id.0];
        slot.instance = Some(instance);
        slot.created = created;
        self.transition(id, ResolutionState::Instantiated);
        Outcome::Ok(())
    }

    /// End the pass, producing the effects to publish.
    ///
    /// Fails if any initializer is not instantiated.
    pub fn finish(self) -> Result<StagedRow> {
        let graph = self.graph;
        if let Some(id) = graph
            .ids()
            .find(|id| self.slots[id.0].state != ResolutionState::Instantiated)
        {
            return Err(self.error(
                id,
                ResolutionErrorKind::InstanceUnavailable,
                format!("row pass ended in state {}", self.slots[id.0].state.as_str()),
            ));
        }

        let mut registrations = Vec::new();
        let mut effects = Vec::new();
        for &id in graph.instance_order() {
            let slot = &self.slots[id.0];
            let node = graph.node(id);
            if slot.created {
                if let Some(ResolvedInstance::Entity(instance)) = &slot.instance {
                    registrations.push(Arc::clone(instance));
                }
            }
            let Some(owner) = node.owner().and_then(|owner| self.entity_of(owner)) else {
                continue;
            };
            match (node, &slot.instance) {
                (Initializer::ToOne(init), Some(instance)) => effects.push(Effect::Link {
                    owner,
                    attribute: init.attribute.clone(),
                    target: match instance {
                        ResolvedInstance::Entity(target) => Some(Arc::clone(target)),
                        _ => None,
                    },
                }),
                (Initializer::Embeddable(init), Some(instance)) => effects.push(Effect::Embed {
                    owner,
                    attribute: init.attribute.clone(),
                    value: match instance {
                        ResolvedInstance::Embedded(value) => Some(value.clone()),
                        _ => None,
                    },
                }),
                (Initializer::Collection(init), Some(ResolvedInstance::Collection { element })) => {
                    effects.push(Effect::Collect {
                        owner,
                        role: init.role.clone(),
                        element: element.clone(),
                    });
                }
                _ => {}
            }
        }

        Ok(StagedRow {
            registrations,
            effects,
            history: self.history,
        })
    }
}

#[derive(Debug)]
enum Effect {
    Link {
        owner: EntityRef,
        attribute: String,
        target: Option<EntityRef>,
    },
    Embed {
        owner: EntityRef,
        attribute: String,
        value: Option<Embedded>,
    },
    Collect {
        owner: EntityRef,
        role: String,
        element: Option<EntityRef>,
    },
}

/// Effects of a completed row pass, not yet published.
#[derive(Debug)]
pub struct StagedRow {
    registrations: Vec<EntityRef>,
    effects: Vec<Effect>,
    history: Vec<Transition>,
}

impl StagedRow {
    /// Number of instances this row allocated.
    pub fn created(&self) -> usize {
        self.registrations.len()
    }

    /// Register new instances and wire associations, embedded values and
    /// collection elements. Returns the pass's transition history.
    pub fn apply(self, context: &mut PersistenceContext) -> Vec<Transition> {
        for instance in self.registrations {
            context.register(instance);
        }
        for effect in self.effects {
            match effect {
                Effect::Link {
                    owner,
                    attribute,
                    target,
                } => owner.set_association(attribute, target),
                Effect::Embed {
                    owner,
                    attribute,
                    value,
                } => owner.set_embedded(attribute, value),
                Effect::Collect {
                    owner,
                    role,
                    element,
                } => {
                    owner.init_collection(&role);
                    if let Some(element) = element {
                        owner.add_to_collection(&role, element);
                    }
                }
            }
        }
        self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initializer::FetchTiming;
    use asupersync::runtime::RuntimeBuilder;
    use rowgraph_core::testing::MockConnection;
    use rowgraph_core::EntityMapping;

    fn mapping(name: &str, table: &str) -> Arc<EntityMapping> {
        EntityMapping::builder(name, table, "id")
            .attribute("name", "name")
            .build()
            .unwrap()
    }

    fn row(columns: &[&str], values: Vec<Value>) -> Row {
        Row::new(columns.iter().map(|c| (*c).to_string()).collect(), values)
    }

    #[test]
    fn keys_resolve_before_instances_and_null_key_is_absent() {
        let mut b = InitializerGraph::builder();
        let order = b.entity("order", mapping("Order", "orders"), "o");
        let customer = b.joined_to_one(order, "customer", mapping("Customer", "customers"), "o__customer_id", "c");
        let graph = b.build().unwrap();

        let conn = MockConnection::new();
        let context = PersistenceContext::new();
        let r = row(
            &["o__id", "o__name", "o__customer_id", "c__id", "c__name"],
            vec![Value::BigInt(1), Value::Text("first".into()), Value::Null, Value::Null, Value::Null],
        );
        let mut state = RowProcessingState::new(&graph, &conn, &context, r);
        state.resolve_keys().unwrap();

        assert_eq!(state.state(order), ResolutionState::KeyResolved);
        assert_eq!(state.state(customer), ResolutionState::Instantiated);
        assert!(matches!(state.instance(customer), Some(ResolvedInstance::Absent)));
    }

    #[test]
    fn instance_before_key_is_rejected() {
        let mut b = InitializerGraph::builder();
        let order = b.entity("order", mapping("Order", "orders"), "o");
        let graph = b.build().unwrap();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let context = PersistenceContext::new();
        let r = row(&["o__id", "o__name"], vec![Value::BigInt(1), Value::Null]);

        rt.block_on(async {
            let mut state = RowProcessingState::new(&graph, &conn, &context, r);
            match state.resolve_instance(&cx, order).await {
                Outcome::Err(Error::Resolution(e)) => {
                    assert_eq!(e.kind, ResolutionErrorKind::KeyUnavailable);
                    assert_eq!(e.entity.as_deref(), Some("Order"));
                }
                other => panic!("expected key unavailable, got {other:?}"),
            }
        });
    }

    #[test]
    fn finish_rejects_unfinished_pass() {
        let mut b = InitializerGraph::builder();
        let order = b.entity("order", mapping("Order", "orders"), "o");
        b.selected_to_one(order, "customer", mapping("Customer", "customers"), "o__customer_id", FetchTiming::Delayed);
        let graph = b.build().unwrap();
        let conn = MockConnection::new();
        let context = PersistenceContext::new();
        let r = row(
            &["o__id", "o__name", "o__customer_id"],
            vec![Value::BigInt(1), Value::Null, Value::BigInt(5)],
        );
        let mut state = RowProcessingState::new(&graph, &conn, &context, r);
        state.resolve_keys().unwrap();
        assert!(state.finish().is_err());
    }
}
