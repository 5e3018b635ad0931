//! Compiled initializer graph.
//!
//! The dependency shape of a query is static, so the graph is compiled once
//! and every row is driven in the same precomputed orders:
//!
//! - the **key order** is topological over key dependencies,
//! - the **instance order** is topological over instance dependencies.
//!
//! Each order must be acyclic on its own. A cycle through the union of both
//! kinds is legal: it is broken by resolving the key of the dependency before
//! its instance is demanded (a collection key embedding a back-reference to
//! its owner's association is the usual case).

use crate::initializer::{
    CollectionInitializer, CollectionKeySource, DependencyKind, EmbeddableInitializer,
    EntityInitializer, FetchTiming, Initializer, InitializerId, ToOneFetch, ToOneInitializer,
};
use rowgraph_core::{EntityMapping, Error, ResolutionError, ResolutionErrorKind, Result};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::sync::Arc;

/// Immutable, shareable initializer graph of one query.
#[derive(Debug)]
pub struct InitializerGraph {
    nodes: Vec<Initializer>,
    key_deps: Vec<Vec<InitializerId>>,
    instance_deps: Vec<Vec<InitializerId>>,
    key_order: Vec<InitializerId>,
    instance_order: Vec<InitializerId>,
    /// Per node: itself plus its transitive instance dependencies, in instance order
    instance_closure: Vec<Vec<InitializerId>>,
    /// Per node: everything that must be instantiated before the node's
    /// value is handed out, in instance order
    completion: Vec<Vec<InitializerId>>,
}

impl InitializerGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: InitializerId) -> Option<&Initializer> {
        self.nodes.get(id.0)
    }

    pub(crate) fn node(&self, id: InitializerId) -> &Initializer {
        &self.nodes[id.0]
    }

    pub fn ids(&self) -> impl Iterator<Item = InitializerId> {
        (0..self.nodes.len()).map(InitializerId)
    }

    pub fn key_dependencies(&self, id: InitializerId) -> &[InitializerId] {
        &self.key_deps[id.0]
    }

    pub fn instance_dependencies(&self, id: InitializerId) -> &[InitializerId] {
        &self.instance_deps[id.0]
    }

    pub fn key_order(&self) -> &[InitializerId] {
        &self.key_order
    }

    pub fn instance_order(&self) -> &[InitializerId] {
        &self.instance_order
    }

    pub(crate) fn instance_closure(&self, id: InitializerId) -> &[InitializerId] {
        &self.instance_closure[id.0]
    }

    pub(crate) fn completion(&self, id: InitializerId) -> &[InitializerId] {
        &self.completion[id.0]
    }

    /// Fail with `UnknownInitializer` unless `id` belongs to this graph.
    pub fn check(&self, id: InitializerId) -> Result<()> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(unknown(id, self.nodes.len()))
        }
    }
}

fn unknown(id: InitializerId, len: usize) -> Error {
    ResolutionError::new(
        ResolutionErrorKind::UnknownInitializer,
        id.to_string(),
        format!("graph has {len} initializers"),
    )
    .into()
}

/// Builder collecting initializer nodes and explicit dependencies.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Initializer>,
    extra: Vec<(InitializerId, InitializerId, DependencyKind)>,
}

impl GraphBuilder {
    fn push(&mut self, node: Initializer) -> InitializerId {
        self.nodes.push(node);
        InitializerId(self.nodes.len() - 1)
    }

    /// An entity read from columns prefixed with `alias`.
    pub fn entity(
        &mut self,
        path: impl Into<String>,
        mapping: Arc<EntityMapping>,
        alias: impl Into<String>,
    ) -> InitializerId {
        self.push(Initializer::Entity(EntityInitializer {
            path: path.into(),
            mapping,
            alias: alias.into(),
        }))
    }

    /// A to-one association whose target columns are joined under `alias`.
    pub fn joined_to_one(
        &mut self,
        owner: InitializerId,
        attribute: impl Into<String>,
        target: Arc<EntityMapping>,
        key_column: impl Into<String>,
        alias: impl Into<String>,
    ) -> InitializerId {
        self.to_one(
            owner,
            attribute,
            target,
            key_column,
            ToOneFetch::Joined {
                alias: alias.into(),
            },
            FetchTiming::Immediate,
        )
    }

    /// A to-one association fetched by a nested select.
    pub fn selected_to_one(
        &mut self,
        owner: InitializerId,
        attribute: impl Into<String>,
        target: Arc<EntityMapping>,
        key_column: impl Into<String>,
        timing: FetchTiming,
    ) -> InitializerId {
        self.to_one(owner, attribute, target, key_column, ToOneFetch::Select, timing)
    }

    pub fn to_one(
        &mut self,
        owner: InitializerId,
        attribute: impl Into<String>,
        target: Arc<EntityMapping>,
        key_column: impl Into<String>,
        fetch: ToOneFetch,
        timing: FetchTiming,
    ) -> InitializerId {
        let attribute = attribute.into();
        let path = self.child_path(owner, &attribute);
        self.push(Initializer::ToOne(ToOneInitializer {
            path,
            owner,
            attribute,
            target,
            key_column: key_column.into(),
            fetch,
            timing,
        }))
    }

    /// An embedded value on `owner`, or a top-level one when `owner` is `None`.
    pub fn embeddable(
        &mut self,
        owner: Option<InitializerId>,
        attribute: impl Into<String>,
        columns: Vec<(String, String)>,
    ) -> InitializerId {
        let attribute = attribute.into();
        let path = match owner {
            Some(owner) => self.child_path(owner, &attribute),
            None => attribute.clone(),
        };
        self.push(Initializer::Embeddable(EmbeddableInitializer {
            path,
            owner,
            attribute,
            columns,
        }))
    }

    /// A collection on `owner` whose element is read by `element`.
    pub fn collection(
        &mut self,
        owner: InitializerId,
        role: impl Into<String>,
        key_source: CollectionKeySource,
        element: InitializerId,
    ) -> InitializerId {
        let role = role.into();
        let path = self.child_path(owner, &role);
        self.push(Initializer::Collection(CollectionInitializer {
            path,
            owner,
            role,
            key_source,
            element,
        }))
    }

    /// Record an extra dependency of `from` on `on`.
    pub fn depends_on(&mut self, from: InitializerId, on: InitializerId, kind: DependencyKind) {
        self.extra.push((from, on, kind));
    }

    fn child_path(&self, owner: InitializerId, attribute: &str) -> String {
        match self.nodes.get(owner.0) {
            Some(node) => format!("{}.{}", node.path(), attribute),
            None => attribute.to_string(),
        }
    }

    /// Validate references and compute both resolution orders.
    pub fn build(self) -> Result<Arc<InitializerGraph>> {
        let len = self.nodes.len();
        let check = |id: InitializerId| {
            if id.0 < len {
                Ok(())
            } else {
                Err(unknown(id, len))
            }
        };

        let mut key_deps: Vec<BTreeSet<InitializerId>> = vec![BTreeSet::new(); len];
        let mut instance_deps: Vec<BTreeSet<InitializerId>> = vec![BTreeSet::new(); len];

        for (index, node) in self.nodes.iter().enumerate() {
            let id = InitializerId(index);
            if let Some(owner) = node.owner() {
                check(owner)?;
                if !self.nodes[owner.0].produces_entity() {
                    return Err(Error::config(format!(
                        "initializer '{}' is attached to '{}', which does not produce an entity",
                        node.path(),
                        self.nodes[owner.0].path()
                    )));
                }
                key_deps[index].insert(owner);
            }
            match node {
                Initializer::Entity(_) => {}
                Initializer::ToOne(to_one) => {
                    if to_one.timing == FetchTiming::Immediate {
                        instance_deps[to_one.owner.0].insert(id);
                    }
                }
                Initializer::Embeddable(embeddable) => {
                    if let Some(owner) = embeddable.owner {
                        instance_deps[owner.0].insert(id);
                    }
                }
                Initializer::Collection(collection) => {
                    check(collection.element)?;
                    if !matches!(self.nodes[collection.element.0], Initializer::Entity(_)) {
                        return Err(Error::config(format!(
                            "collection '{}' must read its element with an entity initializer",
                            collection.path
                        )));
                    }
                    if let CollectionKeySource::Initializer(source) = collection.key_source {
                        check(source)?;
                        if !self.nodes[source.0].produces_entity() {
                            return Err(Error::config(format!(
                                "collection '{}' must take its key from an entity or association",
                                collection.path
                            )));
                        }
                        key_deps[index].insert(source);
                    }
                    key_deps[index].insert(collection.element);
                    instance_deps[index].insert(collection.owner);
                    instance_deps[index].insert(collection.element);
                }
            }
        }

        for &(from, on, kind) in &self.extra {
            check(from)?;
            check(on)?;
            match kind {
                DependencyKind::Key => key_deps[from.0].insert(on),
                DependencyKind::Instance => instance_deps[from.0].insert(on),
            };
        }

        for (index, deps) in key_deps.iter_mut().enumerate() {
            deps.remove(&InitializerId(index));
        }
        for (index, deps) in instance_deps.iter_mut().enumerate() {
            deps.remove(&InitializerId(index));
        }

        let key_deps: Vec<Vec<InitializerId>> =
            key_deps.into_iter().map(|d| d.into_iter().collect()).collect();
        let instance_deps: Vec<Vec<InitializerId>> =
            instance_deps.into_iter().map(|d| d.into_iter().collect()).collect();

        let key_order = topological(&key_deps).map_err(|stuck| cycle(&self.nodes, &stuck, "key"))?;
        let instance_order =
            topological(&instance_deps).map_err(|stuck| cycle(&self.nodes, &stuck, "instance"))?;

        let mut rank = vec![0; len];
        for (position, id) in instance_order.iter().enumerate() {
            rank[id.0] = position;
        }
        let ordered = |set: BTreeSet<InitializerId>| {
            let mut ids: Vec<InitializerId> = set.into_iter().collect();
            ids.sort_by_key(|id| rank[id.0]);
            ids
        };

        let instance_closure: Vec<Vec<InitializerId>> = (0..len)
            .map(|index| ordered(reachable(&[InitializerId(index)], &instance_deps, &[])))
            .collect();

        let mut owned: Vec<Vec<InitializerId>> = vec![Vec::new(); len];
        for (index, node) in self.nodes.iter().enumerate() {
            if let Some(owner) = node.owner() {
                owned[owner.0].push(InitializerId(index));
            }
        }
        let completion: Vec<Vec<InitializerId>> = (0..len)
            .map(|index| ordered(reachable(&[InitializerId(index)], &instance_deps, &owned)))
            .collect();

        tracing::debug!(
            initializers = len,
            key_order = ?key_order,
            instance_order = ?instance_order,
            "Compiled initializer graph"
        );

        Ok(Arc::new(InitializerGraph {
            nodes: self.nodes,
            key_deps,
            instance_deps,
            key_order,
            instance_order,
            instance_closure,
            completion,
        }))
    }
}

/// Nodes reachable from `start` through `deps` and, when given, `owned` edges.
fn reachable(
    start: &[InitializerId],
    deps: &[Vec<InitializerId>],
    owned: &[Vec<InitializerId>],
) -> BTreeSet<InitializerId> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<InitializerId> = start.to_vec();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        stack.extend(deps[id.0].iter().copied());
        if let Some(children) = owned.get(id.0) {
            stack.extend(children.iter().copied());
        }
    }
    seen
}

/// Kahn's algorithm, lowest index first among ready nodes.
///
/// Returns the nodes left over when a cycle prevents completion.
fn topological(
    deps: &[Vec<InitializerId>],
) -> std::result::Result<Vec<InitializerId>, Vec<InitializerId>> {
    let len = deps.len();
    let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); len];
    for (index, node_deps) in deps.iter().enumerate() {
        for dep in node_deps {
            dependents[dep.0].push(index);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = pending
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(index, _)| Reverse(index))
        .collect();

    let mut order = Vec::with_capacity(len);
    while let Some(Reverse(index)) = ready.pop() {
        order.push(InitializerId(index));
        for &dependent in &dependents[index] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }

    if order.len() == len {
        Ok(order)
    } else {
        Err((0..len)
            .filter(|index| pending[*index] > 0)
            .map(InitializerId)
            .collect())
    }
}

fn cycle(nodes: &[Initializer], stuck: &[InitializerId], kind: &str) -> Error {
    let paths: Vec<&str> = stuck.iter().map(|id| nodes[id.0].path()).collect();
    let first = paths.first().copied().unwrap_or_default();
    ResolutionError::new(
        ResolutionErrorKind::GraphCycle,
        first,
        format!("{kind} dependencies form a cycle through [{}]", paths.join(", ")),
    )
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(name: &str, table: &str) -> Arc<EntityMapping> {
        EntityMapping::builder(name, table, "id")
            .attribute("name", "name")
            .build()
            .unwrap()
    }

    #[test]
    fn eager_children_are_instantiated_before_owner() {
        let mut b = InitializerGraph::builder();
        let order = b.entity("order", mapping("Order", "orders"), "o");
        let customer = b.joined_to_one(order, "customer", mapping("Customer", "customers"), "o__customer_id", "c");
        let graph = b.build().unwrap();

        assert_eq!(graph.key_order(), &[order, customer]);
        assert_eq!(graph.instance_order(), &[customer, order]);
        assert_eq!(graph.node(customer).path(), "order.customer");
        assert_eq!(graph.instance_closure(order), &[customer, order]);
    }

    #[test]
    fn delayed_child_is_only_part_of_completion() {
        let mut b = InitializerGraph::builder();
        let order = b.entity("order", mapping("Order", "orders"), "o");
        let customer = b.selected_to_one(
            order,
            "customer",
            mapping("Customer", "customers"),
            "o__customer_id",
            FetchTiming::Delayed,
        );
        let graph = b.build().unwrap();

        assert_eq!(graph.instance_closure(order), &[order]);
        assert!(graph.completion(order).contains(&customer));
        assert!(graph.completion(order).contains(&order));
    }

    #[test]
    fn collection_keyed_by_association_of_its_owner() {
        // owner -> customer (instance) and customer -> owner (key) form a
        // mixed cycle that the key pass breaks
        let mut b = InitializerGraph::builder();
        let order = b.entity("order", mapping("Order", "orders"), "o");
        let customer = b.joined_to_one(order, "customer", mapping("Customer", "customers"), "o__customer_id", "c");
        let line = b.entity("order.lines.element", mapping("Line", "lines"), "l");
        let lines = b.collection(order, "lines", CollectionKeySource::Initializer(customer), line);
        let graph = b.build().unwrap();

        assert_eq!(graph.key_dependencies(lines), &[order, customer, line]);

        let key_pos = |id| graph.key_order().iter().position(|x| *x == id).unwrap();
        assert!(key_pos(order) < key_pos(customer));
        let inst_pos = |id| graph.instance_order().iter().position(|x| *x == id).unwrap();
        assert!(inst_pos(order) < inst_pos(lines));
        assert!(inst_pos(line) < inst_pos(lines));
    }

    #[test]
    fn instance_cycle_is_rejected() {
        let mut b = InitializerGraph::builder();
        let a = b.entity("a", mapping("A", "a"), "a");
        let c = b.entity("c", mapping("C", "c"), "c");
        b.depends_on(a, c, DependencyKind::Instance);
        b.depends_on(c, a, DependencyKind::Instance);
        let err = b.build().unwrap_err();
        match err {
            Error::Resolution(e) => {
                assert_eq!(e.kind, ResolutionErrorKind::GraphCycle);
                assert!(e.message.contains("instance"));
            }
            other => panic!("expected graph cycle, got {other:?}"),
        }
    }

    #[test]
    fn unknown_owner_is_rejected() {
        let mut b = InitializerGraph::builder();
        b.embeddable(Some(InitializerId(4)), "address", vec![]);
        let err = b.build().unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution(ResolutionError {
                kind: ResolutionErrorKind::UnknownInitializer,
                ..
            })
        ));
    }

    #[test]
    fn collection_element_must_be_an_entity() {
        let mut b = InitializerGraph::builder();
        let order = b.entity("order", mapping("Order", "orders"), "o");
        let emb = b.embeddable(None, "tag", vec![("name".into(), "t__name".into())]);
        b.collection(order, "tags", CollectionKeySource::Owner, emb);
        assert!(matches!(b.build().unwrap_err(), Error::Config(_)));
    }
}
