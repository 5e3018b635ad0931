//! Flush ordering for a unit of work.
//!
//! A dirty set is written in three phases:
//! - inserts, referenced entity types before the types pointing at them
//! - updates, in submission order
//! - deletes, referencing entity types before the types they point at
//!
//! Consecutive mutations of the same entity type and kind share one scoped
//! coordinator, so they batch under one key.

use crate::coordinator::{EntityMutation, VersionChange};
use crate::operation::MutationKind;
use crate::scope::CoordinatorRegistry;
use rowgraph_core::{Connection, Cx, EntityMapping, Error, Outcome, try_outcome, try_result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Orders mutations by the foreign keys between entity types.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Entity -> entities it holds foreign keys to.
    dependencies: HashMap<String, Vec<String>>,
    keep_insert_order: bool,
}

impl FlushOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep inserts in submission order instead of parent-first.
    #[must_use]
    pub fn order_inserts(mut self, enabled: bool) -> Self {
        self.keep_insert_order = !enabled;
        self
    }

    /// Register an entity type's references from its mapping.
    pub fn register_mapping(&mut self, mapping: &EntityMapping) {
        self.dependencies
            .insert(mapping.name().to_string(), mapping.references().to_vec());
    }

    /// Register an entity type's references directly.
    pub fn register_entity(&mut self, entity: impl Into<String>, depends_on: Vec<String>) {
        self.dependencies.insert(entity.into(), depends_on);
    }

    /// Length of the longest reference chain starting at each registered
    /// type. Types without references have depth 0; a reference that closes
    /// a cycle adds nothing.
    fn depths(&self) -> HashMap<&str, usize> {
        let mut depths = HashMap::new();
        let mut visiting = HashSet::new();
        for entity in self.dependencies.keys() {
            self.depth(entity, &mut visiting, &mut depths);
        }
        depths
    }

    fn depth<'a>(
        &'a self,
        entity: &'a str,
        visiting: &mut HashSet<&'a str>,
        depths: &mut HashMap<&'a str, usize>,
    ) -> usize {
        if let Some(&depth) = depths.get(entity) {
            return depth;
        }
        if !visiting.insert(entity) {
            return 0;
        }
        let depth = self
            .dependencies
            .get(entity)
            .into_iter()
            .flatten()
            .filter(|target| target.as_str() != entity)
            .map(|target| 1 + self.depth(target, visiting, depths))
            .max()
            .unwrap_or(0);
        visiting.remove(entity);
        depths.insert(entity, depth);
        depth
    }

    /// Split mutations into the three phases and order each.
    pub fn order(&self, mutations: Vec<EntityMutation>) -> FlushPlan {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for mutation in mutations {
            match mutation.kind() {
                MutationKind::Insert => inserts.push(mutation),
                MutationKind::Update => updates.push(mutation),
                MutationKind::Delete => deletes.push(mutation),
            }
        }

        // Stable sorts keep the submission order within one entity type.
        let depths = self.depths();
        let depth = |m: &EntityMutation| depths.get(m.entity()).copied().unwrap_or(0);
        if !self.keep_insert_order {
            inserts.sort_by(|a, b| depth(a).cmp(&depth(b)).then_with(|| a.entity().cmp(b.entity())));
        }
        deletes.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.entity().cmp(b.entity())));

        FlushPlan {
            inserts,
            updates,
            deletes,
        }
    }
}

/// A plan for executing flush operations.
#[derive(Debug, Default)]
pub struct FlushPlan {
    pub inserts: Vec<EntityMutation>,
    pub updates: Vec<EntityMutation>,
    pub deletes: Vec<EntityMutation>,
}

/// Result of a flush operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub statements: usize,
    pub round_trips: usize,
    /// Versions written, to be applied to the managed instances
    pub versions: Vec<VersionChange>,
}

impl FlushResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    /// Run the plan. The first failure stops the flush.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        registry: &CoordinatorRegistry,
    ) -> Outcome<FlushResult, Error> {
        tracing::info!(
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            deletes = self.deletes.len(),
            "Executing flush plan"
        );

        let start = std::time::Instant::now();
        let mut result = FlushResult::default();

        for phase in [&self.inserts, &self.updates, &self.deletes] {
            for batch in Self::batch_by_entity(phase) {
                let entity = batch[0].entity();
                let kind = batch[0].kind();
                let factory = try_result!(registry.factory(entity, kind));
                let mut coordinator = factory.make_scoped_coordinator();
                for mutation in batch {
                    try_outcome!(coordinator.submit(cx, conn, mutation.clone()).await);
                }
                let outcome = try_outcome!(coordinator.drain(cx, conn).await);

                match kind {
                    MutationKind::Insert => result.inserted += outcome.mutations,
                    MutationKind::Update => result.updated += outcome.mutations,
                    MutationKind::Delete => result.deleted += outcome.mutations,
                }
                result.statements += outcome.statements;
                result.round_trips += outcome.round_trips;
                result.versions.extend(outcome.versions);
            }
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            round_trips = result.round_trips,
            "Flush complete"
        );

        Outcome::Ok(result)
    }

    /// Group consecutive mutations of the same entity type.
    fn batch_by_entity(mutations: &[EntityMutation]) -> Vec<&[EntityMutation]> {
        let mut batches = Vec::new();
        let mut start = 0;
        for i in 1..=mutations.len() {
            if i == mutations.len() || mutations[i].entity() != mutations[start].entity() {
                batches.push(&mutations[start..i]);
                start = i;
            }
        }
        batches
    }
}

/// Order `mutations` against the registry's mappings and run them.
pub async fn flush<C: Connection>(
    cx: &Cx,
    conn: &C,
    registry: &CoordinatorRegistry,
    mutations: Vec<EntityMutation>,
) -> Outcome<FlushResult, Error> {
    let mut orderer = FlushOrderer::new().order_inserts(registry.config().order_inserts);
    for mapping in registry.mappings() {
        orderer.register_mapping(mapping);
    }
    let plan = orderer.order(mutations);
    if plan.is_empty() {
        return Outcome::Ok(FlushResult::default());
    }
    plan.execute(cx, conn, registry).await
}
