//! Coordinator scope factories.
//!
//! A [`CoordinatorScopeFactory`] holds the immutable templates of one
//! entity type and kind: the operation group, its batch key and, for
//! updates, the version-update group with its own key. Every call to
//! [`make_scoped_coordinator`](CoordinatorScopeFactory::make_scoped_coordinator)
//! shares those templates and allocates fresh queue and version state, so
//! interleaved units of work never see each other's pending statements.

use crate::batch::BatchKey;
use crate::coordinator::{EntityMutation, MutationOutcome, ScopedCoordinator};
use crate::group::MutationOperationGroup;
use crate::operation::MutationKind;
use rowgraph_core::{Connection, Cx, EngineConfig, EntityMapping, Error, Outcome, Result, try_outcome};
use std::collections::HashMap;
use std::sync::Arc;

const VERSION_QUALIFIER: &str = "version";

#[derive(Debug, Clone)]
pub struct CoordinatorScopeFactory {
    group: Arc<MutationOperationGroup>,
    batch_key: BatchKey,
    version_group: Option<(Arc<MutationOperationGroup>, BatchKey)>,
    batch_size: usize,
    dynamic_update: bool,
}

impl CoordinatorScopeFactory {
    pub fn new(mapping: &Arc<EntityMapping>, kind: MutationKind, config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let group = MutationOperationGroup::build(mapping, kind);
        let batch_key = BatchKey::new(mapping.name(), kind);
        let version_group = if kind == MutationKind::Update {
            MutationOperationGroup::version_update(mapping)
                .map(|g| (g, BatchKey::new(mapping.name(), kind).qualified(VERSION_QUALIFIER)))
        } else {
            None
        };
        Ok(Self {
            group,
            batch_key,
            version_group,
            batch_size: config.batch_size,
            dynamic_update: mapping.dynamic_update().unwrap_or(config.default_dynamic_update),
        })
    }

    /// A coordinator sharing this factory's templates with private state.
    pub fn make_scoped_coordinator(&self) -> ScopedCoordinator {
        ScopedCoordinator::new(
            Arc::clone(&self.group),
            self.batch_key.clone(),
            self.version_group
                .as_ref()
                .map(|(group, key)| (Arc::clone(group), key.clone())),
            self.batch_size,
            self.dynamic_update,
        )
    }

    pub fn group(&self) -> &Arc<MutationOperationGroup> {
        &self.group
    }

    pub fn batch_key(&self) -> &BatchKey {
        &self.batch_key
    }

    pub fn version_group(&self) -> Option<&Arc<MutationOperationGroup>> {
        self.version_group.as_ref().map(|(group, _)| group)
    }

    pub fn kind(&self) -> MutationKind {
        self.group.kind()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dynamic_update(&self) -> bool {
        self.dynamic_update
    }
}

/// Execute one mutation in its own unit of work.
pub async fn execute_mutation<C: Connection>(
    cx: &Cx,
    conn: &C,
    factory: &CoordinatorScopeFactory,
    mutation: EntityMutation,
) -> Outcome<MutationOutcome, Error> {
    let mut coordinator = factory.make_scoped_coordinator();
    try_outcome!(coordinator.submit(cx, conn, mutation).await);
    coordinator.drain(cx, conn).await
}

/// Scope factories of one entity type, one per mutation kind.
#[derive(Debug, Clone)]
pub struct EntityFactories {
    pub mapping: Arc<EntityMapping>,
    pub insert: CoordinatorScopeFactory,
    pub update: CoordinatorScopeFactory,
    pub delete: CoordinatorScopeFactory,
}

impl EntityFactories {
    pub fn for_kind(&self, kind: MutationKind) -> &CoordinatorScopeFactory {
        match kind {
            MutationKind::Insert => &self.insert,
            MutationKind::Update => &self.update,
            MutationKind::Delete => &self.delete,
        }
    }
}

/// Factories for every registered entity type.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorRegistry {
    config: EngineConfig,
    entities: HashMap<String, EntityFactories>,
}

impl CoordinatorRegistry {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            entities: HashMap::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Build the three factories for `mapping`, replacing earlier ones.
    pub fn register(&mut self, mapping: Arc<EntityMapping>) -> Result<()> {
        let factories = EntityFactories {
            insert: CoordinatorScopeFactory::new(&mapping, MutationKind::Insert, &self.config)?,
            update: CoordinatorScopeFactory::new(&mapping, MutationKind::Update, &self.config)?,
            delete: CoordinatorScopeFactory::new(&mapping, MutationKind::Delete, &self.config)?,
            mapping,
        };
        tracing::debug!(entity = factories.mapping.name(), "Registered scope factories");
        self.entities
            .insert(factories.mapping.name().to_string(), factories);
        Ok(())
    }

    pub fn entity(&self, entity: &str) -> Option<&EntityFactories> {
        self.entities.get(entity)
    }

    pub fn mapping(&self, entity: &str) -> Option<&Arc<EntityMapping>> {
        self.entities.get(entity).map(|f| &f.mapping)
    }

    pub fn factory(&self, entity: &str, kind: MutationKind) -> Result<&CoordinatorScopeFactory> {
        self.entities
            .get(entity)
            .map(|f| f.for_kind(kind))
            .ok_or_else(|| Error::config(format!("no mapping registered for entity '{entity}'")))
    }

    pub fn mappings(&self) -> impl Iterator<Item = &Arc<EntityMapping>> {
        self.entities.values().map(|f| &f.mapping)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
