//! rowgraph - non-blocking row-to-object resolution and mutation coordination.
//!
//! rowgraph is the execution core beneath an object/relational mapping layer:
//!
//! - result rows are driven through a compiled [`InitializerGraph`] into fully
//!   initialized, identity-mapped entity graphs
//! - entity writes are bound against shared [`MutationOperationGroup`]
//!   templates and sent through per-use [`ScopedCoordinator`]s with batching
//!   and optimistic locking
//!
//! Every operation takes a `Cx` and returns an `Outcome`; nothing blocks the
//! calling thread.
//!
//! # Quick Start
//!
//! ```ignore
//! use rowgraph::prelude::*;
//!
//! async fn example(cx: &Cx, conn: &impl Connection) -> Outcome<FlushResult, Error> {
//!     let orders = try_result!(
//!         EntityMapping::builder("Order", "orders", "id")
//!             .attribute("total", "total")
//!             .version("version", "version")
//!             .build()
//!     );
//!
//!     let mut engine = try_result!(Engine::new(EngineConfig::new(20)));
//!     try_result!(engine.register(Arc::clone(&orders)));
//!
//!     let mut graph = InitializerGraph::builder();
//!     let order = graph.entity("order", orders, "o");
//!     let graph = try_result!(graph.build());
//!     let query = try_result!(engine.compile_query("all orders", graph, vec![Assembler::entity(order)]));
//!
//!     let mut context = PersistenceContext::new();
//!     let sql = "SELECT o.id AS o__id, o.version AS o__version, o.total AS o__total FROM orders o";
//!     let rows = try_outcome!(engine.native(conn, sql, &query).list(cx, &mut context).await);
//!     if let Some(order) = rows.first().and_then(|row| row[0].as_entity()) {
//!         order.set_attribute("total", Value::BigInt(42));
//!     }
//!     engine.flush_context(cx, conn, &mut context).await
//! }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

pub use rowgraph_core::{
    AttributeMapping, Budget, ColumnInfo, ConfigError, Connection, Cx, DriverError, DriverErrorKind,
    Embedded, EngineConfig, EntityInstance, EntityKey, EntityMapping, EntityMappingBuilder, EntityRef,
    EntitySnapshot, Error, FromValue, MutationError, MutationErrorKind, OptimisticLockError, Outcome,
    QueryRowSource, RegionId, ResolutionError, ResolutionErrorKind, Result, Row, RowSource,
    TableMapping, TaskId, UnsupportedOperation, Value, VecRowSource, try_outcome, try_result,
};
pub use rowgraph_mutation::{
    BatchKey, BatchQueue, BatchStats, BindContext, Binding, CoordinatorRegistry, CoordinatorScopeFactory,
    CoordinatorState, EntityFactories, EntityMutation, Expectation, FlushOrderer, FlushPlan, FlushResult,
    MutationKind, MutationOperation, MutationOperationGroup, MutationOutcome, PendingStatement,
    ScopedCoordinator, VersionChange, execute_mutation, flush,
};
pub use rowgraph_results::{
    Assembler, CollectionKeySource, CompiledQuery, DependencyKind, FetchTiming, GraphBuilder, Initializer,
    InitializerGraph, InitializerId, NativeQuery, PersistenceContext, ProcessedRow, ResolutionState,
    ResultTuple, ResultValue, RowPipeline, ToOneFetch, Transition, aliased_column, execute_query,
    single_result, single_result_or_none,
};

/// Commonly used types.
pub mod prelude {
    pub use crate::Engine;
    pub use rowgraph_core::{
        Connection, Cx, EngineConfig, EntityMapping, EntityRef, EntitySnapshot, Error, Outcome, Row,
        RowSource, Value,
    };
    pub use rowgraph_core::{try_outcome, try_result};
    pub use rowgraph_mutation::{EntityMutation, FlushResult, MutationKind, MutationOutcome};
    pub use rowgraph_results::{
        Assembler, CollectionKeySource, CompiledQuery, FetchTiming, InitializerGraph, NativeQuery,
        PersistenceContext, ResultValue,
    };
    pub use std::sync::Arc;
}

/// Configuration plus the mappings and scope factories of every entity type.
#[derive(Debug, Clone)]
pub struct Engine {
    coordinators: CoordinatorRegistry,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Ok(Self {
            coordinators: CoordinatorRegistry::new(config)?,
        })
    }

    /// An engine configured from `ROWGRAPH_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(EngineConfig::from_env()?)
    }

    pub fn config(&self) -> &EngineConfig {
        self.coordinators.config()
    }

    /// Register an entity type, building its operation groups once.
    pub fn register(&mut self, mapping: Arc<EntityMapping>) -> Result<()> {
        self.coordinators.register(mapping)
    }

    pub fn mapping(&self, entity: &str) -> Option<&Arc<EntityMapping>> {
        self.coordinators.mapping(entity)
    }

    pub fn coordinators(&self) -> &CoordinatorRegistry {
        &self.coordinators
    }

    pub fn factory(&self, entity: &str, kind: MutationKind) -> Result<&CoordinatorScopeFactory> {
        self.coordinators.factory(entity, kind)
    }

    /// Compile a result shape with the engine's de-duplication setting.
    pub fn compile_query(
        &self,
        description: impl Into<String>,
        graph: Arc<InitializerGraph>,
        assemblers: Vec<Assembler>,
    ) -> Result<CompiledQuery> {
        Ok(CompiledQuery::new(description, graph, assemblers)?
            .unique_roots(self.config().unique_entity_results))
    }

    /// A native SQL query producing `shape`.
    pub fn native<'q, C: Connection>(
        &self,
        conn: &'q C,
        sql: impl Into<String>,
        shape: &'q CompiledQuery,
    ) -> NativeQuery<'q, C> {
        NativeQuery::new(conn, sql, shape)
    }

    /// Run one mutation in its own unit of work.
    pub async fn execute_mutation<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        mutation: EntityMutation,
    ) -> Outcome<MutationOutcome, Error> {
        let factory = try_result!(self.factory(mutation.entity(), mutation.kind()));
        execute_mutation(cx, conn, factory, mutation).await
    }

    /// Order and run a dirty set.
    pub async fn flush<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        mutations: Vec<EntityMutation>,
    ) -> Outcome<FlushResult, Error> {
        flush(cx, conn, &self.coordinators, mutations).await
    }

    /// Write every modified instance of `context` back to the database.
    ///
    /// On success new versions are applied to the instances and their
    /// loaded state is refreshed. On failure the context is left untouched.
    pub async fn flush_context<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        context: &mut PersistenceContext,
    ) -> Outcome<FlushResult, Error> {
        self.flush_context_touching(cx, conn, context, &[]).await
    }

    /// Like [`flush_context`](Self::flush_context), and also increments the
    /// version of each `touched` instance that has no changed attributes of
    /// its own, such as an owner whose collection changed.
    ///
    /// Touched keys the context does not manage are skipped.
    #[tracing::instrument(level = "debug", skip_all, fields(managed = context.len(), touched = touched.len()))]
    pub async fn flush_context_touching<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        context: &mut PersistenceContext,
        touched: &[EntityKey],
    ) -> Outcome<FlushResult, Error> {
        let mut synchronized: Vec<EntityKey> = Vec::new();
        let mut updated: HashSet<EntityKey> = HashSet::new();
        let mut mutations: Vec<EntityMutation> = Vec::new();
        for (current, previous) in context.dirty() {
            synchronized.push(current.key());
            if current.changed_attributes(&previous).is_empty() {
                continue;
            }
            updated.insert(current.key());
            mutations.push(EntityMutation::Update { current, previous });
        }
        for key in touched {
            if updated.contains(key) {
                continue;
            }
            let Some(instance) = context.get(key) else {
                tracing::warn!(key = %key, "Touched entity is not managed, skipping");
                continue;
            };
            updated.insert(key.clone());
            synchronized.push(key.clone());
            mutations.push(EntityMutation::TouchVersion(instance.snapshot()));
        }
        tracing::debug!(mutations = mutations.len(), "Collected modified instances");

        let result = try_outcome!(self.flush(cx, conn, mutations).await);
        for change in &result.versions {
            if let Some(instance) = context.find(&change.entity, &change.id) {
                instance.set_version(change.version.clone());
            }
        }
        for key in &synchronized {
            context.mark_synchronized(key);
        }
        Outcome::Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_query_follows_unique_results_setting() {
        let mapping = EntityMapping::builder("Tag", "tags", "id")
            .attribute("label", "label")
            .build()
            .unwrap();
        let mut engine = Engine::new(EngineConfig::default().unique_entity_results(false)).unwrap();
        engine.register(Arc::clone(&mapping)).unwrap();
        assert!(engine.mapping("Tag").is_some());

        let mut graph = InitializerGraph::builder();
        let tag = graph.entity("tag", mapping, "t");
        let query = engine
            .compile_query("tags", graph.build().unwrap(), vec![Assembler::entity(tag)])
            .unwrap();
        assert_eq!(query.description(), "tags");
        assert!(!query.unique_roots_enabled());
    }

    #[test]
    fn unregistered_entity_has_no_factory() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        assert!(engine.factory("Tag", MutationKind::Insert).is_err());
        assert!(Engine::new(EngineConfig::new(0)).is_err());
    }
}
