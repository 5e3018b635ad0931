//! Scoped mutation coordinators.
//!
//! A [`ScopedCoordinator`] binds live entity state against a shared
//! [`MutationOperationGroup`] and sends the statements through its own
//! [`BatchQueue`]. It lives for one unit of work:
//!
//! ```text
//! Pending --submit--> Submitted --drain--> Succeeded
//!    |                    |
//!    +------failure-------+----failure---> Failed
//! ```
//!
//! A coordinator that has reached `Succeeded` or `Failed` rejects every
//! further call with `CoordinatorReused`.

use crate::batch::{BatchKey, BatchQueue, PendingStatement};
use crate::group::MutationOperationGroup;
use crate::operation::{BindContext, MutationKind, MutationOperation};
use rowgraph_core::{
    Connection, Cx, EntitySnapshot, Error, MutationError, MutationErrorKind, Outcome, Result,
    Value, try_outcome, try_result,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    Pending,
    Submitted,
    Succeeded,
    Failed,
}

impl CoordinatorState {
    pub const fn as_str(self) -> &'static str {
        match self {
            CoordinatorState::Pending => "pending",
            CoordinatorState::Submitted => "submitted",
            CoordinatorState::Succeeded => "succeeded",
            CoordinatorState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CoordinatorState::Succeeded | CoordinatorState::Failed)
    }
}

/// One entity-level write.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityMutation {
    Insert(EntitySnapshot),
    /// `previous` is the state the entity was loaded with
    Update {
        current: EntitySnapshot,
        previous: EntitySnapshot,
    },
    Delete(EntitySnapshot),
    /// Increment the version of an entity whose own columns did not change
    TouchVersion(EntitySnapshot),
}

impl EntityMutation {
    /// The group kind that executes this mutation.
    pub fn kind(&self) -> MutationKind {
        match self {
            EntityMutation::Insert(_) => MutationKind::Insert,
            EntityMutation::Update { .. } | EntityMutation::TouchVersion(_) => MutationKind::Update,
            EntityMutation::Delete(_) => MutationKind::Delete,
        }
    }

    pub fn snapshot(&self) -> &EntitySnapshot {
        match self {
            EntityMutation::Insert(s) | EntityMutation::Delete(s) | EntityMutation::TouchVersion(s) => s,
            EntityMutation::Update { current, .. } => current,
        }
    }

    pub fn entity(&self) -> &str {
        &self.snapshot().entity
    }
}

/// A version the database holds once the unit of work succeeds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionChange {
    pub entity: String,
    pub id: Value,
    pub version: Value,
}

/// Result of draining a coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MutationOutcome {
    /// Entity mutations submitted
    pub mutations: usize,
    pub statements: usize,
    pub round_trips: usize,
    pub rows_affected: u64,
    pub versions: Vec<VersionChange>,
}

/// Per-use coordinator produced by a scope factory.
#[derive(Debug)]
pub struct ScopedCoordinator {
    group: Arc<MutationOperationGroup>,
    batch_key: BatchKey,
    version_group: Option<(Arc<MutationOperationGroup>, BatchKey)>,
    dynamic_update: bool,
    state: CoordinatorState,
    queue: BatchQueue,
    versions: Vec<VersionChange>,
    mutations: usize,
}

impl ScopedCoordinator {
    pub(crate) fn new(
        group: Arc<MutationOperationGroup>,
        batch_key: BatchKey,
        version_group: Option<(Arc<MutationOperationGroup>, BatchKey)>,
        batch_size: usize,
        dynamic_update: bool,
    ) -> Self {
        Self {
            group,
            batch_key,
            version_group,
            dynamic_update,
            state: CoordinatorState::Pending,
            queue: BatchQueue::new(batch_size),
            versions: Vec::new(),
            mutations: 0,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn group(&self) -> &Arc<MutationOperationGroup> {
        &self.group
    }

    pub fn batch_key(&self) -> &BatchKey {
        &self.batch_key
    }

    /// Statements bound but not yet sent.
    pub fn queued(&self) -> &[PendingStatement] {
        self.queue.pending()
    }

    /// Identifiers of the entities whose statements are still queued.
    pub fn queued_identifiers(&self) -> Vec<Value> {
        let mut ids: Vec<Value> = Vec::new();
        for statement in self.queue.pending() {
            if !ids.contains(&statement.identifier) {
                ids.push(statement.identifier.clone());
            }
        }
        ids
    }

    /// Versions this coordinator will have written once drained.
    pub fn pending_versions(&self) -> &[VersionChange] {
        &self.versions
    }

    pub async fn insert<C: Connection>(&mut self, cx: &Cx, conn: &C, entity: EntitySnapshot) -> Outcome<(), Error> {
        self.submit(cx, conn, EntityMutation::Insert(entity)).await
    }

    pub async fn update<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        current: EntitySnapshot,
        previous: EntitySnapshot,
    ) -> Outcome<(), Error> {
        self.submit(cx, conn, EntityMutation::Update { current, previous })
            .await
    }

    pub async fn delete<C: Connection>(&mut self, cx: &Cx, conn: &C, entity: EntitySnapshot) -> Outcome<(), Error> {
        self.submit(cx, conn, EntityMutation::Delete(entity)).await
    }

    pub async fn touch_version<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        entity: EntitySnapshot,
    ) -> Outcome<(), Error> {
        self.submit(cx, conn, EntityMutation::TouchVersion(entity)).await
    }

    /// Bind `mutation` and queue its statements.
    ///
    /// Statements go out as soon as the queue fills; the rest wait for
    /// [`drain`](Self::drain).
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(batch_key = %self.batch_key, id = %mutation.snapshot().id)
    )]
    pub async fn submit<C: Connection>(&mut self, cx: &Cx, conn: &C, mutation: EntityMutation) -> Outcome<(), Error> {
        try_result!(self.check_usable());
        self.state = CoordinatorState::Submitted;

        let outcome = self.bind_and_queue(cx, conn, &mutation).await;
        if !matches!(outcome, Outcome::Ok(())) {
            self.fail();
        }
        outcome
    }

    /// Send everything still queued and finish the unit of work.
    #[tracing::instrument(level = "debug", skip_all, fields(batch_key = %self.batch_key))]
    pub async fn drain<C: Connection>(&mut self, cx: &Cx, conn: &C) -> Outcome<MutationOutcome, Error> {
        try_result!(self.check_usable());

        let flushed = self.queue.flush(cx, conn).await;
        if !matches!(flushed, Outcome::Ok(())) {
            self.fail();
        }
        try_outcome!(flushed);

        self.state = CoordinatorState::Succeeded;
        let stats = self.queue.stats();
        let outcome = MutationOutcome {
            mutations: self.mutations,
            statements: stats.statements,
            round_trips: stats.round_trips,
            rows_affected: stats.rows_affected,
            versions: std::mem::take(&mut self.versions),
        };
        tracing::debug!(
            mutations = outcome.mutations,
            statements = outcome.statements,
            round_trips = outcome.round_trips,
            rows_affected = outcome.rows_affected,
            "Coordinator drained"
        );
        Outcome::Ok(outcome)
    }

    fn check_usable(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::Mutation(MutationError::new(
                MutationErrorKind::CoordinatorReused,
                self.group.entity(),
                format!("coordinator for {} is already {}", self.batch_key, self.state.as_str()),
            )));
        }
        Ok(())
    }

    fn fail(&mut self) {
        self.state = CoordinatorState::Failed;
        self.queue.discard();
        self.versions.clear();
    }

    fn wrong_kind(&self, mutation: &EntityMutation) -> Error {
        Error::Mutation(MutationError::new(
            MutationErrorKind::WrongOperationKind,
            mutation.entity(),
            format!(
                "{} mutation submitted to the {} coordinator",
                mutation.kind(),
                self.batch_key
            ),
        ))
    }

    async fn bind_and_queue<C: Connection>(&mut self, cx: &Cx, conn: &C, mutation: &EntityMutation) -> Outcome<(), Error> {
        if mutation.kind() != self.group.kind() || mutation.entity() != self.group.entity() {
            return Outcome::Err(self.wrong_kind(mutation));
        }

        let current = mutation.snapshot();
        let (operations, key, expected) = match mutation {
            EntityMutation::Insert(_) => (self.group.operations().to_vec(), self.batch_key.clone(), None),
            EntityMutation::Delete(entity) => (
                self.group.operations().to_vec(),
                self.batch_key.clone(),
                entity.version.clone(),
            ),
            EntityMutation::Update { current, previous } => {
                let changed = current.changed_attributes(previous);
                if changed.is_empty() {
                    tracing::trace!(id = %current.id, "No changed attributes, nothing to update");
                    self.mutations += 1;
                    return Outcome::Ok(());
                }
                let expected = previous.version.clone().or_else(|| current.version.clone());
                (
                    self.group.plan_update(&changed, self.dynamic_update),
                    self.batch_key.clone(),
                    expected,
                )
            }
            EntityMutation::TouchVersion(entity) => {
                let Some((group, key)) = &self.version_group else {
                    return Outcome::Err(self.wrong_kind(mutation));
                };
                (group.operations().to_vec(), key.clone(), entity.version.clone())
            }
        };

        let next = expected.as_ref().and_then(Value::next_version);
        let statements = try_result!(bind_all(&operations, current, expected.as_ref(), next.as_ref()));

        for statement in statements {
            try_outcome!(self.queue.add(cx, conn, &key, statement).await);
        }
        self.mutations += 1;

        let written = match mutation {
            EntityMutation::Insert(_) if self.group.is_versioned() => {
                Some(current.version.clone().unwrap_or(Value::BigInt(0)))
            }
            EntityMutation::Update { .. } | EntityMutation::TouchVersion(_) => next,
            _ => None,
        };
        if let Some(version) = written {
            self.versions.push(VersionChange {
                entity: current.entity.clone(),
                id: current.id.clone(),
                version,
            });
        }
        Outcome::Ok(())
    }
}

fn bind_all(
    operations: &[MutationOperation],
    current: &EntitySnapshot,
    expected: Option<&Value>,
    next: Option<&Value>,
) -> Result<Vec<PendingStatement>> {
    operations
        .iter()
        .map(|op| {
            let params = op.bind(BindContext {
                current,
                expected_version: expected,
                next_version: next,
            })?;
            Ok(PendingStatement {
                sql: op.sql.clone(),
                params,
                expectation: op.expectation,
                entity: current.entity.clone(),
                table: op.table.clone(),
                identifier: current.id.clone(),
                expected_version: expected.cloned(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::CoordinatorScopeFactory;
    use asupersync::runtime::RuntimeBuilder;
    use rowgraph_core::testing::MockConnection;
    use rowgraph_core::{EngineConfig, EntityMapping};

    fn orders() -> Arc<EntityMapping> {
        EntityMapping::builder("Order", "orders", "id")
            .attribute("total", "total")
            .attribute("status", "status")
            .version("version", "version")
            .build()
            .unwrap()
    }

    fn order(id: i64, version: i64) -> EntitySnapshot {
        EntitySnapshot::new("Order", id)
            .with("total", 10_i64)
            .with("status", "new")
            .with_version(version)
    }

    fn factory(kind: MutationKind) -> CoordinatorScopeFactory {
        CoordinatorScopeFactory::new(&orders(), kind, &EngineConfig::default()).unwrap()
    }

    #[test]
    fn update_binds_expected_and_next_version() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut coordinator = factory(MutationKind::Update).make_scoped_coordinator();
        let previous = order(1, 3);
        let current = previous.clone().with("status", "paid");

        let outcome = rt.block_on(async {
            assert!(matches!(
                coordinator.update(&cx, &conn, current, previous).await,
                Outcome::Ok(())
            ));
            coordinator.drain(&cx, &conn).await
        });

        let Outcome::Ok(outcome) = outcome else {
            panic!("drain failed: {outcome:?}");
        };
        assert_eq!(outcome.versions[0].version, Value::BigInt(4));
        let (sql, params) = &conn.executed()[0];
        assert!(sql.starts_with("UPDATE \"orders\""));
        assert_eq!(params[params.len() - 1], Value::BigInt(3));
        assert_eq!(coordinator.state(), CoordinatorState::Succeeded);
    }

    #[test]
    fn unchanged_update_sends_nothing() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut coordinator = factory(MutationKind::Update).make_scoped_coordinator();

        let outcome = rt.block_on(async {
            let _ = coordinator.update(&cx, &conn, order(1, 3), order(1, 3)).await;
            coordinator.drain(&cx, &conn).await
        });
        assert!(matches!(outcome, Outcome::Ok(ref o) if o.statements == 0 && o.versions.is_empty()));
        assert!(conn.executed().is_empty());
    }

    #[test]
    fn touch_version_uses_the_version_group() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut coordinator = factory(MutationKind::Update).make_scoped_coordinator();

        rt.block_on(async {
            let _ = coordinator.touch_version(&cx, &conn, order(5, 1)).await;
            let _ = coordinator.drain(&cx, &conn).await;
        });
        let (sql, params) = &conn.executed()[0];
        assert_eq!(sql, "UPDATE \"orders\" SET \"version\" = $1 WHERE \"id\" = $2 AND \"version\" = $3");
        assert_eq!(params, &vec![Value::BigInt(2), Value::BigInt(5), Value::BigInt(1)]);
    }

    #[test]
    fn wrong_kind_and_reuse_are_rejected() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut coordinator = factory(MutationKind::Delete).make_scoped_coordinator();

        rt.block_on(async {
            match coordinator.insert(&cx, &conn, order(1, 0)).await {
                Outcome::Err(Error::Mutation(e)) => assert_eq!(e.kind, MutationErrorKind::WrongOperationKind),
                other => panic!("expected wrong kind, got {other:?}"),
            }
            assert_eq!(coordinator.state(), CoordinatorState::Failed);
            match coordinator.delete(&cx, &conn, order(1, 0)).await {
                Outcome::Err(Error::Mutation(e)) => assert_eq!(e.kind, MutationErrorKind::CoordinatorReused),
                other => panic!("expected reuse rejection, got {other:?}"),
            }
        });
        assert!(conn.executed().is_empty());
    }

    #[test]
    fn failed_statement_fails_the_coordinator() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.script_affected("DELETE FROM \"orders\"", 0);
        let mut coordinator = factory(MutationKind::Delete).make_scoped_coordinator();

        rt.block_on(async {
            let submitted = coordinator.delete(&cx, &conn, order(1, 3)).await;
            assert!(matches!(submitted, Outcome::Err(ref e) if e.is_optimistic_lock()));
            assert!(matches!(coordinator.drain(&cx, &conn).await, Outcome::Err(_)));
        });
        assert_eq!(coordinator.state(), CoordinatorState::Failed);
    }
}
