//! Batch keys and the per-coordinator statement queue.
//!
//! Statements queued under the same [`BatchKey`] travel to the driver in one
//! round trip. The queue flushes when it reaches the configured batch size,
//! when a statement with a different key arrives, and on explicit drain.
//! Every affected-row count is checked against the statement's expectation;
//! one bad count fails the whole round trip.

use crate::operation::{Expectation, MutationKind};
use rowgraph_core::{
    Connection, Cx, Error, MutationError, MutationErrorKind, OptimisticLockError, Outcome, Result,
    Value, try_outcome, try_result,
};
use serde::Serialize;
use std::fmt;

/// Identifies statements that may share a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BatchKey {
    pub entity: String,
    pub kind: MutationKind,
    /// Distinguishes special groups of the same kind, such as version updates
    pub qualifier: Option<&'static str>,
}

impl BatchKey {
    pub fn new(entity: impl Into<String>, kind: MutationKind) -> Self {
        Self {
            entity: entity.into(),
            kind,
            qualifier: None,
        }
    }

    #[must_use]
    pub fn qualified(mut self, qualifier: &'static str) -> Self {
        self.qualifier = Some(qualifier);
        self
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.qualifier {
            Some(q) => write!(f, "{}#{}({})", self.entity, self.kind, q),
            None => write!(f, "{}#{}", self.entity, self.kind),
        }
    }
}

/// A bound statement waiting for its round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingStatement {
    pub sql: String,
    pub params: Vec<Value>,
    pub expectation: Expectation,
    pub entity: String,
    pub table: String,
    pub identifier: Value,
    pub expected_version: Option<Value>,
}

impl PendingStatement {
    fn check(&self, affected: u64) -> Result<()> {
        match self.expectation {
            Expectation::Versioned if affected == 0 => {
                tracing::warn!(
                    entity = %self.entity,
                    id = %self.identifier,
                    table = %self.table,
                    "Versioned statement matched no row"
                );
                Err(Error::OptimisticLock(OptimisticLockError {
                    entity: self.entity.clone(),
                    identifier: self.identifier.clone(),
                    expected_version: self.expected_version.clone().unwrap_or(Value::Null),
                    table: self.table.clone(),
                }))
            }
            Expectation::Versioned => self.expect_count(1, affected),
            Expectation::RowCount(expected) => self.expect_count(expected, affected),
        }
    }

    fn expect_count(&self, expected: u64, affected: u64) -> Result<()> {
        if expected == affected {
            return Ok(());
        }
        Err(Error::Mutation(MutationError::new(
            MutationErrorKind::UnexpectedRowCount,
            self.entity.as_str(),
            format!(
                "statement on \"{}\" for id {} affected {} rows, expected {}",
                self.table, self.identifier, affected, expected
            ),
        )))
    }
}

/// Counters for the round trips a queue has made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub round_trips: usize,
    pub statements: usize,
    pub rows_affected: u64,
}

/// Mutable queue owned by exactly one scoped coordinator.
#[derive(Debug)]
pub struct BatchQueue {
    batch_size: usize,
    key: Option<BatchKey>,
    statements: Vec<PendingStatement>,
    stats: BatchStats,
}

impl BatchQueue {
    /// A `batch_size` of 1 sends every statement on its own.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            key: None,
            statements: Vec::new(),
            stats: BatchStats::default(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Key of the statements currently queued.
    pub fn key(&self) -> Option<&BatchKey> {
        self.key.as_ref()
    }

    pub fn pending(&self) -> &[PendingStatement] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    /// Drop queued statements without sending them.
    pub fn discard(&mut self) {
        self.statements.clear();
        self.key = None;
    }

    /// Queue a statement, flushing first if it starts a new batch key and
    /// afterwards if the queue is full.
    pub async fn add<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        key: &BatchKey,
        statement: PendingStatement,
    ) -> Outcome<(), Error> {
        if self.key.as_ref().is_some_and(|current| current != key) {
            try_outcome!(self.flush(cx, conn).await);
        }
        if self.key.is_none() {
            self.key = Some(key.clone());
        }
        self.statements.push(statement);
        if self.statements.len() >= self.batch_size {
            try_outcome!(self.flush(cx, conn).await);
        }
        Outcome::Ok(())
    }

    /// Send everything queued in one round trip.
    #[tracing::instrument(level = "debug", skip_all, fields(batch_key = tracing::field::Empty, statements = self.statements.len()))]
    pub async fn flush<C: Connection>(&mut self, cx: &Cx, conn: &C) -> Outcome<(), Error> {
        let statements = std::mem::take(&mut self.statements);
        let key = self.key.take();
        if statements.is_empty() {
            return Outcome::Ok(());
        }
        if let Some(key) = &key {
            tracing::Span::current().record("batch_key", tracing::field::display(key));
        }

        let counts = if let [single] = statements.as_slice() {
            vec![try_outcome!(conn.execute(cx, &single.sql, &single.params).await)]
        } else {
            let batch: Vec<(String, Vec<Value>)> = statements
                .iter()
                .map(|s| (s.sql.clone(), s.params.clone()))
                .collect();
            try_outcome!(conn.batch(cx, &batch).await)
        };
        self.stats.round_trips += 1;

        if counts.len() != statements.len() {
            let entity = statements[0].entity.as_str();
            return Outcome::Err(Error::Mutation(MutationError::new(
                MutationErrorKind::UnexpectedRowCount,
                entity,
                format!(
                    "driver reported {} counts for a batch of {} statements",
                    counts.len(),
                    statements.len()
                ),
            )));
        }
        for (statement, affected) in statements.iter().zip(&counts) {
            try_result!(statement.check(*affected));
        }

        let rows: u64 = counts.iter().sum();
        self.stats.statements += statements.len();
        self.stats.rows_affected += rows;
        tracing::debug!(rows_affected = rows, "Batch flushed");
        Outcome::Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use rowgraph_core::testing::MockConnection;

    fn insert(id: i64) -> PendingStatement {
        PendingStatement {
            sql: "INSERT INTO \"tags\" (\"id\") VALUES ($1)".into(),
            params: vec![Value::BigInt(id)],
            expectation: Expectation::RowCount(1),
            entity: "Tag".into(),
            table: "tags".into(),
            identifier: Value::BigInt(id),
            expected_version: None,
        }
    }

    #[test]
    fn key_display_includes_qualifier() {
        let key = BatchKey::new("Order", MutationKind::Update);
        assert_eq!(key.to_string(), "Order#UPDATE");
        assert_eq!(key.qualified("version").to_string(), "Order#UPDATE(version)");
    }

    #[test]
    fn flushes_at_threshold_and_on_key_change() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let tags = BatchKey::new("Tag", MutationKind::Insert);
        let deletes = BatchKey::new("Tag", MutationKind::Delete);
        let mut queue = BatchQueue::new(2);

        rt.block_on(async {
            assert!(matches!(queue.add(&cx, &conn, &tags, insert(1)).await, Outcome::Ok(())));
            assert_eq!(queue.len(), 1);
            assert!(matches!(queue.add(&cx, &conn, &tags, insert(2)).await, Outcome::Ok(())));
            assert!(queue.is_empty());
            assert!(matches!(queue.add(&cx, &conn, &tags, insert(3)).await, Outcome::Ok(())));
            assert!(matches!(queue.add(&cx, &conn, &deletes, insert(4)).await, Outcome::Ok(())));
            assert_eq!(queue.key(), Some(&deletes));
            assert!(matches!(queue.flush(&cx, &conn).await, Outcome::Ok(())));
        });

        assert_eq!(conn.batch_sizes(), vec![2]);
        assert_eq!(conn.round_trips(), 3);
        assert_eq!(queue.stats().statements, 4);
        assert_eq!(queue.stats().rows_affected, 4);
    }

    #[test]
    fn zero_rows_on_versioned_statement_is_an_optimistic_lock_failure() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.script_affected("UPDATE \"orders\"", 0);
        let key = BatchKey::new("Order", MutationKind::Update);
        let mut queue = BatchQueue::new(1);
        let statement = PendingStatement {
            sql: "UPDATE \"orders\" SET \"version\" = $1 WHERE \"id\" = $2 AND \"version\" = $3".into(),
            params: vec![Value::BigInt(4), Value::BigInt(1), Value::BigInt(3)],
            expectation: Expectation::Versioned,
            entity: "Order".into(),
            table: "orders".into(),
            identifier: Value::BigInt(1),
            expected_version: Some(Value::BigInt(3)),
        };

        match rt.block_on(queue.add(&cx, &conn, &key, statement)) {
            Outcome::Err(Error::OptimisticLock(e)) => {
                assert_eq!(e.expected_version, Value::BigInt(3));
                assert_eq!(e.table, "orders");
            }
            other => panic!("expected optimistic lock failure, got {other:?}"),
        }
    }

    #[test]
    fn unexpected_count_fails_the_round_trip() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.script_affected_for("INSERT INTO \"tags\"", Value::BigInt(2), 0);
        let key = BatchKey::new("Tag", MutationKind::Insert);
        let mut queue = BatchQueue::new(3);

        rt.block_on(async {
            for id in 1..=2 {
                assert!(matches!(queue.add(&cx, &conn, &key, insert(id)).await, Outcome::Ok(())));
            }
            match queue.flush(&cx, &conn).await {
                Outcome::Err(Error::Mutation(e)) => {
                    assert_eq!(e.kind, MutationErrorKind::UnexpectedRowCount);
                }
                other => panic!("expected row count failure, got {other:?}"),
            }
        });
        assert_eq!(queue.stats().statements, 0);
    }
}
