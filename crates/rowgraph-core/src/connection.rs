//! Database driver boundary.
//!
//! This module defines the two collaborator traits the engine consumes:
//!
//! - [`Connection`] - executes statements and returns rows or affected-row counts
//! - [`RowSource`] - yields the rows of one query execution, one at a time
//!
//! SQL text and parameter encoding belong to the driver. All operations take
//! a `Cx` context and return `Outcome` so cancellation and driver failures
//! propagate as failed deferred values.

use crate::error::Error;
use crate::row::Row;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::collections::VecDeque;

/// A database connection capable of executing statements.
///
/// Implementations must be `Send + Sync`; the futures they return are
/// awaited on a single-threaded cooperative runtime but may be moved between
/// polls.
pub trait Connection: Send + Sync {
    /// Execute a query and return all rows.
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Execute several statements in one round trip.
    ///
    /// Returns the number of rows affected by each statement, in order.
    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send;
}

/// An asynchronous source of result rows for one query execution.
pub trait RowSource {
    /// Fetch the next row, or `None` once the result set is exhausted.
    fn next_row(&mut self, cx: &Cx) -> impl Future<Output = Outcome<Option<Row>, Error>>;
}

/// A row source over rows that are already in memory.
///
/// Rows are stamped with their cursor position as they are handed out.
#[derive(Debug, Default)]
pub struct VecRowSource {
    rows: VecDeque<Row>,
    position: usize,
}

impl VecRowSource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into(),
            position: 0,
        }
    }

    /// Number of rows not yet handed out.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

impl RowSource for VecRowSource {
    fn next_row(&mut self, _cx: &Cx) -> impl Future<Output = Outcome<Option<Row>, Error>> {
        let next = self.rows.pop_front().map(|row| {
            let row = row.at_position(self.position);
            self.position += 1;
            row
        });
        async move { Outcome::Ok(next) }
    }
}

/// A row source that runs a query on first use and then streams its rows.
pub struct QueryRowSource<'c, C: Connection> {
    conn: &'c C,
    sql: String,
    params: Vec<Value>,
    fetched: Option<VecRowSource>,
}

impl<'c, C: Connection> QueryRowSource<'c, C> {
    pub fn new(conn: &'c C, sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            conn,
            sql: sql.into(),
            params,
            fetched: None,
        }
    }

    /// The SQL this source executes.
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl<C: Connection> RowSource for QueryRowSource<'_, C> {
    #[allow(clippy::manual_async_fn)]
    fn next_row(&mut self, cx: &Cx) -> impl Future<Output = Outcome<Option<Row>, Error>> {
        async move {
            if self.fetched.is_none() {
                tracing::trace!(sql = %self.sql, "Fetching rows for query");
                let rows = crate::try_outcome!(self.conn.query(cx, &self.sql, &self.params).await);
                tracing::debug!(row_count = rows.len(), "Query returned rows");
                self.fetched = Some(VecRowSource::new(rows));
            }
            match self.fetched.as_mut() {
                Some(source) => source.next_row(cx).await,
                None => Outcome::Ok(None),
            }
        }
    }
}
