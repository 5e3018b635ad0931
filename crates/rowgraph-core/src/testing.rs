//! Scripted in-memory driver for tests.
//!
//! [`MockConnection`] answers queries from scripted row sets, reports
//! scripted affected-row counts for statements, can inject driver failures
//! or cancellations, and optionally suspends once per call so that
//! concurrently driven operations interleave on a single-threaded runtime.

use crate::connection::Connection;
use crate::error::{DriverError, DriverErrorKind, Error};
use crate::row::Row;
use crate::value::Value;
use asupersync::{CancelReason, Cx, Outcome};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

/// A future that returns `Pending` exactly once, waking itself first.
#[derive(Debug, Default)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, task_cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            task_cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Suspend the current task once, letting other tasks on the loop run.
pub fn yield_now() -> YieldNow {
    YieldNow::default()
}

struct ScriptedQuery {
    sql: String,
    params: Option<Vec<Value>>,
    rows: Vec<Row>,
}

struct ScriptedCount {
    fragment: String,
    param: Option<Value>,
    count: u64,
}

struct MockState {
    queries: Vec<ScriptedQuery>,
    counts: Vec<ScriptedCount>,
    failures: Vec<String>,
    cancellations: Vec<String>,
    default_affected: u64,
    suspend: bool,
    executed: Vec<(String, Vec<Value>)>,
    queried: Vec<(String, Vec<Value>)>,
    query_calls: usize,
    execute_calls: usize,
    batch_sizes: Vec<usize>,
}

impl MockState {
    fn affected_for(&self, sql: &str, params: &[Value]) -> u64 {
        self.counts
            .iter()
            .rev()
            .find(|c| {
                sql.contains(&c.fragment)
                    && c.param.as_ref().is_none_or(|p| {
                        params.iter().any(|v| v.normalized() == p.normalized())
                    })
            })
            .map_or(self.default_affected, |c| c.count)
    }

    fn failure_for(&self, sql: &str) -> Option<&str> {
        self.failures
            .iter()
            .find(|f| sql.contains(f.as_str()))
            .map(String::as_str)
    }

    fn rows_for(&self, sql: &str, params: &[Value]) -> Vec<Row> {
        let exact = self.queries.iter().find(|q| {
            q.sql == sql
                && q.params
                    .as_ref()
                    .is_some_and(|p| p.iter().map(Value::normalized).eq(params.iter().map(Value::normalized)))
        });
        let any = || self.queries.iter().find(|q| q.sql == sql && q.params.is_none());
        exact.or_else(any).map(|q| q.rows.clone()).unwrap_or_default()
    }
}

fn injected(kind: DriverErrorKind, sql: &str, fragment: &str) -> Error {
    Error::Driver(DriverError {
        kind,
        sql: Some(sql.to_string()),
        message: format!("injected failure for '{fragment}'"),
        source: None,
    })
}

/// Scripted connection; clones share the same script and call log.
#[derive(Clone)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnection {
    /// Create a connection where every statement affects one row.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                queries: Vec::new(),
                counts: Vec::new(),
                failures: Vec::new(),
                cancellations: Vec::new(),
                default_affected: 1,
                suspend: false,
                executed: Vec::new(),
                queried: Vec::new(),
                query_calls: 0,
                execute_calls: 0,
                batch_sizes: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Suspend once inside every call before answering.
    pub fn suspending(self) -> Self {
        self.lock().suspend = true;
        self
    }

    /// Answer `sql` with `rows` regardless of parameters.
    pub fn script_query(&self, sql: impl Into<String>, rows: Vec<Row>) {
        self.lock().queries.push(ScriptedQuery {
            sql: sql.into(),
            params: None,
            rows,
        });
    }

    /// Answer `sql` with `rows` when called with exactly `params`.
    pub fn script_query_with(&self, sql: impl Into<String>, params: Vec<Value>, rows: Vec<Row>) {
        self.lock().queries.push(ScriptedQuery {
            sql: sql.into(),
            params: Some(params),
            rows,
        });
    }

    /// Statements containing `fragment` report `count` affected rows.
    pub fn script_affected(&self, fragment: impl Into<String>, count: u64) {
        self.lock().counts.push(ScriptedCount {
            fragment: fragment.into(),
            param: None,
            count,
        });
    }

    /// Statements containing `fragment` and binding `param` report `count`.
    pub fn script_affected_for(&self, fragment: impl Into<String>, param: Value, count: u64) {
        self.lock().counts.push(ScriptedCount {
            fragment: fragment.into(),
            param: Some(param),
            count,
        });
    }

    /// Statements and queries containing `fragment` fail with a driver error.
    pub fn fail_on(&self, fragment: impl Into<String>) {
        self.lock().failures.push(fragment.into());
    }

    /// Queries containing `fragment` come back cancelled.
    pub fn cancel_on(&self, fragment: impl Into<String>) {
        self.lock().cancellations.push(fragment.into());
    }

    /// Every statement executed, batched or not, in submission order.
    pub fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.lock().executed.clone()
    }

    /// Every query issued, in order.
    pub fn queried(&self) -> Vec<(String, Vec<Value>)> {
        self.lock().queried.clone()
    }

    pub fn query_calls(&self) -> usize {
        self.lock().query_calls
    }

    /// Number of `execute` plus `batch` calls.
    pub fn round_trips(&self) -> usize {
        let state = self.lock();
        state.execute_calls + state.batch_sizes.len()
    }

    /// Size of each `batch` call, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }
}

impl Connection for MockConnection {
    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = {
            let mut state = self.lock();
            state.query_calls += 1;
            state.queried.push((sql.to_string(), params.to_vec()));
            if state.cancellations.iter().any(|c| sql.contains(c.as_str())) {
                Outcome::Cancelled(CancelReason::user("injected cancellation"))
            } else {
                match state.failure_for(sql) {
                    Some(fragment) => Outcome::Err(injected(DriverErrorKind::Query, sql, fragment)),
                    None => Outcome::Ok(state.rows_for(sql, params)),
                }
            }
        };
        let suspend = self.lock().suspend;
        async move {
            if suspend {
                yield_now().await;
            }
            result
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = {
            let mut state = self.lock();
            state.execute_calls += 1;
            state.executed.push((sql.to_string(), params.to_vec()));
            match state.failure_for(sql) {
                Some(fragment) => Err(injected(DriverErrorKind::Query, sql, fragment)),
                None => Ok(state.affected_for(sql, params)),
            }
        };
        let suspend = self.lock().suspend;
        async move {
            if suspend {
                yield_now().await;
            }
            match result {
                Ok(count) => Outcome::Ok(count),
                Err(err) => Outcome::Err(err),
            }
        }
    }

    fn batch(
        &self,
        _cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        let result = {
            let mut state = self.lock();
            state.batch_sizes.push(statements.len());
            let mut counts = Vec::with_capacity(statements.len());
            let mut failure = None;
            for (sql, params) in statements {
                state.executed.push((sql.clone(), params.clone()));
                if let Some(fragment) = state.failure_for(sql) {
                    failure = Some(injected(DriverErrorKind::Batch, sql, fragment));
                    break;
                }
                counts.push(state.affected_for(sql, params));
            }
            match failure {
                Some(err) => Err(err),
                None => Ok(counts),
            }
        };
        let suspend = self.lock().suspend;
        async move {
            if suspend {
                yield_now().await;
            }
            match result {
                Ok(counts) => Outcome::Ok(counts),
                Err(err) => Outcome::Err(err),
            }
        }
    }
}
