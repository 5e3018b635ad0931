//! Native SQL queries on the asynchronous path.
//!
//! A [`NativeQuery`] pairs SQL text with a compiled result shape. Listing
//! and single-result retrieval go through the row pipeline. Operations the
//! asynchronous path does not implement fail immediately with
//! [`Error::Unsupported`], and so do the blocking entry points: neither
//! ever degrades into an empty answer or a blocking call.

use crate::identity_map::PersistenceContext;
use crate::query::{CompiledQuery, ResultTuple, execute_query, single_result, single_result_or_none};
use rowgraph_core::{Connection, Cx, Error, Outcome, QueryRowSource, Result, Value};
use std::future::ready;

pub struct NativeQuery<'q, C: Connection> {
    conn: &'q C,
    sql: String,
    params: Vec<Value>,
    shape: &'q CompiledQuery,
}

impl<'q, C: Connection> NativeQuery<'q, C> {
    pub fn new(conn: &'q C, sql: impl Into<String>, shape: &'q CompiledQuery) -> Self {
        Self {
            conn,
            sql: sql.into(),
            params: Vec::new(),
            shape,
        }
    }

    /// Bind the next positional parameter.
    #[must_use]
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    fn source(&self) -> QueryRowSource<'q, C> {
        QueryRowSource::new(self.conn, self.sql.clone(), self.params.clone())
    }

    pub async fn list(&self, cx: &Cx, context: &mut PersistenceContext) -> Outcome<Vec<ResultTuple>, Error> {
        let mut source = self.source();
        execute_query(cx, self.conn, self.shape, &mut source, context).await
    }

    /// The only result; no rows is `NoResult` naming this query's SQL.
    pub async fn single_result(&self, cx: &Cx, context: &mut PersistenceContext) -> Outcome<ResultTuple, Error> {
        let mut source = self.source();
        let shape = self.shape.described_as(self.sql.clone());
        single_result(cx, self.conn, &shape, &mut source, context).await
    }

    pub async fn single_result_or_none(
        &self,
        cx: &Cx,
        context: &mut PersistenceContext,
    ) -> Outcome<Option<ResultTuple>, Error> {
        let mut source = self.source();
        let shape = self.shape.described_as(self.sql.clone());
        single_result_or_none(cx, self.conn, &shape, &mut source, context).await
    }

    /// Bulk update or delete through native SQL.
    pub fn execute_update(&self, _cx: &Cx) -> impl Future<Output = Outcome<u64, Error>> {
        ready(Outcome::Err(Error::unsupported("execute_update")))
    }

    pub fn unique_result_optional(
        &self,
        _cx: &Cx,
        _context: &mut PersistenceContext,
    ) -> impl Future<Output = Outcome<Option<ResultTuple>, Error>> {
        ready(Outcome::Err(Error::unsupported("unique_result_optional")))
    }

    /// Apply a named fetch graph to the result shape.
    pub fn apply_graph(&mut self, _graph: &str) -> Outcome<(), Error> {
        Outcome::Err(Error::unsupported("apply_graph"))
    }

    pub fn result_list_blocking(&self) -> Result<Vec<ResultTuple>> {
        Err(Error::blocking_call("result_list_blocking", "list"))
    }

    pub fn single_result_blocking(&self) -> Result<ResultTuple> {
        Err(Error::blocking_call("single_result_blocking", "single_result"))
    }

    pub fn execute_update_blocking(&self) -> Result<u64> {
        Err(Error::blocking_call("execute_update_blocking", "execute_update"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::Assembler;
    use crate::graph::InitializerGraph;
    use asupersync::runtime::RuntimeBuilder;
    use rowgraph_core::testing::MockConnection;
    use rowgraph_core::{EntityMapping, Row};

    const SQL: &str = "SELECT c.id AS c__id, c.name AS c__name FROM customers c WHERE c.name = $1";

    fn shape() -> CompiledQuery {
        let mapping = EntityMapping::builder("Customer", "customers", "id")
            .attribute("name", "name")
            .build()
            .unwrap();
        let mut b = InitializerGraph::builder();
        let customer = b.entity("customer", mapping, "c");
        CompiledQuery::new("customers by name", b.build().unwrap(), vec![Assembler::entity(customer)]).unwrap()
    }

    #[test]
    fn list_runs_sql_with_bound_parameters() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.script_query(
            SQL,
            vec![Row::new(
                vec!["c__id".into(), "c__name".into()],
                vec![Value::BigInt(1), Value::Text("Ada".into())],
            )],
        );
        let shape = shape();
        let query = NativeQuery::new(&conn, SQL, &shape).bind("Ada");
        let mut context = PersistenceContext::new();

        let results = rt.block_on(query.list(&cx, &mut context));
        assert!(matches!(results, Outcome::Ok(ref r) if r.len() == 1));
        assert_eq!(conn.queried()[0].1, vec![Value::Text("Ada".into())]);
    }

    #[test]
    fn empty_single_result_names_the_sql() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let shape = shape();
        let query = NativeQuery::new(&conn, SQL, &shape);
        let mut context = PersistenceContext::new();

        match rt.block_on(query.single_result(&cx, &mut context)) {
            Outcome::Err(err @ Error::NoResult { .. }) => {
                assert_eq!(err.to_string(), format!("No result found for query [{SQL}]"));
            }
            other => panic!("expected no result, got {other:?}"),
        }
    }

    #[test]
    fn unimplemented_operations_fail_fast() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let shape = shape();
        let mut query = NativeQuery::new(&conn, SQL, &shape);
        let mut context = PersistenceContext::new();

        let update = rt.block_on(query.execute_update(&cx));
        assert!(matches!(update, Outcome::Err(ref e) if e.is_unsupported()));
        let optional = rt.block_on(query.unique_result_optional(&cx, &mut context));
        assert!(matches!(optional, Outcome::Err(ref e) if e.is_unsupported()));
        assert!(matches!(query.apply_graph("order.lines"), Outcome::Err(ref e) if e.is_unsupported()));
        assert!(query.result_list_blocking().unwrap_err().is_unsupported());
        assert!(query.single_result_blocking().unwrap_err().is_unsupported());
        assert!(query.execute_update_blocking().unwrap_err().is_unsupported());
        assert_eq!(conn.query_calls(), 0);
    }
}
