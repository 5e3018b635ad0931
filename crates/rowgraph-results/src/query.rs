//! Query execution over a row source.

use crate::assembler::{Assembler, ResultValue};
use crate::graph::InitializerGraph;
use crate::identity_map::PersistenceContext;
use crate::pipeline::RowPipeline;
use rowgraph_core::{Connection, Cx, EntityKey, Error, Outcome, Result, RowSource, try_outcome};
use std::collections::HashSet;
use std::sync::Arc;

/// One result tuple, one value per assembler.
pub type ResultTuple = Vec<ResultValue>;

/// A query's result shape, compiled once and reused for every execution.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    description: String,
    pipeline: RowPipeline,
    unique_roots: bool,
}

impl CompiledQuery {
    /// `description` names the query in diagnostics, usually its SQL.
    pub fn new(
        description: impl Into<String>,
        graph: Arc<InitializerGraph>,
        assemblers: Vec<Assembler>,
    ) -> Result<Self> {
        Ok(Self {
            description: description.into(),
            pipeline: RowPipeline::new(graph, assemblers)?,
            unique_roots: true,
        })
    }

    /// Whether tuples repeating an earlier tuple are dropped.
    ///
    /// Collection joins repeat the owner on every element row; with this on
    /// (the default) a projection of the owner alone lists it once. Tuples
    /// are compared slot by slot, so `[owner, element]` keeps every element.
    #[must_use]
    pub fn unique_roots(mut self, enabled: bool) -> Self {
        self.unique_roots = enabled;
        self
    }

    /// A copy of this query named `description` in diagnostics.
    #[must_use]
    pub fn described_as(&self, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..self.clone()
        }
    }

    pub fn unique_roots_enabled(&self) -> bool {
        self.unique_roots
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn pipeline(&self) -> &RowPipeline {
        &self.pipeline
    }
}

/// Tuples already produced, compared slot by slot with [`ResultValue::same_as`].
///
/// Tuples made only of entities and absent slots are looked up by key;
/// the rest are compared against earlier tuples of the same kind.
#[derive(Default)]
struct DistinctTuples {
    keyed: HashSet<Vec<Option<EntityKey>>>,
    unkeyed: Vec<ResultTuple>,
}

impl DistinctTuples {
    /// Record `tuple`, returning false if an equal tuple was seen before.
    fn insert(&mut self, tuple: &ResultTuple) -> bool {
        match entity_keys(tuple) {
            Some(keys) => self.keyed.insert(keys),
            None => {
                let seen = self.unkeyed.iter().any(|earlier| {
                    earlier.len() == tuple.len() && earlier.iter().zip(tuple).all(|(a, b)| a.same_as(b))
                });
                if !seen {
                    self.unkeyed.push(tuple.clone());
                }
                !seen
            }
        }
    }

    fn len(&self) -> usize {
        self.keyed.len() + self.unkeyed.len()
    }
}

fn entity_keys(tuple: &ResultTuple) -> Option<Vec<Option<EntityKey>>> {
    tuple
        .iter()
        .map(|slot| match slot {
            ResultValue::Entity(e) => Some(Some(e.key().clone())),
            ResultValue::Absent => Some(None),
            ResultValue::Scalar(_) | ResultValue::Embedded(_) => None,
        })
        .collect()
}

/// Drive every row of `source` through the pipeline and collect results.
#[tracing::instrument(level = "debug", skip_all, fields(query = %query.description))]
pub async fn execute_query<C: Connection, S: RowSource>(
    cx: &Cx,
    conn: &C,
    query: &CompiledQuery,
    source: &mut S,
    context: &mut PersistenceContext,
) -> Outcome<Vec<ResultTuple>, Error> {
    let mut results = Vec::new();
    let mut seen = DistinctTuples::default();
    let mut rows = 0usize;

    while let Some(row) = try_outcome!(source.next_row(cx).await) {
        rows += 1;
        let processed = try_outcome!(query.pipeline.process_row(cx, conn, context, row).await);
        if query.unique_roots && !seen.insert(&processed.values) {
            continue;
        }
        results.push(processed.values);
    }

    tracing::debug!(rows, results = results.len(), "Query executed");
    Outcome::Ok(results)
}

/// Number of distinct tuples in `results`.
fn distinct_results(results: &[ResultTuple]) -> usize {
    let mut distinct = DistinctTuples::default();
    for tuple in results {
        distinct.insert(tuple);
    }
    distinct.len()
}

/// Execute and return the only result.
///
/// No rows is [`Error::NoResult`]; more than one distinct result is
/// [`Error::NonUniqueResult`].
pub async fn single_result<C: Connection, S: RowSource>(
    cx: &Cx,
    conn: &C,
    query: &CompiledQuery,
    source: &mut S,
    context: &mut PersistenceContext,
) -> Outcome<ResultTuple, Error> {
    match try_outcome!(single_result_or_none(cx, conn, query, source, context).await) {
        Some(tuple) => Outcome::Ok(tuple),
        None => Outcome::Err(Error::NoResult {
            query: query.description.clone(),
        }),
    }
}

/// Execute and return the only result, or `None` when there are no rows.
pub async fn single_result_or_none<C: Connection, S: RowSource>(
    cx: &Cx,
    conn: &C,
    query: &CompiledQuery,
    source: &mut S,
    context: &mut PersistenceContext,
) -> Outcome<Option<ResultTuple>, Error> {
    let results = try_outcome!(execute_query(cx, conn, query, source, context).await);
    let distinct = distinct_results(&results);
    if distinct > 1 {
        return Outcome::Err(Error::NonUniqueResult {
            query: query.description.clone(),
            count: distinct,
        });
    }
    Outcome::Ok(results.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initializer::CollectionKeySource;
    use asupersync::runtime::RuntimeBuilder;
    use rowgraph_core::testing::MockConnection;
    use rowgraph_core::{EntityMapping, Row, Value, VecRowSource};

    fn mapping(name: &str, table: &str) -> Arc<EntityMapping> {
        EntityMapping::builder(name, table, "id")
            .attribute("name", "name")
            .build()
            .unwrap()
    }

    fn customer_with_addresses() -> CompiledQuery {
        let mut b = InitializerGraph::builder();
        let customer = b.entity("customer", mapping("Customer", "customers"), "c");
        let address = b.entity("customer.addresses.element", mapping("Address", "addresses"), "a");
        b.collection(customer, "addresses", CollectionKeySource::Owner, address);
        CompiledQuery::new(
            "customers with addresses",
            b.build().unwrap(),
            vec![Assembler::entity(customer)],
        )
        .unwrap()
    }

    fn customer_address_pairs() -> CompiledQuery {
        let mut b = InitializerGraph::builder();
        let customer = b.entity("customer", mapping("Customer", "customers"), "c");
        let address = b.entity("customer.addresses.element", mapping("Address", "addresses"), "a");
        b.collection(customer, "addresses", CollectionKeySource::Owner, address);
        CompiledQuery::new(
            "customer address pairs",
            b.build().unwrap(),
            vec![Assembler::entity(customer), Assembler::entity(address)],
        )
        .unwrap()
    }

    fn rows(data: &[(i64, Option<i64>)]) -> Vec<Row> {
        data.iter()
            .map(|(customer, address)| {
                Row::new(
                    vec!["c__id".into(), "c__name".into(), "a__id".into(), "a__name".into()],
                    vec![
                        Value::BigInt(*customer),
                        Value::Text(format!("customer {customer}")),
                        Value::from(*address),
                        Value::from(address.map(|a| format!("street {a}"))),
                    ],
                )
            })
            .collect()
    }

    #[test]
    fn collection_rows_fold_into_one_owner() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let query = customer_with_addresses();
        let mut context = PersistenceContext::new();
        let mut source = VecRowSource::new(rows(&[(1, Some(10)), (1, Some(11)), (2, None)]));

        let results = rt.block_on(async {
            match execute_query(&cx, &conn, &query, &mut source, &mut context).await {
                Outcome::Ok(results) => results,
                other => panic!("query failed: {other:?}"),
            }
        });

        assert_eq!(results.len(), 2);
        let first = results[0][0].as_entity().unwrap();
        assert_eq!(first.collection("addresses").map(|c| c.len()), Some(2));
        let second = results[1][0].as_entity().unwrap();
        assert_eq!(second.collection("addresses").map(|c| c.len()), Some(0));
    }

    #[test]
    fn single_result_distinguishes_empty_and_non_unique() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let query = customer_with_addresses();

        rt.block_on(async {
            let mut context = PersistenceContext::new();
            let mut empty = VecRowSource::new(vec![]);
            match single_result(&cx, &conn, &query, &mut empty, &mut context).await {
                Outcome::Err(Error::NoResult { query }) => {
                    assert_eq!(query, "customers with addresses");
                }
                other => panic!("expected no result, got {other:?}"),
            }

            let mut empty = VecRowSource::new(vec![]);
            assert!(matches!(
                single_result_or_none(&cx, &conn, &query, &mut empty, &mut context).await,
                Outcome::Ok(None)
            ));

            let mut one = VecRowSource::new(rows(&[(1, Some(10)), (1, Some(11))]));
            assert!(matches!(
                single_result(&cx, &conn, &query, &mut one, &mut context).await,
                Outcome::Ok(_)
            ));

            let mut two = VecRowSource::new(rows(&[(1, None), (2, None)]));
            match single_result(&cx, &conn, &query, &mut two, &mut context).await {
                Outcome::Err(Error::NonUniqueResult { count, .. }) => assert_eq!(count, 2),
                other => panic!("expected non-unique, got {other:?}"),
            }
        });
    }

    #[test]
    fn unique_tuples_compare_every_slot() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let query = customer_address_pairs();
        let mut context = PersistenceContext::new();
        let mut source = VecRowSource::new(rows(&[(1, Some(10)), (1, Some(11)), (1, Some(10))]));

        let results = rt.block_on(async {
            match execute_query(&cx, &conn, &query, &mut source, &mut context).await {
                Outcome::Ok(results) => results,
                other => panic!("query failed: {other:?}"),
            }
        });

        assert_eq!(results.len(), 2);
        assert!(results[0][0].same_as(&results[1][0]));
        assert!(!results[0][1].same_as(&results[1][1]));
    }

    #[test]
    fn single_result_counts_whole_tuples() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let pairs = customer_address_pairs().unique_roots(false);
        let mut b = InitializerGraph::builder();
        let _customer = b.entity("customer", mapping("Customer", "customers"), "c");
        let names = CompiledQuery::new("customer names", b.build().unwrap(), vec![Assembler::basic("c__name")])
            .unwrap()
            .unique_roots(false);

        rt.block_on(async {
            let mut context = PersistenceContext::new();
            let mut source = VecRowSource::new(rows(&[(1, Some(10)), (1, Some(11))]));
            match single_result(&cx, &conn, &pairs, &mut source, &mut context).await {
                Outcome::Err(Error::NonUniqueResult { count, .. }) => assert_eq!(count, 2),
                other => panic!("expected non-unique, got {other:?}"),
            }

            let mut repeated = VecRowSource::new(rows(&[(1, Some(10)), (1, Some(10))]));
            assert!(matches!(
                single_result(&cx, &conn, &pairs, &mut repeated, &mut context).await,
                Outcome::Ok(_)
            ));

            let mut same_name = VecRowSource::new(rows(&[(1, Some(10)), (1, Some(11))]));
            assert!(matches!(
                single_result(&cx, &conn, &names, &mut same_name, &mut context).await,
                Outcome::Ok(_)
            ));
            let mut two_names = VecRowSource::new(rows(&[(1, None), (2, None)]));
            assert!(matches!(
                single_result(&cx, &conn, &names, &mut two_names, &mut context).await,
                Outcome::Err(Error::NonUniqueResult { count: 2, .. })
            ));
        });
    }
}
