//! The row pipeline.
//!
//! One call to [`RowPipeline::process_row`] drives a row through the compiled
//! graph in a fixed sequence:
//!
//! 1. resolve every key in key order,
//! 2. instantiate eager initializers in instance order,
//! 3. run the assemblers, each forcing full instantiation of what it exposes,
//! 4. instantiate anything still only key-resolved,
//! 5. publish the row's instances and associations.
//!
//! Nested fetches in steps 2 to 4 suspend the pass without blocking the loop.
//! A failure at any step returns before step 5, so the context never sees a
//! partially initialized entity.

use crate::assembler::{Assembler, ResultValue};
use crate::graph::InitializerGraph;
use crate::identity_map::PersistenceContext;
use crate::processing::{RowProcessingState, Transition};
use rowgraph_core::{Connection, Cx, Error, Outcome, Result, Row, try_outcome, try_result};
use std::sync::Arc;

/// The output of one row pass.
#[derive(Debug)]
pub struct ProcessedRow {
    pub values: Vec<ResultValue>,
    /// Lifecycle transitions in the order they happened
    pub history: Vec<Transition>,
}

/// Compiled graph plus the assemblers of one result shape.
#[derive(Debug, Clone)]
pub struct RowPipeline {
    graph: Arc<InitializerGraph>,
    assemblers: Vec<Assembler>,
}

impl RowPipeline {
    /// Fails if an assembler refers to an initializer outside `graph`.
    pub fn new(graph: Arc<InitializerGraph>, assemblers: Vec<Assembler>) -> Result<Self> {
        for assembler in &assemblers {
            if let Some(id) = assembler.initializer() {
                graph.check(id)?;
            }
        }
        Ok(Self { graph, assemblers })
    }

    pub fn graph(&self) -> &InitializerGraph {
        &self.graph
    }

    pub fn assemblers(&self) -> &[Assembler] {
        &self.assemblers
    }

    #[tracing::instrument(level = "debug", skip_all, fields(position = row.position()))]
    pub async fn process_row<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        context: &mut PersistenceContext,
        row: Row,
    ) -> Outcome<ProcessedRow, Error> {
        let (values, staged) = {
            let mut state = RowProcessingState::new(&self.graph, conn, context, row);
            try_result!(state.resolve_keys());
            try_outcome!(state.resolve_eager(cx).await);

            let mut values = Vec::with_capacity(self.assemblers.len());
            for assembler in &self.assemblers {
                values.push(try_outcome!(assembler.assemble(cx, &mut state).await));
            }

            try_outcome!(state.force_remaining(cx).await);
            let staged = try_result!(state.finish());
            (values, staged)
        };

        let created = staged.created();
        let history = staged.apply(context);
        tracing::trace!(created, transitions = history.len(), "Row committed");
        Outcome::Ok(ProcessedRow { values, history })
    }
}
