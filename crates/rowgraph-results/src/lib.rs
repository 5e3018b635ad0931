//! Row-to-object resolution for rowgraph.
//!
//! This crate turns result rows into fully initialized object graphs:
//!
//! - [`InitializerGraph`]: the compiled dependency graph of one result shape
//! - [`RowPipeline`]: drives one row through the graph in key, instance and
//!   visibility order
//! - [`Assembler`]: exposes one projected value of a row
//! - [`PersistenceContext`]: the identity map of one unit of work
//! - [`execute_query`] and the single-result helpers, plus [`NativeQuery`]

pub mod assembler;
pub mod graph;
pub mod identity_map;
pub mod initializer;
pub mod loader;
pub mod native;
pub mod pipeline;
pub mod processing;
pub mod query;

pub use assembler::{Assembler, ResultValue};
pub use graph::{GraphBuilder, InitializerGraph};
pub use identity_map::PersistenceContext;
pub use initializer::{
    CollectionKeySource, DependencyKind, FetchTiming, Initializer, InitializerId, ResolutionState,
    ToOneFetch, aliased_column,
};
pub use loader::{instance_from_row, load_by_key};
pub use native::NativeQuery;
pub use pipeline::{ProcessedRow, RowPipeline};
pub use processing::{ResolvedInstance, ResolvedKey, RowProcessingState, StagedRow, Transition};
pub use query::{
    CompiledQuery, ResultTuple, execute_query, single_result, single_result_or_none,
};
