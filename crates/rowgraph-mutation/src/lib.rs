//! Mutation coordination for rowgraph.
//!
//! - [`MutationOperationGroup`]: the immutable statement template of one
//!   entity type and kind, built once and shared by `Arc`
//! - [`CoordinatorScopeFactory`]: turns one template into any number of
//!   [`ScopedCoordinator`]s, each with private batching and version state
//! - [`BatchQueue`] and [`BatchKey`]: grouping of statements into round trips
//! - [`flush`]: ordered execution of a whole dirty set

pub mod batch;
pub mod coordinator;
pub mod flush;
pub mod group;
pub mod operation;
pub mod scope;

pub use batch::{BatchKey, BatchQueue, BatchStats, PendingStatement};
pub use coordinator::{CoordinatorState, EntityMutation, MutationOutcome, ScopedCoordinator, VersionChange};
pub use flush::{FlushOrderer, FlushPlan, FlushResult, flush};
pub use group::MutationOperationGroup;
pub use operation::{BindContext, Binding, Expectation, MutationKind, MutationOperation};
pub use scope::{CoordinatorRegistry, CoordinatorScopeFactory, EntityFactories, execute_mutation};
