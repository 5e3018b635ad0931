//! Core types and traits for rowgraph.
//!
//! This crate provides the foundations shared by the result-resolution and
//! mutation layers:
//!
//! - [`Value`] and [`Row`] for raw column data
//! - [`Connection`] and [`RowSource`], the asynchronous database driver boundary
//! - [`EntityMapping`] mapping metadata, built once per entity type
//! - [`EntityKey`] / [`EntityInstance`] for identity-mapped object state
//! - [`Error`] with the distinct resolution, optimistic-lock, driver and
//!   unsupported-operation kinds
//! - `Outcome` re-export from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod config;
pub mod connection;
pub mod entity;
pub mod error;
pub mod mapping;
pub mod row;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod value;

pub use config::EngineConfig;
pub use connection::{Connection, QueryRowSource, RowSource, VecRowSource};
pub use entity::{Embedded, EntityInstance, EntityKey, EntityRef, EntitySnapshot};
pub use error::{
    ConfigError, DriverError, DriverErrorKind, Error, MutationError, MutationErrorKind,
    OptimisticLockError, ResolutionError, ResolutionErrorKind, Result, UnsupportedOperation,
};
pub use mapping::{AttributeMapping, EntityMapping, EntityMappingBuilder, TableMapping};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;

/// Unwrap an `Outcome::Ok`, returning early from the enclosing function on
/// `Err`, `Cancelled` or `Panicked`.
/// The error is converted with `Into`.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(err) => return $crate::Outcome::Err(err.into()),
            $crate::Outcome::Cancelled(reason) => return $crate::Outcome::Cancelled(reason),
            $crate::Outcome::Panicked(payload) => return $crate::Outcome::Panicked(payload),
        }
    };
}

/// Unwrap a `Result`, returning `Outcome::Err` from the enclosing function on failure.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => return $crate::Outcome::Err(err.into()),
        }
    };
}
