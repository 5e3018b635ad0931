//! Error types for rowgraph operations.
//!
//! Every failure surfaces as a failed deferred value (`Outcome::Err`). The
//! kinds are kept apart so callers can react differently: an
//! [`Error::OptimisticLock`] can be retried by the unit of work, a
//! [`Error::Driver`] failure is propagated unchanged, and an
//! [`Error::Unsupported`] operation never silently degrades into a blocking
//! call or a "no data" answer.

use crate::value::Value;
use std::fmt;

/// The primary error type for all rowgraph operations.
#[derive(Debug)]
pub enum Error {
    /// An initializer could not resolve its key or instance
    Resolution(ResolutionError),
    /// A versioned mutation affected zero rows
    OptimisticLock(OptimisticLockError),
    /// The database driver failed
    Driver(DriverError),
    /// A capability not available on the asynchronous path
    Unsupported(UnsupportedOperation),
    /// A mutation could not be prepared or its outcome was unexpected
    Mutation(MutationError),
    /// A single result was requested but the query produced none
    NoResult {
        /// Description of the query that produced no rows
        query: String,
    },
    /// A single result was requested but the query produced several
    NonUniqueResult {
        /// Description of the query
        query: String,
        /// Number of distinct results produced
        count: usize,
    },
    /// Invalid configuration or mapping metadata
    Config(ConfigError),
}

/// Failure while resolving one initializer of a row.
#[derive(Debug)]
pub struct ResolutionError {
    pub kind: ResolutionErrorKind,
    /// Navigable path of the initializer (for example `order.customer`)
    pub path: String,
    /// Entity type involved, if any
    pub entity: Option<String>,
    pub message: String,
    pub source: Option<Box<Error>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionErrorKind {
    /// The row does not carry a column the initializer reads
    MissingColumn,
    /// A column carries a value of an unusable type
    TypeMismatch,
    /// A dependency's key was demanded before it was resolved
    KeyUnavailable,
    /// A dependency's instance was demanded before it was resolved
    InstanceUnavailable,
    /// A nested fetch found no row for a non-null key
    NotFound,
    /// The initializer graph has a dependency cycle that keys cannot break
    GraphCycle,
    /// A reference to an initializer that does not exist in the graph
    UnknownInitializer,
}

/// A versioned update or delete matched no row.
#[derive(Debug, Clone)]
pub struct OptimisticLockError {
    pub entity: String,
    pub identifier: Value,
    /// The version the statement required
    pub expected_version: Value,
    pub table: String,
}

/// The driver reported an I/O or database failure.
#[derive(Debug)]
pub struct DriverError {
    pub kind: DriverErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Connection lost or refused
    Connection,
    /// A statement failed
    Query,
    /// A batched round trip failed
    Batch,
}

/// A capability the asynchronous path does not implement.
#[derive(Debug, Clone)]
pub struct UnsupportedOperation {
    pub operation: &'static str,
    /// Asynchronous alternative to call instead, if one exists
    pub alternative: Option<&'static str>,
}

#[derive(Debug)]
pub struct MutationError {
    pub kind: MutationErrorKind,
    pub entity: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationErrorKind {
    /// A statement affected a different number of rows than expected
    UnexpectedRowCount,
    /// A scoped coordinator was used after it had been submitted
    CoordinatorReused,
    /// The entity state carries no identifier
    MissingIdentifier,
    /// The entity has no version value or it cannot be incremented
    InvalidVersion,
    /// The group does not apply to the requested operation
    WrongOperationKind,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl Error {
    /// Is this an optimistic-lock failure?
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    /// Is this an unsupported-operation failure?
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported(_))
    }

    /// Is this a resolution failure?
    pub fn is_resolution(&self) -> bool {
        matches!(self, Error::Resolution(_))
    }

    /// Is this a driver failure?
    pub fn is_driver(&self) -> bool {
        matches!(self, Error::Driver(_))
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Driver(d) => d.sql.as_deref(),
            _ => None,
        }
    }

    /// Build an unsupported-operation error.
    pub fn unsupported(operation: &'static str) -> Self {
        Error::Unsupported(UnsupportedOperation {
            operation,
            alternative: None,
        })
    }

    /// Build the error returned when a blocking entry point is called.
    pub fn blocking_call(operation: &'static str, alternative: &'static str) -> Self {
        Error::Unsupported(UnsupportedOperation {
            operation,
            alternative: Some(alternative),
        })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
        })
    }

    pub fn driver(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Error::Driver(DriverError {
            kind,
            sql: None,
            message: message.into(),
            source: None,
        })
    }
}

impl ResolutionError {
    pub fn new(kind: ResolutionErrorKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            entity: None,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    #[must_use]
    pub fn caused_by(mut self, source: Error) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl MutationError {
    pub fn new(kind: MutationErrorKind, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: entity.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Resolution(e) => write!(f, "Resolution error: {}", e),
            Error::OptimisticLock(e) => write!(f, "Optimistic lock failure: {}", e),
            Error::Driver(e) => write!(f, "Driver error: {}", e),
            Error::Unsupported(e) => write!(f, "Unsupported operation: {}", e),
            Error::Mutation(e) => write!(f, "Mutation error: {}", e),
            Error::NoResult { query } => write!(f, "No result found for query [{}]", query),
            Error::NonUniqueResult { query, count } => write!(
                f,
                "Query [{}] did not return a unique result: {} results",
                query, count
            ),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Resolution(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Driver(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{} [{} at '{}']", self.message, entity, self.path),
            None => write!(f, "{} [at '{}']", self.message, self.path),
        }
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row of {} with id {} in table '{}' was updated or deleted by another \
             transaction (expected version {})",
            self.entity, self.identifier, self.table, self.expected_version
        )
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sql {
            Some(sql) => write!(f, "{} (sql: {})", self.message, sql),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for UnsupportedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.alternative {
            Some(alt) => write!(
                f,
                "'{}' is not available on the non-blocking path, use '{}'",
                self.operation, alt
            ),
            None => write!(f, "'{}' is not implemented yet", self.operation),
        }
    }
}

impl fmt::Display for MutationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.entity)
    }
}

impl From<ResolutionError> for Error {
    fn from(err: ResolutionError) -> Self {
        Error::Resolution(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Error::Driver(err)
    }
}

impl From<UnsupportedOperation> for Error {
    fn from(err: UnsupportedOperation) -> Self {
        Error::Unsupported(err)
    }
}

impl From<MutationError> for Error {
    fn from(err: MutationError) -> Self {
        Error::Mutation(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

/// Result type alias for synchronous rowgraph helpers.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let lock = Error::OptimisticLock(OptimisticLockError {
            entity: "Order".to_string(),
            identifier: Value::BigInt(1),
            expected_version: Value::BigInt(3),
            table: "orders".to_string(),
        });
        assert!(lock.is_optimistic_lock());
        assert!(!lock.is_driver());

        let unsupported = Error::unsupported("reactive_unique");
        assert!(unsupported.is_unsupported());
        assert!(!matches!(unsupported, Error::NoResult { .. }));
    }

    #[test]
    fn display_names_the_alternative_for_blocking_calls() {
        let err = Error::blocking_call("list", "execute_query");
        let text = err.to_string();
        assert!(text.contains("'list'"));
        assert!(text.contains("'execute_query'"));
    }

    #[test]
    fn resolution_error_chains_source() {
        let cause = Error::driver(DriverErrorKind::Query, "relation does not exist");
        let err: Error = ResolutionError::new(
            ResolutionErrorKind::NotFound,
            "order.customer",
            "nested fetch failed",
        )
        .entity("Customer")
        .caused_by(cause)
        .into();

        let source = std::error::Error::source(&err).expect("source present");
        assert!(source.to_string().contains("relation does not exist"));
        assert!(err.to_string().contains("Customer at 'order.customer'"));
    }
}
