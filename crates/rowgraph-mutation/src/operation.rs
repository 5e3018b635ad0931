//! Single mutation statements and their parameter-binding plans.

use rowgraph_core::{EntitySnapshot, Error, MutationError, MutationErrorKind, Result, Value};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

impl MutationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MutationKind::Insert => "INSERT",
            MutationKind::Update => "UPDATE",
            MutationKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where one statement parameter is taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Current value of an attribute
    Attribute(String),
    /// The entity's identifier
    Identifier,
    /// Version written by an insert; zero when the entity carries none
    InitialVersion,
    /// Version the row must still have for the statement to apply
    ExpectedVersion,
    /// Incremented version written by an update
    NextVersion,
}

/// How many rows a statement must affect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// Exactly this many rows
    RowCount(u64),
    /// One row; zero rows means the version predicate failed
    Versioned,
}

/// Values a binding plan draws from.
#[derive(Debug, Clone, Copy)]
pub struct BindContext<'a> {
    pub current: &'a EntitySnapshot,
    pub expected_version: Option<&'a Value>,
    pub next_version: Option<&'a Value>,
}

/// One SQL statement against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationOperation {
    pub table: String,
    /// Position of the table in the mapping, root first
    pub table_index: usize,
    pub sql: String,
    pub bindings: Vec<Binding>,
    /// Attributes this statement writes
    pub attributes: Vec<String>,
    pub expectation: Expectation,
}

impl MutationOperation {
    /// Whether the statement writes any of `changed`.
    pub fn writes_any(&self, changed: &[String]) -> bool {
        self.attributes.iter().any(|a| changed.contains(a))
    }

    /// Resolve the binding plan against live entity state.
    pub fn bind(&self, cx: BindContext<'_>) -> Result<Vec<Value>> {
        let entity = cx.current.entity.as_str();
        self.bindings
            .iter()
            .map(|binding| match binding {
                Binding::Attribute(name) => Ok(cx.current.attribute(name).clone()),
                Binding::Identifier => {
                    if cx.current.id.is_null() {
                        Err(Error::Mutation(MutationError::new(
                            MutationErrorKind::MissingIdentifier,
                            entity,
                            format!("{} on \"{}\" needs an identifier", self.kind_word(), self.table),
                        )))
                    } else {
                        Ok(cx.current.id.clone())
                    }
                }
                Binding::InitialVersion => Ok(cx
                    .current
                    .version
                    .clone()
                    .unwrap_or(Value::BigInt(0))),
                Binding::ExpectedVersion => cx.expected_version.cloned().ok_or_else(|| {
                    Error::Mutation(MutationError::new(
                        MutationErrorKind::InvalidVersion,
                        entity,
                        "versioned statement without a current version",
                    ))
                }),
                Binding::NextVersion => cx.next_version.cloned().ok_or_else(|| {
                    Error::Mutation(MutationError::new(
                        MutationErrorKind::InvalidVersion,
                        entity,
                        "version cannot be incremented",
                    ))
                }),
            })
            .collect()
    }

    fn kind_word(&self) -> &str {
        self.sql.split_whitespace().next().unwrap_or("statement")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update_op() -> MutationOperation {
        MutationOperation {
            table: "orders".into(),
            table_index: 0,
            sql: "UPDATE \"orders\" SET \"total\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4".into(),
            bindings: vec![
                Binding::Attribute("total".into()),
                Binding::NextVersion,
                Binding::Identifier,
                Binding::ExpectedVersion,
            ],
            attributes: vec!["total".into()],
            expectation: Expectation::Versioned,
        }
    }

    #[test]
    fn binds_in_plan_order() {
        let current = EntitySnapshot::new("Order", 7_i64).with("total", 30_i64).with_version(3_i64);
        let expected = Value::BigInt(3);
        let next = Value::BigInt(4);
        let params = update_op()
            .bind(BindContext {
                current: &current,
                expected_version: Some(&expected),
                next_version: Some(&next),
            })
            .unwrap();
        assert_eq!(
            params,
            vec![Value::BigInt(30), Value::BigInt(4), Value::BigInt(7), Value::BigInt(3)]
        );
    }

    #[test]
    fn missing_identifier_is_reported() {
        let current = EntitySnapshot::new("Order", Value::Null).with("total", 1_i64);
        let err = update_op()
            .bind(BindContext {
                current: &current,
                expected_version: Some(&Value::BigInt(1)),
                next_version: Some(&Value::BigInt(2)),
            })
            .unwrap_err();
        match err {
            Error::Mutation(e) => {
                assert_eq!(e.kind, MutationErrorKind::MissingIdentifier);
                assert!(e.message.starts_with("UPDATE"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_version_is_reported() {
        let current = EntitySnapshot::new("Order", 1_i64);
        let err = update_op()
            .bind(BindContext {
                current: &current,
                expected_version: None,
                next_version: None,
            })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Mutation(MutationError {
                kind: MutationErrorKind::InvalidVersion,
                ..
            })
        ));
    }

    #[test]
    fn writes_any_checks_attribute_overlap() {
        let op = update_op();
        assert!(op.writes_any(&["total".to_string()]));
        assert!(!op.writes_any(&["status".to_string()]));
    }
}
