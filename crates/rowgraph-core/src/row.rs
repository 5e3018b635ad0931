//! Result rows.
//!
//! A [`Row`] carries the aliased columns produced by one cursor step. Rows of
//! one result set share a single [`ColumnInfo`]. Every lookup made on behalf
//! of an initializer goes through [`Row::require`], so a missing column is
//! reported with the initializer path and the cursor position.

use crate::Result;
use crate::error::{Error, ResolutionError, ResolutionErrorKind};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column aliases of a result set, in select order.
#[derive(Debug, Clone, Default)]
pub struct ColumnInfo {
    aliases: Vec<String>,
    positions: HashMap<String, usize>,
}

impl ColumnInfo {
    pub fn new(aliases: Vec<String>) -> Self {
        let positions = aliases.iter().cloned().zip(0..).collect();
        Self { aliases, positions }
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn position_of(&self, alias: &str) -> Option<usize> {
        self.positions.get(alias).copied()
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// One row of a result set.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<ColumnInfo>,
    values: Vec<Value>,
    position: usize,
}

impl Row {
    pub fn new(aliases: Vec<String>, values: Vec<Value>) -> Self {
        Self::shared(Arc::new(ColumnInfo::new(aliases)), values)
    }

    /// A row reusing the columns of an earlier row of the same result set.
    pub fn shared(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self {
            columns,
            values,
            position: 0,
        }
    }

    /// Stamp the cursor position.
    #[must_use]
    pub fn at_position(mut self, position: usize) -> Self {
        self.position = position;
        self
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn columns(&self) -> &Arc<ColumnInfo> {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, alias: &str) -> Option<&Value> {
        self.columns
            .position_of(alias)
            .and_then(|i| self.values.get(i))
    }

    /// The value under `alias`, or a `MissingColumn` error blamed on `path`.
    pub fn require(&self, alias: &str, path: &str) -> Result<&Value> {
        self.value(alias).ok_or_else(|| {
            ResolutionError::new(
                ResolutionErrorKind::MissingColumn,
                path,
                format!(
                    "row {} has no column '{alias}' ({} columns)",
                    self.position,
                    self.len()
                ),
            )
            .into()
        })
    }

    /// Typed read of a required column.
    pub fn decode<T: FromValue>(&self, alias: &str) -> Result<T> {
        T::from_value(self.require(alias, alias)?, alias)
    }
}

/// Conversion of a column value into a Rust type.
pub trait FromValue: Sized {
    fn from_value(value: &Value, alias: &str) -> Result<Self>;
}

fn type_mismatch(wanted: &str, found: &Value, alias: &str) -> Error {
    ResolutionError::new(
        ResolutionErrorKind::TypeMismatch,
        alias,
        format!("wanted {wanted}, column holds {}", found.kind_name()),
    )
    .into()
}

impl FromValue for Value {
    fn from_value(value: &Value, _alias: &str) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value, alias: &str) -> Result<Self> {
        value.as_i64().ok_or_else(|| type_mismatch("an integer", value, alias))
    }
}

impl FromValue for String {
    fn from_value(value: &Value, alias: &str) -> Result<Self> {
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| type_mismatch("text", value, alias))
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value, alias: &str) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other, alias).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer_row() -> Row {
        Row::new(
            vec!["c__id".into(), "c__name".into(), "c__note".into()],
            vec![Value::BigInt(1), Value::Text("Ada".into()), Value::Null],
        )
        .at_position(4)
    }

    #[test]
    fn decode_reads_typed_columns() {
        let row = customer_row();
        assert_eq!(row.decode::<i64>("c__id").unwrap(), 1);
        assert_eq!(row.decode::<String>("c__name").unwrap(), "Ada");
        assert_eq!(row.decode::<Option<String>>("c__note").unwrap(), None);
    }

    #[test]
    fn missing_column_blames_path_and_position() {
        let err = customer_row().require("c__email", "order.customer").unwrap_err();
        let Error::Resolution(e) = err else {
            panic!("expected a resolution error, got {err}");
        };
        assert_eq!(e.kind, ResolutionErrorKind::MissingColumn);
        assert_eq!(e.path, "order.customer");
        assert!(e.message.contains("row 4"));
    }

    #[test]
    fn wrong_type_is_a_mismatch() {
        let err = customer_row().decode::<i64>("c__name").unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution(ResolutionError {
                kind: ResolutionErrorKind::TypeMismatch,
                ..
            })
        ));
    }

    #[test]
    fn rows_of_one_result_share_columns() {
        let first = customer_row();
        let second = Row::shared(
            Arc::clone(first.columns()),
            vec![Value::BigInt(2), Value::Text("Grace".into()), Value::Null],
        );
        assert!(Arc::ptr_eq(first.columns(), second.columns()));
        assert_eq!(second.columns().position_of("c__name"), Some(1));
        assert_eq!(second.value("c__name"), Some(&Value::Text("Grace".into())));
    }
}
