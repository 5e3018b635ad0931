//! Materializing entity state from rows.
//!
//! Entities joined into a result row are read from aliased columns
//! (`{alias}__{column}`); entities fetched by a nested select are read from
//! plain column names of the select-by-id statement.

use crate::initializer::aliased_column;
use rowgraph_core::{
    Connection, Cx, EntityInstance, EntityKey, EntityMapping, EntityRef, Error, Outcome,
    ResolutionError, ResolutionErrorKind, Result, Row, try_outcome, try_result,
};
use std::collections::BTreeMap;

/// Build a new instance for `key` from the columns of `row`.
///
/// With an alias, columns are looked up as `{alias}__{column}`.
pub fn instance_from_row(
    mapping: &EntityMapping,
    key: EntityKey,
    row: &Row,
    alias: Option<&str>,
    path: &str,
) -> Result<EntityRef> {
    let column = |name: &str| match alias {
        Some(alias) => aliased_column(alias, name),
        None => name.to_string(),
    };

    let mut attributes = BTreeMap::new();
    for attr in mapping.attributes() {
        let value = row.require(&column(&attr.column), path)?;
        attributes.insert(attr.name.clone(), value.clone());
    }
    let version = match mapping.version() {
        Some(version) => {
            let value = row.require(&column(&version.column), path)?;
            if value.is_null() {
                None
            } else {
                Some(value.clone())
            }
        }
        None => None,
    };

    Ok(EntityInstance::new(key, attributes, version))
}

/// Fetch one instance by identifier with a nested select.
///
/// This is a suspension point: the row's pipeline waits on the driver while
/// other tasks on the loop make progress. A non-null key that matches no row
/// is a `NotFound` resolution failure.
#[tracing::instrument(level = "debug", skip(cx, conn, mapping, key), fields(entity = mapping.name(), key = %key))]
pub async fn load_by_key<C: Connection>(
    cx: &Cx,
    conn: &C,
    mapping: &EntityMapping,
    key: &EntityKey,
    path: &str,
) -> Outcome<EntityRef, Error> {
    let sql = mapping.select_by_id_sql();
    let rows = try_outcome!(conn.query(cx, &sql, &[key.id().clone()]).await);

    let Some(row) = rows.first() else {
        return Outcome::Err(
            ResolutionError::new(
                ResolutionErrorKind::NotFound,
                path,
                format!("no row found for {key}"),
            )
            .entity(mapping.name())
            .into(),
        );
    };
    if rows.len() > 1 {
        tracing::warn!(rows = rows.len(), "Select by identifier returned several rows");
    }

    let instance = try_result!(instance_from_row(mapping, key.clone(), row, None, path));
    tracing::trace!("Loaded instance by nested select");
    Outcome::Ok(instance)
}
