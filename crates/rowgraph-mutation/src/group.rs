//! Mutation operation groups.
//!
//! A [`MutationOperationGroup`] is the immutable statement template for one
//! kind of mutation of one entity type. It is built once from the mapping
//! and shared by `Arc` with every coordinator of that entity type.
//!
//! Statement order across a multi-table hierarchy:
//!
//! - inserts and updates run root table first,
//! - deletes run leaf table first,
//! - the version column and its predicate live on the root table only.

use crate::operation::{Binding, Expectation, MutationKind, MutationOperation};
use rowgraph_core::{AttributeMapping, EntityMapping};
use std::sync::Arc;

#[derive(Debug)]
pub struct MutationOperationGroup {
    entity: String,
    kind: MutationKind,
    mapping: Arc<EntityMapping>,
    operations: Vec<MutationOperation>,
    version_only: bool,
}

impl MutationOperationGroup {
    /// Build the group of `kind` for `mapping`.
    pub fn build(mapping: &Arc<EntityMapping>, kind: MutationKind) -> Arc<Self> {
        let operations: Vec<MutationOperation> = match kind {
            MutationKind::Insert => (0..mapping.tables().len())
                .map(|table| insert_operation(mapping, table))
                .collect(),
            MutationKind::Update => (0..mapping.tables().len())
                .filter_map(|table| {
                    let attrs: Vec<&AttributeMapping> =
                        mapping.attributes_in(table).filter(|a| a.updatable).collect();
                    update_operation(mapping, table, &attrs)
                })
                .collect(),
            MutationKind::Delete => (0..mapping.tables().len())
                .rev()
                .map(|table| delete_operation(mapping, table))
                .collect(),
        };
        tracing::debug!(
            entity = mapping.name(),
            kind = %kind,
            statements = operations.len(),
            "Built mutation operation group"
        );
        Arc::new(Self {
            entity: mapping.name().to_string(),
            kind,
            mapping: Arc::clone(mapping),
            operations,
            version_only: false,
        })
    }

    /// The group that only increments the version of an unchanged row.
    ///
    /// `None` for unversioned entities.
    pub fn version_update(mapping: &Arc<EntityMapping>) -> Option<Arc<Self>> {
        let operation = update_operation(mapping, 0, &[])?;
        mapping.version()?;
        Some(Arc::new(Self {
            entity: mapping.name().to_string(),
            kind: MutationKind::Update,
            mapping: Arc::clone(mapping),
            operations: vec![operation],
            version_only: true,
        }))
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn kind(&self) -> MutationKind {
        self.kind
    }

    pub fn mapping(&self) -> &Arc<EntityMapping> {
        &self.mapping
    }

    /// Statements in execution order.
    pub fn operations(&self) -> &[MutationOperation] {
        &self.operations
    }

    pub fn is_versioned(&self) -> bool {
        self.mapping.is_versioned()
    }

    pub fn is_version_only(&self) -> bool {
        self.version_only
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Statements needed for an update that changed `changed`.
    ///
    /// Tables with no changed attribute are skipped, except the root of a
    /// versioned entity, whose version always advances. With `dynamic` each
    /// statement sets only the changed columns; otherwise the full static
    /// statements are reused.
    pub fn plan_update(&self, changed: &[String], dynamic: bool) -> Vec<MutationOperation> {
        if self.kind != MutationKind::Update || self.version_only {
            return self.operations.clone();
        }
        let versioned = self.is_versioned();
        if !dynamic {
            return self
                .operations
                .iter()
                .filter(|op| op.writes_any(changed) || (versioned && op.table_index == 0))
                .cloned()
                .collect();
        }

        (0..self.mapping.tables().len())
            .filter_map(|table| {
                let attrs: Vec<&AttributeMapping> = self
                    .mapping
                    .attributes_in(table)
                    .filter(|a| a.updatable && changed.contains(&a.name))
                    .collect();
                if attrs.is_empty() && !(versioned && table == 0) {
                    return None;
                }
                update_operation(&self.mapping, table, &attrs)
            })
            .collect()
    }
}

fn quoted(name: &str) -> String {
    format!("\"{name}\"")
}

fn insert_operation(mapping: &EntityMapping, table: usize) -> MutationOperation {
    let table_mapping = &mapping.tables()[table];
    let mut columns = vec![quoted(&table_mapping.key_column)];
    let mut bindings = vec![Binding::Identifier];
    if table == 0 {
        if let Some(version) = mapping.version() {
            columns.push(quoted(&version.column));
            bindings.push(Binding::InitialVersion);
        }
    }
    let mut attributes = Vec::new();
    for attr in mapping.attributes_in(table).filter(|a| a.insertable) {
        columns.push(quoted(&attr.column));
        bindings.push(Binding::Attribute(attr.name.clone()));
        attributes.push(attr.name.clone());
    }
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    MutationOperation {
        table: table_mapping.name.clone(),
        table_index: table,
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quoted(&table_mapping.name),
            columns.join(", "),
            placeholders.join(", ")
        ),
        bindings,
        attributes,
        expectation: Expectation::RowCount(1),
    }
}

/// `None` when the statement would set nothing.
fn update_operation(
    mapping: &EntityMapping,
    table: usize,
    attrs: &[&AttributeMapping],
) -> Option<MutationOperation> {
    let table_mapping = &mapping.tables()[table];
    let version = if table == 0 { mapping.version() } else { None };
    if attrs.is_empty() && version.is_none() {
        return None;
    }

    let mut param = 0;
    let mut next = || {
        param += 1;
        format!("${param}")
    };
    let mut sets = Vec::new();
    let mut bindings = Vec::new();
    for attr in attrs {
        sets.push(format!("{} = {}", quoted(&attr.column), next()));
        bindings.push(Binding::Attribute(attr.name.clone()));
    }
    if let Some(version) = version {
        sets.push(format!("{} = {}", quoted(&version.column), next()));
        bindings.push(Binding::NextVersion);
    }
    let mut sql = format!(
        "UPDATE {} SET {} WHERE {} = {}",
        quoted(&table_mapping.name),
        sets.join(", "),
        quoted(&table_mapping.key_column),
        next()
    );
    bindings.push(Binding::Identifier);
    if let Some(version) = version {
        sql.push_str(&format!(" AND {} = {}", quoted(&version.column), next()));
        bindings.push(Binding::ExpectedVersion);
    }

    Some(MutationOperation {
        table: table_mapping.name.clone(),
        table_index: table,
        sql,
        bindings,
        attributes: attrs.iter().map(|a| a.name.clone()).collect(),
        expectation: if version.is_some() {
            Expectation::Versioned
        } else {
            Expectation::RowCount(1)
        },
    })
}

fn delete_operation(mapping: &EntityMapping, table: usize) -> MutationOperation {
    let table_mapping = &mapping.tables()[table];
    let version = if table == 0 { mapping.version() } else { None };
    let mut sql = format!(
        "DELETE FROM {} WHERE {} = $1",
        quoted(&table_mapping.name),
        quoted(&table_mapping.key_column)
    );
    let mut bindings = vec![Binding::Identifier];
    if let Some(version) = version {
        sql.push_str(&format!(" AND {} = $2", quoted(&version.column)));
        bindings.push(Binding::ExpectedVersion);
    }
    MutationOperation {
        table: table_mapping.name.clone(),
        table_index: table,
        sql,
        bindings,
        attributes: Vec::new(),
        expectation: if version.is_some() {
            Expectation::Versioned
        } else {
            Expectation::RowCount(1)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn special_order() -> Arc<EntityMapping> {
        EntityMapping::builder("SpecialOrder", "orders", "id")
            .attribute("total", "total")
            .immutable_attribute("created", "created_at")
            .joined_table("special_orders", "order_id")
            .attribute_in("note", "note", 1)
            .version("version", "version")
            .build()
            .unwrap()
    }

    fn plain() -> Arc<EntityMapping> {
        EntityMapping::builder("Tag", "tags", "id")
            .attribute("label", "label")
            .build()
            .unwrap()
    }

    #[test]
    fn insert_runs_root_first() {
        let group = MutationOperationGroup::build(&special_order(), MutationKind::Insert);
        let tables: Vec<&str> = group.operations().iter().map(|o| o.table.as_str()).collect();
        assert_eq!(tables, vec!["orders", "special_orders"]);
        assert_eq!(
            group.operations()[0].sql,
            "INSERT INTO \"orders\" (\"id\", \"version\", \"total\", \"created_at\") VALUES ($1, $2, $3, $4)"
        );
        assert_eq!(
            group.operations()[1].sql,
            "INSERT INTO \"special_orders\" (\"order_id\", \"note\") VALUES ($1, $2)"
        );
    }

    #[test]
    fn delete_runs_leaf_first_with_version_on_root() {
        let group = MutationOperationGroup::build(&special_order(), MutationKind::Delete);
        let ops = group.operations();
        assert_eq!(ops[0].sql, "DELETE FROM \"special_orders\" WHERE \"order_id\" = $1");
        assert_eq!(ops[0].expectation, Expectation::RowCount(1));
        assert_eq!(ops[1].sql, "DELETE FROM \"orders\" WHERE \"id\" = $1 AND \"version\" = $2");
        assert_eq!(ops[1].expectation, Expectation::Versioned);
    }

    #[test]
    fn update_skips_immutable_columns() {
        let group = MutationOperationGroup::build(&special_order(), MutationKind::Update);
        assert_eq!(
            group.operations()[0].sql,
            "UPDATE \"orders\" SET \"total\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"
        );
        assert_eq!(
            group.operations()[1].sql,
            "UPDATE \"special_orders\" SET \"note\" = $1 WHERE \"order_id\" = $2"
        );
    }

    #[test]
    fn narrow_update_keeps_versioned_root() {
        let group = MutationOperationGroup::build(&special_order(), MutationKind::Update);
        let ops = group.plan_update(&["note".to_string()], false);
        let tables: Vec<&str> = ops.iter().map(|o| o.table.as_str()).collect();
        assert_eq!(tables, vec!["orders", "special_orders"]);

        let plain_group = MutationOperationGroup::build(&plain(), MutationKind::Update);
        assert!(plain_group.plan_update(&[], false).is_empty());
    }

    #[test]
    fn dynamic_update_sets_only_changed_columns() {
        let mapping = EntityMapping::builder("Order", "orders", "id")
            .attribute("total", "total")
            .attribute("status", "status")
            .version("version", "version")
            .build()
            .unwrap();
        let group = MutationOperationGroup::build(&mapping, MutationKind::Update);
        let ops = group.plan_update(&["status".to_string()], true);
        assert_eq!(ops.len(), 1);
        assert_eq!(
            ops[0].sql,
            "UPDATE \"orders\" SET \"status\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"
        );
    }

    #[test]
    fn version_update_group_only_for_versioned_entities() {
        let group = MutationOperationGroup::version_update(&special_order()).unwrap();
        assert!(group.is_version_only());
        assert_eq!(
            group.operations()[0].sql,
            "UPDATE \"orders\" SET \"version\" = $1 WHERE \"id\" = $2 AND \"version\" = $3"
        );
        assert!(MutationOperationGroup::version_update(&plain()).is_none());
    }
}
