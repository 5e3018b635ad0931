//! Mapping metadata for entity types.
//!
//! An [`EntityMapping`] is produced by the schema-building collaborator once
//! per entity type and never changes afterwards. It is shared by `Arc`
//! between compiled queries and mutation templates.
//!
//! Multi-table hierarchies list the root table first; every further table
//! is joined to the root by its key column.

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// One table backing an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMapping {
    pub name: String,
    /// Column holding the identifier in this table
    pub key_column: String,
}

/// One persistent attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeMapping {
    pub name: String,
    pub column: String,
    /// Index into [`EntityMapping::tables`]
    pub table: usize,
    pub insertable: bool,
    pub updatable: bool,
}

impl AttributeMapping {
    fn new(name: impl Into<String>, column: impl Into<String>, table: usize) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            table,
            insertable: true,
            updatable: true,
        }
    }
}

/// Immutable mapping of one entity type onto its tables.
#[derive(Debug, Clone)]
pub struct EntityMapping {
    name: String,
    tables: Vec<TableMapping>,
    identifier: AttributeMapping,
    attributes: Vec<AttributeMapping>,
    version: Option<AttributeMapping>,
    dynamic_update: Option<bool>,
    references: Vec<String>,
}

impl EntityMapping {
    /// Start building a mapping for `entity` stored in `table` keyed by `id_column`.
    pub fn builder(
        entity: impl Into<String>,
        table: impl Into<String>,
        id_column: impl Into<String>,
    ) -> EntityMappingBuilder {
        let id_column = id_column.into();
        EntityMappingBuilder {
            mapping: EntityMapping {
                name: entity.into(),
                tables: vec![TableMapping {
                    name: table.into(),
                    key_column: id_column.clone(),
                }],
                identifier: AttributeMapping::new("id", id_column, 0),
                attributes: Vec::new(),
                version: None,
                dynamic_update: None,
                references: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tables in root-to-leaf order.
    pub fn tables(&self) -> &[TableMapping] {
        &self.tables
    }

    pub fn root_table(&self) -> &TableMapping {
        &self.tables[0]
    }

    pub fn identifier(&self) -> &AttributeMapping {
        &self.identifier
    }

    pub fn attributes(&self) -> &[AttributeMapping] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeMapping> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Attributes stored in the table at `table`.
    pub fn attributes_in(&self, table: usize) -> impl Iterator<Item = &AttributeMapping> {
        self.attributes.iter().filter(move |a| a.table == table)
    }

    pub fn version(&self) -> Option<&AttributeMapping> {
        self.version.as_ref()
    }

    pub fn is_versioned(&self) -> bool {
        self.version.is_some()
    }

    /// Explicit dynamic-update setting, if the mapping carries one.
    pub fn dynamic_update(&self) -> Option<bool> {
        self.dynamic_update
    }

    /// Entity types this one holds foreign keys to.
    pub fn references(&self) -> &[String] {
        &self.references
    }

    /// Statement fetching one instance by identifier, selecting every mapped
    /// column under its plain column name.
    pub fn select_by_id_sql(&self) -> String {
        let root = self.root_table();
        let mut columns = vec![format!("t0.\"{}\"", self.identifier.column)];
        if let Some(version) = &self.version {
            columns.push(format!("t0.\"{}\"", version.column));
        }
        for attr in &self.attributes {
            columns.push(format!("t{}.\"{}\"", attr.table, attr.column));
        }

        let mut sql = format!("SELECT {} FROM \"{}\" t0", columns.join(", "), root.name);
        for (i, table) in self.tables.iter().enumerate().skip(1) {
            sql.push_str(&format!(
                " JOIN \"{}\" t{} ON t{}.\"{}\" = t0.\"{}\"",
                table.name, i, i, table.key_column, root.key_column
            ));
        }
        sql.push_str(&format!(" WHERE t0.\"{}\" = $1", root.key_column));
        sql
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("entity name must not be empty"));
        }
        let mut seen = HashSet::new();
        seen.insert(self.identifier.name.as_str());
        let version = self.version.iter();
        for attr in self.attributes.iter().chain(version) {
            if attr.table >= self.tables.len() {
                return Err(Error::config(format!(
                    "attribute '{}' of {} refers to table #{} but only {} tables are mapped",
                    attr.name,
                    self.name,
                    attr.table,
                    self.tables.len()
                )));
            }
            if !seen.insert(attr.name.as_str()) {
                return Err(Error::config(format!(
                    "attribute '{}' is mapped twice on {}",
                    attr.name, self.name
                )));
            }
        }
        if let Some(version) = &self.version {
            if version.table != 0 {
                return Err(Error::config(format!(
                    "version attribute of {} must live on the root table",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`EntityMapping`].
#[derive(Debug)]
pub struct EntityMappingBuilder {
    mapping: EntityMapping,
}

impl EntityMappingBuilder {
    /// Rename the identifier attribute (defaults to `id`).
    pub fn identifier_attribute(mut self, name: impl Into<String>) -> Self {
        self.mapping.identifier.name = name.into();
        self
    }

    /// Map an attribute on the root table.
    pub fn attribute(self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.attribute_in(name, column, 0)
    }

    /// Map an attribute on the table at index `table`.
    pub fn attribute_in(
        mut self,
        name: impl Into<String>,
        column: impl Into<String>,
        table: usize,
    ) -> Self {
        self.mapping
            .attributes
            .push(AttributeMapping::new(name, column, table));
        self
    }

    /// Map an attribute that is written on insert but never updated.
    pub fn immutable_attribute(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        let mut attr = AttributeMapping::new(name, column, 0);
        attr.updatable = false;
        self.mapping.attributes.push(attr);
        self
    }

    /// Add a subclass table joined to the root by `key_column`.
    pub fn joined_table(mut self, table: impl Into<String>, key_column: impl Into<String>) -> Self {
        self.mapping.tables.push(TableMapping {
            name: table.into(),
            key_column: key_column.into(),
        });
        self
    }

    /// Map an integer version attribute used for optimistic locking.
    pub fn version(mut self, name: impl Into<String>, column: impl Into<String>) -> Self {
        self.mapping.version = Some(AttributeMapping::new(name, column, 0));
        self
    }

    pub fn dynamic_update(mut self, enabled: bool) -> Self {
        self.mapping.dynamic_update = Some(enabled);
        self
    }

    /// Record a foreign key to another entity type.
    pub fn references(mut self, entity: impl Into<String>) -> Self {
        self.mapping.references.push(entity.into());
        self
    }

    pub fn build(self) -> Result<Arc<EntityMapping>> {
        self.mapping.validate()?;
        Ok(Arc::new(self.mapping))
    }
}
