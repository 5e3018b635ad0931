//! Initializer nodes.
//!
//! One [`Initializer`] exists per resolvable sub-value of a query's result
//! shape. Nodes carry only static description; per-row state lives in the
//! row processing state so a compiled graph can be shared by every row and
//! every execution of the query.

use rowgraph_core::EntityMapping;
use std::fmt;
use std::sync::Arc;

/// Index of an initializer within its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InitializerId(pub(crate) usize);

impl InitializerId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for InitializerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-row lifecycle of an initializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResolutionState {
    Unresolved,
    KeyResolved,
    Instantiated,
}

impl ResolutionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ResolutionState::Unresolved => "unresolved",
            ResolutionState::KeyResolved => "key_resolved",
            ResolutionState::Instantiated => "instantiated",
        }
    }
}

/// When a to-one association is instantiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchTiming {
    /// During the eager instance pass, before its owner
    #[default]
    Immediate,
    /// Only when its owner is assembled, or at the end of the row
    Delayed,
}

/// Where a to-one association's target state comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToOneFetch {
    /// Target columns are joined into the same row under `alias`
    Joined { alias: String },
    /// Target is fetched by a nested select on its identifier
    Select,
}

/// How a dependency is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// Only the dependency's key must be resolved
    Key,
    /// The dependency must be fully instantiated
    Instance,
}

/// Where a collection takes its key from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKeySource {
    /// The owning entity's identifier
    Owner,
    /// The key of another initializer, typically a to-one that is part of
    /// the collection's foreign key
    Initializer(InitializerId),
}

/// An entity read from prefixed columns of the row.
#[derive(Debug, Clone)]
pub struct EntityInitializer {
    pub path: String,
    pub mapping: Arc<EntityMapping>,
    /// Column prefix; columns are read as `{alias}__{column}`
    pub alias: String,
}

/// A to-one association of an entity.
#[derive(Debug, Clone)]
pub struct ToOneInitializer {
    pub path: String,
    pub owner: InitializerId,
    pub attribute: String,
    pub target: Arc<EntityMapping>,
    /// Row column holding the foreign key
    pub key_column: String,
    pub fetch: ToOneFetch,
    pub timing: FetchTiming,
}

/// An embedded value; absent when every mapped column is null.
#[derive(Debug, Clone)]
pub struct EmbeddableInitializer {
    pub path: String,
    pub owner: Option<InitializerId>,
    pub attribute: String,
    /// `(attribute, row column)` pairs
    pub columns: Vec<(String, String)>,
}

/// One element of a collection, rows repeat the owner per element.
#[derive(Debug, Clone)]
pub struct CollectionInitializer {
    pub path: String,
    pub owner: InitializerId,
    pub role: String,
    pub key_source: CollectionKeySource,
    /// Entity initializer reading the element
    pub element: InitializerId,
}

/// A resolvable sub-value of a row.
#[derive(Debug, Clone)]
pub enum Initializer {
    Entity(EntityInitializer),
    ToOne(ToOneInitializer),
    Embeddable(EmbeddableInitializer),
    Collection(CollectionInitializer),
}

impl Initializer {
    /// Navigable path used in diagnostics.
    pub fn path(&self) -> &str {
        match self {
            Initializer::Entity(i) => &i.path,
            Initializer::ToOne(i) => &i.path,
            Initializer::Embeddable(i) => &i.path,
            Initializer::Collection(i) => &i.path,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Initializer::Entity(_) => "entity",
            Initializer::ToOne(_) => "to_one",
            Initializer::Embeddable(_) => "embeddable",
            Initializer::Collection(_) => "collection",
        }
    }

    /// The initializer whose instance this one is attached to.
    pub fn owner(&self) -> Option<InitializerId> {
        match self {
            Initializer::Entity(_) => None,
            Initializer::ToOne(i) => Some(i.owner),
            Initializer::Embeddable(i) => i.owner,
            Initializer::Collection(i) => Some(i.owner),
        }
    }

    /// Whether the resolved instance is an entity.
    pub fn produces_entity(&self) -> bool {
        matches!(self, Initializer::Entity(_) | Initializer::ToOne(_))
    }

    /// Entity name for entity-producing initializers.
    pub fn entity_name(&self) -> Option<&str> {
        match self {
            Initializer::Entity(i) => Some(i.mapping.name()),
            Initializer::ToOne(i) => Some(i.target.name()),
            _ => None,
        }
    }

    /// Whether the eager instance pass instantiates this node.
    pub fn is_eager(&self) -> bool {
        match self {
            Initializer::ToOne(i) => i.timing == FetchTiming::Immediate,
            _ => true,
        }
    }
}

/// Join a column alias and a column name the way result columns are labelled.
pub fn aliased_column(alias: &str, column: &str) -> String {
    format!("{alias}__{column}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn customer() -> Arc<EntityMapping> {
        EntityMapping::builder("Customer", "customers", "id")
            .attribute("name", "name")
            .build()
            .unwrap()
    }

    #[test]
    fn delayed_to_one_is_not_eager() {
        let node = Initializer::ToOne(ToOneInitializer {
            path: "order.customer".into(),
            owner: InitializerId(0),
            attribute: "customer".into(),
            target: customer(),
            key_column: "o__customer_id".into(),
            fetch: ToOneFetch::Select,
            timing: FetchTiming::Delayed,
        });
        assert!(!node.is_eager());
        assert!(node.produces_entity());
        assert_eq!(node.entity_name(), Some("Customer"));
        assert_eq!(node.owner(), Some(InitializerId(0)));
    }

    #[test]
    fn lifecycle_states_are_ordered() {
        assert!(ResolutionState::Unresolved < ResolutionState::KeyResolved);
        assert!(ResolutionState::KeyResolved < ResolutionState::Instantiated);
        assert_eq!(ResolutionState::KeyResolved.as_str(), "key_resolved");
    }

    #[test]
    fn aliased_column_uses_double_underscore() {
        assert_eq!(aliased_column("c", "name"), "c__name");
    }
}
