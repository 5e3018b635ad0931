//! Assemblers: one per projected value of a query.

use crate::initializer::InitializerId;
use crate::processing::{ResolvedInstance, RowProcessingState};
use rowgraph_core::{
    Connection, Cx, Embedded, EntityRef, Error, Outcome, ResolutionError, ResolutionErrorKind,
    Value, try_outcome, try_result,
};
use std::sync::Arc;

/// A materialized value of one result tuple slot.
#[derive(Debug, Clone)]
pub enum ResultValue {
    Scalar(Value),
    Entity(EntityRef),
    Embedded(Embedded),
    /// A null association or embedded value
    Absent,
}

impl ResultValue {
    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            ResultValue::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            ResultValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_embedded(&self) -> Option<&Embedded> {
        match self {
            ResultValue::Embedded(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, ResultValue::Absent)
    }

    /// Same instance for entities, equal values otherwise.
    pub fn same_as(&self, other: &ResultValue) -> bool {
        match (self, other) {
            (ResultValue::Entity(a), ResultValue::Entity(b)) => Arc::ptr_eq(a, b),
            (ResultValue::Scalar(a), ResultValue::Scalar(b)) => a == b,
            (ResultValue::Embedded(a), ResultValue::Embedded(b)) => a == b,
            (ResultValue::Absent, ResultValue::Absent) => true,
            _ => false,
        }
    }
}

/// Reads one projected value out of a row pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembler {
    /// A plain column
    Basic { column: String },
    /// An entity, handed out only once fully instantiated
    Entity { initializer: InitializerId },
    /// An embedded value
    Embeddable { initializer: InitializerId },
}

impl Assembler {
    pub fn basic(column: impl Into<String>) -> Self {
        Assembler::Basic {
            column: column.into(),
        }
    }

    pub fn entity(initializer: InitializerId) -> Self {
        Assembler::Entity { initializer }
    }

    pub fn embeddable(initializer: InitializerId) -> Self {
        Assembler::Embeddable { initializer }
    }

    pub fn initializer(&self) -> Option<InitializerId> {
        match self {
            Assembler::Basic { .. } => None,
            Assembler::Entity { initializer } | Assembler::Embeddable { initializer } => {
                Some(*initializer)
            }
        }
    }

    /// Produce this assembler's value for the current row.
    ///
    /// An entity is returned only after its initializer and everything it
    /// owns are instantiated, even when the row's processing itself only
    /// needed the key. Work already done in the pass is not repeated.
    pub async fn assemble<C: Connection>(
        &self,
        cx: &Cx,
        state: &mut RowProcessingState<'_, C>,
    ) -> Outcome<ResultValue, Error> {
        match self {
            Assembler::Basic { column } => {
                let value = try_result!(state.row().require(column, column));
                Outcome::Ok(ResultValue::Scalar(value.clone()))
            }
            Assembler::Entity { initializer } | Assembler::Embeddable { initializer } => {
                let id = *initializer;
                try_outcome!(state.complete(cx, id).await);
                match state.instance(id) {
                    Some(ResolvedInstance::Entity(instance)) if matches!(self, Assembler::Entity { .. }) => {
                        Outcome::Ok(ResultValue::Entity(Arc::clone(instance)))
                    }
                    Some(ResolvedInstance::Embedded(value)) if matches!(self, Assembler::Embeddable { .. }) => {
                        Outcome::Ok(ResultValue::Embedded(value.clone()))
                    }
                    Some(ResolvedInstance::Absent) => Outcome::Ok(ResultValue::Absent),
                    other => Outcome::Err(
                        ResolutionError::new(
                            ResolutionErrorKind::InstanceUnavailable,
                            id.to_string(),
                            format!("assembler cannot expose {other:?}"),
                        )
                        .into(),
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowgraph_core::{EntityInstance, EntityKey};
    use std::collections::BTreeMap;

    #[test]
    fn same_as_compares_entities_by_reference() {
        let key = EntityKey::new("Order", &Value::BigInt(1));
        let a = EntityInstance::new(key.clone(), BTreeMap::new(), None);
        let b = EntityInstance::new(key, BTreeMap::new(), None);

        let first = ResultValue::Entity(Arc::clone(&a));
        assert!(first.same_as(&ResultValue::Entity(a)));
        assert!(!first.same_as(&ResultValue::Entity(b)));
        assert!(ResultValue::Scalar(Value::Int(1)).same_as(&ResultValue::Scalar(Value::Int(1))));
        assert!(!ResultValue::Absent.same_as(&ResultValue::Scalar(Value::Null)));
    }

    #[test]
    fn basic_assembler_has_no_initializer() {
        assert_eq!(Assembler::basic("o__total").initializer(), None);
        let id = InitializerId(2);
        assert_eq!(Assembler::entity(id).initializer(), Some(id));
    }
}
