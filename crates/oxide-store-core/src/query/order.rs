//! Sort orders.

use std::cmp::Ordering;
use std::fmt;

use crate::entity::{ensure_column, Entity, Field, FieldRef, FieldValue};
use crate::error::{CoreError, Result};

/// Order direction for sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    /// Ascending order.
    #[default]
    Asc,
    /// Descending order.
    Desc,
}

impl OrderDirection {
    /// SQL keyword.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    /// Applies the direction to an ascending comparison.
    #[must_use]
    pub const fn apply(self, ordering: Ordering) -> Ordering {
        match self {
            Self::Asc => ordering,
            Self::Desc => ordering.reverse(),
        }
    }
}

/// One sort key.
pub struct OrderTerm<E> {
    pub(crate) field: FieldRef<E>,
    pub(crate) direction: OrderDirection,
}

impl<E> OrderTerm<E> {
    /// Column sorted on.
    #[must_use]
    pub const fn column(&self) -> &'static str {
        self.field.column()
    }

    /// Direction of the sort.
    #[must_use]
    pub const fn direction(&self) -> OrderDirection {
        self.direction
    }

    /// Compares two rows on this key.
    #[must_use]
    pub fn compare(&self, a: &E, b: &E) -> Ordering {
        self.direction
            .apply(self.field.read(a).sort_cmp(&self.field.read(b)))
    }
}

impl<E> Clone for OrderTerm<E> {
    fn clone(&self) -> Self {
        Self {
            field: self.field.clone(),
            direction: self.direction,
        }
    }
}

impl<E> fmt::Debug for OrderTerm<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.field.column(), self.direction.keyword())
    }
}

/// A list of sort keys, most significant first.
pub struct Order<E> {
    terms: Vec<OrderTerm<E>>,
}

impl<E> Clone for Order<E> {
    fn clone(&self) -> Self {
        Self {
            terms: self.terms.clone(),
        }
    }
}

impl<E> fmt::Debug for Order<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.terms).finish()
    }
}

impl<E: Entity> Order<E> {
    /// Sorts ascending on `field`.
    #[must_use]
    pub fn asc<V: FieldValue>(field: Field<E, V>) -> Self {
        Self {
            terms: vec![OrderTerm {
                field: field.erase(),
                direction: OrderDirection::Asc,
            }],
        }
    }

    /// Sorts descending on `field`.
    #[must_use]
    pub fn desc<V: FieldValue>(field: Field<E, V>) -> Self {
        Self {
            terms: vec![OrderTerm {
                field: field.erase(),
                direction: OrderDirection::Desc,
            }],
        }
    }

    /// Adds an ascending tie-breaker.
    #[must_use]
    pub fn then_asc<V: FieldValue>(mut self, field: Field<E, V>) -> Self {
        self.terms.push(OrderTerm {
            field: field.erase(),
            direction: OrderDirection::Asc,
        });
        self
    }

    /// Adds a descending tie-breaker.
    #[must_use]
    pub fn then_desc<V: FieldValue>(mut self, field: Field<E, V>) -> Self {
        self.terms.push(OrderTerm {
            field: field.erase(),
            direction: OrderDirection::Desc,
        });
        self
    }

    /// The explicit sort keys.
    #[must_use]
    pub fn terms(&self) -> &[OrderTerm<E>] {
        &self.terms
    }
}

/// The sort keys actually applied: the explicit keys, then every primary
/// key column not already listed, ascending. Both the SQL compiler and the
/// in-memory evaluator sort by exactly these keys.
///
/// # Errors
///
/// Returns [`CoreError::UnknownColumn`] for an explicit key that is not a
/// column of `E`, or [`CoreError::SchemaInvariant`] if a primary key
/// column has no field.
pub fn effective_terms<E: Entity>(order: Option<&Order<E>>) -> Result<Vec<OrderTerm<E>>> {
    let mut terms: Vec<OrderTerm<E>> = order.map(|o| o.terms.clone()).unwrap_or_default();
    for term in &terms {
        ensure_column::<E>(term.column())?;
    }
    for key in E::primary_key() {
        if terms.iter().any(|term| term.column() == *key) {
            continue;
        }
        let field = E::field_ref(key).map_err(|_| {
            CoreError::SchemaInvariant(format!(
                "primary key column '{key}' of '{}' has no field",
                E::TABLE
            ))
        })?;
        terms.push(OrderTerm {
            field,
            direction: OrderDirection::Asc,
        });
    }
    Ok(terms)
}

/// Compares two rows on a list of keys.
pub fn compare_rows<E>(terms: &[OrderTerm<E>], a: &E, b: &E) -> Ordering {
    terms
        .iter()
        .map(|term| term.compare(a, b))
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}
