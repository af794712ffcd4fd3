//! In-memory query evaluation.
//!
//! The [`Evaluator`] answers the same queries as the SQL compiler, over rows
//! held in memory, with the same semantics: NULL never compares, an empty
//! ALL matches everything, an empty ANY matches nothing, and results are
//! sorted by the explicit order followed by the primary key.

use crate::entity::Entity;
use crate::error::Result;
use crate::query::join::{effective_joined_terms, JoinedQuery};
use crate::query::order::{compare_rows, effective_terms};
use crate::query::predicate::Predicate;
use crate::query::Query;
use crate::value::SqlValue;

/// Something that holds stored rows, one value per column in schema order.
pub trait RowSource: Send + Sync {
    /// Rows of `table`, in insertion order. Unknown tables have no rows.
    fn rows(&self, table: &str) -> &[Vec<SqlValue>];
}

/// Evaluates predicates and queries against a [`RowSource`].
#[derive(Clone, Copy)]
pub struct Evaluator<'a> {
    source: &'a dyn RowSource,
}

impl std::fmt::Debug for Evaluator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator").finish_non_exhaustive()
    }
}

impl<'a> Evaluator<'a> {
    /// Evaluates against `source`.
    #[must_use]
    pub fn new(source: &'a dyn RowSource) -> Self {
        Self { source }
    }

    /// Decodes every row of `E`'s table.
    ///
    /// # Errors
    ///
    /// Returns a conversion error for a row that does not decode.
    pub fn scan<E: Entity>(&self) -> Result<Vec<E>> {
        self.source
            .rows(E::TABLE)
            .iter()
            .map(|values| E::from_values(values.clone()))
            .collect()
    }

    /// Rows matching `predicate`, in storage order. Each sub-select runs
    /// once, not once per row.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownColumn`](crate::CoreError::UnknownColumn)
    /// for a field that is not a column of its entity.
    pub fn find_all<E: Entity>(&self, predicate: &Predicate<E>) -> Result<Vec<E>> {
        predicate.validate()?;
        let predicate = predicate.resolve(self)?;
        let mut matched = Vec::new();
        for row in self.scan::<E>()? {
            if predicate.matches(self, &row)? {
                matched.push(row);
            }
        }
        Ok(matched)
    }

    /// Rows matching a query, sorted by its order and then by primary key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownColumn`](crate::CoreError::UnknownColumn)
    /// for a field that is not a column of its entity.
    pub fn select<E: Entity>(&self, query: &Query<E>) -> Result<Vec<E>> {
        let terms = effective_terms(query.order_ref())?;
        let mut rows = self.find_all(query.predicate())?;
        rows.sort_by(|a, b| compare_rows(&terms, a, b));
        Ok(rows)
    }

    /// Pairs of rows matching a joined query, joined by nested loops and
    /// sorted by the explicit order, then the left key, then the right key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownColumn`](crate::CoreError::UnknownColumn)
    /// for a field that is not a column of its entity.
    pub fn select_joined<L: Entity, R: Entity>(
        &self,
        query: &JoinedQuery<L, R>,
    ) -> Result<Vec<(L, R)>> {
        let predicate = query.predicate();
        predicate.validate()?;
        let terms = effective_joined_terms(query.order_ref())?;
        let lefts = self.find_all(predicate.left())?;
        let rights = self.find_all(predicate.right())?;

        let mut joined = Vec::new();
        for left in &lefts {
            for right in &rights {
                if predicate.pairs().iter().all(|pair| pair.holds(left, right)) {
                    joined.push((left.clone(), right.clone()));
                }
            }
        }
        joined.sort_by(|a, b| {
            terms
                .iter()
                .map(|term| term.compare(a, b))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(joined)
    }
}
