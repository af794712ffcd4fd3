//! Typed queries.
//!
//! Queries are built from typed [`Field`](crate::Field) handles and can be
//! answered two ways: compiled to SQL by [`compiler`], or evaluated against
//! rows held in memory by [`eval`]. Both paths return the same rows in the
//! same order.

pub mod compiler;
pub mod eval;
pub mod join;
pub mod order;
pub mod predicate;

use std::fmt;

use crate::entity::Entity;

pub use compiler::{CompiledSql, SqlArgument, SqlCompiler};
pub use eval::{Evaluator, RowSource};
pub use join::{JoinPair, JoinedOrder, JoinedOrderTerm, JoinedPredicate, JoinedQuery, Relation};
pub use order::{Order, OrderDirection, OrderTerm};
pub use predicate::{CompareOp, Composition, Predicate};

/// A predicate with an optional sort order and page size.
pub struct Query<E> {
    pub(crate) predicate: Predicate<E>,
    pub(crate) order: Option<Order<E>>,
    pub(crate) page_size: Option<usize>,
}

// Manual Clone implementation to avoid E: Clone bound
impl<E> Clone for Query<E> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            order: self.order.clone(),
            page_size: self.page_size,
        }
    }
}

impl<E> fmt::Debug for Query<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("predicate", &self.predicate)
            .field("order", &self.order)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl<E: Entity> Default for Query<E> {
    fn default() -> Self {
        Self::new(Predicate::all())
    }
}

impl<E: Entity> Query<E> {
    /// An unordered, unpaged query.
    #[must_use]
    pub const fn new(predicate: Predicate<E>) -> Self {
        Self {
            predicate,
            order: None,
            page_size: None,
        }
    }

    /// Sets the sort order.
    #[must_use]
    pub fn order(mut self, order: Order<E>) -> Self {
        self.order = Some(order);
        self
    }

    /// Sets the page size. Zero is treated as one.
    #[must_use]
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// The predicate.
    #[must_use]
    pub const fn predicate(&self) -> &Predicate<E> {
        &self.predicate
    }

    /// The explicit order, if any.
    #[must_use]
    pub const fn order_ref(&self) -> Option<&Order<E>> {
        self.order.as_ref()
    }

    /// Page size, `usize::MAX` when unbounded.
    #[must_use]
    pub fn page_len(&self) -> usize {
        self.page_size.unwrap_or(usize::MAX)
    }
}

impl<E: Entity> From<Predicate<E>> for Query<E> {
    fn from(predicate: Predicate<E>) -> Self {
        Self::new(predicate)
    }
}
