//! Two-entity joins and relations.

use std::fmt;

use crate::entity::{ensure_column, Entity, Field, FieldRef, FieldValue};
use crate::error::Result;
use crate::query::order::{effective_terms, OrderDirection, OrderTerm};
use crate::query::predicate::{in_select, Condition, CompareOp, Predicate};

/// An equality between a field of `L` and a field of `R`.
pub struct JoinPair<L, R> {
    pub(crate) left: FieldRef<L>,
    pub(crate) right: FieldRef<R>,
}

impl<L, R> Clone for JoinPair<L, R> {
    fn clone(&self) -> Self {
        Self {
            left: self.left.clone(),
            right: self.right.clone(),
        }
    }
}

impl<L, R> fmt::Debug for JoinPair<L, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.left.column(), self.right.column())
    }
}

impl<L, R> JoinPair<L, R> {
    /// Whether the pair holds for two rows. NULL never joins.
    #[must_use]
    pub fn holds(&self, left: &L, right: &R) -> bool {
        self.left.read(left).sql_eq(&self.right.read(right))
    }
}

/// A predicate over pairs of rows: one predicate per side plus the join
/// condition, a conjunction of field equalities.
pub struct JoinedPredicate<L, R> {
    pub(crate) left: Predicate<L>,
    pub(crate) right: Predicate<R>,
    pub(crate) pairs: Vec<JoinPair<L, R>>,
}

impl<L, R> Clone for JoinedPredicate<L, R> {
    fn clone(&self) -> Self {
        Self {
            left: self.left.clone(),
            right: self.right.clone(),
            pairs: self.pairs.clone(),
        }
    }
}

impl<L, R> fmt::Debug for JoinedPredicate<L, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinedPredicate")
            .field("left", &self.left)
            .field("right", &self.right)
            .field("pairs", &self.pairs)
            .finish()
    }
}

impl<L: Entity, R: Entity> JoinedPredicate<L, R> {
    /// Joins rows matching `left` with rows matching `right`. With no
    /// [`on`](Self::on) pair every combination joins.
    #[must_use]
    pub fn new(left: Predicate<L>, right: Predicate<R>) -> Self {
        Self {
            left,
            right,
            pairs: Vec::new(),
        }
    }

    /// Adds `left_field = right_field` to the join condition.
    #[must_use]
    pub fn on<V, W>(mut self, left_field: Field<L, V>, right_field: Field<R, W>) -> Self
    where
        V: FieldValue,
        W: FieldValue<Compare = V::Compare>,
    {
        self.pairs.push(JoinPair {
            left: left_field.erase(),
            right: right_field.erase(),
        });
        self
    }

    /// Predicate on the left rows.
    #[must_use]
    pub const fn left(&self) -> &Predicate<L> {
        &self.left
    }

    /// Predicate on the right rows.
    #[must_use]
    pub const fn right(&self) -> &Predicate<R> {
        &self.right
    }

    /// Join condition.
    #[must_use]
    pub fn pairs(&self) -> &[JoinPair<L, R>] {
        &self.pairs
    }

    /// Checks every referenced column.
    ///
    /// # Errors
    ///
    /// Returns the first unknown column.
    pub fn validate(&self) -> Result<()> {
        self.left.validate()?;
        self.right.validate()?;
        for pair in &self.pairs {
            ensure_column::<L>(pair.left.column())?;
            ensure_column::<R>(pair.right.column())?;
        }
        Ok(())
    }
}

/// One sort key of a joined query.
pub enum JoinedOrderTerm<L, R> {
    /// Key on the left entity.
    Left(OrderTerm<L>),
    /// Key on the right entity.
    Right(OrderTerm<R>),
}

impl<L, R> Clone for JoinedOrderTerm<L, R> {
    fn clone(&self) -> Self {
        match self {
            Self::Left(term) => Self::Left(term.clone()),
            Self::Right(term) => Self::Right(term.clone()),
        }
    }
}

impl<L, R> fmt::Debug for JoinedOrderTerm<L, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left(term) => write!(f, "left.{term:?}"),
            Self::Right(term) => write!(f, "right.{term:?}"),
        }
    }
}

impl<L, R> JoinedOrderTerm<L, R> {
    /// Compares two joined rows on this key.
    #[must_use]
    pub fn compare(&self, a: &(L, R), b: &(L, R)) -> std::cmp::Ordering {
        match self {
            Self::Left(term) => term.compare(&a.0, &b.0),
            Self::Right(term) => term.compare(&a.1, &b.1),
        }
    }
}

/// Sort order of a joined query.
pub struct JoinedOrder<L, R> {
    terms: Vec<JoinedOrderTerm<L, R>>,
}

impl<L, R> Clone for JoinedOrder<L, R> {
    fn clone(&self) -> Self {
        Self {
            terms: self.terms.clone(),
        }
    }
}

impl<L, R> fmt::Debug for JoinedOrder<L, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.terms).finish()
    }
}

impl<L: Entity, R: Entity> Default for JoinedOrder<L, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Entity, R: Entity> JoinedOrder<L, R> {
    /// No explicit keys.
    #[must_use]
    pub const fn new() -> Self {
        Self { terms: Vec::new() }
    }

    /// Adds a key on a left field.
    #[must_use]
    pub fn left<V: FieldValue>(mut self, field: Field<L, V>, direction: OrderDirection) -> Self {
        self.terms.push(JoinedOrderTerm::Left(OrderTerm {
            field: field.erase(),
            direction,
        }));
        self
    }

    /// Adds a key on a right field.
    #[must_use]
    pub fn right<V: FieldValue>(mut self, field: Field<R, V>, direction: OrderDirection) -> Self {
        self.terms.push(JoinedOrderTerm::Right(OrderTerm {
            field: field.erase(),
            direction,
        }));
        self
    }

    /// The explicit keys.
    #[must_use]
    pub fn terms(&self) -> &[JoinedOrderTerm<L, R>] {
        &self.terms
    }
}

/// Keys applied to a joined query: the explicit keys, then the left
/// primary key, then the right primary key.
///
/// # Errors
///
/// Returns the first unknown column.
pub fn effective_joined_terms<L: Entity, R: Entity>(
    order: Option<&JoinedOrder<L, R>>,
) -> Result<Vec<JoinedOrderTerm<L, R>>> {
    let mut terms: Vec<JoinedOrderTerm<L, R>> =
        order.map(|o| o.terms.clone()).unwrap_or_default();
    for term in &terms {
        match term {
            JoinedOrderTerm::Left(t) => ensure_column::<L>(t.column())?,
            JoinedOrderTerm::Right(t) => ensure_column::<R>(t.column())?,
        }
    }
    terms.extend(
        effective_terms::<L>(None)?
            .into_iter()
            .map(JoinedOrderTerm::Left),
    );
    terms.extend(
        effective_terms::<R>(None)?
            .into_iter()
            .map(JoinedOrderTerm::Right),
    );
    Ok(terms)
}

/// A query over pairs of rows.
pub struct JoinedQuery<L, R> {
    pub(crate) predicate: JoinedPredicate<L, R>,
    pub(crate) order: Option<JoinedOrder<L, R>>,
    pub(crate) page_size: Option<usize>,
}

impl<L, R> Clone for JoinedQuery<L, R> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            order: self.order.clone(),
            page_size: self.page_size,
        }
    }
}

impl<L, R> fmt::Debug for JoinedQuery<L, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinedQuery")
            .field("predicate", &self.predicate)
            .field("order", &self.order)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl<L: Entity, R: Entity> JoinedQuery<L, R> {
    /// An unordered, unpaged joined query.
    #[must_use]
    pub const fn new(predicate: JoinedPredicate<L, R>) -> Self {
        Self {
            predicate,
            order: None,
            page_size: None,
        }
    }

    /// Sets the sort order.
    #[must_use]
    pub fn order(mut self, order: JoinedOrder<L, R>) -> Self {
        self.order = Some(order);
        self
    }

    /// Sets the page size. Zero is treated as one.
    #[must_use]
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size.max(1));
        self
    }

    /// The joined predicate.
    #[must_use]
    pub const fn predicate(&self) -> &JoinedPredicate<L, R> {
        &self.predicate
    }

    /// The explicit order, if any.
    #[must_use]
    pub const fn order_ref(&self) -> Option<&JoinedOrder<L, R>> {
        self.order.as_ref()
    }

    /// Page size, `usize::MAX` when unbounded.
    #[must_use]
    pub fn page_len(&self) -> usize {
        self.page_size.unwrap_or(usize::MAX)
    }
}

impl<L: Entity, R: Entity> From<JoinedPredicate<L, R>> for JoinedQuery<L, R> {
    fn from(predicate: JoinedPredicate<L, R>) -> Self {
        Self::new(predicate)
    }
}

// ================================================================
// Relations
// ================================================================

/// A parent/child relation: `child.child_key` references
/// `parent.parent_key`.
pub struct Relation<P, C> {
    parent_key: FieldRef<P>,
    child_key: FieldRef<C>,
}

impl<P, C> Clone for Relation<P, C> {
    fn clone(&self) -> Self {
        Self {
            parent_key: self.parent_key.clone(),
            child_key: self.child_key.clone(),
        }
    }
}

impl<P, C> fmt::Debug for Relation<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("parent_key", &self.parent_key)
            .field("child_key", &self.child_key)
            .finish()
    }
}

impl<P: Entity, C: Entity> Relation<P, C> {
    /// Declares that `child_key` on `C` references `parent_key` on `P`.
    #[must_use]
    pub fn new<V, W>(parent_key: Field<P, V>, child_key: Field<C, W>) -> Self
    where
        V: FieldValue,
        W: FieldValue<Compare = V::Compare>,
    {
        Self {
            parent_key: parent_key.erase(),
            child_key: child_key.erase(),
        }
    }

    /// Children of one parent row.
    #[must_use]
    pub fn children_of(&self, parent: &P) -> Predicate<C> {
        Predicate::leaf(
            self.child_key.clone(),
            Condition::Compare(CompareOp::Eq, self.parent_key.read(parent)),
        )
    }

    /// Parent of one child row.
    #[must_use]
    pub fn parent_of(&self, child: &C) -> Predicate<P> {
        Predicate::leaf(
            self.parent_key.clone(),
            Condition::Compare(CompareOp::Eq, self.child_key.read(child)),
        )
    }

    /// Parents having at least one child matching `children`.
    #[must_use]
    pub fn having_child(&self, children: Predicate<C>) -> Predicate<P> {
        in_select(self.parent_key.clone(), self.child_key.clone(), children)
    }

    /// Children whose parent matches `parents`.
    #[must_use]
    pub fn having_parent(&self, parents: Predicate<P>) -> Predicate<C> {
        in_select(self.child_key.clone(), self.parent_key.clone(), parents)
    }

    /// Joins matching parents with their matching children.
    #[must_use]
    pub fn join_children(
        &self,
        parents: Predicate<P>,
        children: Predicate<C>,
    ) -> JoinedPredicate<P, C> {
        JoinedPredicate {
            left: parents,
            right: children,
            pairs: vec![JoinPair {
                left: self.parent_key.clone(),
                right: self.child_key.clone(),
            }],
        }
    }

    /// Joins matching children with their matching parent.
    #[must_use]
    pub fn join_parent(
        &self,
        children: Predicate<C>,
        parents: Predicate<P>,
    ) -> JoinedPredicate<C, P> {
        JoinedPredicate {
            left: children,
            right: parents,
            pairs: vec![JoinPair {
                left: self.child_key.clone(),
                right: self.parent_key.clone(),
            }],
        }
    }
}
