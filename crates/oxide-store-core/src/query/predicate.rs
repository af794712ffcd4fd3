//! Typed predicates.
//!
//! A [`Predicate`] is an immutable tree of comparisons on the fields of one
//! entity, combined with AND and OR. Building a larger predicate never
//! changes the parts it was built from, so predicates can be shared and
//! reused freely.
//!
//! ```ignore
//! let adults_in_nyc = Person::age()
//!     .gte(18)
//!     .and(Person::city().eq("NYC"));
//! ```

use std::fmt;
use std::sync::Arc;

use crate::entity::{ensure_column, Entity, Field, FieldRef, FieldValue};
use crate::error::{CoreError, Result};
use crate::query::compiler::SqlCompiler;
use crate::query::eval::Evaluator;
use crate::value::SqlValue;

/// How the parts of a predicate combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Composition {
    /// Every part must hold (AND). An empty ALL is true.
    #[default]
    All,
    /// At least one part must hold (OR). An empty ANY is false.
    Any,
}

impl Composition {
    /// Truth value of an empty composition.
    #[must_use]
    pub const fn identity(self) -> bool {
        matches!(self, Self::All)
    }

    /// SQL keyword joining two operands.
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::All => "AND",
            Self::Any => "OR",
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// Equal (=)
    Eq,
    /// Less than (<)
    Lt,
    /// Less than or equal (<=)
    Lte,
    /// Greater than (>)
    Gt,
    /// Greater than or equal (>=)
    Gte,
}

impl CompareOp {
    /// Whether the operator accepts the result of comparing the stored
    /// value with the operand. `None` (a NULL side) never matches.
    #[must_use]
    pub fn holds(self, ordering: Option<std::cmp::Ordering>) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match (self, ordering) {
            (_, None) => false,
            (Self::Eq, Some(o)) => o == Equal,
            (Self::Lt, Some(o)) => o == Less,
            (Self::Lte, Some(o)) => o != Greater,
            (Self::Gt, Some(o)) => o == Greater,
            (Self::Gte, Some(o)) => o != Less,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq => write!(f, "="),
            Self::Lt => write!(f, "<"),
            Self::Lte => write!(f, "<="),
            Self::Gt => write!(f, ">"),
            Self::Gte => write!(f, ">="),
        }
    }
}

/// A nested select producing the values an `IN` leaf tests against.
pub(crate) trait SubSelect: Send + Sync + fmt::Debug {
    /// Checks every column the select references.
    fn validate(&self) -> Result<()>;

    /// Emits `SELECT ... FROM ... [WHERE ...]` using `compiler`'s alias.
    fn to_sql(&self, compiler: &mut SqlCompiler) -> Result<String>;

    /// Values the select yields against the evaluator's rows.
    fn values(&self, evaluator: &Evaluator<'_>) -> Result<Vec<SqlValue>>;
}

/// `SELECT select FROM R WHERE predicate`.
pub(crate) struct SubQuery<R> {
    pub(crate) select: FieldRef<R>,
    pub(crate) predicate: Predicate<R>,
}

impl<R> fmt::Debug for SubQuery<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubQuery")
            .field("select", &self.select)
            .field("predicate", &self.predicate)
            .finish()
    }
}

impl<R: Entity> SubSelect for SubQuery<R> {
    fn validate(&self) -> Result<()> {
        ensure_column::<R>(self.select.column())?;
        self.predicate.validate()
    }

    fn to_sql(&self, compiler: &mut SqlCompiler) -> Result<String> {
        compiler.compile_sub_select(&self.select, &self.predicate)
    }

    fn values(&self, evaluator: &Evaluator<'_>) -> Result<Vec<SqlValue>> {
        let rows = evaluator.find_all(&self.predicate)?;
        Ok(rows.iter().map(|row| self.select.read(row)).collect())
    }
}

/// What a leaf tests its field against.
#[derive(Debug, Clone)]
pub(crate) enum Condition {
    Compare(CompareOp, SqlValue),
    InList(Vec<SqlValue>),
    InSubquery(Arc<dyn SubSelect>),
}

pub(crate) enum Node<E> {
    Leaf {
        field: FieldRef<E>,
        condition: Condition,
    },
    Const(bool),
    Compose {
        op: Composition,
        left: Arc<Node<E>>,
        right: Arc<Node<E>>,
    },
}

impl<E> fmt::Debug for Node<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leaf { field, condition } => f
                .debug_struct("Leaf")
                .field("field", field)
                .field("condition", condition)
                .finish(),
            Self::Const(value) => f.debug_tuple("Const").field(value).finish(),
            Self::Compose { op, left, right } => f
                .debug_struct("Compose")
                .field("op", op)
                .field("left", left)
                .field("right", right)
                .finish(),
        }
    }
}

/// A boolean condition over rows of `E`.
///
/// The empty predicate takes the truth value of its seed composition:
/// [`Predicate::all`] matches every row, [`Predicate::any`] matches none.
pub struct Predicate<E> {
    seed: Composition,
    root: Option<Arc<Node<E>>>,
}

// Manual Clone implementation to avoid E: Clone bound
impl<E> Clone for Predicate<E> {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            root: self.root.clone(),
        }
    }
}

impl<E> fmt::Debug for Predicate<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Predicate")
            .field("seed", &self.seed)
            .field("root", &self.root)
            .finish()
    }
}

impl<E: Entity> Default for Predicate<E> {
    fn default() -> Self {
        Self::all()
    }
}

impl<E: Entity> Predicate<E> {
    /// The empty ALL predicate: matches every row.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            seed: Composition::All,
            root: None,
        }
    }

    /// The empty ANY predicate: matches no row.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            seed: Composition::Any,
            root: None,
        }
    }

    /// A constant predicate.
    #[must_use]
    pub fn constant(value: bool) -> Self {
        Self {
            seed: Composition::All,
            root: Some(Arc::new(Node::Const(value))),
        }
    }

    pub(crate) fn leaf(field: FieldRef<E>, condition: Condition) -> Self {
        Self {
            seed: Composition::All,
            root: Some(Arc::new(Node::Leaf { field, condition })),
        }
    }

    /// The composition this predicate was seeded with.
    #[must_use]
    pub const fn seed(&self) -> Composition {
        self.seed
    }

    /// Whether nothing has been added to the seed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub(crate) fn root(&self) -> Option<&Node<E>> {
        self.root.as_deref()
    }

    /// Adds a part using this predicate's seed composition.
    #[must_use]
    pub fn with(self, part: Self) -> Self {
        let seed = self.seed;
        Self {
            seed,
            ..combine(seed, self, part)
        }
    }

    /// Both predicates must hold.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        combine(Composition::All, self, other)
    }

    /// Either predicate must hold.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        combine(Composition::Any, self, other)
    }

    /// Checks that every referenced column belongs to its entity.
    ///
    /// # Errors
    ///
    /// Returns the first [`CoreError::UnknownColumn`](crate::CoreError::UnknownColumn).
    pub fn validate(&self) -> Result<()> {
        self.root().map_or(Ok(()), validate_node)
    }

    /// Evaluates this predicate against one row.
    ///
    /// Sub-selects are answered from `evaluator`'s rows.
    ///
    /// # Errors
    ///
    /// Propagates errors from sub-select evaluation.
    pub fn matches(&self, evaluator: &Evaluator<'_>, row: &E) -> Result<bool> {
        match self.root() {
            None => Ok(self.seed.identity()),
            Some(node) => eval_node(evaluator, node, row),
        }
    }

    /// Runs every sub-select once against `evaluator`'s rows and replaces
    /// it with the values it yields. The result matches the same rows and
    /// no longer reads other tables.
    ///
    /// # Errors
    ///
    /// Propagates errors from sub-select evaluation.
    pub fn resolve(&self, evaluator: &Evaluator<'_>) -> Result<Self> {
        let root = match &self.root {
            None => None,
            Some(node) => Some(resolve_node(evaluator, node)?),
        };
        Ok(Self {
            seed: self.seed,
            root,
        })
    }

    /// Rows whose primary key equals `key`, one value per key column.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaInvariant`] if `E` has no primary key or
    /// `key` has the wrong width.
    pub fn key_eq(key: Vec<SqlValue>) -> Result<Self> {
        let columns = E::primary_key();
        if columns.is_empty() || columns.len() != key.len() {
            return Err(CoreError::SchemaInvariant(format!(
                "'{}' has a {}-column primary key, got {} key values",
                E::TABLE,
                columns.len(),
                key.len()
            )));
        }
        let mut predicate = Self::all();
        for (column, value) in columns.iter().zip(key) {
            let field = E::field_ref(column)?;
            predicate = predicate.and(Self::leaf(
                field,
                Condition::Compare(CompareOp::Eq, value),
            ));
        }
        Ok(predicate)
    }
}

/// Combines two predicates under `op`. An empty operand whose value is the
/// identity of `op` is dropped.
fn combine<E>(op: Composition, left: Predicate<E>, right: Predicate<E>) -> Predicate<E> {
    let operand = |p: Predicate<E>| match p.root {
        Some(node) => Some(node),
        None if p.seed.identity() == op.identity() => None,
        None => Some(Arc::new(Node::Const(p.seed.identity()))),
    };
    let root = match (operand(left), operand(right)) {
        (None, None) => None,
        (Some(node), None) | (None, Some(node)) => Some(node),
        (Some(left), Some(right)) => Some(Arc::new(Node::Compose { op, left, right })),
    };
    Predicate { seed: op, root }
}

fn validate_node<E: Entity>(node: &Node<E>) -> Result<()> {
    match node {
        Node::Const(_) => Ok(()),
        Node::Leaf { field, condition } => {
            ensure_column::<E>(field.column())?;
            if let Condition::InSubquery(select) = condition {
                select.validate()?;
            }
            Ok(())
        }
        Node::Compose { left, right, .. } => {
            validate_node(left)?;
            validate_node(right)
        }
    }
}

fn resolve_node<E: Entity>(
    evaluator: &Evaluator<'_>,
    node: &Arc<Node<E>>,
) -> Result<Arc<Node<E>>> {
    match node.as_ref() {
        Node::Leaf {
            field,
            condition: Condition::InSubquery(select),
        } => Ok(Arc::new(Node::Leaf {
            field: field.clone(),
            condition: Condition::InList(select.values(evaluator)?),
        })),
        Node::Compose { op, left, right } => Ok(Arc::new(Node::Compose {
            op: *op,
            left: resolve_node(evaluator, left)?,
            right: resolve_node(evaluator, right)?,
        })),
        Node::Leaf { .. } | Node::Const(_) => Ok(Arc::clone(node)),
    }
}

fn eval_node<E: Entity>(evaluator: &Evaluator<'_>, node: &Node<E>, row: &E) -> Result<bool> {
    match node {
        Node::Const(value) => Ok(*value),
        Node::Leaf { field, condition } => {
            let value = field.read(row);
            Ok(match condition {
                Condition::Compare(op, operand) => op.holds(value.compare(operand)),
                Condition::InList(values) => values.iter().any(|v| value.sql_eq(v)),
                Condition::InSubquery(select) => {
                    select.values(evaluator)?.iter().any(|v| value.sql_eq(v))
                }
            })
        }
        Node::Compose { op, left, right } => {
            let left = eval_node(evaluator, left, row)?;
            match op {
                Composition::All if !left => Ok(false),
                Composition::Any if left => Ok(true),
                _ => eval_node(evaluator, right, row),
            }
        }
    }
}

// ================================================================
// Field comparisons
// ================================================================

impl<E: Entity, V: FieldValue> Field<E, V> {
    fn compare(&self, op: CompareOp, value: V::Compare) -> Predicate<E> {
        Predicate::leaf(self.erase(), Condition::Compare(op, value.to_value()))
    }

    /// `field = value`
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn eq(&self, value: impl Into<V::Compare>) -> Predicate<E> {
        self.compare(CompareOp::Eq, value.into())
    }

    /// `field < value`
    #[must_use]
    pub fn lt(&self, value: impl Into<V::Compare>) -> Predicate<E> {
        self.compare(CompareOp::Lt, value.into())
    }

    /// `field <= value`
    #[must_use]
    pub fn lte(&self, value: impl Into<V::Compare>) -> Predicate<E> {
        self.compare(CompareOp::Lte, value.into())
    }

    /// `field > value`
    #[must_use]
    pub fn gt(&self, value: impl Into<V::Compare>) -> Predicate<E> {
        self.compare(CompareOp::Gt, value.into())
    }

    /// `field >= value`
    #[must_use]
    pub fn gte(&self, value: impl Into<V::Compare>) -> Predicate<E> {
        self.compare(CompareOp::Gte, value.into())
    }

    /// `field IN (values...)`. An empty list matches nothing.
    #[must_use]
    pub fn is_in<I>(&self, values: I) -> Predicate<E>
    where
        I: IntoIterator,
        I::Item: Into<V::Compare>,
    {
        let values = values.into_iter().map(|v| v.into().to_value()).collect();
        Predicate::leaf(self.erase(), Condition::InList(values))
    }

    /// `field IN (SELECT select FROM R WHERE predicate)`.
    #[must_use]
    pub fn in_subquery<R, W>(&self, select: Field<R, W>, predicate: Predicate<R>) -> Predicate<E>
    where
        R: Entity,
        W: FieldValue<Compare = V::Compare>,
    {
        in_select(self.erase(), select.erase(), predicate)
    }
}

/// Builds an `IN` sub-select leaf from untyped handles.
pub(crate) fn in_select<E: Entity, R: Entity>(
    field: FieldRef<E>,
    select: FieldRef<R>,
    predicate: Predicate<R>,
) -> Predicate<E> {
    let select: Arc<dyn SubSelect> = Arc::new(SubQuery { select, predicate });
    Predicate::leaf(field, Condition::InSubquery(select))
}
