//! The storage interface shared by the SQL and in-memory stores.
//!
//! Both stores answer every query with the same rows in the same order, so
//! application code and tests can switch between them freely.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use oxide_store_core::{
    Entity, JoinedQuery, KeyedEntity, PrimaryKey, Predicate, Query, Relation, SchemaDifference,
    SqlValue, TableSchema,
};
use oxide_store_migrate::executor::MigrationReport;
use oxide_store_migrate::planner::MigrationPolicy;

use crate::change_set::{ChangeSet, PendingChanges};
use crate::error::{Result, StoreError};
use crate::key::{GeneratedKey, KeyAllocator};

/// Persistent storage for entities.
///
/// Stores are opened through their builders, which register entity types
/// and bring the schema up to date; see [`SqlStore`](crate::SqlStore) and
/// [`MemoryStore`](crate::MemoryStore).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Migrates the stored schema to the registered entities, recording
    /// the store's version tag.
    async fn migrate(&self, policy: &MigrationPolicy) -> Result<MigrationReport>;

    /// Differences between the stored schema and the registered entities,
    /// without applying them.
    async fn check_schema(&self) -> Result<Vec<SchemaDifference>>;

    /// Recorded version tags, oldest first.
    async fn schema_versions(&self) -> Result<Vec<String>>;

    /// Runs a query and hands the rows to `on_page` in batches of at most
    /// the query's page size. Returning [`ControlFlow::Break`] ends the
    /// fetch early; returning an error aborts it.
    async fn fetch<E, F>(&self, query: &Query<E>, on_page: F) -> Result<()>
    where
        E: Entity,
        F: FnMut(Vec<E>) -> Result<ControlFlow<()>> + Send;

    /// Runs a joined query, paging like [`Storage::fetch`].
    async fn fetch_joined<L, R, F>(&self, query: &JoinedQuery<L, R>, on_page: F) -> Result<()>
    where
        L: Entity,
        R: Entity,
        F: FnMut(Vec<(L, R)>) -> Result<ControlFlow<()>> + Send;

    /// Inserts a row.
    async fn insert<E: Entity>(&self, row: &E) -> Result<()>;

    /// Writes every column of a stored row, found by key.
    ///
    /// Returns [`StoreError::NotFound`] if no row has the key.
    async fn update<E: KeyedEntity>(&self, row: &E) -> Result<()>;

    /// Deletes the row with `row`'s key. Deleting a missing row is not an
    /// error.
    async fn delete<E: KeyedEntity>(&self, row: &E) -> Result<()>;

    /// Deletes every row matching `predicate` and returns how many went.
    async fn delete_where<E: Entity>(&self, predicate: &Predicate<E>) -> Result<u64>;

    /// Writes change sets in one transaction: deletes across the list in
    /// reverse order, then creates in order, then updates in order.
    ///
    /// List parents before children: children are then deleted before and
    /// created after their parents.
    async fn save(&self, change_sets: &[&dyn PendingChanges]) -> Result<()>;

    /// Opens a transaction spanning the following operations until the
    /// handle is committed or rolled back.
    async fn begin(&self) -> Result<Transaction<'_>>;

    /// The key allocator for `E`, built on first use and cached for the
    /// store's lifetime.
    async fn key_allocator<E>(&self) -> Result<Arc<dyn KeyAllocator<E::Key>>>
    where
        E: KeyedEntity,
        E::Key: GeneratedKey;

    /// Rows matching `predicate`, in primary-key order.
    async fn find<E: Entity>(&self, predicate: &Predicate<E>) -> Result<Vec<E>> {
        self.find_query(&Query::new(predicate.clone())).await
    }

    /// Every row a query selects, across all pages.
    async fn find_query<E: Entity>(&self, query: &Query<E>) -> Result<Vec<E>> {
        let mut rows = Vec::new();
        self.fetch(query, |page| {
            rows.extend(page);
            Ok(ControlFlow::Continue(()))
        })
        .await?;
        Ok(rows)
    }

    /// Every pair a joined query selects, across all pages.
    async fn find_joined<L: Entity, R: Entity>(
        &self,
        query: &JoinedQuery<L, R>,
    ) -> Result<Vec<(L, R)>> {
        let mut pairs = Vec::new();
        self.fetch_joined(query, |page| {
            pairs.extend(page);
            Ok(ControlFlow::Continue(()))
        })
        .await?;
        Ok(pairs)
    }

    /// Children of `parent` under `relation`.
    async fn find_related<P: Entity, C: Entity>(
        &self,
        relation: &Relation<P, C>,
        parent: &P,
    ) -> Result<Vec<C>> {
        self.find(&relation.children_of(parent)).await
    }

    /// The row with `key`, or [`StoreError::NotFound`].
    async fn get<E: KeyedEntity>(&self, key: &E::Key) -> Result<E> {
        self.get_optional::<E>(key)
            .await?
            .ok_or_else(|| StoreError::not_found(E::TABLE, key))
    }

    /// The row with `key`, if any.
    async fn get_optional<E: KeyedEntity>(&self, key: &E::Key) -> Result<Option<E>> {
        let predicate = Predicate::key_eq(key.key_values())?;
        Ok(self.find(&predicate).await?.into_iter().next())
    }

    /// Applies `setter` to every row matching `predicate` and writes the
    /// rows back. Reading and writing hold the store for the whole call, in
    /// one transaction, so no other write lands in between. Returns how many
    /// rows changed.
    async fn update_where<E, F>(&self, predicate: &Predicate<E>, setter: F) -> Result<usize>
    where
        E: KeyedEntity,
        F: FnMut(&mut E) + Send;

    /// An empty change set for `E`, using the store's key allocator.
    async fn change_set<E>(&self) -> Result<ChangeSet<E>>
    where
        E: KeyedEntity,
        E::Key: GeneratedKey,
    {
        Ok(ChangeSet::new(self.key_allocator::<E>().await?))
    }
}

// ================================================================
// Writes
// ================================================================

/// One row-level write.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Write {
    Insert {
        table: Arc<TableSchema>,
        values: Vec<SqlValue>,
    },
    Update {
        table: Arc<TableSchema>,
        values: Vec<SqlValue>,
    },
    Delete {
        table: Arc<TableSchema>,
        key: Vec<SqlValue>,
    },
}

impl Write {
    pub(crate) fn table(&self) -> &TableSchema {
        match self {
            Self::Insert { table, .. } | Self::Update { table, .. } | Self::Delete { table, .. } => {
                table
            }
        }
    }
}

/// The writes of `change_sets` in save order.
pub(crate) fn ordered_writes(change_sets: &[&dyn PendingChanges]) -> Vec<Write> {
    let tables: Vec<Arc<TableSchema>> = change_sets
        .iter()
        .map(|changes| Arc::new(changes.schema()))
        .collect();
    let mut writes = Vec::new();
    for (changes, table) in change_sets.iter().zip(&tables).rev() {
        writes.extend(changes.deleted_keys().into_iter().map(|key| Write::Delete {
            table: Arc::clone(table),
            key,
        }));
    }
    for (changes, table) in change_sets.iter().zip(&tables) {
        writes.extend(
            changes
                .created_values()
                .into_iter()
                .map(|values| Write::Insert {
                    table: Arc::clone(table),
                    values,
                }),
        );
    }
    for (changes, table) in change_sets.iter().zip(&tables) {
        writes.extend(
            changes
                .updated_values()
                .into_iter()
                .map(|values| Write::Update {
                    table: Arc::clone(table),
                    values,
                }),
        );
    }
    writes
}

/// Key values of a full row.
pub(crate) fn key_of(table: &TableSchema, values: &[SqlValue]) -> Result<Vec<SqlValue>> {
    Ok(table
        .primary_key_indexes()?
        .into_iter()
        .map(|i| values.get(i).cloned().unwrap_or(SqlValue::Null))
        .collect())
}

// ================================================================
// Transactions
// ================================================================

/// Where a store stands with respect to a caller's transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum TransactionState {
    #[default]
    Idle,
    Open,
    /// A write failed inside the transaction and it was rolled back. The
    /// store refuses work until the handle is closed.
    Aborted,
}

impl TransactionState {
    pub(crate) fn ensure_usable(self) -> Result<()> {
        match self {
            Self::Aborted => Err(StoreError::TransactionAborted),
            Self::Idle | Self::Open => Ok(()),
        }
    }
}

/// What a [`Transaction`] handle drives.
#[async_trait]
pub(crate) trait TransactionScope: Send + Sync {
    async fn commit_scope(&self) -> Result<()>;

    async fn rollback_scope(&self) -> Result<()>;

    /// Called when a handle is dropped while open. Must not block.
    fn abandon_scope(&self);
}

/// An open transaction.
///
/// Operations on the store run inside the transaction until [`commit`] or
/// [`rollback`] is called. Both are idempotent: only the first call has
/// an effect. A handle dropped while open rolls the transaction back.
///
/// A write that fails inside the transaction rolls all of it back. Until
/// the handle is closed the store then answers every operation with
/// [`StoreError::TransactionAborted`], and [`commit`] returns that error.
///
/// [`commit`]: Transaction::commit
/// [`rollback`]: Transaction::rollback
pub struct Transaction<'a> {
    scope: &'a dyn TransactionScope,
    open: bool,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(scope: &'a dyn TransactionScope) -> Self {
        Self { scope, open: true }
    }

    /// Whether neither commit nor rollback has been called.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TransactionAborted`] if a write failed inside
    /// the transaction, or the backend error; the transaction is rolled
    /// back then.
    pub async fn commit(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.scope.commit_scope().await
    }

    /// Rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn rollback(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.scope.rollback_scope().await
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.open {
            self.scope.abandon_scope();
        }
    }
}
