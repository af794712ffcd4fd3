//! The store backed by a relational engine.
//!
//! [`SqlStore`] compiles queries to SQL and runs them on a migration
//! [`Backend`]. The backend sits behind an async mutex: every operation
//! holds it for its duration, so statements never interleave on the single
//! connection.
//!
//! A write that fails inside a caller's transaction rolls the whole
//! transaction back; the store then refuses work until the
//! [`Transaction`] handle is closed.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use oxide_store_core::query::compiler::{
    delete_statement, insert_statement, max_statement, update_statement,
};
use oxide_store_core::{
    compile_query, CompiledSql, Entity, JoinedQuery, KeyedEntity, Predicate, PrimaryKey, Query,
    RenameDirectives, ScalarType, SchemaDifference, SqlCompiler, TableSchema,
};
use oxide_store_migrate::backend::Backend;
use oxide_store_migrate::executor::{
    create_missing_tables, migrate, pending_differences, MigrationReport,
};
use oxide_store_migrate::planner::MigrationPolicy;
use oxide_store_migrate::version;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::change_set::PendingChanges;
use crate::error::{Result, StoreError};
use crate::key::{AllocatorCache, GeneratedKey, KeyAllocator};
use crate::storage::{
    key_of, ordered_writes, Storage, Transaction, TransactionScope, TransactionState, Write,
};

struct SqlState {
    backend: Box<dyn Backend>,
    transaction: TransactionState,
}

impl SqlState {
    /// Ends a write. A store-owned transaction (`own`) is committed, or
    /// rolled back on failure. A failure inside the caller's transaction
    /// rolls that transaction back and marks it aborted.
    async fn finish_writes<T: Send>(&mut self, own: bool, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                if own {
                    if let Err(error) = self.backend.commit().await {
                        self.backend.rollback().await.ok();
                        return Err(error.into());
                    }
                }
                Ok(value)
            }
            Err(error) if own => {
                warn!(store = "sql", error = %error, "Write failed, rolling back");
                self.backend.rollback().await?;
                Err(error)
            }
            Err(error) if self.transaction == TransactionState::Open => {
                warn!(
                    store = "sql",
                    error = %error,
                    "Write failed, aborting the open transaction"
                );
                self.transaction = TransactionState::Aborted;
                self.backend.rollback().await?;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }
}

/// Builds a [`SqlStore`].
pub struct SqlStoreBuilder {
    backend: Box<dyn Backend>,
    tables: Vec<TableSchema>,
    version: Option<String>,
}

impl fmt::Debug for SqlStoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlStoreBuilder")
            .field("tables", &self.tables)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl SqlStoreBuilder {
    /// Registers an entity type. Registering a table twice keeps the
    /// first registration.
    #[must_use]
    pub fn register<E: Entity>(mut self) -> Self {
        if !self.tables.iter().any(|table| table.name == E::TABLE) {
            self.tables.push(E::schema());
        }
        self
    }

    /// Sets the version tag recorded by [`Storage::migrate`].
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Opens the store, creating registered tables that do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns a schema invariant error for an inconsistent entity, and a
    /// migrations-needed error if any existing table differs from its
    /// entity; call [`Storage::migrate`] on a store opened with
    /// [`SqlStoreBuilder::open_unchecked`] first.
    pub async fn open(self) -> Result<SqlStore> {
        let store = self.open_unchecked()?;
        {
            let mut state = store.state.lock().await;
            let report = create_missing_tables(&mut *state.backend, &store.tables).await?;
            info!(
                store = "sql",
                created = report.tables.len(),
                "Opened store"
            );
        }
        Ok(store)
    }

    /// Opens the store without looking at the stored schema, so it can be
    /// migrated.
    ///
    /// # Errors
    ///
    /// Returns a schema invariant error for an inconsistent entity.
    pub fn open_unchecked(self) -> Result<SqlStore> {
        for table in &self.tables {
            table.validate()?;
        }
        Ok(SqlStore {
            state: Mutex::new(SqlState {
                backend: self.backend,
                transaction: TransactionState::Idle,
            }),
            tables: self.tables,
            version: self.version,
            abandoned: AtomicBool::new(false),
            allocators: AllocatorCache::default(),
        })
    }
}

/// A store running on a relational [`Backend`].
pub struct SqlStore {
    state: Mutex<SqlState>,
    tables: Vec<TableSchema>,
    version: Option<String>,
    abandoned: AtomicBool,
    allocators: AllocatorCache,
}

impl fmt::Debug for SqlStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables: Vec<&str> = self.tables.iter().map(|t| t.name.as_str()).collect();
        f.debug_struct("SqlStore")
            .field("tables", &tables)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl SqlStore {
    /// Starts building a store on `backend`.
    pub fn builder(backend: impl Backend + 'static) -> SqlStoreBuilder {
        SqlStoreBuilder {
            backend: Box::new(backend),
            tables: Vec::new(),
            version: None,
        }
    }

    /// Registered table schemas, in registration order.
    #[must_use]
    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    /// Locks the backend, first rolling back a transaction whose handle
    /// was dropped while open.
    async fn lock(&self) -> Result<MutexGuard<'_, SqlState>> {
        let mut state = self.state.lock().await;
        if self.abandoned.swap(false, Ordering::SeqCst) {
            let previous = std::mem::take(&mut state.transaction);
            if previous == TransactionState::Open {
                warn!(store = "sql", "Rolling back a dropped transaction");
                state.backend.rollback().await?;
            }
        }
        Ok(state)
    }

    /// Locks the backend for an operation, refusing while an aborted
    /// transaction is still open.
    async fn lock_usable(&self) -> Result<MutexGuard<'_, SqlState>> {
        let state = self.lock().await?;
        state.transaction.ensure_usable()?;
        Ok(state)
    }

    fn ensure_registered(&self, table: &str) -> Result<()> {
        if self.tables.iter().any(|t| t.name == table) {
            Ok(())
        } else {
            Err(StoreError::unregistered(table))
        }
    }

    /// Runs `writes`, inside a transaction of its own when there is more
    /// than one and none is open.
    async fn run_writes(&self, writes: &[Write]) -> Result<()> {
        for write in writes {
            self.ensure_registered(&write.table().name)?;
        }
        let mut state = self.lock_usable().await?;
        let own = writes.len() > 1 && state.transaction == TransactionState::Idle;
        if own {
            state.backend.begin().await?;
        }
        let outcome = apply_writes(&mut *state.backend, writes).await;
        state.finish_writes(own, outcome).await?;
        debug!(store = "sql", writes = writes.len(), "Saved changes");
        Ok(())
    }
}

/// Reads the rows `compiled` selects, applies `setter` and writes each row
/// back. Returns how many rows were written.
async fn update_rows<E, F>(
    backend: &mut dyn Backend,
    compiled: &CompiledSql,
    setter: &mut F,
) -> Result<usize>
where
    E: KeyedEntity,
    F: FnMut(&mut E) + Send,
{
    let rows = backend
        .query_all(&compiled.sql, &compiled.arguments, &column_types::<E>())
        .await?;
    let table = Arc::new(E::schema());
    let mut writes = Vec::with_capacity(rows.len());
    for values in rows {
        let mut row = E::from_values(values)?;
        setter(&mut row);
        writes.push(Write::Update {
            table: Arc::clone(&table),
            values: row.to_values(),
        });
    }
    apply_writes(backend, &writes).await?;
    Ok(writes.len())
}

async fn apply_writes(backend: &mut dyn Backend, writes: &[Write]) -> Result<()> {
    for write in writes {
        match write {
            Write::Insert { table, values } => {
                let statement = insert_statement(table, values.clone());
                backend
                    .execute(&statement.sql, &statement.arguments)
                    .await?;
            }
            Write::Update { table, values } => {
                let statement = update_statement(table, values.clone())?;
                let affected = backend
                    .execute(&statement.sql, &statement.arguments)
                    .await?;
                if affected == 0 {
                    return Err(StoreError::not_found(&table.name, &key_of(table, values)?));
                }
            }
            Write::Delete { table, key } => {
                let statement = delete_statement(table, key.clone());
                backend
                    .execute(&statement.sql, &statement.arguments)
                    .await?;
            }
        }
    }
    Ok(())
}

fn column_types<E: Entity>() -> Vec<ScalarType> {
    E::fields().iter().map(|field| field.scalar_type()).collect()
}

/// Collects decoded rows into pages and hands full pages on.
struct Pager<T, F> {
    page: Vec<T>,
    page_len: usize,
    on_page: F,
    failure: Option<StoreError>,
    stopped: bool,
}

impl<T, F> Pager<T, F>
where
    F: FnMut(Vec<T>) -> Result<ControlFlow<()>>,
{
    const fn new(page_len: usize, on_page: F) -> Self {
        Self {
            page: Vec::new(),
            page_len,
            on_page,
            failure: None,
            stopped: false,
        }
    }

    fn deliver(&mut self) -> ControlFlow<()> {
        let page = std::mem::take(&mut self.page);
        match (self.on_page)(page) {
            Ok(ControlFlow::Continue(())) => ControlFlow::Continue(()),
            Ok(ControlFlow::Break(())) => {
                self.stopped = true;
                ControlFlow::Break(())
            }
            Err(error) => {
                self.failure = Some(error);
                ControlFlow::Break(())
            }
        }
    }

    fn push(&mut self, row: Result<T>) -> ControlFlow<()> {
        match row {
            Ok(row) => self.page.push(row),
            Err(error) => {
                self.failure = Some(error);
                return ControlFlow::Break(());
            }
        }
        if self.page.len() >= self.page_len {
            self.deliver()
        } else {
            ControlFlow::Continue(())
        }
    }

    fn finish(mut self) -> Result<()> {
        if let Some(error) = self.failure {
            return Err(error);
        }
        if !self.stopped && !self.page.is_empty() {
            self.deliver();
            if let Some(error) = self.failure {
                return Err(error);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for SqlStore {
    async fn migrate(&self, policy: &MigrationPolicy) -> Result<MigrationReport> {
        let mut state = self.lock_usable().await?;
        if state.transaction != TransactionState::Idle {
            return Err(StoreError::Configuration(
                "cannot migrate inside a transaction".to_string(),
            ));
        }
        let report = migrate(
            &mut *state.backend,
            &self.tables,
            policy,
            self.version.as_deref(),
        )
        .await?;
        info!(store = "sql", tables = report.tables.len(), "Migrated store");
        Ok(report)
    }

    async fn check_schema(&self) -> Result<Vec<SchemaDifference>> {
        let mut state = self.lock_usable().await?;
        Ok(pending_differences(
            &mut *state.backend,
            &self.tables,
            &RenameDirectives::default(),
        )
        .await?)
    }

    async fn schema_versions(&self) -> Result<Vec<String>> {
        let mut state = self.lock_usable().await?;
        Ok(version::recorded(&mut *state.backend).await?)
    }

    async fn fetch<E, F>(&self, query: &Query<E>, on_page: F) -> Result<()>
    where
        E: Entity,
        F: FnMut(Vec<E>) -> Result<ControlFlow<()>> + Send,
    {
        self.ensure_registered(E::TABLE)?;
        let compiled = compile_query(query)?;
        let types = column_types::<E>();
        debug!(store = "sql", sql = %compiled.sql, "Fetching");

        let mut pager = Pager::new(query.page_len(), on_page);
        {
            let mut state = self.lock_usable().await?;
            state
                .backend
                .query(
                    &compiled.sql,
                    &compiled.arguments,
                    &types,
                    &mut |values| pager.push(E::from_values(values).map_err(StoreError::from)),
                )
                .await?;
        }
        pager.finish()
    }

    async fn fetch_joined<L, R, F>(&self, query: &JoinedQuery<L, R>, on_page: F) -> Result<()>
    where
        L: Entity,
        R: Entity,
        F: FnMut(Vec<(L, R)>) -> Result<ControlFlow<()>> + Send,
    {
        self.ensure_registered(L::TABLE)?;
        self.ensure_registered(R::TABLE)?;
        let compiled = SqlCompiler::new().select_joined(query)?;
        let left_width = L::fields().len();
        let mut types = column_types::<L>();
        types.extend(column_types::<R>());
        debug!(store = "sql", sql = %compiled.sql, "Fetching join");

        let mut pager = Pager::new(query.page_len(), on_page);
        {
            let mut state = self.lock_usable().await?;
            state
                .backend
                .query(
                    &compiled.sql,
                    &compiled.arguments,
                    &types,
                    &mut |mut values| {
                        let right = values.split_off(left_width.min(values.len()));
                        let pair = L::from_values(values)
                            .and_then(|left| Ok((left, R::from_values(right)?)))
                            .map_err(StoreError::from);
                        pager.push(pair)
                    },
                )
                .await?;
        }
        pager.finish()
    }

    async fn insert<E: Entity>(&self, row: &E) -> Result<()> {
        let write = Write::Insert {
            table: Arc::new(E::schema()),
            values: row.to_values(),
        };
        self.run_writes(&[write]).await
    }

    async fn update<E: KeyedEntity>(&self, row: &E) -> Result<()> {
        let write = Write::Update {
            table: Arc::new(E::schema()),
            values: row.to_values(),
        };
        self.run_writes(&[write]).await
    }

    async fn delete<E: KeyedEntity>(&self, row: &E) -> Result<()> {
        let write = Write::Delete {
            table: Arc::new(E::schema()),
            key: row.key().key_values(),
        };
        self.run_writes(&[write]).await
    }

    async fn delete_where<E: Entity>(&self, predicate: &Predicate<E>) -> Result<u64> {
        self.ensure_registered(E::TABLE)?;
        let compiled = SqlCompiler::unaliased().delete(predicate)?;
        let mut state = self.lock_usable().await?;
        let outcome = state
            .backend
            .execute(&compiled.sql, &compiled.arguments)
            .await
            .map_err(StoreError::from);
        let deleted = state.finish_writes(false, outcome).await?;
        debug!(store = "sql", table = E::TABLE, deleted, "Deleted rows");
        Ok(deleted)
    }

    async fn save(&self, change_sets: &[&dyn PendingChanges]) -> Result<()> {
        let writes = ordered_writes(change_sets);
        self.run_writes(&writes).await
    }

    async fn update_where<E, F>(&self, predicate: &Predicate<E>, mut setter: F) -> Result<usize>
    where
        E: KeyedEntity,
        F: FnMut(&mut E) + Send,
    {
        self.ensure_registered(E::TABLE)?;
        let compiled = compile_query(&Query::new(predicate.clone()))?;
        let mut state = self.lock_usable().await?;
        let own = state.transaction == TransactionState::Idle;
        if own {
            state.backend.begin().await?;
        }
        let outcome = update_rows(&mut *state.backend, &compiled, &mut setter).await;
        let updated = state.finish_writes(own, outcome).await?;
        debug!(store = "sql", table = E::TABLE, updated, "Updated rows");
        Ok(updated)
    }

    async fn begin(&self) -> Result<Transaction<'_>> {
        let mut state = self.lock().await?;
        if state.transaction != TransactionState::Idle {
            return Err(StoreError::Configuration(
                "a transaction is already open".to_string(),
            ));
        }
        state.backend.begin().await?;
        state.transaction = TransactionState::Open;
        debug!(store = "sql", "Transaction started");
        Ok(Transaction::new(self))
    }

    async fn key_allocator<E>(&self) -> Result<Arc<dyn KeyAllocator<E::Key>>>
    where
        E: KeyedEntity,
        E::Key: GeneratedKey,
    {
        if let Some(allocator) = self.allocators.get::<E::Key>(E::TABLE) {
            return Ok(allocator);
        }
        self.ensure_registered(E::TABLE)?;
        let max = if <E::Key as GeneratedKey>::SEQUENTIAL {
            let [column] = E::primary_key() else {
                return Err(StoreError::Configuration(format!(
                    "sequential keys for '{}' need a single-column primary key",
                    E::TABLE
                )));
            };
            let statement = max_statement(E::TABLE, column);
            let mut state = self.lock_usable().await?;
            state
                .backend
                .query_all(&statement.sql, &statement.arguments, &[ScalarType::Int])
                .await?
                .into_iter()
                .next()
                .and_then(|row| row.into_iter().next())
        } else {
            None
        };
        debug!(store = "sql", table = E::TABLE, max = ?max, "Built key allocator");
        Ok(self
            .allocators
            .insert(E::TABLE, <E::Key as GeneratedKey>::allocator(max)))
    }
}

#[async_trait]
impl TransactionScope for SqlStore {
    async fn commit_scope(&self) -> Result<()> {
        let mut state = self.lock().await?;
        match std::mem::take(&mut state.transaction) {
            TransactionState::Idle => return Ok(()),
            TransactionState::Aborted => return Err(StoreError::TransactionAborted),
            TransactionState::Open => {}
        }
        if let Err(error) = state.backend.commit().await {
            warn!(store = "sql", error = %error, "Commit failed, rolling back");
            state.backend.rollback().await.ok();
            return Err(error.into());
        }
        debug!(store = "sql", "Transaction committed");
        Ok(())
    }

    async fn rollback_scope(&self) -> Result<()> {
        let mut state = self.lock().await?;
        if std::mem::take(&mut state.transaction) != TransactionState::Open {
            return Ok(());
        }
        state.backend.rollback().await?;
        debug!(store = "sql", "Transaction rolled back");
        Ok(())
    }

    fn abandon_scope(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxide_store_core::FieldDef;
    use oxide_store_migrate::backend::SqliteBackend;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Counter {
        id: i64,
        hits: i64,
    }

    impl Entity for Counter {
        const TABLE: &'static str = "counter";

        fn fields() -> Vec<FieldDef<Self>> {
            vec![
                FieldDef::new("id", |c: &Self| &c.id, |c: &mut Self| &mut c.id),
                FieldDef::new("hits", |c: &Self| &c.hits, |c: &mut Self| &mut c.hits),
            ]
        }

        fn primary_key() -> &'static [&'static str] {
            &["id"]
        }
    }

    impl KeyedEntity for Counter {
        type Key = i64;

        fn key(&self) -> i64 {
            self.id
        }

        fn set_key(&mut self, key: i64) {
            self.id = key;
        }
    }

    async fn store() -> SqlStore {
        SqlStore::builder(SqliteBackend::in_memory().await.unwrap())
            .register::<Counter>()
            .open()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pages_are_bounded() {
        let store = store().await;
        for id in 1..=5 {
            store.insert(&Counter { id, hits: 0 }).await.unwrap();
        }
        let mut sizes = Vec::new();
        store
            .fetch(&Query::<Counter>::default().page_size(2), |page| {
                sizes.push(page.len());
                Ok(ControlFlow::Continue(()))
            })
            .await
            .unwrap();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_stop_and_failure() {
        let store = store().await;
        for id in 1..=5 {
            store.insert(&Counter { id, hits: 0 }).await.unwrap();
        }
        let mut pages = 0;
        store
            .fetch(&Query::<Counter>::default().page_size(2), |_| {
                pages += 1;
                Ok(ControlFlow::Break(()))
            })
            .await
            .unwrap();
        assert_eq!(pages, 1);

        let err = store
            .fetch(&Query::<Counter>::default().page_size(2), |_| {
                Err(StoreError::Configuration("stop".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = store().await;
        {
            let _tx = store.begin().await.unwrap();
            store.insert(&Counter { id: 1, hits: 1 }).await.unwrap();
        }
        assert!(store.find(&Predicate::<Counter>::all()).await.unwrap().is_empty());

        // A new transaction can start after the deferred rollback.
        let mut tx = store.begin().await.unwrap();
        store.insert(&Counter { id: 2, hits: 1 }).await.unwrap();
        tx.commit().await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.find(&Predicate::<Counter>::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_aborts_transaction() {
        let store = store().await;
        store.insert(&Counter { id: 1, hits: 0 }).await.unwrap();
        {
            let _tx = store.begin().await.unwrap();
            store.insert(&Counter { id: 2, hits: 0 }).await.unwrap();
            let err = store.insert(&Counter { id: 1, hits: 5 }).await.unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Backend);
            assert!(matches!(
                store.delete_where(&Predicate::<Counter>::all()).await.unwrap_err(),
                StoreError::TransactionAborted
            ));
        }

        // Dropping the aborted handle frees the store.
        let rows = store.find(&Predicate::<Counter>::all()).await.unwrap();
        assert_eq!(rows, vec![Counter { id: 1, hits: 0 }]);
        let mut tx = store.begin().await.unwrap();
        store.update(&Counter { id: 1, hits: 3 }).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.get::<Counter>(&1).await.unwrap().hits, 3);
    }

    #[tokio::test]
    async fn test_nested_begin_is_rejected() {
        let store = store().await;
        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            store.begin().await.unwrap_err(),
            StoreError::Configuration(_)
        ));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_unregistered_entity() {
        let store = SqlStore::builder(SqliteBackend::in_memory().await.unwrap())
            .open()
            .await
            .unwrap();
        let err = store.insert(&Counter::default()).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
