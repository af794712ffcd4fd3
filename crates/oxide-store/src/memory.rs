//! The in-memory store.
//!
//! [`MemoryStore`] keeps every table as a list of encoded rows and answers
//! queries with the core [`Evaluator`], so it returns the same rows in the
//! same order as [`SqlStore`](crate::SqlStore). It is meant for tests and
//! for short-lived data that never needs to reach a database.
//!
//! Transactions behave as on the SQL store: a failed write inside one
//! restores the snapshot taken by `begin` and aborts the transaction.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use oxide_store_core::{
    Entity, Evaluator, JoinedQuery, KeyedEntity, Predicate, PrimaryKey, Query, RowSource,
    SchemaDifference, SqlValue, TableSchema,
};
use oxide_store_migrate::executor::MigrationReport;
use oxide_store_migrate::planner::MigrationPolicy;
use tracing::{debug, info, warn};

use crate::change_set::PendingChanges;
use crate::error::{Result, StoreError};
use crate::key::{AllocatorCache, GeneratedKey, KeyAllocator};
use crate::storage::{
    key_of, ordered_writes, Storage, Transaction, TransactionScope, TransactionState, Write,
};

/// Rows of every table, keyed by table name.
#[derive(Debug, Clone, Default)]
struct Tables(HashMap<String, Vec<Vec<SqlValue>>>);

impl RowSource for Tables {
    fn rows(&self, table: &str) -> &[Vec<SqlValue>] {
        self.0.get(table).map_or(&[], Vec::as_slice)
    }
}

impl Tables {
    fn position(&self, table: &TableSchema, key: &[SqlValue]) -> Result<Option<usize>> {
        let Some(rows) = self.0.get(&table.name) else {
            return Ok(None);
        };
        let indexes = table.primary_key_indexes()?;
        Ok(rows.iter().position(|row| {
            indexes
                .iter()
                .zip(key)
                .all(|(&i, value)| row.get(i) == Some(value))
        }))
    }

    fn apply(&mut self, write: &Write) -> Result<()> {
        match write {
            Write::Insert { table, values } => {
                if !table.primary_key.is_empty() {
                    let key = key_of(table, values)?;
                    if self.position(table, &key)?.is_some() {
                        return Err(StoreError::Constraint(format!(
                            "duplicate primary key {key:?} in '{}'",
                            table.name
                        )));
                    }
                }
                self.0
                    .entry(table.name.clone())
                    .or_default()
                    .push(values.clone());
            }
            Write::Update { table, values } => {
                let key = key_of(table, values)?;
                let Some(index) = self.position(table, &key)? else {
                    return Err(StoreError::not_found(&table.name, &key));
                };
                if let Some(rows) = self.0.get_mut(&table.name) {
                    rows[index] = values.clone();
                }
            }
            Write::Delete { table, key } => {
                if let Some(index) = self.position(table, key)? {
                    if let Some(rows) = self.0.get_mut(&table.name) {
                        rows.remove(index);
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: Tables,
    /// Tables as they were when the open transaction began.
    snapshot: Option<Tables>,
    transaction: TransactionState,
    versions: Vec<String>,
}

impl MemoryState {
    /// Applies `writes` all or nothing. A failure inside an open
    /// transaction restores its snapshot and aborts it.
    fn apply_writes(&mut self, writes: &[Write]) -> Result<()> {
        let mut tables = self.tables.clone();
        for write in writes {
            if let Err(error) = tables.apply(write) {
                self.abort(&error);
                return Err(error);
            }
        }
        self.tables = tables;
        Ok(())
    }

    fn abort(&mut self, error: &StoreError) {
        if self.transaction != TransactionState::Open {
            return;
        }
        warn!(store = "memory", error = %error, "Write failed, aborting the open transaction");
        if let Some(snapshot) = self.snapshot.take() {
            self.tables = snapshot;
        }
        self.transaction = TransactionState::Aborted;
    }

    /// Drops the transaction, restoring the snapshot if it is still open.
    fn close(&mut self, restore: bool) -> TransactionState {
        if let Some(snapshot) = self.snapshot.take() {
            if restore {
                self.tables = snapshot;
            }
        }
        std::mem::take(&mut self.transaction)
    }
}

/// Builds a [`MemoryStore`].
#[derive(Debug, Default)]
pub struct MemoryStoreBuilder {
    tables: Vec<TableSchema>,
    version: Option<String>,
}

impl MemoryStoreBuilder {
    /// Registers an entity type.
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

    /// Opens an empty store.
    ///
    /// # Errors
    ///
    /// Returns a schema invariant error for an inconsistent entity.
    pub fn open(self) -> Result<MemoryStore> {
        for table in &self.tables {
            table.validate()?;
        }
        info!(store = "memory", tables = self.tables.len(), "Opened store");
        Ok(MemoryStore {
            state: Mutex::new(MemoryState::default()),
            tables: self.tables,
            version: self.version,
            allocators: AllocatorCache::default(),
        })
    }
}

/// A store holding its rows in memory.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    tables: Vec<TableSchema>,
    version: Option<String>,
    allocators: AllocatorCache,
}

impl MemoryStore {
    /// Starts building a store.
    #[must_use]
    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::default()
    }

    /// Registered table schemas, in registration order.
    #[must_use]
    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the tables for an operation, refusing while an aborted
    /// transaction is still open.
    fn lock_usable(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let state = self.lock();
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

    /// Applies `writes` all or nothing.
    fn run_writes(&self, writes: &[Write]) -> Result<()> {
        for write in writes {
            self.ensure_registered(&write.table().name)?;
        }
        self.lock_usable()?.apply_writes(writes)
    }
}

/// Hands `rows` to `on_page` in batches of `page_len`.
fn deliver_pages<T, F>(rows: Vec<T>, page_len: usize, mut on_page: F) -> Result<()>
where
    F: FnMut(Vec<T>) -> Result<ControlFlow<()>>,
{
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        let page: Vec<T> = rows.by_ref().take(page_len).collect();
        if on_page(page)?.is_break() {
            break;
        }
    }
    Ok(())
}

#[async_trait]
impl Storage for MemoryStore {
    async fn migrate(&self, _policy: &MigrationPolicy) -> Result<MigrationReport> {
        let mut state = self.lock_usable()?;
        if state.transaction != TransactionState::Idle {
            return Err(StoreError::Configuration(
                "cannot migrate inside a transaction".to_string(),
            ));
        }
        if let Some(version) = &self.version {
            if !state.versions.contains(version) {
                state.versions.push(version.clone());
            }
        }
        Ok(MigrationReport::default())
    }

    async fn check_schema(&self) -> Result<Vec<SchemaDifference>> {
        Ok(Vec::new())
    }

    async fn schema_versions(&self) -> Result<Vec<String>> {
        Ok(self.lock_usable()?.versions.clone())
    }

    async fn fetch<E, F>(&self, query: &Query<E>, on_page: F) -> Result<()>
    where
        E: Entity,
        F: FnMut(Vec<E>) -> Result<ControlFlow<()>> + Send,
    {
        self.ensure_registered(E::TABLE)?;
        let rows = {
            let state = self.lock_usable()?;
            Evaluator::new(&state.tables).select(query)?
        };
        debug!(store = "memory", table = E::TABLE, rows = rows.len(), "Fetching");
        deliver_pages(rows, query.page_len(), on_page)
    }

    async fn fetch_joined<L, R, F>(&self, query: &JoinedQuery<L, R>, on_page: F) -> Result<()>
    where
        L: Entity,
        R: Entity,
        F: FnMut(Vec<(L, R)>) -> Result<ControlFlow<()>> + Send,
    {
        self.ensure_registered(L::TABLE)?;
        self.ensure_registered(R::TABLE)?;
        let pairs = {
            let state = self.lock_usable()?;
            Evaluator::new(&state.tables).select_joined(query)?
        };
        deliver_pages(pairs, query.page_len(), on_page)
    }

    async fn insert<E: Entity>(&self, row: &E) -> Result<()> {
        self.run_writes(&[Write::Insert {
            table: Arc::new(E::schema()),
            values: row.to_values(),
        }])
    }

    async fn update<E: KeyedEntity>(&self, row: &E) -> Result<()> {
        self.run_writes(&[Write::Update {
            table: Arc::new(E::schema()),
            values: row.to_values(),
        }])
    }

    async fn delete<E: KeyedEntity>(&self, row: &E) -> Result<()> {
        self.run_writes(&[Write::Delete {
            table: Arc::new(E::schema()),
            key: row.key().key_values(),
        }])
    }

    async fn delete_where<E: Entity>(&self, predicate: &Predicate<E>) -> Result<u64> {
        self.ensure_registered(E::TABLE)?;
        predicate.validate()?;
        let mut state = self.lock_usable()?;
        let matched = {
            let evaluator = Evaluator::new(&state.tables);
            let predicate = predicate.resolve(&evaluator)?;
            let mut matched = Vec::new();
            for values in state.tables.rows(E::TABLE) {
                let row = E::from_values(values.clone())?;
                matched.push(predicate.matches(&evaluator, &row)?);
            }
            matched
        };
        let deleted = matched.iter().filter(|&&m| m).count();
        if let Some(rows) = state.tables.0.get_mut(E::TABLE) {
            let mut flags = matched.into_iter();
            rows.retain(|_| !flags.next().unwrap_or(false));
        }
        debug!(store = "memory", table = E::TABLE, deleted, "Deleted rows");
        Ok(deleted as u64)
    }

    async fn save(&self, change_sets: &[&dyn PendingChanges]) -> Result<()> {
        let writes = ordered_writes(change_sets);
        self.run_writes(&writes)?;
        debug!(store = "memory", writes = writes.len(), "Saved changes");
        Ok(())
    }

    async fn update_where<E, F>(&self, predicate: &Predicate<E>, mut setter: F) -> Result<usize>
    where
        E: KeyedEntity,
        F: FnMut(&mut E) + Send,
    {
        self.ensure_registered(E::TABLE)?;
        let mut state = self.lock_usable()?;
        let rows = Evaluator::new(&state.tables).find_all(predicate)?;
        let table = Arc::new(E::schema());
        let writes: Vec<Write> = rows
            .into_iter()
            .map(|mut row| {
                setter(&mut row);
                Write::Update {
                    table: Arc::clone(&table),
                    values: row.to_values(),
                }
            })
            .collect();
        state.apply_writes(&writes)?;
        debug!(store = "memory", table = E::TABLE, updated = writes.len(), "Updated rows");
        Ok(writes.len())
    }

    async fn begin(&self) -> Result<Transaction<'_>> {
        let mut state = self.lock();
        if state.transaction != TransactionState::Idle {
            return Err(StoreError::Configuration(
                "a transaction is already open".to_string(),
            ));
        }
        state.snapshot = Some(state.tables.clone());
        state.transaction = TransactionState::Open;
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
            let indexes = E::schema().primary_key_indexes()?;
            let [index] = indexes[..] else {
                return Err(StoreError::Configuration(format!(
                    "sequential keys for '{}' need a single-column primary key",
                    E::TABLE
                )));
            };
            let state = self.lock_usable()?;
            state
                .tables
                .rows(E::TABLE)
                .iter()
                .filter_map(|row| match row.get(index) {
                    Some(SqlValue::Int(value)) => Some(*value),
                    _ => None,
                })
                .max()
                .map(SqlValue::Int)
        } else {
            None
        };
        Ok(self
            .allocators
            .insert(E::TABLE, <E::Key as GeneratedKey>::allocator(max)))
    }
}

#[async_trait]
impl TransactionScope for MemoryStore {
    async fn commit_scope(&self) -> Result<()> {
        match self.lock().close(false) {
            TransactionState::Aborted => Err(StoreError::TransactionAborted),
            TransactionState::Idle | TransactionState::Open => Ok(()),
        }
    }

    async fn rollback_scope(&self) -> Result<()> {
        self.lock().close(true);
        Ok(())
    }

    fn abandon_scope(&self) {
        if self.lock().close(true) == TransactionState::Open {
            warn!(store = "memory", "Rolling back a dropped transaction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxide_store_core::FieldDef;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Item {
        id: i64,
        name: String,
    }

    impl Entity for Item {
        const TABLE: &'static str = "item";

        fn fields() -> Vec<FieldDef<Self>> {
            vec![
                FieldDef::new("id", |i: &Self| &i.id, |i: &mut Self| &mut i.id),
                FieldDef::new("name", |i: &Self| &i.name, |i: &mut Self| &mut i.name),
            ]
        }

        fn primary_key() -> &'static [&'static str] {
            &["id"]
        }
    }

    impl KeyedEntity for Item {
        type Key = i64;

        fn key(&self) -> i64 {
            self.id
        }

        fn set_key(&mut self, key: i64) {
            self.id = key;
        }
    }

    fn item(id: i64, name: &str) -> Item {
        Item {
            id,
            name: name.to_string(),
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::builder().register::<Item>().open().unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_key_is_a_constraint_error() {
        let store = store();
        store.insert(&item(1, "a")).await.unwrap();
        let err = store.insert(&item(1, "b")).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
        assert_eq!(store.get::<Item>(&1).await.unwrap().name, "a");
    }

    #[tokio::test]
    async fn test_update_and_delete_by_key() {
        let store = store();
        store.insert(&item(1, "a")).await.unwrap();
        store.update(&item(1, "b")).await.unwrap();
        assert_eq!(store.get::<Item>(&1).await.unwrap().name, "b");

        let err = store.update(&item(2, "x")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));

        store.delete(&item(1, "")).await.unwrap();
        store.delete(&item(1, "")).await.unwrap();
        assert!(store.get_optional::<Item>(&1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_save_changes_nothing() {
        let store = store();
        store.insert(&item(1, "a")).await.unwrap();
        let writes = [
            Write::Insert {
                table: Arc::new(Item::schema()),
                values: item(2, "b").to_values(),
            },
            Write::Update {
                table: Arc::new(Item::schema()),
                values: item(9, "missing").to_values(),
            },
        ];
        assert!(store.run_writes(&writes).is_err());
        assert_eq!(store.find(&Predicate::<Item>::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_where() {
        let store = store();
        for (id, name) in [(1, "keep"), (2, "drop"), (3, "drop")] {
            store.insert(&item(id, name)).await.unwrap();
        }
        let name = oxide_store_core::Field::new("name", |i: &Item| &i.name);
        assert_eq!(store.delete_where(&name.eq("drop")).await.unwrap(), 2);
        let left = store.find(&Predicate::<Item>::all()).await.unwrap();
        assert_eq!(left, vec![item(1, "keep")]);
    }

    #[tokio::test]
    async fn test_transaction_snapshot() {
        let store = store();
        store.insert(&item(1, "a")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        store.insert(&item(2, "b")).await.unwrap();
        tx.rollback().await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.find(&Predicate::<Item>::all()).await.unwrap().len(), 1);

        {
            let _tx = store.begin().await.unwrap();
            store.insert(&item(3, "c")).await.unwrap();
        }
        assert_eq!(store.find(&Predicate::<Item>::all()).await.unwrap().len(), 1);

        let mut tx = store.begin().await.unwrap();
        store.insert(&item(4, "d")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.find(&Predicate::<Item>::all()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_write_aborts_transaction() {
        let store = store();
        store.insert(&item(1, "a")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        store.insert(&item(2, "b")).await.unwrap();
        let err = store.insert(&item(1, "again")).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
        assert!(matches!(
            store.get::<Item>(&1).await.unwrap_err(),
            StoreError::TransactionAborted
        ));
        assert!(matches!(
            store.begin().await.unwrap_err(),
            StoreError::Configuration(_)
        ));
        assert!(matches!(
            tx.commit().await.unwrap_err(),
            StoreError::TransactionAborted
        ));

        let rows = store.find(&Predicate::<Item>::all()).await.unwrap();
        assert_eq!(rows, vec![item(1, "a")]);
    }

    #[tokio::test]
    async fn test_versions_are_recorded_once() {
        let store = MemoryStore::builder()
            .register::<Item>()
            .version("v1")
            .open()
            .unwrap();
        let policy = MigrationPolicy::new();
        assert!(store.migrate(&policy).await.unwrap().is_empty());
        store.migrate(&policy).await.unwrap();
        assert_eq!(store.schema_versions().await.unwrap(), vec!["v1".to_string()]);
        assert!(store.check_schema().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_int_keys_continue_from_max() {
        let store = store();
        store.insert(&item(7, "a")).await.unwrap();
        let mut items = store.change_set::<Item>().await.unwrap();
        assert_eq!(items.create(|i| i.name = "b".into()), 8);
        store.save(&[&items]).await.unwrap();
        assert_eq!(store.get::<Item>(&8).await.unwrap().name, "b");
    }
}
