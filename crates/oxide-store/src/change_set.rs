//! Batched writes.
//!
//! A [`ChangeSet`] collects created, updated and deleted rows of one entity
//! type, keyed by primary key, so a whole unit of work can be written in a
//! single transaction with [`Storage::save`](crate::Storage::save).
//!
//! The maps stay consistent as rows move between them:
//! - a deleted key is in neither `created` nor `updated`
//! - updating a created row replaces it in `created`
//! - updating a deleted row is ignored

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use oxide_store_core::{KeyedEntity, PrimaryKey, SqlValue, TableSchema};

use crate::key::KeyAllocator;

/// Pending writes for one entity type.
pub struct ChangeSet<E: KeyedEntity> {
    created: BTreeMap<E::Key, E>,
    updated: BTreeMap<E::Key, E>,
    deleted: BTreeMap<E::Key, E>,
    allocator: Arc<dyn KeyAllocator<E::Key>>,
}

impl<E: KeyedEntity + fmt::Debug> fmt::Debug for ChangeSet<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSet")
            .field("table", &E::TABLE)
            .field("created", &self.created)
            .field("updated", &self.updated)
            .field("deleted", &self.deleted)
            .finish_non_exhaustive()
    }
}

impl<E: KeyedEntity> ChangeSet<E> {
    /// An empty change set drawing new keys from `allocator`.
    #[must_use]
    pub fn new(allocator: Arc<dyn KeyAllocator<E::Key>>) -> Self {
        Self {
            created: BTreeMap::new(),
            updated: BTreeMap::new(),
            deleted: BTreeMap::new(),
            allocator,
        }
    }

    /// Creates a row: allocates its key, lets `initializer` fill in the
    /// other fields, and records it as created. Returns the key.
    pub fn create(&mut self, initializer: impl FnOnce(&mut E)) -> E::Key {
        let mut row = E::default();
        row.set_key(self.allocator.next());
        initializer(&mut row);
        let key = row.key();
        self.deleted.remove(&key);
        self.created.insert(key.clone(), row);
        key
    }

    /// Records a changed row.
    pub fn updated(&mut self, row: E) {
        let key = row.key();
        if let Some(created) = self.created.get_mut(&key) {
            *created = row;
        } else if !self.deleted.contains_key(&key) {
            self.updated.insert(key, row);
        }
    }

    /// Records a deleted row.
    pub fn deleted(&mut self, row: E) {
        let key = row.key();
        // A row created in this change set never reached storage.
        if self.created.remove(&key).is_some() {
            self.updated.remove(&key);
            return;
        }
        self.updated.remove(&key);
        self.deleted.insert(key, row);
    }

    /// Rows to create, in key order.
    pub fn new_rows(&self) -> impl Iterator<Item = &E> {
        self.created.values()
    }

    /// Rows to update, in key order.
    pub fn updated_rows(&self) -> impl Iterator<Item = &E> {
        self.updated.values()
    }

    /// Rows to delete, in key order.
    pub fn deleted_rows(&self) -> impl Iterator<Item = &E> {
        self.deleted.values()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Forgets every pending change. The allocator keeps its position.
    pub fn clear(&mut self) {
        self.created.clear();
        self.updated.clear();
        self.deleted.clear();
    }
}

/// The writes of a change set, with the entity type erased so change sets
/// of different types can be saved together.
pub trait PendingChanges: Send + Sync {
    /// Schema of the table written to.
    fn schema(&self) -> TableSchema;

    /// Key values of the rows to delete.
    fn deleted_keys(&self) -> Vec<Vec<SqlValue>>;

    /// Column values of the rows to create.
    fn created_values(&self) -> Vec<Vec<SqlValue>>;

    /// Column values of the rows to update.
    fn updated_values(&self) -> Vec<Vec<SqlValue>>;
}

impl<E: KeyedEntity> PendingChanges for ChangeSet<E> {
    fn schema(&self) -> TableSchema {
        E::schema()
    }

    fn deleted_keys(&self) -> Vec<Vec<SqlValue>> {
        self.deleted.keys().map(PrimaryKey::key_values).collect()
    }

    fn created_values(&self) -> Vec<Vec<SqlValue>> {
        self.created.values().map(E::to_values).collect()
    }

    fn updated_values(&self) -> Vec<Vec<SqlValue>> {
        self.updated.values().map(E::to_values).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::IntKeyAllocator;
    use oxide_store_core::{Entity, FieldDef};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Note {
        id: i64,
        text: String,
    }

    impl Entity for Note {
        const TABLE: &'static str = "note";

        fn fields() -> Vec<FieldDef<Self>> {
            vec![
                FieldDef::new("id", |n: &Self| &n.id, |n: &mut Self| &mut n.id),
                FieldDef::new("text", |n: &Self| &n.text, |n: &mut Self| &mut n.text),
            ]
        }

        fn primary_key() -> &'static [&'static str] {
            &["id"]
        }
    }

    impl KeyedEntity for Note {
        type Key = i64;

        fn key(&self) -> i64 {
            self.id
        }

        fn set_key(&mut self, key: i64) {
            self.id = key;
        }
    }

    fn notes() -> ChangeSet<Note> {
        ChangeSet::new(Arc::new(IntKeyAllocator::starting_at(10)))
    }

    fn note(id: i64, text: &str) -> Note {
        Note {
            id,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_create_allocates_keys() {
        let mut changes = notes();
        let first = changes.create(|n| n.text = "a".into());
        let second = changes.create(|n| n.text = "b".into());
        assert_eq!((first, second), (10, 11));
        let texts: Vec<&str> = changes.new_rows().map(|n| n.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert_eq!(changes.updated_rows().count(), 0);
    }

    #[test]
    fn test_update_of_created_row_stays_created() {
        let mut changes = notes();
        let key = changes.create(|n| n.text = "draft".into());
        changes.updated(note(key, "final"));
        assert_eq!(changes.new_rows().next().unwrap().text, "final");
        assert_eq!(changes.updated_rows().count(), 0);
    }

    #[test]
    fn test_delete_of_created_row_cancels_it() {
        let mut changes = notes();
        let key = changes.create(|_| {});
        changes.deleted(note(key, ""));
        assert!(changes.is_empty());
    }

    #[test]
    fn test_update_after_delete_is_ignored() {
        let mut changes = notes();
        changes.updated(note(1, "edited"));
        changes.deleted(note(1, "edited"));
        changes.updated(note(1, "again"));
        assert_eq!(changes.updated_rows().count(), 0);
        assert_eq!(changes.deleted_rows().count(), 1);
    }

    #[test]
    fn test_pending_changes_are_key_ordered() {
        let mut changes = notes();
        changes.updated(note(3, "c"));
        changes.updated(note(1, "a"));
        changes.deleted(note(7, ""));
        changes.deleted(note(5, ""));
        assert_eq!(
            changes.updated_values(),
            vec![
                vec![SqlValue::Int(1), SqlValue::from("a")],
                vec![SqlValue::Int(3), SqlValue::from("c")],
            ]
        );
        assert_eq!(
            changes.deleted_keys(),
            vec![vec![SqlValue::Int(5)], vec![SqlValue::Int(7)]]
        );
        assert_eq!(changes.schema().name, "note");
    }

    #[test]
    fn test_clear() {
        let mut changes = notes();
        changes.create(|_| {});
        changes.updated(note(1, "a"));
        changes.clear();
        assert!(changes.is_empty());
        assert_eq!(changes.create(|_| {}), 11);
    }
}
