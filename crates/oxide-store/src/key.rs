//! Primary key allocation.
//!
//! A [`ChangeSet`](crate::ChangeSet) asks a [`KeyAllocator`] for the key of
//! every row it creates. Integer keys continue from the largest key already
//! stored; UUID and string keys are random.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use oxide_store_core::{PrimaryKey, SqlValue};
use uuid::Uuid;

/// Hands out fresh primary keys.
pub trait KeyAllocator<K>: Send + Sync {
    /// The next unused key.
    fn next(&self) -> K;
}

/// Sequential integer keys.
#[derive(Debug)]
pub struct IntKeyAllocator {
    next: AtomicI64,
}

impl IntKeyAllocator {
    /// Starts handing out keys at `first`.
    #[must_use]
    pub const fn starting_at(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }

    /// Continues after the largest stored key, or starts at 1 for an empty
    /// table.
    #[must_use]
    pub fn after(max: Option<i64>) -> Self {
        Self::starting_at(max.map_or(1, |max| max.saturating_add(1)))
    }
}

impl KeyAllocator<i64> for IntKeyAllocator {
    fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// Keys past `i32::MAX` saturate, so inserting them fails on the duplicate
/// key instead of wrapping to negative keys.
impl KeyAllocator<i32> for IntKeyAllocator {
    fn next(&self) -> i32 {
        let next = self.next.fetch_add(1, Ordering::SeqCst);
        i32::try_from(next).unwrap_or(i32::MAX)
    }
}

/// Random version 4 UUID keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidKeyAllocator;

impl KeyAllocator<Uuid> for UuidKeyAllocator {
    fn next(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Random version 4 UUID keys, as strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringKeyAllocator;

impl KeyAllocator<String> for StringKeyAllocator {
    fn next(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// A key type the store can allocate.
pub trait GeneratedKey: PrimaryKey {
    /// Whether allocation starts from the largest stored key.
    const SEQUENTIAL: bool = false;

    /// Builds the allocator. `max` is the largest stored key when
    /// [`GeneratedKey::SEQUENTIAL`] is set, `None` otherwise.
    fn allocator(max: Option<SqlValue>) -> Arc<dyn KeyAllocator<Self>>;
}

fn max_int(max: Option<SqlValue>) -> Option<i64> {
    match max {
        Some(SqlValue::Int(value)) => Some(value),
        _ => None,
    }
}

impl GeneratedKey for i64 {
    const SEQUENTIAL: bool = true;

    fn allocator(max: Option<SqlValue>) -> Arc<dyn KeyAllocator<Self>> {
        Arc::new(IntKeyAllocator::after(max_int(max)))
    }
}

impl GeneratedKey for i32 {
    const SEQUENTIAL: bool = true;

    fn allocator(max: Option<SqlValue>) -> Arc<dyn KeyAllocator<Self>> {
        Arc::new(IntKeyAllocator::after(max_int(max)))
    }
}

impl GeneratedKey for Uuid {
    fn allocator(_max: Option<SqlValue>) -> Arc<dyn KeyAllocator<Self>> {
        Arc::new(UuidKeyAllocator)
    }
}

impl GeneratedKey for String {
    fn allocator(_max: Option<SqlValue>) -> Arc<dyn KeyAllocator<Self>> {
        Arc::new(StringKeyAllocator)
    }
}

type AllocatorMap = HashMap<&'static str, Box<dyn Any + Send + Sync>>;

/// Allocators a store has built, one per entity table.
#[derive(Default)]
pub(crate) struct AllocatorCache {
    allocators: Mutex<AllocatorMap>,
}

impl fmt::Debug for AllocatorCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorCache").finish_non_exhaustive()
    }
}

impl AllocatorCache {
    fn lock(&self) -> MutexGuard<'_, AllocatorMap> {
        self.allocators.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cached allocator for `table`, if any.
    pub(crate) fn get<K: GeneratedKey>(&self, table: &str) -> Option<Arc<dyn KeyAllocator<K>>> {
        self.lock()
            .get(table)
            .and_then(|entry| entry.downcast_ref::<Arc<dyn KeyAllocator<K>>>())
            .cloned()
    }

    /// Caches `allocator` unless another caller got there first, and
    /// returns the cached one.
    pub(crate) fn insert<K: GeneratedKey>(
        &self,
        table: &'static str,
        allocator: Arc<dyn KeyAllocator<K>>,
    ) -> Arc<dyn KeyAllocator<K>> {
        let mut allocators = self.lock();
        if let Some(existing) = allocators
            .get(table)
            .and_then(|entry| entry.downcast_ref::<Arc<dyn KeyAllocator<K>>>())
        {
            return Arc::clone(existing);
        }
        allocators.insert(table, Box::new(Arc::clone(&allocator)));
        allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_keys_continue_after_max() {
        let allocator = i64::allocator(Some(SqlValue::Int(41)));
        assert_eq!(allocator.next(), 42);
        assert_eq!(allocator.next(), 43);
    }

    #[test]
    fn test_int_keys_start_at_one() {
        let allocator = i64::allocator(None);
        assert_eq!(allocator.next(), 1);
        let allocator = i64::allocator(Some(SqlValue::Null));
        assert_eq!(allocator.next(), 1);
    }

    #[test]
    fn test_i32_keys_saturate() {
        let allocator = i32::allocator(Some(SqlValue::Int(i64::from(i32::MAX) - 1)));
        assert_eq!(allocator.next(), i32::MAX);
        assert_eq!(allocator.next(), i32::MAX);
        assert_eq!(allocator.next(), i32::MAX);
    }

    #[test]
    fn test_random_keys_differ() {
        let allocator = Uuid::allocator(None);
        assert_ne!(allocator.next(), allocator.next());
        let allocator = String::allocator(None);
        let key = allocator.next();
        assert_eq!(key.len(), 36);
        assert_ne!(key, allocator.next());
    }

    #[test]
    fn test_concurrent_int_keys_are_unique() {
        let allocator = i64::allocator(None);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || (0..100).map(|_| allocator.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut keys: Vec<i64> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 400);
    }

    #[test]
    fn test_cache_keeps_first_allocator() {
        let cache = AllocatorCache::default();
        assert!(cache.get::<i64>("person").is_none());
        let first = cache.insert("person", i64::allocator(Some(SqlValue::Int(9))));
        assert_eq!(first.next(), 10);
        let second = cache.insert("person", i64::allocator(None));
        assert_eq!(second.next(), 11);
        assert_eq!(cache.get::<i64>("person").unwrap().next(), 12);
    }
}
