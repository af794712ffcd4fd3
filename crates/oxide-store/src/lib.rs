//! # oxide-store
//!
//! An embedded object store: entities derived from Rust structs, typed
//! queries, batched writes, and schema-diff migrations.
//!
//! This crate provides:
//! - [`Storage`], the interface both stores implement
//! - [`SqlStore`], running compiled SQL on a migration backend
//! - [`MemoryStore`], evaluating the same queries over rows in memory
//! - [`ChangeSet`] for writing a unit of work in one transaction
//! - Key allocators for new rows
//!
//! ## Quick Start
//!
//! ```ignore
//! use oxide_store::prelude::*;
//! use oxide_store_derive::Entity;
//!
//! #[derive(Debug, Clone, Default, Entity)]
//! #[entity(table = "person")]
//! struct Person {
//!     #[field(primary_key)]
//!     id: i64,
//!     name: String,
//!     age: i64,
//! }
//!
//! async fn example() -> oxide_store::Result<()> {
//!     let backend = SqliteBackend::connect("sqlite:app.db").await?;
//!     let store = SqlStore::builder(backend)
//!         .register::<Person>()
//!         .version("v1")
//!         .open()
//!         .await?;
//!
//!     let mut people = store.change_set::<Person>().await?;
//!     people.create(|p| {
//!         p.name = "Ada".into();
//!         p.age = 36;
//!     });
//!     store.save(&[&people]).await?;
//!
//!     let adults = store.find(&Person::age().gte(18)).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Paging
//!
//! ```ignore
//! let query = Query::new(Person::age().gte(18))
//!     .order(Order::asc(Person::name()))
//!     .page_size(100);
//! store
//!     .fetch(&query, |page| {
//!         for person in page {
//!             println!("{}", person.name);
//!         }
//!         Ok(ControlFlow::Continue(()))
//!     })
//!     .await?;
//! ```

pub mod change_set;
mod error;
pub mod key;
pub mod memory;
pub mod sql;
pub mod storage;

pub use change_set::{ChangeSet, PendingChanges};
pub use error::{ErrorKind, Result, StoreError};
pub use key::{GeneratedKey, IntKeyAllocator, KeyAllocator, StringKeyAllocator, UuidKeyAllocator};
pub use memory::{MemoryStore, MemoryStoreBuilder};
pub use sql::{SqlStore, SqlStoreBuilder};
pub use storage::{Storage, Transaction};

// Re-export the model and migration types stores are used with
pub use oxide_store_core::{
    Entity, Field, JoinedOrder, JoinedPredicate, JoinedQuery, KeyedEntity, Order, OrderDirection,
    Predicate, Query, Relation, SchemaDifference, SqlValue,
};
pub use oxide_store_migrate::backend::{Backend, SqliteBackend};
pub use oxide_store_migrate::executor::{MigrationReport, Migrator};
pub use oxide_store_migrate::planner::MigrationPolicy;

/// Commonly used items.
pub mod prelude {
    pub use crate::{
        ChangeSet, Entity, JoinedOrder, JoinedPredicate, JoinedQuery, KeyedEntity, MemoryStore,
        MigrationPolicy, Order, OrderDirection, Predicate, Query, Relation, SqlStore,
        SqliteBackend, Storage,
    };
    pub use std::ops::ControlFlow;
}
