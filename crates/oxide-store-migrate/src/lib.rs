//! Schema-diff driven migrations for oxide-store.
//!
//! `oxide-store-migrate` compares the tables found in a database with the
//! tables derived from registered entities and brings the database up to
//! date in a single transaction:
//! - Additive and rename-only changes migrate automatically
//! - Changes that need a data decision (a new primary key, a required
//!   foreign key) require a caller-supplied migrator, reported before any
//!   DDL runs
//! - Every structural change rebuilds the table, so engines without
//!   column-altering DDL are supported
//!
//! # Architecture
//!
//! - **Backend** - A relational engine: statements, queries, transactions
//!   and schema introspection ([`backend::SqliteBackend`] on `sqlx`)
//! - **Dialect** - SQL generation for [`operations::MigrationOperation`]s
//! - **Planner** - Classifies differences as automatic or manual
//! - **Executor** - Runs the rebuild under a transaction
//! - **Version** - The hidden changelog table of version tags
//!
//! # Example
//!
//! ```rust,ignore
//! use oxide_store_migrate::prelude::*;
//!
//! let mut backend = SqliteBackend::connect("sqlite:app.db").await?;
//! let policy = MigrationPolicy::new().rename_column("person", "name", "full_name");
//! migrate(&mut backend, &[Person::schema()], &policy, Some("v2")).await?;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Print the database schema as JSON
//! oxide-store-migrate inspect
//!
//! # Compare with an expected schema
//! oxide-store-migrate diff --expected schema.json
//!
//! # Show the SQL a migration would run
//! oxide-store-migrate plan --expected schema.json
//!
//! # Apply it and record a version tag
//! oxide-store-migrate migrate --expected schema.json --version v2
//! ```

pub mod backend;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod operations;
pub mod planner;
pub mod version;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::{Backend, SqliteBackend};
    pub use crate::dialect::{MigrationDialect, SqliteDialect, SqliteTypes};
    pub use crate::error::{MigrateError, Result};
    pub use crate::executor::{
        create_missing_tables, migrate, pending_differences, MigrationContext,
        MigrationExecutor, MigrationReport, Migrator,
    };
    pub use crate::operations::MigrationOperation;
    pub use crate::planner::{is_auto_migratable, plan, MigrationAction, MigrationPolicy};
}
