//! Relational backends.
//!
//! A [`Backend`] owns one logical connection. Statements run one at a time
//! on it; callers serialize access (the store keeps its backend behind a
//! mutex). SQL reaching a backend carries `:name` placeholders matching
//! the names of its [`SqlArgument`]s.

mod sqlite;

pub use sqlite::SqliteBackend;

use std::ops::ControlFlow;

use async_trait::async_trait;
use oxide_store_core::{ScalarType, SqlArgument, SqlValue, TableSchema, TypeEquivalence};
use tracing::debug;

use crate::dialect::MigrationDialect;
use crate::error::Result;
use crate::operations::MigrationOperation;

/// Receives decoded rows from [`Backend::query`], one at a time. Returning
/// [`ControlFlow::Break`] stops the query.
pub type RowSink<'a> = dyn FnMut(Vec<SqlValue>) -> ControlFlow<()> + Send + 'a;

/// A relational engine the store and the migration executor run against.
#[async_trait]
pub trait Backend: Send {
    /// The dialect used to render migration operations.
    fn dialect(&self) -> &dyn MigrationDialect;

    /// When two scalar types or defaults count as equal for this engine.
    fn type_rules(&self) -> &dyn TypeEquivalence;

    /// Starts a transaction.
    async fn begin(&mut self) -> Result<()>;

    /// Commits the open transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Rolls back the open transaction.
    async fn rollback(&mut self) -> Result<()>;

    /// Turns foreign-key enforcement on or off. Must be called outside a
    /// transaction.
    async fn set_foreign_keys(&mut self, enabled: bool) -> Result<()>;

    /// Executes a statement and returns the number of affected rows.
    async fn execute(&mut self, sql: &str, arguments: &[SqlArgument]) -> Result<u64>;

    /// Runs a query, decoding column `i` of every row as `columns[i]`, and
    /// feeds rows to `sink` until it breaks or the rows run out.
    async fn query(
        &mut self,
        sql: &str,
        arguments: &[SqlArgument],
        columns: &[ScalarType],
        sink: &mut RowSink<'_>,
    ) -> Result<()>;

    /// Reads the schema of every user table.
    async fn existing_tables(&mut self) -> Result<Vec<TableSchema>>;

    /// Applies one migration operation.
    async fn apply(&mut self, operation: &MigrationOperation) -> Result<()> {
        debug!(operation = %operation.description(), "Applying operation");
        for sql in self.dialect().generate_sql(operation) {
            self.execute(&sql, &[]).await?;
        }
        Ok(())
    }

    /// Runs a query and collects every row.
    async fn query_all(
        &mut self,
        sql: &str,
        arguments: &[SqlArgument],
        columns: &[ScalarType],
    ) -> Result<Vec<Vec<SqlValue>>> {
        let mut rows = Vec::new();
        self.query(sql, arguments, columns, &mut |row| {
            rows.push(row);
            ControlFlow::Continue(())
        })
        .await?;
        Ok(rows)
    }
}
