//! Database dialect implementations.
//!
//! A dialect turns [`MigrationOperation`]s into SQL statements and knows how
//! the engine stores each scalar type.

mod sqlite;

pub use sqlite::{SqliteDialect, SqliteTypes};

use oxide_store_core::{ColumnDefinition, ScalarType, SqlValue};

use crate::operations::MigrationOperation;

/// Trait for database-specific SQL generation.
pub trait MigrationDialect: Send + Sync {
    /// Returns the dialect name.
    fn name(&self) -> &'static str;

    /// Generates SQL for a migration operation.
    fn generate_sql(&self, operation: &MigrationOperation) -> Vec<String>;

    /// Returns the declared column type for a scalar type. An empty string
    /// declares no type.
    fn type_name(&self, scalar_type: ScalarType) -> &'static str;

    /// Renders a value as an SQL literal, for `DEFAULT` clauses.
    fn literal(&self, value: &SqlValue) -> String;

    /// Generates column definition SQL: name, type, default and, for
    /// columns with a non-null default, `NOT NULL`.
    fn column_definition(&self, column: &ColumnDefinition) -> String {
        let mut parts = vec![self.quote_identifier(&column.name)];
        let type_name = self.type_name(column.scalar_type);
        if !type_name.is_empty() {
            parts.push(type_name.to_string());
        }
        parts.push(format!("DEFAULT {}", self.literal(&column.default)));
        if !column.is_nullable() {
            parts.push("NOT NULL".to_string());
        }
        parts.join(" ")
    }

    /// Quote an identifier (table name, column name, etc.).
    fn quote_identifier(&self, name: &str) -> String {
        oxide_store_core::quote_identifier(name)
    }
}
