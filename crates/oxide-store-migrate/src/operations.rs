//! Migration operations.
//!
//! The executor rebuilds tables instead of altering them in place, so the
//! operation set is small: create, drop and rename whole tables, create
//! and drop indexes, and copy data between an old table and its
//! replacement.

use oxide_store_core::{SqlValue, TableIndex, TableSchema};
use serde::{Deserialize, Serialize};

/// A single DDL or data-copy step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MigrationOperation {
    /// Create a table with the columns, keys and foreign keys of `schema`,
    /// named `name`. Indexes are created separately.
    CreateTable {
        /// Name to create the table under.
        name: String,
        /// Table definition.
        schema: TableSchema,
    },
    /// Drop a table.
    DropTable {
        /// Table name.
        name: String,
    },
    /// Rename a table.
    RenameTable {
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Create an index named `<table>_<col1>_<col2>...`.
    CreateIndex {
        /// Table name.
        table: String,
        /// Index definition.
        index: TableIndex,
    },
    /// Drop the index named after `table` and `index`.
    DropIndex {
        /// Table name.
        table: String,
        /// Index definition.
        index: TableIndex,
    },
    /// Copy every row of `from` into `to`, column by column.
    CopyColumns {
        /// Source table.
        from: String,
        /// Target table.
        to: String,
        /// (source column, target column) pairs.
        columns: Vec<(String, String)>,
        /// Also carry the implicit `rowid` (tables without a primary key).
        with_rowid: bool,
    },
    /// Copy one column's values from `from` into already copied rows of
    /// `to`, skipping rows that hold the old default so they keep the new
    /// one.
    CopyNonDefaults {
        /// Source table.
        from: String,
        /// Target table.
        to: String,
        /// Column in the source table.
        source_column: String,
        /// Column in the target table.
        target_column: String,
        /// The source column's default.
        old_default: SqlValue,
        /// Key columns pairing source and target rows; empty pairs by
        /// `rowid`.
        key: Vec<String>,
    },
}

impl MigrationOperation {
    /// Creates a table operation.
    #[must_use]
    pub fn create_table(name: impl Into<String>, schema: TableSchema) -> Self {
        Self::CreateTable {
            name: name.into(),
            schema,
        }
    }

    /// Drop table operation.
    #[must_use]
    pub fn drop_table(name: impl Into<String>) -> Self {
        Self::DropTable { name: name.into() }
    }

    /// Rename table operation.
    #[must_use]
    pub fn rename_table(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::RenameTable {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create index operation.
    #[must_use]
    pub fn create_index(table: impl Into<String>, index: TableIndex) -> Self {
        Self::CreateIndex {
            table: table.into(),
            index,
        }
    }

    /// Drop index operation.
    #[must_use]
    pub fn drop_index(table: impl Into<String>, index: TableIndex) -> Self {
        Self::DropIndex {
            table: table.into(),
            index,
        }
    }

    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::CreateTable { name, .. } => format!("Create table {name}"),
            Self::DropTable { name } => format!("Drop table {name}"),
            Self::RenameTable { from, to } => format!("Rename table {from} to {to}"),
            Self::CreateIndex { table, index } => {
                format!("Create index {}", index.name_on(table))
            }
            Self::DropIndex { table, index } => format!("Drop index {}", index.name_on(table)),
            Self::CopyColumns { from, to, columns, .. } => {
                format!("Copy {} columns from {from} to {to}", columns.len())
            }
            Self::CopyNonDefaults {
                from,
                to,
                target_column,
                ..
            } => format!("Copy non-default {target_column} values from {from} to {to}"),
        }
    }
}
