//! Table schemas and the schema differ.
//!
//! A [`TableSchema`] is either derived from a registered entity or read
//! back from a live database. The [`diff`] module compares the two.

pub mod diff;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::value::{ScalarType, SqlValue};

pub use diff::{
    column_mappings, diff_schema, diff_table, ColumnRename, ExactTypes, RenameDirectives,
    SchemaDifference, SchemaTableDifference, TableRename, TypeEquivalence,
};

/// A single column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name.
    pub name: String,
    /// Declared scalar type.
    #[serde(rename = "type")]
    pub scalar_type: ScalarType,
    /// Default value. `Null` marks a nullable column.
    #[serde(default = "null_value")]
    pub default: SqlValue,
}

const fn null_value() -> SqlValue {
    SqlValue::Null
}

impl ColumnDefinition {
    /// A non-null column defaulting to the type's zero value.
    #[must_use]
    pub fn new(name: impl Into<String>, scalar_type: ScalarType) -> Self {
        Self {
            name: name.into(),
            scalar_type,
            default: scalar_type.default_value(),
        }
    }

    /// A nullable column (default `Null`).
    #[must_use]
    pub fn nullable(name: impl Into<String>, scalar_type: ScalarType) -> Self {
        Self {
            name: name.into(),
            scalar_type,
            default: SqlValue::Null,
        }
    }

    /// Replaces the default value.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<SqlValue>) -> Self {
        self.default = value.into();
        self
    }

    /// Whether the column admits NULL.
    #[must_use]
    pub const fn is_nullable(&self) -> bool {
        self.default.is_null()
    }
}

/// An index over one or more columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableIndex {
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    #[serde(default)]
    pub unique: bool,
}

impl TableIndex {
    /// A non-unique index.
    #[must_use]
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// A unique index.
    #[must_use]
    pub fn unique<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            unique: true,
            ..Self::new(columns)
        }
    }

    /// Index name on `table`: the table name and column names joined by `_`.
    #[must_use]
    pub fn name_on(&self, table: &str) -> String {
        let mut name = table.to_string();
        for column in &self.columns {
            name.push('_');
            name.push_str(column);
        }
        name
    }
}

/// A single-column foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referencing column.
    pub column: String,
    /// Referenced table.
    pub references_table: String,
    /// Referenced column.
    pub references_column: String,
}

impl ForeignKey {
    /// Creates a foreign key from `column` to `table.target`.
    #[must_use]
    pub fn new(
        column: impl Into<String>,
        table: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            references_table: table.into(),
            references_column: target.into(),
        }
    }
}

/// The structure of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Columns, in declaration order.
    pub columns: Vec<ColumnDefinition>,
    /// Primary key column names, in key order. Empty for key-less tables.
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<TableIndex>,
    /// Foreign keys.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    /// Creates an empty table schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Appends a column.
    #[must_use]
    pub fn column(mut self, column: ColumnDefinition) -> Self {
        self.columns.push(column);
        self
    }

    /// Sets the primary key.
    #[must_use]
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Appends an index.
    #[must_use]
    pub fn index(mut self, index: TableIndex) -> Self {
        self.indexes.push(index);
        self
    }

    /// Appends a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    /// Looks up a column by name.
    #[must_use]
    pub fn get_column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Position of a column.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Positions of the primary key columns, in key order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaInvariant`] when a key column is missing.
    pub fn primary_key_indexes(&self) -> Result<Vec<usize>> {
        self.primary_key
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| {
                    CoreError::SchemaInvariant(format!(
                        "primary key column '{name}' is not a column of '{}'",
                        self.name
                    ))
                })
            })
            .collect()
    }

    /// Checks that keys, indexes and foreign keys only name existing
    /// columns, that column names are unique, and that the primary key
    /// has at most two columns.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SchemaInvariant`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(CoreError::SchemaInvariant(format!(
                    "duplicate column '{}' in '{}'",
                    column.name, self.name
                )));
            }
        }
        if self.primary_key.len() > 2 {
            return Err(CoreError::SchemaInvariant(format!(
                "'{}' declares {} primary key columns, at most 2 are supported",
                self.name,
                self.primary_key.len()
            )));
        }
        self.primary_key_indexes()?;
        let referenced = self
            .indexes
            .iter()
            .flat_map(|index| index.columns.iter())
            .chain(self.foreign_keys.iter().map(|fk| &fk.column));
        for name in referenced {
            if self.get_column(name).is_none() {
                return Err(CoreError::SchemaInvariant(format!(
                    "'{}' has no column '{name}'",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// A copy of this schema under another table name.
    #[must_use]
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

/// A set of tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    /// Tables, in registration order.
    pub tables: Vec<TableSchema>,
}

impl DatabaseSchema {
    /// Creates an empty schema.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a table.
    #[must_use]
    pub fn table(mut self, table: TableSchema) -> Self {
        self.tables.push(table);
        self
    }

    /// Looks up a table by name.
    #[must_use]
    pub fn get_table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }
}
