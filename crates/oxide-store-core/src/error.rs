//! Error types for the core model.

use crate::value::ScalarType;

/// Errors raised while deriving schemas, converting rows, or compiling
/// and evaluating queries.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A predicate, order, or join references a field that is not a
    /// column of its entity.
    #[error("Unknown column '{column}' on table '{table}'")]
    UnknownColumn {
        /// Table the field was resolved against.
        table: String,
        /// The unresolvable column name.
        column: String,
    },

    /// A stored value could not be converted into the field's Rust type.
    #[error("Column '{column}' expected a {expected} value, found {found}")]
    Conversion {
        /// Column being decoded.
        column: String,
        /// Declared scalar type of the column.
        expected: ScalarType,
        /// Description of the value that was found.
        found: String,
    },

    /// A row does not have one value per column.
    #[error("Row for table '{table}' has {found} values, expected {expected}")]
    RowShape {
        /// Table being decoded.
        table: String,
        /// Number of columns in the table.
        expected: usize,
        /// Number of values in the row.
        found: usize,
    },

    /// A declared schema contradicts itself (for example a primary key
    /// naming a column the table does not have).
    #[error("Schema invariant violated: {0}")]
    SchemaInvariant(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
