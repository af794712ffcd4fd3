//! Error types for the migration system.

use oxide_store_core::CoreError;

/// Errors that can occur while inspecting, planning or applying a
/// migration.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Differences that cannot migrate automatically have no migrator.
    #[error("No migrator supplied for non-automatic changes to: {}", tables.join(", "))]
    MissingMigrators {
        /// Every table lacking a migrator, in difference order.
        tables: Vec<String>,
    },

    /// The database differs from the registered schema in a way that
    /// needs an explicit migration.
    #[error("Migrations needed before opening the store: {}", tables.join(", "))]
    MigrationsNeeded {
        /// Tables with pending non-additive changes.
        tables: Vec<String>,
    },

    /// A caller-supplied migrator failed.
    #[error("Migrator for '{table}' failed: {message}")]
    Migrator {
        /// Table the migrator was registered for.
        table: String,
        /// Failure description.
        message: String,
    },

    /// A row returned by the database could not be decoded.
    #[error("Failed to decode column {index}: {message}")]
    Decode {
        /// Zero-based column position.
        index: usize,
        /// What went wrong.
        message: String,
    },

    /// Database error during inspection or execution.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema or value error from the core model.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Serialization error (schema and rename documents).
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (reading schema documents).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A step failed and cleaning up after it failed too.
    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<MigrateError>),
}

impl MigrateError {
    /// Builds a [`MigrateError::Migrator`] from any displayable failure.
    pub fn migrator(table: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Migrator {
            table: table.into(),
            message: message.to_string(),
        }
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
