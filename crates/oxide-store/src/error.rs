//! Error types for the store.

use oxide_store_core::CoreError;
use oxide_store_migrate::error::MigrateError;
use thiserror::Error;

/// The four classes every store error falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The store was set up wrongly: a missing migrator, an unregistered
    /// entity, a field that is not a column. Raised before work begins.
    Configuration,
    /// A lookup by key found nothing.
    NotFound,
    /// The backend failed; the enclosing transaction was aborted.
    Backend,
    /// A declared schema contradicts itself.
    SchemaInvariant,
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row has the requested key.
    #[error("No {entity} with key {key}")]
    NotFound {
        /// Table of the entity.
        entity: String,
        /// Debug rendering of the key.
        key: String,
    },

    /// The store configuration cannot serve the request.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A write broke a constraint, such as a duplicate primary key.
    #[error("Constraint violated: {0}")]
    Constraint(String),

    /// A write failed inside a caller's transaction, which was rolled back.
    #[error("Transaction was rolled back after a failed write")]
    TransactionAborted,

    /// Migration or backend error.
    #[error(transparent)]
    Migrate(MigrateError),

    /// Error from the core model.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Database error from sqlx.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<MigrateError> for StoreError {
    fn from(error: MigrateError) -> Self {
        match error {
            MigrateError::Database(error) => Self::Database(error),
            MigrateError::Core(error) => Self::Core(error),
            other => Self::Migrate(other),
        }
    }
}

impl StoreError {
    pub(crate) fn not_found(entity: &str, key: &impl std::fmt::Debug) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            key: format!("{key:?}"),
        }
    }

    pub(crate) fn unregistered(table: &str) -> Self {
        Self::Configuration(format!("entity table '{table}' is not registered"))
    }

    /// Classifies the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Constraint(_) | Self::TransactionAborted | Self::Database(_) => {
                ErrorKind::Backend
            }
            Self::Core(error) => core_kind(error),
            Self::Migrate(error) => migrate_kind(error),
        }
    }
}

const fn core_kind(error: &CoreError) -> ErrorKind {
    match error {
        CoreError::UnknownColumn { .. } => ErrorKind::Configuration,
        CoreError::SchemaInvariant(_) => ErrorKind::SchemaInvariant,
        CoreError::Conversion { .. } | CoreError::RowShape { .. } => ErrorKind::Backend,
    }
}

fn migrate_kind(error: &MigrateError) -> ErrorKind {
    match error {
        MigrateError::MissingMigrators { .. } | MigrateError::MigrationsNeeded { .. } => {
            ErrorKind::Configuration
        }
        MigrateError::Core(error) => core_kind(error),
        MigrateError::Multiple(errors) => errors
            .first()
            .map_or(ErrorKind::Backend, migrate_kind),
        _ => ErrorKind::Backend,
    }
}

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
