//! Schema version tracking.
//!
//! A hidden single-column table records the version tag passed to each
//! migration. It is a changelog only: whether a migration runs is decided
//! by the schema diff, never by this table.

use oxide_store_core::{quote_identifier, ScalarType, SqlArgument, SqlValue};

use crate::backend::Backend;
use crate::error::Result;

/// Name of the version table. Schema introspection skips it.
pub const VERSION_TABLE: &str = "__SchemaVersion__";

fn create_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\"version\" TEXT NOT NULL)",
        quote_identifier(VERSION_TABLE)
    )
}

/// Creates the version table if it does not exist yet.
///
/// # Errors
///
/// Returns the backend error if the statement fails.
pub async fn ensure_table(backend: &mut dyn Backend) -> Result<()> {
    backend.execute(&create_table_sql(), &[]).await?;
    Ok(())
}

/// Records `version`, unless it is already recorded.
///
/// # Errors
///
/// Returns the backend error if a statement fails.
pub async fn record(backend: &mut dyn Backend, version: &str) -> Result<()> {
    ensure_table(backend).await?;
    let table = quote_identifier(VERSION_TABLE);
    let sql = format!(
        "INSERT INTO {table} (\"version\") SELECT :version \
         WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE \"version\" = :version)"
    );
    let arguments = [SqlArgument {
        name: "version".to_string(),
        value: SqlValue::from(version),
    }];
    backend.execute(&sql, &arguments).await?;
    Ok(())
}

/// Every recorded version, oldest first.
///
/// # Errors
///
/// Returns the backend error if a statement fails.
pub async fn recorded(backend: &mut dyn Backend) -> Result<Vec<String>> {
    ensure_table(backend).await?;
    let sql = format!(
        "SELECT \"version\" FROM {} ORDER BY rowid",
        quote_identifier(VERSION_TABLE)
    );
    let rows = backend.query_all(&sql, &[], &[ScalarType::Text]).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| match row.into_iter().next() {
            Some(SqlValue::Text(version)) => Some(version),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;

    #[tokio::test]
    async fn test_record_versions() {
        let mut backend = SqliteBackend::in_memory().await.unwrap();
        assert!(recorded(&mut backend).await.unwrap().is_empty());

        record(&mut backend, "v1").await.unwrap();
        record(&mut backend, "v2").await.unwrap();
        record(&mut backend, "v2").await.unwrap();

        assert_eq!(recorded(&mut backend).await.unwrap(), vec!["v1", "v2"]);
    }

    #[tokio::test]
    async fn test_version_table_is_hidden() {
        let mut backend = SqliteBackend::in_memory().await.unwrap();
        record(&mut backend, "v1").await.unwrap();
        assert!(backend.existing_tables().await.unwrap().is_empty());
    }
}
