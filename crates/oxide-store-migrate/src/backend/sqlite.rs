//! SQLite backend on top of `sqlx`.

use std::ops::ControlFlow;
use std::str::FromStr;

use async_trait::async_trait;
use futures::TryStreamExt;
use oxide_store_core::{
    ColumnDefinition, ForeignKey, ScalarType, SqlArgument, SqlValue, TableIndex, TableSchema,
    TypeEquivalence,
};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Backend, RowSink};
use crate::dialect::{MigrationDialect, SqliteDialect, SqliteTypes};
use crate::error::{MigrateError, Result};
use crate::version::VERSION_TABLE;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>;

/// A SQLite database reached through a single pooled connection.
///
/// The pool is capped at one connection that never expires, and the
/// backend holds it for its whole lifetime, so raw `BEGIN`/`COMMIT`
/// statements and `sqlite::memory:` databases behave as on a plain
/// connection.
pub struct SqliteBackend {
    pool: SqlitePool,
    connection: PoolConnection<Sqlite>,
    dialect: SqliteDialect,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Connects to a database URL such as `sqlite::memory:` or
    /// `sqlite:data.db`. Database files are created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Database`] if the URL is invalid or the
    /// database cannot be opened.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let connection = pool.acquire().await?;
        info!(url = %url, "Connected to SQLite");
        Ok(Self {
            pool,
            connection,
            dialect: SqliteDialect::new(),
        })
    }

    /// Opens a fresh in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Database`] if SQLite cannot be opened.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Releases the connection and closes the pool.
    pub async fn close(self) {
        drop(self.connection);
        self.pool.close().await;
    }

    async fn table_schema(&mut self, name: &str) -> Result<TableSchema> {
        let mut table = TableSchema::new(name);

        let columns: Vec<(String, String, Option<String>, i64)> = sqlx::query_as(
            "SELECT name, type, dflt_value, pk FROM pragma_table_info(?) ORDER BY cid",
        )
        .bind(name)
        .fetch_all(&mut *self.connection)
        .await?;
        let mut key: Vec<(i64, String)> = Vec::new();
        for (column, declared, default, position) in columns {
            let scalar_type = SqliteDialect::scalar_type(&declared);
            let default = SqliteDialect::parse_literal(default.as_deref(), scalar_type);
            if position > 0 {
                key.push((position, column.clone()));
            }
            table = table.column(ColumnDefinition::new(column, scalar_type).default_value(default));
        }
        key.sort();
        table = table.primary_key(key.into_iter().map(|(_, column)| column));

        let indexes: Vec<(String, i64)> = sqlx::query_as(
            "SELECT name, \"unique\" FROM pragma_index_list(?) WHERE origin = 'c' ORDER BY name",
        )
        .bind(name)
        .fetch_all(&mut *self.connection)
        .await?;
        for (index_name, unique) in indexes {
            let columns: Vec<(Option<String>,)> =
                sqlx::query_as("SELECT name FROM pragma_index_info(?) ORDER BY seqno")
                    .bind(&index_name)
                    .fetch_all(&mut *self.connection)
                    .await?;
            let columns = columns.into_iter().filter_map(|(column,)| column);
            table = table.index(if unique != 0 {
                TableIndex::unique(columns)
            } else {
                TableIndex::new(columns)
            });
        }

        let foreign_keys: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT \"from\", \"table\", \"to\" FROM pragma_foreign_key_list(?) ORDER BY id, seq",
        )
        .bind(name)
        .fetch_all(&mut *self.connection)
        .await?;
        for (column, target_table, target_column) in foreign_keys {
            table = table.foreign_key(ForeignKey::new(
                column,
                target_table,
                target_column.unwrap_or_default(),
            ));
        }

        Ok(table)
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    fn dialect(&self) -> &dyn MigrationDialect {
        &self.dialect
    }

    fn type_rules(&self) -> &dyn TypeEquivalence {
        &SqliteTypes
    }

    async fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN", &[]).await.map(|_| ())
    }

    async fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }

    async fn set_foreign_keys(&mut self, enabled: bool) -> Result<()> {
        let sql = if enabled {
            "PRAGMA foreign_keys = ON"
        } else {
            "PRAGMA foreign_keys = OFF"
        };
        self.execute(sql, &[]).await.map(|_| ())
    }

    async fn execute(&mut self, sql: &str, arguments: &[SqlArgument]) -> Result<u64> {
        debug!(sql = %sql, "Executing SQL");
        let (sql, values) = positional(sql, arguments);
        let result = bind_all(sqlx::query(&sql), &values)
            .execute(&mut *self.connection)
            .await?;
        Ok(result.rows_affected())
    }

    async fn query(
        &mut self,
        sql: &str,
        arguments: &[SqlArgument],
        columns: &[ScalarType],
        sink: &mut RowSink<'_>,
    ) -> Result<()> {
        debug!(sql = %sql, "Running query");
        let (sql, values) = positional(sql, arguments);
        let mut rows = bind_all(sqlx::query(&sql), &values).fetch(&mut *self.connection);
        while let Some(row) = rows.try_next().await? {
            let decoded = decode_row(&row, columns)?;
            if sink(decoded).is_break() {
                break;
            }
        }
        Ok(())
    }

    async fn existing_tables(&mut self) -> Result<Vec<TableSchema>> {
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' AND name <> ? ORDER BY name",
        )
        .bind(VERSION_TABLE)
        .fetch_all(&mut *self.connection)
        .await?;
        let mut tables = Vec::with_capacity(names.len());
        for (name,) in names {
            tables.push(self.table_schema(&name).await?);
        }
        Ok(tables)
    }
}

/// Rewrites `:name` placeholders into positional `?` parameters and lists
/// the values to bind, in order of appearance. Text inside quotes and
/// names without a matching argument are left alone.
fn positional<'a>(sql: &str, arguments: &'a [SqlArgument]) -> (String, Vec<&'a SqlValue>) {
    let mut rewritten = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        if let Some(open) = quote {
            if c == open {
                quote = None;
            }
            rewritten.push(c);
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                rewritten.push(c);
            }
            ':' => {
                let mut end = start + 1;
                while let Some(&(i, next)) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        end = i + next.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let name = &sql[start + 1..end];
                match arguments.iter().find(|a| !name.is_empty() && a.name == name) {
                    Some(argument) => {
                        rewritten.push('?');
                        values.push(&argument.value);
                    }
                    None => rewritten.push_str(&sql[start..end]),
                }
            }
            _ => rewritten.push(c),
        }
    }

    (rewritten, values)
}

fn bind_all<'q>(mut query: SqliteQuery<'q>, values: &[&SqlValue]) -> SqliteQuery<'q> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(None::<i64>),
            SqlValue::Int(v) => query.bind(*v),
            SqlValue::Bool(v) => query.bind(i64::from(*v)),
            SqlValue::Text(v) => query.bind(v.clone()),
            SqlValue::Real(v) => query.bind(*v),
            SqlValue::Date(v) => query.bind(SqlValue::date_seconds(v)),
            SqlValue::Uuid(v) => query.bind(v.as_bytes().to_vec()),
            SqlValue::Blob(v) => query.bind(v.clone()),
        };
    }
    query
}

fn decode_row(row: &SqliteRow, columns: &[ScalarType]) -> Result<Vec<SqlValue>> {
    columns
        .iter()
        .enumerate()
        .map(|(index, &scalar_type)| decode_column(row, index, scalar_type))
        .collect()
}

fn decode_column(row: &SqliteRow, index: usize, scalar_type: ScalarType) -> Result<SqlValue> {
    let value = match scalar_type {
        ScalarType::Int => row
            .try_get_unchecked::<Option<i64>, _>(index)?
            .map(SqlValue::Int),
        ScalarType::Bool => row
            .try_get_unchecked::<Option<i64>, _>(index)?
            .map(|v| SqlValue::Bool(v != 0)),
        ScalarType::Text => row
            .try_get_unchecked::<Option<String>, _>(index)?
            .map(SqlValue::Text),
        ScalarType::Real => row
            .try_get_unchecked::<Option<f64>, _>(index)?
            .map(SqlValue::Real),
        ScalarType::Date => match row.try_get_unchecked::<Option<f64>, _>(index)? {
            Some(seconds) => Some(SqlValue::date_from_seconds(seconds).ok_or_else(|| {
                MigrateError::Decode {
                    index,
                    message: format!("{seconds} is not a representable timestamp"),
                }
            })?),
            None => None,
        },
        ScalarType::Uuid => match row.try_get_unchecked::<Option<Vec<u8>>, _>(index)? {
            Some(bytes) => Some(SqlValue::Uuid(Uuid::from_slice(&bytes).map_err(|e| {
                MigrateError::Decode {
                    index,
                    message: e.to_string(),
                }
            })?)),
            None => None,
        },
        ScalarType::Blob => row
            .try_get_unchecked::<Option<Vec<u8>>, _>(index)?
            .map(SqlValue::Blob),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argument(name: &str, value: impl Into<SqlValue>) -> SqlArgument {
        SqlArgument {
            name: name.to_string(),
            value: value.into(),
        }
    }

    #[test]
    fn test_positional_rewrite() {
        let arguments = vec![argument("t0arg0", 18), argument("t1arg0", "NYC")];
        let (sql, values) = positional(
            "SELECT t0.\"a:b\" FROM x AS t0 WHERE t0.c = :t1arg0 AND t0.age >= :t0arg0 AND t0.d = ':t0arg0'",
            &arguments,
        );
        assert_eq!(
            sql,
            "SELECT t0.\"a:b\" FROM x AS t0 WHERE t0.c = ? AND t0.age >= ? AND t0.d = ':t0arg0'"
        );
        assert_eq!(values, vec![&SqlValue::from("NYC"), &SqlValue::Int(18)]);
    }

    #[test]
    fn test_positional_repeats_and_unknown_names() {
        let arguments = vec![argument("arg0", "v1")];
        let (sql, values) = positional("SELECT :arg0 WHERE :arg0 <> :other", &arguments);
        assert_eq!(sql, "SELECT ? WHERE ? <> :other");
        assert_eq!(values.len(), 2);
    }

    #[tokio::test]
    async fn test_round_trip_values() {
        let mut backend = SqliteBackend::in_memory().await.unwrap();
        backend
            .execute("CREATE TABLE v (i NUM, b NUM, t TEXT, r REAL, d REAL, u, x)", &[])
            .await
            .unwrap();
        let now = SqlValue::date_from_seconds(1_700_000_000.25).unwrap();
        let id = Uuid::new_v4();
        let row = vec![
            SqlValue::Int(-3),
            SqlValue::Bool(true),
            SqlValue::from("hello"),
            SqlValue::Real(1.25),
            now.clone(),
            SqlValue::Uuid(id),
            SqlValue::Null,
        ];
        let arguments: Vec<SqlArgument> = row
            .iter()
            .enumerate()
            .map(|(i, value)| argument(&format!("arg{i}"), value.clone()))
            .collect();
        backend
            .execute(
                "INSERT INTO v VALUES (:arg0, :arg1, :arg2, :arg3, :arg4, :arg5, :arg6)",
                &arguments,
            )
            .await
            .unwrap();
        let types = [
            ScalarType::Int,
            ScalarType::Bool,
            ScalarType::Text,
            ScalarType::Real,
            ScalarType::Date,
            ScalarType::Uuid,
            ScalarType::Blob,
        ];
        let rows = backend
            .query_all("SELECT * FROM v", &[], &types)
            .await
            .unwrap();
        assert_eq!(rows, vec![row]);
    }

    #[tokio::test]
    async fn test_sink_can_stop_early() {
        let mut backend = SqliteBackend::in_memory().await.unwrap();
        backend.execute("CREATE TABLE n (v NUM)", &[]).await.unwrap();
        backend
            .execute("INSERT INTO n VALUES (1), (2), (3)", &[])
            .await
            .unwrap();
        let mut seen = Vec::new();
        backend
            .query("SELECT v FROM n ORDER BY v", &[], &[ScalarType::Int], &mut |row| {
                seen.push(row);
                ControlFlow::Break(())
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![vec![SqlValue::Int(1)]]);
        // The connection is still usable after an abandoned cursor.
        let count = backend
            .query_all("SELECT count(*) FROM n", &[], &[ScalarType::Int])
            .await
            .unwrap();
        assert_eq!(count, vec![vec![SqlValue::Int(3)]]);
    }

    #[tokio::test]
    async fn test_introspection() {
        let mut backend = SqliteBackend::in_memory().await.unwrap();
        backend
            .execute(
                "CREATE TABLE \"person\" (\"id\" NUM DEFAULT 0 NOT NULL, \"name\" TEXT DEFAULT '' NOT NULL, \
                 \"city\" TEXT DEFAULT NULL, PRIMARY KEY(\"id\")) WITHOUT ROWID",
                &[],
            )
            .await
            .unwrap();
        backend
            .execute("CREATE INDEX \"person_name\" ON \"person\" (\"name\")", &[])
            .await
            .unwrap();
        let tables = backend.existing_tables().await.unwrap();
        assert_eq!(
            tables,
            vec![TableSchema::new("person")
                .column(ColumnDefinition::new("id", ScalarType::Int))
                .column(ColumnDefinition::new("name", ScalarType::Text))
                .column(ColumnDefinition::nullable("city", ScalarType::Text))
                .primary_key(["id"])
                .index(TableIndex::new(["name"]))]
        );
    }
}
