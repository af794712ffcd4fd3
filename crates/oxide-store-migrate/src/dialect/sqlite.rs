//! SQLite dialect for migrations.
//!
//! SQLite has limited ALTER TABLE support, so every structural change goes
//! through the "table recreation" strategy: create a new table, copy data,
//! drop the old table, rename the new table.

use oxide_store_core::{ScalarType, SqlValue, TableIndex, TableSchema, TypeEquivalence};

use super::MigrationDialect;
use crate::operations::MigrationOperation;

/// SQLite migration dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Creates a new SQLite dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Maps a declared column type back to a scalar type.
    ///
    /// Only the names this dialect writes are recognized; anything else
    /// reads back as a blob.
    #[must_use]
    pub fn scalar_type(declared: &str) -> ScalarType {
        match declared.trim().to_ascii_uppercase().as_str() {
            "NUM" => ScalarType::Int,
            "REAL" => ScalarType::Real,
            "TEXT" => ScalarType::Text,
            _ => ScalarType::Blob,
        }
    }

    /// Parses a `DEFAULT` expression as reported by `pragma_table_info`.
    #[must_use]
    pub fn parse_literal(text: Option<&str>, scalar_type: ScalarType) -> SqlValue {
        let Some(text) = text.map(str::trim) else {
            return SqlValue::Null;
        };
        if text.eq_ignore_ascii_case("NULL") {
            return SqlValue::Null;
        }
        if let Some(quoted) = text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
            return SqlValue::Text(quoted.replace("''", "'"));
        }
        if let Some(hex) = text
            .strip_prefix("X'")
            .or_else(|| text.strip_prefix("x'"))
            .and_then(|t| t.strip_suffix('\''))
        {
            return decode_hex(hex).map_or(SqlValue::Null, SqlValue::Blob);
        }
        match scalar_type {
            ScalarType::Real => text.parse().map_or(SqlValue::Null, SqlValue::Real),
            _ => text.parse().map_or_else(
                |_| text.parse().map_or(SqlValue::Null, SqlValue::Real),
                SqlValue::Int,
            ),
        }
    }

    fn create_table_sql(&self, name: &str, schema: &TableSchema) -> String {
        let mut definitions: Vec<String> = schema
            .columns
            .iter()
            .map(|c| self.column_definition(c))
            .collect();

        for foreign_key in &schema.foreign_keys {
            definitions.push(format!(
                "FOREIGN KEY({}) REFERENCES {}({})",
                self.quote_identifier(&foreign_key.column),
                self.quote_identifier(&foreign_key.references_table),
                self.quote_identifier(&foreign_key.references_column)
            ));
        }

        if !schema.primary_key.is_empty() {
            let quoted: Vec<String> = schema
                .primary_key
                .iter()
                .map(|c| self.quote_identifier(c))
                .collect();
            definitions.push(format!("PRIMARY KEY({})", quoted.join(", ")));
        }

        let mut sql = format!(
            "CREATE TABLE {} ({})",
            self.quote_identifier(name),
            definitions.join(", ")
        );
        if !schema.primary_key.is_empty() {
            sql.push_str(" WITHOUT ROWID");
        }
        sql
    }

    fn drop_table_sql(&self, name: &str) -> String {
        format!("DROP TABLE {}", self.quote_identifier(name))
    }

    fn rename_table_sql(&self, from: &str, to: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME TO {}",
            self.quote_identifier(from),
            self.quote_identifier(to)
        )
    }

    fn create_index_sql(&self, table: &str, index: &TableIndex) -> String {
        let quoted: Vec<String> = index
            .columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect();
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.quote_identifier(&index.name_on(table)),
            self.quote_identifier(table),
            quoted.join(", ")
        )
    }

    fn copy_columns_sql(
        &self,
        from: &str,
        to: &str,
        columns: &[(String, String)],
        with_rowid: bool,
    ) -> Option<String> {
        let mut sources: Vec<String> = Vec::new();
        let mut targets: Vec<String> = Vec::new();
        if with_rowid {
            sources.push("rowid".to_string());
            targets.push("rowid".to_string());
        }
        for (source, target) in columns {
            sources.push(self.quote_identifier(source));
            targets.push(self.quote_identifier(target));
        }
        if targets.is_empty() {
            return None;
        }
        Some(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            self.quote_identifier(to),
            targets.join(", "),
            sources.join(", "),
            self.quote_identifier(from)
        ))
    }

    fn copy_non_defaults_sql(
        &self,
        from: &str,
        to: &str,
        source_column: &str,
        target_column: &str,
        old_default: &SqlValue,
        key: &[String],
    ) -> String {
        let target = self.quote_identifier(to);
        let pairing: Vec<String> = if key.is_empty() {
            vec![format!("prior.rowid = {target}.rowid")]
        } else {
            key.iter()
                .map(|column| {
                    let column = self.quote_identifier(column);
                    format!("prior.{column} = {target}.{column}")
                })
                .collect()
        };
        let pairing = pairing.join(" AND ");
        let source = self.quote_identifier(source_column);
        let holds_value = if old_default.is_null() {
            format!("prior.{source} IS NOT NULL")
        } else {
            format!("prior.{source} <> {}", self.literal(old_default))
        };
        format!(
            "UPDATE {target} SET {} = (SELECT prior.{source} FROM {from_table} AS prior WHERE {pairing}) \
             WHERE EXISTS (SELECT 1 FROM {from_table} AS prior WHERE {pairing} AND {holds_value})",
            self.quote_identifier(target_column),
            from_table = self.quote_identifier(from),
        )
    }
}

impl MigrationDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn generate_sql(&self, operation: &MigrationOperation) -> Vec<String> {
        match operation {
            MigrationOperation::CreateTable { name, schema } => {
                vec![self.create_table_sql(name, schema)]
            }
            MigrationOperation::DropTable { name } => vec![self.drop_table_sql(name)],
            MigrationOperation::RenameTable { from, to } => vec![self.rename_table_sql(from, to)],
            MigrationOperation::CreateIndex { table, index } => {
                vec![self.create_index_sql(table, index)]
            }
            MigrationOperation::DropIndex { table, index } => vec![format!(
                "DROP INDEX {}",
                self.quote_identifier(&index.name_on(table))
            )],
            MigrationOperation::CopyColumns {
                from,
                to,
                columns,
                with_rowid,
            } => self
                .copy_columns_sql(from, to, columns, *with_rowid)
                .into_iter()
                .collect(),
            MigrationOperation::CopyNonDefaults {
                from,
                to,
                source_column,
                target_column,
                old_default,
                key,
            } => vec![self.copy_non_defaults_sql(
                from,
                to,
                source_column,
                target_column,
                old_default,
                key,
            )],
        }
    }

    fn type_name(&self, scalar_type: ScalarType) -> &'static str {
        match scalar_type {
            ScalarType::Int | ScalarType::Bool => "NUM",
            ScalarType::Real | ScalarType::Date => "REAL",
            ScalarType::Text => "TEXT",
            ScalarType::Uuid | ScalarType::Blob => "",
        }
    }

    fn literal(&self, value: &SqlValue) -> String {
        match value {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Bool(v) => i64::from(*v).to_string(),
            SqlValue::Text(v) => format!("'{}'", v.replace('\'', "''")),
            SqlValue::Real(v) => real_literal(*v),
            SqlValue::Date(v) => real_literal(SqlValue::date_seconds(v)),
            SqlValue::Uuid(v) => hex_literal(v.as_bytes()),
            SqlValue::Blob(v) => hex_literal(v),
        }
    }
}

fn real_literal(value: f64) -> String {
    if value.is_finite() {
        format!("{value:?}")
    } else {
        "NULL".to_string()
    }
}

fn hex_literal(bytes: &[u8]) -> String {
    let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
    format!("X'{hex}'")
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| hex.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

/// SQLite's view of type equality: two scalar types are equal when they
/// share a declared storage type, and two defaults are equal when they
/// store the same value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteTypes;

impl TypeEquivalence for SqliteTypes {
    fn types_equal(&self, existing: ScalarType, expected: ScalarType) -> bool {
        let dialect = SqliteDialect::new();
        dialect.type_name(existing) == dialect.type_name(expected)
    }

    fn defaults_equal(&self, existing: &SqlValue, expected: &SqlValue) -> bool {
        (existing.is_null() && expected.is_null()) || existing.sql_eq(expected)
    }
}
