//! Migration executor.
//!
//! Applies planned actions with the rebuild pattern: every new or changed
//! table is created under a temporary name, filled from its predecessor,
//! and renamed into place once the old tables are gone. The whole run is
//! one transaction with foreign-key enforcement switched off around it.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use oxide_store_core::schema::{column_mappings, diff_schema};
use oxide_store_core::{
    RenameDirectives, ScalarType, SchemaDifference, SchemaTableDifference, SqlArgument, SqlValue,
    TableSchema, TypeEquivalence,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::{MigrateError, Result};
use crate::operations::MigrationOperation;
use crate::planner::{plan, MigrationAction, MigrationPolicy};
use crate::version;

/// Caller-supplied code for a change the executor cannot make alone.
///
/// The executor has already created the expected table under its
/// temporary name when the migrator runs, and drops the existing table
/// afterwards; the migrator copies whatever data should survive.
#[async_trait]
pub trait Migrator: Send + Sync {
    /// Runs the migration step.
    async fn migrate(&self, context: &mut MigrationContext<'_>) -> Result<()>;
}

/// What a [`Migrator`] sees while it runs.
pub struct MigrationContext<'a> {
    backend: &'a mut dyn Backend,
    difference: &'a SchemaDifference,
    rebuilt: &'a HashSet<String>,
}

impl std::fmt::Debug for MigrationContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationContext")
            .field("table", &self.difference.table_name())
            .finish_non_exhaustive()
    }
}

impl MigrationContext<'_> {
    /// The difference being migrated.
    #[must_use]
    pub const fn difference(&self) -> &SchemaDifference {
        self.difference
    }

    /// The name `table` currently has: the temporary name while a new or
    /// changed table is being rebuilt, the table's own name otherwise.
    #[must_use]
    pub fn table_name(&self, table: &str) -> String {
        if self.rebuilt.contains(table) {
            temporary_name(table)
        } else {
            table.to_string()
        }
    }

    /// The backend, inside the migration transaction.
    pub fn backend(&mut self) -> &mut dyn Backend {
        &mut *self.backend
    }

    /// Executes a statement inside the migration transaction.
    ///
    /// # Errors
    ///
    /// Returns the backend error; the migration then rolls back.
    pub async fn execute(&mut self, sql: &str, arguments: &[SqlArgument]) -> Result<u64> {
        self.backend.execute(sql, arguments).await
    }

    /// Runs a query inside the migration transaction and collects its
    /// rows.
    ///
    /// # Errors
    ///
    /// Returns the backend error; the migration then rolls back.
    pub async fn query_all(
        &mut self,
        sql: &str,
        arguments: &[SqlArgument],
        columns: &[ScalarType],
    ) -> Result<Vec<Vec<SqlValue>>> {
        self.backend.query_all(sql, arguments, columns).await
    }
}

/// Name a table is built under during a migration.
#[must_use]
pub fn temporary_name(table: &str) -> String {
    format!("{table}_migrate")
}

/// What a migration did, or would do in a dry run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Tables touched, in action order.
    pub tables: Vec<String>,
    /// SQL statements, in execution order. Manual steps appear as
    /// comments.
    pub statements: Vec<String>,
}

impl MigrationReport {
    /// Whether nothing had to change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// The actions of a migration, broken down into execution phases.
struct Steps<'a> {
    tables: Vec<String>,
    create: Vec<MigrationOperation>,
    copy: Vec<MigrationOperation>,
    manual: Vec<(&'a Arc<dyn Migrator>, &'a SchemaDifference)>,
    drop: Vec<MigrationOperation>,
    rename: Vec<MigrationOperation>,
    index: Vec<MigrationOperation>,
    rebuilt: HashSet<String>,
}

impl<'a> Steps<'a> {
    fn new(rules: &dyn TypeEquivalence, actions: &'a [MigrationAction]) -> Self {
        let mut steps = Self {
            tables: Vec::new(),
            create: Vec::new(),
            copy: Vec::new(),
            manual: Vec::new(),
            drop: Vec::new(),
            rename: Vec::new(),
            index: Vec::new(),
            rebuilt: HashSet::new(),
        };

        for action in actions {
            let difference = action.difference();
            steps.tables.push(difference.table_name().to_string());

            if let Some(expected) = difference.expected() {
                let temporary = temporary_name(&expected.name);
                steps
                    .create
                    .push(MigrationOperation::create_table(&temporary, expected.clone()));
                steps
                    .rename
                    .push(MigrationOperation::rename_table(&temporary, &expected.name));
                for index in &expected.indexes {
                    steps
                        .index
                        .push(MigrationOperation::create_index(&expected.name, index.clone()));
                }
                steps.rebuilt.insert(expected.name.clone());
            }
            if let Some(existing) = difference.existing() {
                steps.drop.push(MigrationOperation::drop_table(&existing.name));
            }

            match action {
                MigrationAction::Auto(SchemaDifference::ChangedTable {
                    existing,
                    expected,
                    differences,
                }) => steps.copy_data(rules, existing, expected, differences),
                MigrationAction::Auto(_) => {}
                MigrationAction::Manual {
                    migrator,
                    difference,
                } => steps.manual.push((migrator, difference)),
            }
        }

        steps
    }

    fn copy_data(
        &mut self,
        rules: &dyn TypeEquivalence,
        existing: &TableSchema,
        expected: &TableSchema,
        differences: &[SchemaTableDifference],
    ) {
        let temporary = temporary_name(&expected.name);
        let mut columns: Vec<(String, String)> =
            column_mappings(rules, existing, expected, differences)
                .into_iter()
                .map(|(from, to)| (from.name, to.name))
                .collect();
        let mut scoped = Vec::new();
        for difference in differences {
            if let SchemaTableDifference::ChangedDefault { from, to } = difference {
                // Key values are copied as they are.
                if expected.primary_key.contains(&to.name) {
                    columns.push((from.name.clone(), to.name.clone()));
                    continue;
                }
                scoped.push(MigrationOperation::CopyNonDefaults {
                    from: existing.name.clone(),
                    to: temporary.clone(),
                    source_column: from.name.clone(),
                    target_column: to.name.clone(),
                    old_default: from.default.clone(),
                    key: expected.primary_key.clone(),
                });
            }
        }
        self.copy.push(MigrationOperation::CopyColumns {
            from: existing.name.clone(),
            to: temporary,
            columns,
            with_rowid: existing.primary_key.is_empty() && expected.primary_key.is_empty(),
        });
        self.copy.extend(scoped);
    }

    fn before_migrators(&self) -> impl Iterator<Item = &MigrationOperation> {
        self.create.iter().chain(&self.copy)
    }

    fn after_migrators(&self) -> impl Iterator<Item = &MigrationOperation> {
        self.drop.iter().chain(&self.rename).chain(&self.index)
    }
}

/// Executes planned migration actions against a backend.
pub struct MigrationExecutor<'a> {
    backend: &'a mut dyn Backend,
    dry_run: bool,
}

impl std::fmt::Debug for MigrationExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationExecutor")
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl<'a> MigrationExecutor<'a> {
    /// Creates a new migration executor.
    pub fn new(backend: &'a mut dyn Backend) -> Self {
        Self {
            backend,
            dry_run: false,
        }
    }

    /// Enables dry-run mode (statements are reported but not executed).
    #[must_use]
    pub const fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Returns the SQL statements that `actions` would run.
    #[must_use]
    pub fn sql_for(&self, actions: &[MigrationAction]) -> Vec<String> {
        let steps = Steps::new(self.backend.type_rules(), actions);
        self.render(&steps)
    }

    fn render(&self, steps: &Steps<'_>) -> Vec<String> {
        let dialect = self.backend.dialect();
        let mut statements: Vec<String> = steps
            .before_migrators()
            .flat_map(|op| dialect.generate_sql(op))
            .collect();
        statements.extend(
            steps
                .manual
                .iter()
                .map(|(_, difference)| format!("-- run migrator for {}", difference.table_name())),
        );
        statements.extend(steps.after_migrators().flat_map(|op| dialect.generate_sql(op)));
        statements
    }

    /// Applies `actions` in one transaction and records `version`, if
    /// given.
    ///
    /// Foreign-key enforcement is switched off for the run and switched
    /// back on whatever the outcome. Any failure rolls the whole migration
    /// back.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error, or
    /// [`MigrateError::Multiple`] if cleaning up failed as well.
    pub async fn execute(
        mut self,
        actions: &[MigrationAction],
        version: Option<&str>,
    ) -> Result<MigrationReport> {
        let steps = Steps::new(self.backend.type_rules(), actions);
        let report = MigrationReport {
            tables: steps.tables.clone(),
            statements: self.render(&steps),
        };
        if self.dry_run {
            info!(tables = report.tables.len(), "Dry run, nothing executed");
            return Ok(report);
        }
        if actions.is_empty() && version.is_none() {
            return Ok(report);
        }

        self.backend.set_foreign_keys(false).await?;
        let outcome = run_in_transaction(&mut *self.backend, &steps, version).await;
        let restored = self.backend.set_foreign_keys(true).await;

        match (outcome, restored) {
            (Ok(()), Ok(())) => {
                info!(tables = report.tables.len(), "Migration complete");
                Ok(report)
            }
            (Err(error), Ok(())) | (Ok(()), Err(error)) => Err(error),
            (Err(error), Err(restore)) => Err(MigrateError::Multiple(vec![error, restore])),
        }
    }
}

async fn run_in_transaction(
    backend: &mut dyn Backend,
    steps: &Steps<'_>,
    version: Option<&str>,
) -> Result<()> {
    backend.begin().await?;
    let outcome = match run_steps(&mut *backend, steps, version).await {
        Ok(()) => backend.commit().await,
        Err(error) => Err(error),
    };
    let Err(error) = outcome else {
        return Ok(());
    };
    warn!(error = %error, "Migration failed, rolling back");
    match backend.rollback().await {
        Ok(()) => Err(error),
        Err(rollback) => Err(MigrateError::Multiple(vec![error, rollback])),
    }
}

async fn run_steps(
    backend: &mut dyn Backend,
    steps: &Steps<'_>,
    version: Option<&str>,
) -> Result<()> {
    for table in &steps.tables {
        info!(table = %table, "Migrating table");
    }
    for operation in steps.before_migrators() {
        backend.apply(operation).await?;
    }
    for &(migrator, difference) in &steps.manual {
        info!(table = %difference.table_name(), "Running migrator");
        let mut context = MigrationContext {
            backend: &mut *backend,
            difference,
            rebuilt: &steps.rebuilt,
        };
        migrator.migrate(&mut context).await?;
    }
    for operation in steps.after_migrators() {
        backend.apply(operation).await?;
    }
    if let Some(version) = version {
        debug!(version = %version, "Recording schema version");
        version::record(backend, version).await?;
    }
    Ok(())
}

/// Differences between the database and the `expected` tables.
///
/// # Errors
///
/// Returns [`MigrateError::Core`] if an expected table is inconsistent,
/// or the backend error if introspection fails.
pub async fn pending_differences(
    backend: &mut dyn Backend,
    expected: &[TableSchema],
    renames: &RenameDirectives,
) -> Result<Vec<SchemaDifference>> {
    for table in expected {
        table.validate()?;
    }
    let existing = backend.existing_tables().await?;
    Ok(diff_schema(backend.type_rules(), &existing, expected, renames))
}

/// Brings the database to the `expected` tables: diff, plan, execute.
///
/// # Errors
///
/// Returns [`MigrateError::MissingMigrators`] before touching the
/// database if the policy lacks a required migrator, or the error of the
/// failed step after rolling back.
pub async fn migrate(
    backend: &mut dyn Backend,
    expected: &[TableSchema],
    policy: &MigrationPolicy,
    version: Option<&str>,
) -> Result<MigrationReport> {
    let differences = pending_differences(&mut *backend, expected, policy.rename_directives()).await?;
    let actions = plan(differences, policy)?;
    MigrationExecutor::new(backend).execute(&actions, version).await
}

/// Creates the `expected` tables that do not exist yet.
///
/// # Errors
///
/// Returns [`MigrateError::MigrationsNeeded`] naming the affected tables
/// if the database differs in any other way, without changing anything.
pub async fn create_missing_tables(
    backend: &mut dyn Backend,
    expected: &[TableSchema],
) -> Result<MigrationReport> {
    let differences =
        pending_differences(&mut *backend, expected, &RenameDirectives::default()).await?;
    let blocked: Vec<String> = differences
        .iter()
        .filter(|d| !d.is_new_table())
        .map(|d| d.table_name().to_string())
        .collect();
    if !blocked.is_empty() {
        return Err(MigrateError::MigrationsNeeded { tables: blocked });
    }
    let actions: Vec<MigrationAction> = differences.into_iter().map(MigrationAction::Auto).collect();
    MigrationExecutor::new(backend).execute(&actions, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteBackend;
    use oxide_store_core::{ColumnDefinition, TableIndex};

    fn person_v1() -> TableSchema {
        TableSchema::new("person")
            .column(ColumnDefinition::new("id", ScalarType::Int))
            .column(ColumnDefinition::new("name", ScalarType::Text))
            .primary_key(["id"])
    }

    fn person_v2() -> TableSchema {
        person_v1()
            .column(ColumnDefinition::nullable("email", ScalarType::Text))
            .index(TableIndex::new(["name"]))
    }

    #[tokio::test]
    async fn test_creates_missing_tables() {
        let mut backend = SqliteBackend::in_memory().await.unwrap();
        let report = create_missing_tables(&mut backend, &[person_v1()]).await.unwrap();
        assert_eq!(report.tables, vec!["person"]);

        let existing = backend.existing_tables().await.unwrap();
        assert_eq!(existing, vec![person_v1()]);

        let again = create_missing_tables(&mut backend, &[person_v1()]).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_changed_table_blocks_open() {
        let mut backend = SqliteBackend::in_memory().await.unwrap();
        create_missing_tables(&mut backend, &[person_v1()]).await.unwrap();
        let err = create_missing_tables(&mut backend, &[person_v2()])
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::MigrationsNeeded { ref tables } if tables == &["person"]));
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let mut backend = SqliteBackend::in_memory().await.unwrap();
        let actions = vec![MigrationAction::Auto(SchemaDifference::NewTable {
            table: person_v2(),
        })];
        let report = MigrationExecutor::new(&mut backend)
            .dry_run(true)
            .execute(&actions, Some("v1"))
            .await
            .unwrap();
        assert_eq!(
            report.statements,
            vec![
                "CREATE TABLE \"person_migrate\" (\"id\" NUM DEFAULT 0 NOT NULL, \
                 \"name\" TEXT DEFAULT '' NOT NULL, \"email\" TEXT DEFAULT NULL, \
                 PRIMARY KEY(\"id\")) WITHOUT ROWID",
                "ALTER TABLE \"person_migrate\" RENAME TO \"person\"",
                "CREATE INDEX \"person_name\" ON \"person\" (\"name\")",
            ]
        );
        assert!(backend.existing_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_migrate_converges() {
        let mut backend = SqliteBackend::in_memory().await.unwrap();
        create_missing_tables(&mut backend, &[person_v1()]).await.unwrap();
        migrate(&mut backend, &[person_v2()], &MigrationPolicy::new(), Some("v2"))
            .await
            .unwrap();
        let remaining = pending_differences(&mut backend, &[person_v2()], &RenameDirectives::new())
            .await
            .unwrap();
        assert!(remaining.is_empty());
        assert_eq!(version::recorded(&mut backend).await.unwrap(), vec!["v2"]);
    }
}
