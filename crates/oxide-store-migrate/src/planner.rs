//! Migration planning.
//!
//! The planner turns schema differences into [`MigrationAction`]s. Changes
//! the executor can carry out by itself (adding or dropping columns,
//! renames, index changes, new defaults) become automatic actions; the
//! rest need a caller-supplied [`Migrator`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use oxide_store_core::{RenameDirectives, SchemaDifference, SchemaTableDifference, TableSchema};
use tracing::{debug, warn};

use crate::error::{MigrateError, Result};
use crate::executor::Migrator;

/// What a caller supplies to a migration: rename directives, migrators
/// for changes that cannot run automatically, and overrides for changes
/// that could.
///
/// Migrators are keyed by table name: the expected name for new and
/// changed tables, the existing name for removed ones.
#[derive(Clone, Default)]
pub struct MigrationPolicy {
    renames: RenameDirectives,
    manual: HashMap<String, Arc<dyn Migrator>>,
    overrides: HashMap<String, Arc<dyn Migrator>>,
}

impl fmt::Debug for MigrationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut manual: Vec<&String> = self.manual.keys().collect();
        manual.sort();
        let mut overrides: Vec<&String> = self.overrides.keys().collect();
        overrides.sort();
        f.debug_struct("MigrationPolicy")
            .field("renames", &self.renames)
            .field("manual", &manual)
            .field("overrides", &overrides)
            .finish()
    }
}

impl MigrationPolicy {
    /// A policy with no renames and no migrators.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the rename directives.
    #[must_use]
    pub fn renames(mut self, renames: RenameDirectives) -> Self {
        self.renames = renames;
        self
    }

    /// Declares that table `from` is now called `to`.
    #[must_use]
    pub fn rename_table(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.renames = self.renames.rename_table(from, to);
        self
    }

    /// Declares that column `from` of `table` is now called `to`.
    #[must_use]
    pub fn rename_column(
        mut self,
        table: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.renames = self.renames.rename_column(table, from, to);
        self
    }

    /// Supplies the migrator for a change to `table` that cannot run
    /// automatically.
    #[must_use]
    pub fn manual(mut self, table: impl Into<String>, migrator: impl Migrator + 'static) -> Self {
        self.manual.insert(table.into(), Arc::new(migrator));
        self
    }

    /// Supplies a migrator that replaces the automatic migration of
    /// `table`.
    #[must_use]
    pub fn override_auto(
        mut self,
        table: impl Into<String>,
        migrator: impl Migrator + 'static,
    ) -> Self {
        self.overrides.insert(table.into(), Arc::new(migrator));
        self
    }

    /// The rename directives.
    #[must_use]
    pub const fn rename_directives(&self) -> &RenameDirectives {
        &self.renames
    }

    fn migrator_for(&self, table: &str, auto: bool) -> Option<Arc<dyn Migrator>> {
        self.overrides
            .get(table)
            .or_else(|| if auto { None } else { self.manual.get(table) })
            .cloned()
    }
}

/// One planned step.
#[derive(Clone)]
pub enum MigrationAction {
    /// Carried out by the executor alone.
    Auto(SchemaDifference),
    /// Carried out by a migrator; the executor still creates and drops
    /// tables around it.
    Manual {
        /// The caller-supplied migrator.
        migrator: Arc<dyn Migrator>,
        /// The difference it handles.
        difference: SchemaDifference,
    },
}

impl fmt::Debug for MigrationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto(difference) => f.debug_tuple("Auto").field(difference).finish(),
            Self::Manual { difference, .. } => f
                .debug_struct("Manual")
                .field("difference", difference)
                .finish_non_exhaustive(),
        }
    }
}

impl MigrationAction {
    /// The difference this action resolves.
    #[must_use]
    pub const fn difference(&self) -> &SchemaDifference {
        match self {
            Self::Auto(difference) | Self::Manual { difference, .. } => difference,
        }
    }

    /// Whether a migrator handles this action.
    #[must_use]
    pub const fn is_manual(&self) -> bool {
        matches!(self, Self::Manual { .. })
    }
}

/// Whether the executor can apply a table difference without help.
///
/// A new foreign key is automatic only when its column is nullable in the
/// expected table; a changed primary key never is.
#[must_use]
pub fn is_auto_table_difference(difference: &SchemaTableDifference, expected: &TableSchema) -> bool {
    match difference {
        SchemaTableDifference::NewColumn { .. }
        | SchemaTableDifference::RemovedColumn { .. }
        | SchemaTableDifference::RenamedColumn { .. }
        | SchemaTableDifference::NewIndex { .. }
        | SchemaTableDifference::RemovedIndex { .. }
        | SchemaTableDifference::RemovedForeignKey { .. }
        | SchemaTableDifference::ChangedDefault { .. } => true,
        SchemaTableDifference::NewForeignKey { foreign_key } => expected
            .get_column(&foreign_key.column)
            .is_some_and(oxide_store_core::ColumnDefinition::is_nullable),
        SchemaTableDifference::ChangedPrimaryKey { .. } => false,
    }
}

/// Whether the executor can apply a schema difference without help.
#[must_use]
pub fn is_auto_migratable(difference: &SchemaDifference) -> bool {
    match difference {
        SchemaDifference::NewTable { .. } | SchemaDifference::RemovedTable { .. } => true,
        SchemaDifference::ChangedTable {
            expected,
            differences,
            ..
        } => differences
            .iter()
            .all(|d| is_auto_table_difference(d, expected)),
    }
}

/// Plans one action per difference, in difference order.
///
/// # Errors
///
/// Returns [`MigrateError::MissingMigrators`] naming every table whose
/// non-automatic difference has no migrator.
pub fn plan(differences: Vec<SchemaDifference>, policy: &MigrationPolicy) -> Result<Vec<MigrationAction>> {
    let mut actions = Vec::with_capacity(differences.len());
    let mut missing = Vec::new();

    for difference in differences {
        let table = difference.table_name().to_string();
        let auto = is_auto_migratable(&difference);
        match policy.migrator_for(&table, auto) {
            Some(migrator) => {
                debug!(table = %table, auto, "Planned manual migration");
                actions.push(MigrationAction::Manual {
                    migrator,
                    difference,
                });
            }
            None if auto => {
                debug!(table = %table, "Planned automatic migration");
                actions.push(MigrationAction::Auto(difference));
            }
            None => {
                warn!(table = %table, "No migrator for a non-automatic change");
                missing.push(table);
            }
        }
    }

    if missing.is_empty() {
        Ok(actions)
    } else {
        Err(MigrateError::MissingMigrators { tables: missing })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MigrationContext;
    use async_trait::async_trait;
    use oxide_store_core::{ColumnDefinition, ForeignKey, ScalarType};

    struct Noop;

    #[async_trait]
    impl Migrator for Noop {
        async fn migrate(&self, _context: &mut MigrationContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn person() -> TableSchema {
        TableSchema::new("person")
            .column(ColumnDefinition::new("id", ScalarType::Int))
            .column(ColumnDefinition::new("name", ScalarType::Text))
            .primary_key(["id"])
    }

    fn changed(differences: Vec<SchemaTableDifference>, expected: TableSchema) -> SchemaDifference {
        SchemaDifference::ChangedTable {
            existing: person(),
            expected,
            differences,
        }
    }

    #[test]
    fn test_nullable_column_is_auto() {
        let difference = changed(
            vec![SchemaTableDifference::NewColumn {
                column: ColumnDefinition::nullable("email", ScalarType::Text),
            }],
            person().column(ColumnDefinition::nullable("email", ScalarType::Text)),
        );
        assert!(is_auto_migratable(&difference));
    }

    #[test]
    fn test_changed_primary_key_is_never_auto() {
        let difference = changed(
            vec![SchemaTableDifference::ChangedPrimaryKey {
                from: vec![ColumnDefinition::new("id", ScalarType::Int)],
                to: vec![ColumnDefinition::new("name", ScalarType::Text)],
            }],
            person().primary_key(["name"]),
        );
        assert!(!is_auto_migratable(&difference));
    }

    #[test]
    fn test_new_foreign_key_depends_on_nullability() {
        let foreign_key = ForeignKey::new("group_id", "group", "id");
        let required = person()
            .column(ColumnDefinition::new("group_id", ScalarType::Int))
            .foreign_key(foreign_key.clone());
        let optional = person()
            .column(ColumnDefinition::nullable("group_id", ScalarType::Int))
            .foreign_key(foreign_key.clone());
        let difference = SchemaTableDifference::NewForeignKey { foreign_key };
        assert!(!is_auto_table_difference(&difference, &required));
        assert!(is_auto_table_difference(&difference, &optional));
    }

    #[test]
    fn test_plan_reports_every_missing_migrator() {
        let key_change = |table: &str| SchemaDifference::ChangedTable {
            existing: person().renamed(table),
            expected: person().renamed(table).primary_key(["name"]),
            differences: vec![SchemaTableDifference::ChangedPrimaryKey {
                from: vec![ColumnDefinition::new("id", ScalarType::Int)],
                to: vec![ColumnDefinition::new("name", ScalarType::Text)],
            }],
        };
        let differences = vec![
            key_change("a"),
            SchemaDifference::NewTable { table: person() },
            key_change("b"),
        ];
        let err = plan(differences.clone(), &MigrationPolicy::new()).unwrap_err();
        match err {
            MigrateError::MissingMigrators { tables } => assert_eq!(tables, vec!["a", "b"]),
            other => panic!("unexpected error: {other}"),
        }

        let policy = MigrationPolicy::new().manual("a", Noop).manual("b", Noop);
        let actions = plan(differences, &policy).unwrap();
        let manual: Vec<bool> = actions.iter().map(MigrationAction::is_manual).collect();
        assert_eq!(manual, vec![true, false, true]);
    }

    #[test]
    fn test_override_replaces_auto() {
        let differences = vec![SchemaDifference::NewTable { table: person() }];
        let policy = MigrationPolicy::new().override_auto("person", Noop);
        let actions = plan(differences, &policy).unwrap();
        assert!(actions[0].is_manual());
    }

    #[test]
    fn test_manual_migrator_is_ignored_for_auto_changes() {
        let differences = vec![SchemaDifference::NewTable { table: person() }];
        let policy = MigrationPolicy::new().manual("person", Noop);
        let actions = plan(differences, &policy).unwrap();
        assert!(!actions[0].is_manual());
    }
}
