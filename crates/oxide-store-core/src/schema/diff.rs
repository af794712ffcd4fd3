//! Schema differ.
//!
//! Compares the schema found in the database ("existing") with the schema
//! derived from registered entities ("expected") and reports structured
//! differences. Explicit rename directives are applied first; everything
//! left over is matched by name. The differ is pure and deterministic:
//! given the same inputs it always returns the same list in the same
//! order.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ColumnDefinition, ForeignKey, TableIndex, TableSchema};
use crate::value::{ScalarType, SqlValue};

// ================================================================
// Type equivalence
// ================================================================

/// Decides when two declared types or defaults count as equal.
///
/// A backend that stores several scalar types in the same storage class
/// (SQLite stores booleans as integers, for example) reads them back as a
/// single type. Comparing through this trait keeps such columns from
/// showing up as changed on every startup.
pub trait TypeEquivalence: Send + Sync {
    /// Whether a column of type `existing` can hold `expected` unchanged.
    fn types_equal(&self, existing: ScalarType, expected: ScalarType) -> bool;

    /// Whether two default values are the same.
    fn defaults_equal(&self, existing: &SqlValue, expected: &SqlValue) -> bool;
}

/// Strict equality of types and defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactTypes;

impl TypeEquivalence for ExactTypes {
    fn types_equal(&self, existing: ScalarType, expected: ScalarType) -> bool {
        existing == expected
    }

    fn defaults_equal(&self, existing: &SqlValue, expected: &SqlValue) -> bool {
        existing == expected
    }
}

// ================================================================
// Rename directives
// ================================================================

/// A table rename: `from` is the existing name, `to` the expected one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRename {
    /// Existing table name.
    pub from: String,
    /// Expected table name.
    pub to: String,
}

/// A column rename inside one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRename {
    /// Existing column name.
    pub from: String,
    /// Expected column name.
    pub to: String,
}

/// User-supplied renames. Column renames are keyed by the expected
/// table name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameDirectives {
    /// Table renames, applied in order.
    #[serde(default)]
    pub tables: Vec<TableRename>,
    /// Column renames per expected table.
    #[serde(default)]
    pub columns: BTreeMap<String, Vec<ColumnRename>>,
}

impl RenameDirectives {
    /// No renames.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that table `from` is now called `to`.
    #[must_use]
    pub fn rename_table(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.tables.push(TableRename {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Declares that column `from` of `table` (expected name) is now `to`.
    #[must_use]
    pub fn rename_column(
        mut self,
        table: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.columns
            .entry(table.into())
            .or_default()
            .push(ColumnRename {
                from: from.into(),
                to: to.into(),
            });
        self
    }

    /// Column renames for an expected table.
    #[must_use]
    pub fn columns_for(&self, table: &str) -> &[ColumnRename] {
        self.columns.get(table).map_or(&[][..], Vec::as_slice)
    }
}

// ================================================================
// Differences
// ================================================================

/// One difference between an existing and an expected table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaTableDifference {
    /// Column only present in the expected table.
    NewColumn {
        /// The expected column.
        column: ColumnDefinition,
    },
    /// Column only present in the existing table.
    RemovedColumn {
        /// The existing column.
        column: ColumnDefinition,
    },
    /// Column renamed by directive.
    RenamedColumn {
        /// Existing column.
        from: ColumnDefinition,
        /// Expected column.
        to: ColumnDefinition,
    },
    /// Foreign key only present in the expected table.
    NewForeignKey {
        /// The expected foreign key.
        foreign_key: ForeignKey,
    },
    /// Foreign key only present in the existing table.
    RemovedForeignKey {
        /// The existing foreign key.
        foreign_key: ForeignKey,
    },
    /// Index only present in the expected table.
    NewIndex {
        /// The expected index.
        index: TableIndex,
    },
    /// Index only present in the existing table.
    RemovedIndex {
        /// The existing index.
        index: TableIndex,
    },
    /// The primary key columns differ by name, type, or position.
    ChangedPrimaryKey {
        /// Existing key columns.
        from: Vec<ColumnDefinition>,
        /// Expected key columns.
        to: Vec<ColumnDefinition>,
    },
    /// A paired column keeps its name and type but changes its default.
    ChangedDefault {
        /// Existing column.
        from: ColumnDefinition,
        /// Expected column.
        to: ColumnDefinition,
    },
}

/// One difference between the existing and the expected database.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaDifference {
    /// Table only present in the expected schema.
    NewTable {
        /// The expected table.
        table: TableSchema,
    },
    /// Table only present in the existing schema.
    RemovedTable {
        /// The existing table.
        table: TableSchema,
    },
    /// Table present on both sides (possibly under another name) with
    /// differences, or renamed by directive.
    ChangedTable {
        /// The existing table.
        existing: TableSchema,
        /// The expected table.
        expected: TableSchema,
        /// What changed, in differ order.
        differences: Vec<SchemaTableDifference>,
    },
}

impl SchemaDifference {
    /// Name of the table this difference is about: the expected name when
    /// there is one, otherwise the existing name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        match self {
            Self::NewTable { table } | Self::RemovedTable { table } => &table.name,
            Self::ChangedTable { expected, .. } => &expected.name,
        }
    }

    /// The existing side, if any.
    #[must_use]
    pub const fn existing(&self) -> Option<&TableSchema> {
        match self {
            Self::RemovedTable { table } => Some(table),
            Self::ChangedTable { existing, .. } => Some(existing),
            Self::NewTable { .. } => None,
        }
    }

    /// The expected side, if any.
    #[must_use]
    pub const fn expected(&self) -> Option<&TableSchema> {
        match self {
            Self::NewTable { table } => Some(table),
            Self::ChangedTable { expected, .. } => Some(expected),
            Self::RemovedTable { .. } => None,
        }
    }

    /// Whether this is a [`SchemaDifference::NewTable`].
    #[must_use]
    pub const fn is_new_table(&self) -> bool {
        matches!(self, Self::NewTable { .. })
    }
}

/// Differences compare by table identity and change list, not by the full
/// table definitions they carry.
impl PartialEq for SchemaDifference {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::NewTable { table: a }, Self::NewTable { table: b })
            | (Self::RemovedTable { table: a }, Self::RemovedTable { table: b }) => {
                a.name == b.name
            }
            (
                Self::ChangedTable {
                    existing: ea,
                    expected: xa,
                    differences: da,
                },
                Self::ChangedTable {
                    existing: eb,
                    expected: xb,
                    differences: db,
                },
            ) => ea.name == eb.name && xa.name == xb.name && da == db,
            _ => false,
        }
    }
}

// ================================================================
// Table-level diff
// ================================================================

/// Compares one existing table with one expected table.
///
/// Column renames are applied first, for directives whose source and
/// target exist with equal types. Remaining existing columns pair with the
/// first unclaimed expected column of the same name and type; a paired
/// column with a different default yields `ChangedDefault`. Unpaired
/// existing columns are removed, unpaired expected columns are new.
#[must_use]
pub fn diff_table(
    rules: &dyn TypeEquivalence,
    existing: &TableSchema,
    expected: &TableSchema,
    renames: &[ColumnRename],
) -> Vec<SchemaTableDifference> {
    let mut differences = Vec::new();
    let mut claimed_existing: HashSet<&str> = HashSet::new();
    let mut claimed_expected: HashSet<&str> = HashSet::new();

    for rename in renames {
        let (Some(from), Some(to)) = (
            existing.get_column(&rename.from),
            expected.get_column(&rename.to),
        ) else {
            continue;
        };
        if claimed_existing.contains(from.name.as_str())
            || claimed_expected.contains(to.name.as_str())
            || !rules.types_equal(from.scalar_type, to.scalar_type)
        {
            continue;
        }
        claimed_existing.insert(&from.name);
        claimed_expected.insert(&to.name);
        differences.push(SchemaTableDifference::RenamedColumn {
            from: from.clone(),
            to: to.clone(),
        });
    }

    for column in &existing.columns {
        if claimed_existing.contains(column.name.as_str()) {
            continue;
        }
        let partner = expected.columns.iter().find(|candidate| {
            !claimed_expected.contains(candidate.name.as_str())
                && candidate.name == column.name
                && rules.types_equal(column.scalar_type, candidate.scalar_type)
        });
        match partner {
            Some(target) => {
                claimed_expected.insert(&target.name);
                if !rules.defaults_equal(&column.default, &target.default) {
                    differences.push(SchemaTableDifference::ChangedDefault {
                        from: column.clone(),
                        to: target.clone(),
                    });
                }
            }
            None => differences.push(SchemaTableDifference::RemovedColumn {
                column: column.clone(),
            }),
        }
    }

    for column in &expected.columns {
        if !claimed_expected.contains(column.name.as_str()) {
            differences.push(SchemaTableDifference::NewColumn {
                column: column.clone(),
            });
        }
    }

    for index in &existing.indexes {
        if !expected.indexes.contains(index) {
            differences.push(SchemaTableDifference::RemovedIndex {
                index: index.clone(),
            });
        }
    }
    for index in &expected.indexes {
        if !existing.indexes.contains(index) {
            differences.push(SchemaTableDifference::NewIndex {
                index: index.clone(),
            });
        }
    }

    for foreign_key in &existing.foreign_keys {
        if !expected.foreign_keys.contains(foreign_key) {
            differences.push(SchemaTableDifference::RemovedForeignKey {
                foreign_key: foreign_key.clone(),
            });
        }
    }
    for foreign_key in &expected.foreign_keys {
        if !existing.foreign_keys.contains(foreign_key) {
            differences.push(SchemaTableDifference::NewForeignKey {
                foreign_key: foreign_key.clone(),
            });
        }
    }

    let from = key_columns(existing);
    let to = key_columns(expected);
    let same_key = existing.primary_key.len() == expected.primary_key.len()
        && existing
            .primary_key
            .iter()
            .zip(&expected.primary_key)
            .all(|(a, b)| a == b)
        && from.len() == to.len()
        && from
            .iter()
            .zip(&to)
            .all(|(a, b)| rules.types_equal(a.scalar_type, b.scalar_type));
    if !same_key {
        differences.push(SchemaTableDifference::ChangedPrimaryKey { from, to });
    }

    differences
}

fn key_columns(table: &TableSchema) -> Vec<ColumnDefinition> {
    table
        .primary_key
        .iter()
        .filter_map(|name| table.get_column(name).cloned())
        .collect()
}

// ================================================================
// Schema-level diff
// ================================================================

/// Compares the existing tables with the expected tables.
///
/// Table rename directives claim their pair first. Remaining expected
/// tables match existing tables by name. The result lists changed and
/// renamed tables in expected order, then new tables in expected order,
/// then removed tables in existing order. A renamed table is always
/// reported, even when its structure did not change.
#[must_use]
pub fn diff_schema(
    rules: &dyn TypeEquivalence,
    existing: &[TableSchema],
    expected: &[TableSchema],
    renames: &RenameDirectives,
) -> Vec<SchemaDifference> {
    let mut renamed_from: HashMap<&str, &TableSchema> = HashMap::new();
    let mut claimed_existing: HashSet<&str> = HashSet::new();

    for rename in &renames.tables {
        let source = existing.iter().find(|t| t.name == rename.from);
        let target = expected.iter().find(|t| t.name == rename.to);
        if let (Some(source), Some(target)) = (source, target) {
            if claimed_existing.contains(source.name.as_str())
                || renamed_from.contains_key(target.name.as_str())
            {
                continue;
            }
            claimed_existing.insert(&source.name);
            renamed_from.insert(&target.name, source);
        }
    }

    let mut changed = Vec::new();
    let mut created = Vec::new();

    for table in expected {
        if let Some(source) = renamed_from.get(table.name.as_str()) {
            changed.push(SchemaDifference::ChangedTable {
                existing: (*source).clone(),
                expected: table.clone(),
                differences: diff_table(rules, source, table, renames.columns_for(&table.name)),
            });
            continue;
        }
        let source = existing
            .iter()
            .find(|t| t.name == table.name && !claimed_existing.contains(t.name.as_str()));
        match source {
            Some(source) => {
                claimed_existing.insert(&source.name);
                let differences =
                    diff_table(rules, source, table, renames.columns_for(&table.name));
                if !differences.is_empty() {
                    changed.push(SchemaDifference::ChangedTable {
                        existing: source.clone(),
                        expected: table.clone(),
                        differences,
                    });
                }
            }
            None => created.push(SchemaDifference::NewTable {
                table: table.clone(),
            }),
        }
    }

    let removed: Vec<SchemaDifference> = existing
        .iter()
        .filter(|t| !claimed_existing.contains(t.name.as_str()))
        .map(|t| SchemaDifference::RemovedTable { table: t.clone() })
        .collect();

    debug!(
        changed = changed.len(),
        new = created.len(),
        removed = removed.len(),
        "Computed schema differences"
    );
    changed.into_iter().chain(created).chain(removed).collect()
}

// ================================================================
// Column mappings
// ================================================================

/// Pairs of (existing, expected) columns whose data should be copied when
/// a changed table is rebuilt.
///
/// Every renamed column pair is included. Every other existing column is
/// paired with the expected column of the same name, equal type and equal
/// default. Columns on one side only are omitted, and so are columns whose
/// default changed: their values are carried over by a separate copy that
/// skips rows holding the old default.
#[must_use]
pub fn column_mappings(
    rules: &dyn TypeEquivalence,
    existing: &TableSchema,
    expected: &TableSchema,
    differences: &[SchemaTableDifference],
) -> Vec<(ColumnDefinition, ColumnDefinition)> {
    let mut mappings = Vec::new();
    let mut renamed: HashSet<&str> = HashSet::new();
    let mut claimed: HashSet<&str> = HashSet::new();

    for difference in differences {
        if let SchemaTableDifference::RenamedColumn { from, to } = difference {
            renamed.insert(&from.name);
            claimed.insert(&to.name);
            mappings.push((from.clone(), to.clone()));
        }
    }

    for column in &existing.columns {
        if renamed.contains(column.name.as_str()) {
            continue;
        }
        let partner = expected.columns.iter().find(|candidate| {
            !claimed.contains(candidate.name.as_str())
                && candidate.name == column.name
                && rules.types_equal(column.scalar_type, candidate.scalar_type)
                && rules.defaults_equal(&column.default, &candidate.default)
        });
        if let Some(target) = partner {
            claimed.insert(&target.name);
            mappings.push((column.clone(), target.clone()));
        }
    }

    mappings
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::schema::ForeignKey;

    fn person_v1() -> TableSchema {
        TableSchema::new("person")
            .column(ColumnDefinition::new("id", ScalarType::Int))
            .column(ColumnDefinition::new("name", ScalarType::Text))
            .column(ColumnDefinition::new("age", ScalarType::Int))
            .primary_key(["id"])
    }

    fn person_v2() -> TableSchema {
        TableSchema::new("person")
            .column(ColumnDefinition::new("id", ScalarType::Int))
            .column(ColumnDefinition::new("name", ScalarType::Text))
            .column(ColumnDefinition::nullable("city", ScalarType::Text))
            .primary_key(["id"])
    }

    // ============================================================
    // diff_table
    // ============================================================

    #[test]
    fn identical_tables_have_no_differences() {
        assert!(diff_table(&ExactTypes, &person_v1(), &person_v1(), &[]).is_empty());
    }

    #[test]
    fn removed_and_new_columns() {
        let differences = diff_table(&ExactTypes, &person_v1(), &person_v2(), &[]);
        assert_eq!(
            differences,
            vec![
                SchemaTableDifference::RemovedColumn {
                    column: ColumnDefinition::new("age", ScalarType::Int),
                },
                SchemaTableDifference::NewColumn {
                    column: ColumnDefinition::nullable("city", ScalarType::Text),
                },
            ]
        );
    }

    #[test]
    fn rename_directive_pairs_columns() {
        let expected = TableSchema::new("person")
            .column(ColumnDefinition::new("id", ScalarType::Int))
            .column(ColumnDefinition::new("full_name", ScalarType::Text))
            .column(ColumnDefinition::new("age", ScalarType::Int))
            .primary_key(["id"]);
        let renames = [ColumnRename {
            from: "name".into(),
            to: "full_name".into(),
        }];
        let differences = diff_table(&ExactTypes, &person_v1(), &expected, &renames);
        assert_eq!(differences.len(), 1);
        assert!(matches!(
            &differences[0],
            SchemaTableDifference::RenamedColumn { from, to }
                if from.name == "name" && to.name == "full_name"
        ));
    }

    #[test]
    fn rename_with_type_change_is_ignored() {
        let expected = TableSchema::new("person")
            .column(ColumnDefinition::new("id", ScalarType::Int))
            .column(ColumnDefinition::new("full_name", ScalarType::Int))
            .column(ColumnDefinition::new("age", ScalarType::Int))
            .primary_key(["id"]);
        let renames = [ColumnRename {
            from: "name".into(),
            to: "full_name".into(),
        }];
        let differences = diff_table(&ExactTypes, &person_v1(), &expected, &renames);
        assert_eq!(differences.len(), 2);
        assert!(matches!(
            differences[0],
            SchemaTableDifference::RemovedColumn { .. }
        ));
        assert!(matches!(differences[1], SchemaTableDifference::NewColumn { .. }));
    }

    #[test]
    fn changed_default_is_reported() {
        let expected = person_v1();
        let mut existing = person_v1();
        existing.columns[2].default = SqlValue::Int(18);
        let differences = diff_table(&ExactTypes, &existing, &expected, &[]);
        assert!(matches!(
            &differences[..],
            [SchemaTableDifference::ChangedDefault { from, to }]
                if from.default == SqlValue::Int(18) && to.default == SqlValue::Int(0)
        ));
    }

    #[test]
    fn primary_key_change_is_reported() {
        let expected = person_v1().primary_key(["id", "name"]);
        let differences = diff_table(&ExactTypes, &person_v1(), &expected, &[]);
        assert!(matches!(
            &differences[..],
            [SchemaTableDifference::ChangedPrimaryKey { from, to }]
                if from.len() == 1 && to.len() == 2
        ));
    }

    #[test]
    fn index_and_foreign_key_changes() {
        let existing = person_v1().index(TableIndex::new(["name"]));
        let expected = person_v1()
            .index(TableIndex::unique(["name"]))
            .foreign_key(ForeignKey::new("age", "ages", "id"));
        let differences = diff_table(&ExactTypes, &existing, &expected, &[]);
        assert_eq!(
            differences,
            vec![
                SchemaTableDifference::RemovedIndex {
                    index: TableIndex::new(["name"]),
                },
                SchemaTableDifference::NewIndex {
                    index: TableIndex::unique(["name"]),
                },
                SchemaTableDifference::NewForeignKey {
                    foreign_key: ForeignKey::new("age", "ages", "id"),
                },
            ]
        );
    }

    // ============================================================
    // diff_schema
    // ============================================================

    #[test]
    fn new_removed_and_unchanged_tables() {
        let other = TableSchema::new("other").column(ColumnDefinition::new("x", ScalarType::Int));
        let fresh = TableSchema::new("fresh").column(ColumnDefinition::new("y", ScalarType::Int));
        let differences = diff_schema(
            &ExactTypes,
            &[person_v1(), other.clone()],
            &[person_v1(), fresh.clone()],
            &RenameDirectives::new(),
        );
        assert_eq!(
            differences,
            vec![
                SchemaDifference::NewTable { table: fresh },
                SchemaDifference::RemovedTable { table: other },
            ]
        );
    }

    #[test]
    fn renamed_table_is_always_reported() {
        let renamed = person_v1().renamed("people");
        let renames = RenameDirectives::new().rename_table("person", "people");
        let differences = diff_schema(&ExactTypes, &[person_v1()], &[renamed], &renames);
        assert_eq!(differences.len(), 1);
        match &differences[0] {
            SchemaDifference::ChangedTable {
                existing,
                expected,
                differences,
            } => {
                assert_eq!(existing.name, "person");
                assert_eq!(expected.name, "people");
                assert!(differences.is_empty());
            }
            other => panic!("unexpected difference {other:?}"),
        }
    }

    #[test]
    fn rename_claims_source_before_name_matching() {
        let renames = RenameDirectives::new().rename_table("person", "people");
        let differences = diff_schema(
            &ExactTypes,
            &[person_v1()],
            &[person_v1(), person_v1().renamed("people")],
            &renames,
        );
        assert_eq!(differences.len(), 2);
        assert_eq!(differences[0].table_name(), "people");
        assert!(differences[1].is_new_table());
        assert_eq!(differences[1].table_name(), "person");
    }

    #[test]
    fn diff_is_deterministic() {
        let renames = RenameDirectives::new().rename_column("person", "age", "years");
        let first = diff_schema(&ExactTypes, &[person_v1()], &[person_v2()], &renames);
        let second = diff_schema(&ExactTypes, &[person_v1()], &[person_v2()], &renames);
        assert_eq!(first, second);
    }

    /// Differences as an order-free set: inner change lists are sorted and
    /// tables are identified by name.
    fn as_set(differences: &[SchemaDifference]) -> BTreeSet<String> {
        differences
            .iter()
            .map(|difference| {
                let mut changes: Vec<String> = match difference {
                    SchemaDifference::ChangedTable { differences, .. } => {
                        differences.iter().map(|c| format!("{c:?}")).collect()
                    }
                    _ => Vec::new(),
                };
                changes.sort();
                format!(
                    "{:?} -> {:?} {changes:?}",
                    difference.existing().map(|t| &t.name),
                    difference.expected().map(|t| &t.name),
                )
            })
            .collect()
    }

    /// `table` with its columns rotated left by `by`.
    fn rotated(table: &TableSchema, by: usize) -> TableSchema {
        let mut table = table.clone();
        let len = table.columns.len();
        table.columns.rotate_left(by % len);
        table
    }

    #[test]
    fn diff_ignores_column_and_table_order() {
        let pet = TableSchema::new("pet")
            .column(ColumnDefinition::new("id", ScalarType::Int))
            .column(ColumnDefinition::new("owner", ScalarType::Int))
            .column(ColumnDefinition::new("legs", ScalarType::Int).default_value(4_i64))
            .column(ColumnDefinition::new("name", ScalarType::Text))
            .primary_key(["id"])
            .index(TableIndex::new(["owner"]));
        let animal = TableSchema::new("animal")
            .column(ColumnDefinition::new("id", ScalarType::Int))
            .column(ColumnDefinition::new("owner", ScalarType::Int))
            .column(ColumnDefinition::new("legs", ScalarType::Int).default_value(2_i64))
            .column(ColumnDefinition::nullable("nickname", ScalarType::Text))
            .primary_key(["id"])
            .foreign_key(ForeignKey::new("owner", "person", "id"));
        let gone = TableSchema::new("gone").column(ColumnDefinition::new("x", ScalarType::Int));
        let fresh = TableSchema::new("fresh").column(ColumnDefinition::new("y", ScalarType::Int));
        let person = TableSchema::new("person")
            .column(ColumnDefinition::new("id", ScalarType::Int))
            .column(ColumnDefinition::new("name", ScalarType::Text))
            .column(ColumnDefinition::new("years", ScalarType::Int))
            .column(ColumnDefinition::nullable("city", ScalarType::Text))
            .primary_key(["id"]);

        let existing = vec![person_v1(), pet, gone];
        let expected = vec![fresh, animal, person];
        let renames = RenameDirectives::new()
            .rename_table("pet", "animal")
            .rename_column("person", "age", "years")
            .rename_column("animal", "name", "nickname");
        let baseline = diff_schema(&ExactTypes, &existing, &expected, &renames);
        assert_eq!(baseline.len(), 4);
        let baseline_set = as_set(&baseline);
        assert_eq!(baseline_set.len(), baseline.len());

        for by in 0..4 {
            for reverse in [false, true] {
                let mut existing: Vec<TableSchema> =
                    existing.iter().map(|t| rotated(t, by)).collect();
                let mut expected: Vec<TableSchema> =
                    expected.iter().map(|t| rotated(t, by + 1)).collect();
                if reverse {
                    existing.reverse();
                } else {
                    expected.reverse();
                }
                let differences = diff_schema(&ExactTypes, &existing, &expected, &renames);
                assert_eq!(differences.len(), baseline.len());
                assert_eq!(as_set(&differences), baseline_set, "rotation {by}");
            }
        }
    }

    // ============================================================
    // column_mappings
    // ============================================================

    #[test]
    fn mappings_cover_renames_and_shared_columns() {
        let expected = TableSchema::new("person")
            .column(ColumnDefinition::new("id", ScalarType::Int))
            .column(ColumnDefinition::new("full_name", ScalarType::Text))
            .column(ColumnDefinition::nullable("city", ScalarType::Text))
            .primary_key(["id"]);
        let renames = [ColumnRename {
            from: "name".into(),
            to: "full_name".into(),
        }];
        let differences = diff_table(&ExactTypes, &person_v1(), &expected, &renames);
        let mappings = column_mappings(&ExactTypes, &person_v1(), &expected, &differences);
        let pairs: Vec<(&str, &str)> = mappings
            .iter()
            .map(|(a, b)| (a.name.as_str(), b.name.as_str()))
            .collect();
        assert_eq!(pairs, vec![("name", "full_name"), ("id", "id")]);
    }

    #[test]
    fn changed_default_is_not_mapped() {
        let expected = TableSchema::new("person")
            .column(ColumnDefinition::new("id", ScalarType::Int))
            .column(ColumnDefinition::new("name", ScalarType::Text))
            .column(ColumnDefinition::new("age", ScalarType::Int).default_value(18))
            .primary_key(["id"]);
        let differences = diff_table(&ExactTypes, &person_v1(), &expected, &[]);
        assert_eq!(
            differences,
            vec![SchemaTableDifference::ChangedDefault {
                from: ColumnDefinition::new("age", ScalarType::Int),
                to: ColumnDefinition::new("age", ScalarType::Int).default_value(18),
            }]
        );
        let mappings = column_mappings(&ExactTypes, &person_v1(), &expected, &differences);
        let names: Vec<&str> = mappings.iter().map(|(a, _)| a.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name"]);
    }
}
