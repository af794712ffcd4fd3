//! SQL compiler for typed queries.
//!
//! Every table reference gets an alias `t{N}`; nested sub-selects take the
//! next free alias, so aliases never collide however deeply selects nest.
//! Arguments are bound by name, namespaced by the alias of the select that
//! introduced them (`:t0arg0`, `:t1arg0`, ...), and listed in the order
//! they first appear in the SQL text.

use std::fmt::Write as _;

use crate::entity::{ensure_column, Entity, FieldRef};
use crate::error::{CoreError, Result};
use crate::query::join::{effective_joined_terms, JoinedOrderTerm, JoinedQuery};
use crate::query::order::{effective_terms, OrderTerm};
use crate::query::predicate::{Condition, Node, Predicate};
use crate::query::Query;
use crate::schema::TableSchema;
use crate::value::SqlValue;

/// A named argument.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlArgument {
    /// Name without the leading `:`.
    pub name: String,
    /// Bound value.
    pub value: SqlValue,
}

/// SQL text plus everything needed to run it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSql {
    /// Statement text with `:name` placeholders.
    pub sql: String,
    /// Selected columns, in result order. Empty for statements without
    /// a result set.
    pub columns: Vec<String>,
    /// Arguments, in order of first appearance.
    pub arguments: Vec<SqlArgument>,
}

/// Quotes an identifier with double quotes.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Compiles predicates, orders and joins to SQL.
#[derive(Debug)]
pub struct SqlCompiler {
    alias: usize,
    next_alias: usize,
    qualify: bool,
    own_arguments: usize,
    arguments: Vec<SqlArgument>,
}

impl Default for SqlCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlCompiler {
    /// A root compiler using alias `t0`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            alias: 0,
            next_alias: 1,
            qualify: true,
            own_arguments: 0,
            arguments: Vec::new(),
        }
    }

    /// A root compiler whose own columns are not qualified, for statements
    /// that cannot alias their table. Nested selects are still aliased.
    #[must_use]
    pub fn unaliased() -> Self {
        Self {
            qualify: false,
            ..Self::new()
        }
    }

    /// This compiler's alias.
    #[must_use]
    pub fn alias(&self) -> String {
        format!("t{}", self.alias)
    }

    fn column(&self, name: &str) -> String {
        if self.qualify {
            format!("t{}.{}", self.alias, quote_identifier(name))
        } else {
            quote_identifier(name)
        }
    }

    fn table(&self, name: &str) -> String {
        if self.qualify {
            format!("{} AS t{}", quote_identifier(name), self.alias)
        } else {
            quote_identifier(name)
        }
    }

    fn bind(&mut self, value: SqlValue) -> String {
        let name = format!("t{}arg{}", self.alias, self.own_arguments);
        self.own_arguments += 1;
        let placeholder = format!(":{name}");
        self.arguments.push(SqlArgument { name, value });
        placeholder
    }

    /// A compiler for a nested select, using the next free alias.
    fn nested(&self) -> Self {
        Self {
            alias: self.next_alias,
            next_alias: self.next_alias + 1,
            qualify: true,
            own_arguments: 0,
            arguments: Vec::new(),
        }
    }

    /// Takes over the aliases and arguments a nested compiler used.
    fn absorb(&mut self, child: Self) {
        self.next_alias = child.next_alias;
        self.arguments.extend(child.arguments);
    }

    /// Compiles the WHERE condition of a predicate. `None` means the
    /// predicate matches everything and no WHERE clause is needed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownColumn`] for a field that is not a
    /// column of its entity.
    pub fn where_clause<E: Entity>(&mut self, predicate: &Predicate<E>) -> Result<Option<String>> {
        match predicate.root() {
            None if predicate.seed().identity() => Ok(None),
            None => Ok(Some("1 = 0".to_string())),
            Some(node) => self.compile_node(node).map(Some),
        }
    }

    fn compile_node<E: Entity>(&mut self, node: &Node<E>) -> Result<String> {
        match node {
            Node::Const(true) => Ok("1 = 1".to_string()),
            Node::Const(false) => Ok("1 = 0".to_string()),
            Node::Leaf { field, condition } => {
                ensure_column::<E>(field.column())?;
                let column = self.column(field.column());
                match condition {
                    Condition::Compare(op, value) => {
                        let placeholder = self.bind(value.clone());
                        Ok(format!("{column} {op} {placeholder}"))
                    }
                    Condition::InList(values) if values.is_empty() => Ok("1 = 0".to_string()),
                    Condition::InList(values) => {
                        let placeholders: Vec<String> =
                            values.iter().map(|v| self.bind(v.clone())).collect();
                        Ok(format!("{column} IN ({})", placeholders.join(", ")))
                    }
                    Condition::InSubquery(select) => {
                        let mut child = self.nested();
                        let sql = select.to_sql(&mut child)?;
                        self.absorb(child);
                        Ok(format!("{column} IN ({sql})"))
                    }
                }
            }
            Node::Compose { op, left, right } => {
                let left = self.compile_node(left)?;
                let right = self.compile_node(right)?;
                Ok(format!("({left}) {} ({right})", op.keyword()))
            }
        }
    }

    pub(crate) fn compile_sub_select<R: Entity>(
        &mut self,
        select: &FieldRef<R>,
        predicate: &Predicate<R>,
    ) -> Result<String> {
        ensure_column::<R>(select.column())?;
        let mut sql = format!(
            "SELECT {} FROM {}",
            self.column(select.column()),
            self.table(R::TABLE)
        );
        if let Some(condition) = self.where_clause(predicate)? {
            write!(sql, " WHERE {condition}").ok();
        }
        Ok(sql)
    }

    fn order_terms<E>(&self, terms: &[OrderTerm<E>]) -> Vec<String> {
        terms
            .iter()
            .map(|term| {
                format!(
                    "{} {}",
                    self.column(term.column()),
                    term.direction().keyword()
                )
            })
            .collect()
    }

    /// Compiles a single-entity select. The order always ends with the
    /// primary key ascending.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownColumn`] for an unresolvable field.
    pub fn select<E: Entity>(mut self, query: &Query<E>) -> Result<CompiledSql> {
        let columns: Vec<String> = E::fields().iter().map(|f| f.name().to_string()).collect();
        let selected: Vec<String> = columns.iter().map(|c| self.column(c)).collect();
        let mut sql = format!("SELECT {} FROM {}", selected.join(", "), self.table(E::TABLE));
        if let Some(condition) = self.where_clause(query.predicate())? {
            write!(sql, " WHERE {condition}").ok();
        }
        let order = self.order_terms(&effective_terms(query.order_ref())?);
        if !order.is_empty() {
            write!(sql, " ORDER BY {}", order.join(", ")).ok();
        }
        Ok(CompiledSql {
            sql,
            columns,
            arguments: self.arguments,
        })
    }

    /// Compiles a two-entity join. The left entity uses this compiler's
    /// alias, the right entity the next free one.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownColumn`] for an unresolvable field.
    pub fn select_joined<L: Entity, R: Entity>(
        mut self,
        query: &JoinedQuery<L, R>,
    ) -> Result<CompiledSql> {
        let predicate = query.predicate();
        predicate.validate()?;
        let left_where = self.where_clause(predicate.left())?;
        let mut right = self.nested();
        let right_where = right.where_clause(predicate.right())?;

        let left_columns: Vec<String> = L::fields().iter().map(|f| f.name().to_string()).collect();
        let right_columns: Vec<String> =
            R::fields().iter().map(|f| f.name().to_string()).collect();
        let selected: Vec<String> = left_columns
            .iter()
            .map(|c| self.column(c))
            .chain(right_columns.iter().map(|c| right.column(c)))
            .collect();

        let on: Vec<String> = predicate
            .pairs()
            .iter()
            .map(|pair| {
                format!(
                    "{} = {}",
                    self.column(pair.left.column()),
                    right.column(pair.right.column())
                )
            })
            .collect();
        let on = match on.len() {
            0 => "1 = 1".to_string(),
            1 => on.join(""),
            _ => on
                .iter()
                .map(|c| format!("({c})"))
                .collect::<Vec<_>>()
                .join(" AND "),
        };

        let mut sql = format!(
            "SELECT {} FROM {} JOIN {} ON {on}",
            selected.join(", "),
            self.table(L::TABLE),
            right.table(R::TABLE)
        );
        let condition = match (left_where, right_where) {
            (Some(l), Some(r)) => Some(format!("({l}) AND ({r})")),
            (Some(c), None) | (None, Some(c)) => Some(c),
            (None, None) => None,
        };
        if let Some(condition) = condition {
            write!(sql, " WHERE {condition}").ok();
        }

        let order: Vec<String> = effective_joined_terms(query.order_ref())?
            .iter()
            .flat_map(|term| match term {
                JoinedOrderTerm::Left(t) => self.order_terms(std::slice::from_ref(t)),
                JoinedOrderTerm::Right(t) => right.order_terms(std::slice::from_ref(t)),
            })
            .collect();
        if !order.is_empty() {
            write!(sql, " ORDER BY {}", order.join(", ")).ok();
        }

        self.absorb(right);
        let columns = left_columns.into_iter().chain(right_columns).collect();
        Ok(CompiledSql {
            sql,
            columns,
            arguments: self.arguments,
        })
    }

    /// Compiles `DELETE FROM table WHERE predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownColumn`] for an unresolvable field.
    pub fn delete<E: Entity>(mut self, predicate: &Predicate<E>) -> Result<CompiledSql> {
        let mut sql = format!("DELETE FROM {}", self.table(E::TABLE));
        if let Some(condition) = self.where_clause(predicate)? {
            write!(sql, " WHERE {condition}").ok();
        }
        Ok(CompiledSql {
            sql,
            columns: Vec::new(),
            arguments: self.arguments,
        })
    }
}

/// Compiles a query with a fresh root compiler.
///
/// # Errors
///
/// Returns [`CoreError::UnknownColumn`] for an unresolvable field.
pub fn compile_query<E: Entity>(query: &Query<E>) -> Result<CompiledSql> {
    SqlCompiler::new().select(query)
}

fn numbered(values: Vec<SqlValue>) -> Vec<SqlArgument> {
    values
        .into_iter()
        .enumerate()
        .map(|(i, value)| SqlArgument {
            name: format!("arg{i}"),
            value,
        })
        .collect()
}

fn key_condition(table: &TableSchema, first: usize) -> Vec<String> {
    table
        .primary_key
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{} = :arg{}", quote_identifier(column), first + i))
        .collect()
}

/// `INSERT INTO table (...) VALUES (...)` for one row.
#[must_use]
pub fn insert_statement(table: &TableSchema, values: Vec<SqlValue>) -> CompiledSql {
    let columns: Vec<String> = table.columns.iter().map(|c| quote_identifier(&c.name)).collect();
    let placeholders: Vec<String> = (0..values.len()).map(|i| format!(":arg{i}")).collect();
    CompiledSql {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(&table.name),
            columns.join(", "),
            placeholders.join(", ")
        ),
        columns: Vec::new(),
        arguments: numbered(values),
    }
}

/// `UPDATE table SET ... WHERE key = ...` for one row, assigning every
/// non-key column.
///
/// # Errors
///
/// Returns [`CoreError::SchemaInvariant`] for a table without a primary
/// key.
pub fn update_statement(table: &TableSchema, values: Vec<SqlValue>) -> Result<CompiledSql> {
    let keys = table.primary_key_indexes()?;
    if keys.is_empty() {
        return Err(CoreError::SchemaInvariant(format!(
            "'{}' has no primary key to update by",
            table.name
        )));
    }
    let mut assigned: Vec<usize> = (0..table.columns.len())
        .filter(|i| !keys.contains(i))
        .collect();
    // A table made only of key columns still needs a SET list.
    if assigned.is_empty() {
        assigned.clone_from(&keys);
    }
    let value_at = |i: usize| values.get(i).cloned().unwrap_or(SqlValue::Null);
    let assignments: Vec<String> = assigned
        .iter()
        .enumerate()
        .map(|(n, &i)| format!("{} = :arg{n}", quote_identifier(&table.columns[i].name)))
        .collect();
    let condition = key_condition(table, assigned.len());
    let arguments: Vec<SqlValue> = assigned
        .iter()
        .chain(keys.iter())
        .map(|&i| value_at(i))
        .collect();
    Ok(CompiledSql {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            quote_identifier(&table.name),
            assignments.join(", "),
            condition.join(" AND ")
        ),
        columns: Vec::new(),
        arguments: numbered(arguments),
    })
}

/// `DELETE FROM table WHERE key = ...` for one key.
#[must_use]
pub fn delete_statement(table: &TableSchema, key: Vec<SqlValue>) -> CompiledSql {
    CompiledSql {
        sql: format!(
            "DELETE FROM {} WHERE {}",
            quote_identifier(&table.name),
            key_condition(table, 0).join(" AND ")
        ),
        columns: Vec::new(),
        arguments: numbered(key),
    }
}

/// `SELECT MAX(column) FROM table`.
#[must_use]
pub fn max_statement(table: &str, column: &str) -> CompiledSql {
    CompiledSql {
        sql: format!(
            "SELECT MAX({}) FROM {}",
            quote_identifier(column),
            quote_identifier(table)
        ),
        columns: vec![column.to_string()],
        arguments: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Field, FieldDef};
    use crate::query::join::{JoinedOrder, JoinedPredicate, Relation};
    use crate::query::order::{Order, OrderDirection};
    use crate::schema::{ColumnDefinition, TableSchema};
    use crate::value::ScalarType;

    #[derive(Debug, Clone, Default)]
    struct Person {
        id: i64,
        name: String,
        age: i64,
    }

    impl Entity for Person {
        const TABLE: &'static str = "person";

        fn fields() -> Vec<FieldDef<Self>> {
            vec![
                FieldDef::new("id", |r: &Self| &r.id, |r: &mut Self| &mut r.id),
                FieldDef::new("name", |r: &Self| &r.name, |r: &mut Self| &mut r.name),
                FieldDef::new("age", |r: &Self| &r.age, |r: &mut Self| &mut r.age),
            ]
        }

        fn primary_key() -> &'static [&'static str] {
            &["id"]
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Pet {
        id: i64,
        owner: i64,
    }

    impl Entity for Pet {
        const TABLE: &'static str = "pet";

        fn fields() -> Vec<FieldDef<Self>> {
            vec![
                FieldDef::new("id", |r: &Self| &r.id, |r: &mut Self| &mut r.id),
                FieldDef::new("owner", |r: &Self| &r.owner, |r: &mut Self| &mut r.owner),
            ]
        }

        fn primary_key() -> &'static [&'static str] {
            &["id"]
        }
    }

    const ID: Field<Person, i64> = Field::new("id", |r: &Person| &r.id);
    const NAME: Field<Person, String> = Field::new("name", |r: &Person| &r.name);
    const AGE: Field<Person, i64> = Field::new("age", |r: &Person| &r.age);
    const PET_ID: Field<Pet, i64> = Field::new("id", |r: &Pet| &r.id);
    const OWNER: Field<Pet, i64> = Field::new("owner", |r: &Pet| &r.owner);

    #[test]
    fn test_select_everything() {
        let compiled = compile_query(&Query::<Person>::default()).unwrap();
        assert_eq!(
            compiled.sql,
            r#"SELECT t0."id", t0."name", t0."age" FROM "person" AS t0 ORDER BY t0."id" ASC"#
        );
        assert_eq!(compiled.columns, vec!["id", "name", "age"]);
        assert!(compiled.arguments.is_empty());
    }

    #[test]
    fn test_empty_any_selects_nothing() {
        let compiled = compile_query(&Query::new(Predicate::<Person>::any())).unwrap();
        assert!(compiled.sql.contains("WHERE 1 = 0"));
    }

    #[test]
    fn test_conjunction_and_order() {
        let query = Query::new(AGE.gte(18).and(NAME.eq("Ann"))).order(Order::desc(AGE));
        let compiled = compile_query(&query).unwrap();
        assert_eq!(
            compiled.sql,
            concat!(
                r#"SELECT t0."id", t0."name", t0."age" FROM "person" AS t0 "#,
                r#"WHERE (t0."age" >= :t0arg0) AND (t0."name" = :t0arg1) "#,
                r#"ORDER BY t0."age" DESC, t0."id" ASC"#
            )
        );
        assert_eq!(compiled.arguments[0].name, "t0arg0");
        assert_eq!(compiled.arguments[1].value, SqlValue::from("Ann"));
    }

    #[test]
    fn test_key_already_ordered_is_not_repeated() {
        let query = Query::new(Predicate::<Person>::all()).order(Order::desc(ID));
        let compiled = compile_query(&query).unwrap();
        assert!(compiled.sql.ends_with(r#"ORDER BY t0."id" DESC"#));
    }

    #[test]
    fn test_in_list() {
        let compiled = compile_query(&Query::new(AGE.is_in([1, 2]))).unwrap();
        assert!(compiled
            .sql
            .contains(r#"WHERE t0."age" IN (:t0arg0, :t0arg1)"#));
    }

    #[test]
    fn test_nested_selects_use_fresh_aliases() {
        let owners = Relation::new(ID, OWNER);
        let inner = owners.having_parent(NAME.eq("Ann"));
        let predicate = ID.in_subquery(OWNER, inner.and(PET_ID.gt(0)));
        let compiled = compile_query(&Query::new(predicate.and(AGE.lt(99)))).unwrap();
        assert!(compiled.sql.contains(concat!(
            r#"(t0."id" IN (SELECT t1."owner" FROM "pet" AS t1 WHERE "#,
            r#"(t1."owner" IN (SELECT t2."id" FROM "person" AS t2 WHERE t2."name" = :t2arg0)) "#,
            r#"AND (t1."id" > :t1arg0))) AND (t0."age" < :t0arg0)"#
        )));
        let names: Vec<&str> = compiled.arguments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["t2arg0", "t1arg0", "t0arg0"]);
    }

    #[test]
    fn test_join() {
        let owners = Relation::new(ID, OWNER);
        let query = JoinedQuery::new(owners.join_children(AGE.gt(3), Predicate::all()))
            .order(JoinedOrder::new().right(PET_ID, OrderDirection::Desc));
        let compiled = SqlCompiler::new().select_joined(&query).unwrap();
        assert_eq!(
            compiled.sql,
            concat!(
                r#"SELECT t0."id", t0."name", t0."age", t1."id", t1."owner" "#,
                r#"FROM "person" AS t0 JOIN "pet" AS t1 ON t0."id" = t1."owner" "#,
                r#"WHERE t0."age" > :t0arg0 "#,
                r#"ORDER BY t1."id" DESC, t0."id" ASC, t1."id" ASC"#
            )
        );
        assert_eq!(compiled.columns.len(), 5);
    }

    #[test]
    fn test_join_with_two_pairs_and_both_sides_filtered() {
        let predicate = JoinedPredicate::new(AGE.gt(1), PET_ID.lt(5))
            .on(ID, OWNER)
            .on(AGE, PET_ID);
        let compiled = SqlCompiler::new()
            .select_joined(&JoinedQuery::new(predicate))
            .unwrap();
        assert!(compiled.sql.contains(
            r#"ON (t0."id" = t1."owner") AND (t0."age" = t1."id") WHERE (t0."age" > :t0arg0) AND (t1."id" < :t1arg0)"#
        ));
    }

    #[test]
    fn test_delete_is_unaliased() {
        let compiled = SqlCompiler::unaliased().delete(&AGE.lt(10)).unwrap();
        assert_eq!(compiled.sql, r#"DELETE FROM "person" WHERE "age" < :t0arg0"#);
    }

    #[test]
    fn test_unknown_column_is_a_configuration_error() {
        let bogus: Field<Person, i64> = Field::new("shoe_size", |r: &Person| &r.age);
        let err = compile_query(&Query::new(bogus.eq(1))).unwrap_err();
        assert!(matches!(err, CoreError::UnknownColumn { ref column, .. } if column == "shoe_size"));
    }

    #[test]
    fn test_row_statements() {
        let table = TableSchema::new("person")
            .column(ColumnDefinition::new("id", ScalarType::Int))
            .column(ColumnDefinition::new("name", ScalarType::Text))
            .primary_key(["id"]);
        let insert = insert_statement(&table, vec![SqlValue::Int(1), SqlValue::from("a")]);
        assert_eq!(
            insert.sql,
            r#"INSERT INTO "person" ("id", "name") VALUES (:arg0, :arg1)"#
        );
        let update = update_statement(&table, vec![SqlValue::Int(1), SqlValue::from("b")]).unwrap();
        assert_eq!(
            update.sql,
            r#"UPDATE "person" SET "name" = :arg0 WHERE "id" = :arg1"#
        );
        assert_eq!(update.arguments[0].value, SqlValue::from("b"));
        assert_eq!(update.arguments[1].value, SqlValue::Int(1));
        let delete = delete_statement(&table, vec![SqlValue::Int(1)]);
        assert_eq!(delete.sql, r#"DELETE FROM "person" WHERE "id" = :arg0"#);
        assert!(update_statement(&TableSchema::new("t"), vec![]).is_err());
    }
}
