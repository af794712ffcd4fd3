#![doc = r#"
Core model of oxide-store: scalar values, table schemas, the schema differ,
and typed queries with two interchangeable evaluators.

- [`value`] defines [`SqlValue`] and [`ScalarType`].
- [`entity`] bridges Rust records and stored rows through [`Entity`].
- [`schema`] holds [`TableSchema`] and the differ in [`schema::diff`].
- [`query`] holds [`Predicate`], [`Query`], joins, the SQL compiler, and
  the in-memory evaluator.

Nothing in this crate touches a database; backends live in
`oxide-store-migrate` and `oxide-store`.

```ignore
use oxide_store_core::prelude::*;

#[derive(Debug, Clone, Default, Entity)]
#[entity(table = "person")]
struct Person {
    #[field(primary_key)]
    id: i64,
    name: String,
    age: i64,
}

let adults = Query::new(Person::age().gte(18)).order(Order::asc(Person::name()));
let compiled = compile_query(&adults)?;
```
"#]

pub mod entity;
pub mod error;
pub mod query;
pub mod schema;
pub mod value;

pub use entity::{Entity, Field, FieldDef, FieldRef, FieldValue, KeyedEntity, PrimaryKey};
pub use error::{CoreError, Result};
pub use query::compiler::{compile_query, quote_identifier};
pub use query::{
    CompareOp, CompiledSql, Composition, Evaluator, JoinedOrder, JoinedPredicate, JoinedQuery,
    Order, OrderDirection, Predicate, Query, Relation, RowSource, SqlArgument, SqlCompiler,
};
pub use schema::{
    ColumnDefinition, DatabaseSchema, ForeignKey, RenameDirectives, SchemaDifference,
    SchemaTableDifference, TableIndex, TableSchema, TypeEquivalence,
};
pub use value::{ScalarType, SqlValue};

/// Commonly used items.
pub mod prelude {
    pub use crate::entity::{Entity, Field, FieldValue, KeyedEntity};
    pub use crate::query::compiler::compile_query;
    pub use crate::query::{
        JoinedOrder, JoinedPredicate, JoinedQuery, Order, OrderDirection, Predicate, Query,
        Relation,
    };
    pub use crate::value::{ScalarType, SqlValue};
}
