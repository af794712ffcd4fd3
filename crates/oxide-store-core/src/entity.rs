//! The bridge between Rust records and stored rows.
//!
//! An [`Entity`] describes its table through a list of [`FieldDef`]s: the
//! column name, the scalar type, the default value, and accessors that move
//! the field in and out of a [`SqlValue`]. The list is built without a live
//! row, so the schema of a type can be derived before anything is stored.
//! Usually this is generated by `#[derive(Entity)]`.
//!
//! Typed [`Field`] handles are what queries are written against.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::schema::{ColumnDefinition, ForeignKey, TableIndex, TableSchema};
use crate::value::{ScalarType, SqlValue};

// ================================================================
// Field values
// ================================================================

/// A Rust type that can be stored in a single column.
pub trait FieldValue: Sized + Clone + Send + Sync + 'static {
    /// The type predicates compare against. `Option<T>` compares as `T`.
    type Compare: FieldValue;

    /// Scalar type of the column.
    const SCALAR_TYPE: ScalarType;

    /// Default value of the column.
    fn default_value() -> SqlValue {
        Self::SCALAR_TYPE.default_value()
    }

    /// Converts to a stored value.
    fn to_value(&self) -> SqlValue;

    /// Converts back from a stored value, `None` if the value does not fit.
    fn from_value(value: SqlValue) -> Option<Self>;
}

impl FieldValue for i64 {
    type Compare = Self;
    const SCALAR_TYPE: ScalarType = ScalarType::Int;

    fn to_value(&self) -> SqlValue {
        SqlValue::Int(*self)
    }

    fn from_value(value: SqlValue) -> Option<Self> {
        match value {
            SqlValue::Int(v) => Some(v),
            SqlValue::Bool(v) => Some(Self::from(v)),
            _ => None,
        }
    }
}

impl FieldValue for i32 {
    type Compare = Self;
    const SCALAR_TYPE: ScalarType = ScalarType::Int;

    fn to_value(&self) -> SqlValue {
        SqlValue::Int(i64::from(*self))
    }

    fn from_value(value: SqlValue) -> Option<Self> {
        i64::from_value(value).and_then(|v| Self::try_from(v).ok())
    }
}

impl FieldValue for bool {
    type Compare = Self;
    const SCALAR_TYPE: ScalarType = ScalarType::Bool;

    fn to_value(&self) -> SqlValue {
        SqlValue::Bool(*self)
    }

    fn from_value(value: SqlValue) -> Option<Self> {
        match value {
            SqlValue::Bool(v) => Some(v),
            SqlValue::Int(v) => Some(v != 0),
            _ => None,
        }
    }
}

impl FieldValue for String {
    type Compare = Self;
    const SCALAR_TYPE: ScalarType = ScalarType::Text;

    fn to_value(&self) -> SqlValue {
        SqlValue::Text(self.clone())
    }

    fn from_value(value: SqlValue) -> Option<Self> {
        match value {
            SqlValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl FieldValue for f64 {
    type Compare = Self;
    const SCALAR_TYPE: ScalarType = ScalarType::Real;

    fn to_value(&self) -> SqlValue {
        SqlValue::Real(*self)
    }

    #[allow(clippy::cast_precision_loss)]
    fn from_value(value: SqlValue) -> Option<Self> {
        match value {
            SqlValue::Real(v) => Some(v),
            SqlValue::Int(v) => Some(v as Self),
            _ => None,
        }
    }
}

impl FieldValue for DateTime<Utc> {
    type Compare = Self;
    const SCALAR_TYPE: ScalarType = ScalarType::Date;

    fn to_value(&self) -> SqlValue {
        SqlValue::date(*self)
    }

    #[allow(clippy::cast_precision_loss)]
    fn from_value(value: SqlValue) -> Option<Self> {
        let value = match value {
            SqlValue::Real(seconds) => SqlValue::date_from_seconds(seconds)?,
            SqlValue::Int(seconds) => SqlValue::date_from_seconds(seconds as f64)?,
            other => other,
        };
        match value {
            SqlValue::Date(v) => Some(v),
            _ => None,
        }
    }
}

impl FieldValue for Uuid {
    type Compare = Self;
    const SCALAR_TYPE: ScalarType = ScalarType::Uuid;

    fn to_value(&self) -> SqlValue {
        SqlValue::Uuid(*self)
    }

    fn from_value(value: SqlValue) -> Option<Self> {
        match value {
            SqlValue::Uuid(v) => Some(v),
            SqlValue::Blob(bytes) => Self::from_slice(&bytes).ok(),
            _ => None,
        }
    }
}

impl FieldValue for Vec<u8> {
    type Compare = Self;
    const SCALAR_TYPE: ScalarType = ScalarType::Blob;

    fn to_value(&self) -> SqlValue {
        SqlValue::Blob(self.clone())
    }

    fn from_value(value: SqlValue) -> Option<Self> {
        match value {
            SqlValue::Blob(v) => Some(v),
            SqlValue::Uuid(v) => Some(v.as_bytes().to_vec()),
            _ => None,
        }
    }
}

/// Optional fields map to nullable columns.
impl<T: FieldValue> FieldValue for Option<T> {
    type Compare = T::Compare;
    const SCALAR_TYPE: ScalarType = T::SCALAR_TYPE;

    fn default_value() -> SqlValue {
        SqlValue::Null
    }

    fn to_value(&self) -> SqlValue {
        self.as_ref().map_or(SqlValue::Null, FieldValue::to_value)
    }

    fn from_value(value: SqlValue) -> Option<Self> {
        match value {
            SqlValue::Null => Some(None),
            other => T::from_value(other).map(Some),
        }
    }
}

// ================================================================
// Field descriptors
// ================================================================

type Reader<E> = Arc<dyn Fn(&E) -> SqlValue + Send + Sync>;
type Writer<E> = Arc<dyn Fn(&mut E, SqlValue) -> Result<()> + Send + Sync>;

/// Describes one column of an entity.
pub struct FieldDef<E> {
    name: &'static str,
    scalar_type: ScalarType,
    default: SqlValue,
    read: Reader<E>,
    write: Writer<E>,
}

impl<E: 'static> FieldDef<E> {
    /// Describes a field through a pair of accessors.
    #[must_use]
    pub fn new<V: FieldValue>(
        name: &'static str,
        get: fn(&E) -> &V,
        get_mut: fn(&mut E) -> &mut V,
    ) -> Self {
        Self {
            name,
            scalar_type: V::SCALAR_TYPE,
            default: V::default_value(),
            read: Arc::new(move |row: &E| get(row).to_value()),
            write: Arc::new(move |row: &mut E, value: SqlValue| {
                let found = value.kind();
                *get_mut(row) = V::from_value(value).ok_or_else(|| CoreError::Conversion {
                    column: name.to_string(),
                    expected: V::SCALAR_TYPE,
                    found: found.to_string(),
                })?;
                Ok(())
            }),
        }
    }

    /// Column name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Scalar type of the column.
    #[must_use]
    pub const fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }

    /// Column definition derived from this field.
    #[must_use]
    pub fn column(&self) -> ColumnDefinition {
        ColumnDefinition {
            name: self.name.to_string(),
            scalar_type: self.scalar_type,
            default: self.default.clone(),
        }
    }

    /// Reads the field from a row.
    #[must_use]
    pub fn read(&self, row: &E) -> SqlValue {
        (self.read)(row)
    }

    /// Writes a stored value into a row.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Conversion`] if the value does not fit the
    /// field's Rust type.
    pub fn write(&self, row: &mut E, value: SqlValue) -> Result<()> {
        (self.write)(row, value)
    }

    /// An untyped handle reading this field.
    #[must_use]
    pub fn field_ref(&self) -> FieldRef<E> {
        FieldRef {
            column: self.name,
            read: Arc::clone(&self.read),
        }
    }
}

impl<E> Clone for FieldDef<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            scalar_type: self.scalar_type,
            default: self.default.clone(),
            read: Arc::clone(&self.read),
            write: Arc::clone(&self.write),
        }
    }
}

impl<E> fmt::Debug for FieldDef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDef")
            .field("name", &self.name)
            .field("scalar_type", &self.scalar_type)
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}

/// A typed handle on one field of `E` holding a `V`.
///
/// Handles are what predicates, orders and joins are built from.
pub struct Field<E, V> {
    column: &'static str,
    get: fn(&E) -> &V,
    _marker: PhantomData<fn() -> V>,
}

impl<E: 'static, V: FieldValue> Field<E, V> {
    /// Creates a handle for `column`, read through `get`.
    #[must_use]
    pub const fn new(column: &'static str, get: fn(&E) -> &V) -> Self {
        Self {
            column,
            get,
            _marker: PhantomData,
        }
    }

    /// Column name.
    #[must_use]
    pub const fn column(&self) -> &'static str {
        self.column
    }

    /// Reads the typed value from a row.
    #[must_use]
    pub fn get<'a>(&self, row: &'a E) -> &'a V {
        (self.get)(row)
    }

    /// Drops the value type, keeping a reader that yields stored values.
    #[must_use]
    pub fn erase(&self) -> FieldRef<E> {
        let get = self.get;
        FieldRef {
            column: self.column,
            read: Arc::new(move |row: &E| get(row).to_value()),
        }
    }
}

impl<E, V> Clone for Field<E, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E, V> Copy for Field<E, V> {}

impl<E, V> fmt::Debug for Field<E, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Field").field(&self.column).finish()
    }
}

/// An untyped field handle: column name plus a reader.
pub struct FieldRef<E> {
    column: &'static str,
    read: Reader<E>,
}

impl<E> FieldRef<E> {
    /// Column name.
    #[must_use]
    pub const fn column(&self) -> &'static str {
        self.column
    }

    /// Reads the field from a row.
    #[must_use]
    pub fn read(&self, row: &E) -> SqlValue {
        (self.read)(row)
    }
}

impl<E> Clone for FieldRef<E> {
    fn clone(&self) -> Self {
        Self {
            column: self.column,
            read: Arc::clone(&self.read),
        }
    }
}

impl<E> fmt::Debug for FieldRef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FieldRef").field(&self.column).finish()
    }
}

// ================================================================
// Entities
// ================================================================

/// A record type stored in one table.
///
/// `Default` supplies the row that decoding starts from, so the field list
/// can be built without an existing value.
pub trait Entity: Clone + Default + Send + Sync + 'static {
    /// Table name.
    const TABLE: &'static str;

    /// Field descriptors, in column order.
    fn fields() -> Vec<FieldDef<Self>>;

    /// Primary key column names, in key order.
    fn primary_key() -> &'static [&'static str] {
        &[]
    }

    /// Secondary indexes.
    fn indexes() -> Vec<TableIndex> {
        Vec::new()
    }

    /// Foreign keys.
    fn foreign_keys() -> Vec<ForeignKey> {
        Vec::new()
    }

    /// Table schema derived from the field list.
    fn schema() -> TableSchema {
        TableSchema {
            name: Self::TABLE.to_string(),
            columns: Self::fields().iter().map(FieldDef::column).collect(),
            primary_key: Self::primary_key().iter().map(ToString::to_string).collect(),
            indexes: Self::indexes(),
            foreign_keys: Self::foreign_keys(),
        }
    }

    /// Encodes the row, one value per column.
    fn to_values(&self) -> Vec<SqlValue> {
        Self::fields().iter().map(|field| field.read(self)).collect()
    }

    /// Decodes a row produced by [`Entity::to_values`] or read back from a
    /// backend.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RowShape`] for a row of the wrong width and
    /// [`CoreError::Conversion`] for a value that does not fit its field.
    fn from_values(values: Vec<SqlValue>) -> Result<Self> {
        let fields = Self::fields();
        if fields.len() != values.len() {
            return Err(CoreError::RowShape {
                table: Self::TABLE.to_string(),
                expected: fields.len(),
                found: values.len(),
            });
        }
        let mut row = Self::default();
        for (field, value) in fields.iter().zip(values) {
            field.write(&mut row, value)?;
        }
        Ok(row)
    }

    /// Untyped handle for a column.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownColumn`] if the entity has no such column.
    fn field_ref(column: &str) -> Result<FieldRef<Self>> {
        Self::fields()
            .iter()
            .find(|field| field.name() == column)
            .map(FieldDef::field_ref)
            .ok_or_else(|| unknown_column::<Self>(column))
    }
}

/// Error for a column `E` does not have.
pub(crate) fn unknown_column<E: Entity>(column: &str) -> CoreError {
    CoreError::UnknownColumn {
        table: E::TABLE.to_string(),
        column: column.to_string(),
    }
}

/// Checks that `column` belongs to `E`.
pub(crate) fn ensure_column<E: Entity>(column: &str) -> Result<()> {
    if E::fields().iter().any(|field| field.name() == column) {
        Ok(())
    } else {
        Err(unknown_column::<E>(column))
    }
}

// ================================================================
// Keys
// ================================================================

/// A primary key value: a single scalar or a pair.
pub trait PrimaryKey: Clone + Ord + fmt::Debug + Send + Sync + 'static {
    /// Stored values, one per key column.
    fn key_values(&self) -> Vec<SqlValue>;
}

macro_rules! scalar_key {
    ($($ty:ty),* $(,)?) => {
        $(
            impl PrimaryKey for $ty {
                fn key_values(&self) -> Vec<SqlValue> {
                    vec![FieldValue::to_value(self)]
                }
            }
        )*
    };
}

scalar_key!(i64, i32, bool, String, Uuid, DateTime<Utc>, Vec<u8>);

impl<A: PrimaryKey, B: PrimaryKey> PrimaryKey for (A, B) {
    fn key_values(&self) -> Vec<SqlValue> {
        let mut values = self.0.key_values();
        values.extend(self.1.key_values());
        values
    }
}

/// An entity with a primary key.
pub trait KeyedEntity: Entity {
    /// Key type: a scalar for single-column keys, a pair for two columns.
    type Key: PrimaryKey;

    /// The row's key.
    fn key(&self) -> Self::Key;

    /// Replaces the row's key.
    fn set_key(&mut self, key: Self::Key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Item {
        id: i64,
        label: Option<String>,
        created: DateTime<Utc>,
    }

    impl Entity for Item {
        const TABLE: &'static str = "item";

        fn fields() -> Vec<FieldDef<Self>> {
            vec![
                FieldDef::new("id", |row: &Self| &row.id, |row: &mut Self| &mut row.id),
                FieldDef::new(
                    "label",
                    |row: &Self| &row.label,
                    |row: &mut Self| &mut row.label,
                ),
                FieldDef::new(
                    "created",
                    |row: &Self| &row.created,
                    |row: &mut Self| &mut row.created,
                ),
            ]
        }

        fn primary_key() -> &'static [&'static str] {
            &["id"]
        }
    }

    #[test]
    fn schema_is_derived_without_a_row() {
        let schema = Item::schema();
        assert_eq!(schema.name, "item");
        assert_eq!(schema.primary_key, vec!["id".to_string()]);
        assert_eq!(schema.columns[0], ColumnDefinition::new("id", ScalarType::Int));
        assert_eq!(
            schema.columns[1],
            ColumnDefinition::nullable("label", ScalarType::Text)
        );
        assert_eq!(schema.columns[2].default, ScalarType::Date.default_value());
    }

    #[test]
    fn values_round_trip_through_descriptors() {
        let item = Item {
            id: 7,
            label: Some("seven".into()),
            created: DateTime::UNIX_EPOCH,
        };
        let values = item.to_values();
        assert_eq!(values[1], SqlValue::from("seven"));
        assert_eq!(Item::from_values(values).unwrap(), item);
    }

    #[test]
    fn conversion_errors_name_the_column() {
        let values = vec![
            SqlValue::from("not a number"),
            SqlValue::Null,
            SqlValue::Real(0.0),
        ];
        let err = Item::from_values(values).unwrap_err();
        assert!(matches!(err, CoreError::Conversion { ref column, .. } if column == "id"));
    }

    #[test]
    fn wrong_row_width_is_rejected() {
        assert!(matches!(
            Item::from_values(vec![SqlValue::Int(1)]),
            Err(CoreError::RowShape { expected: 3, found: 1, .. })
        ));
    }

    #[test]
    fn dates_decode_from_seconds() {
        let decoded = <DateTime<Utc>>::from_value(SqlValue::Real(1.5)).unwrap();
        assert_eq!(decoded.timestamp_millis(), 1_500);
    }

    #[test]
    fn field_ref_lookup() {
        assert_eq!(Item::field_ref("label").unwrap().column(), "label");
        assert!(matches!(
            Item::field_ref("nope"),
            Err(CoreError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn pair_keys_flatten() {
        let key = (1_i64, "a".to_string());
        assert_eq!(key.key_values(), vec![SqlValue::Int(1), SqlValue::from("a")]);
    }
}
