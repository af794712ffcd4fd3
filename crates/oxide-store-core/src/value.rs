//! Scalar values and their type tags.
//!
//! Every column declares one [`ScalarType`] and every stored cell holds one
//! [`SqlValue`]. Values are ordered the way SQLite orders storage classes:
//! NULL sorts first, then numbers (integers, booleans, reals and dates all
//! compare numerically), then text (bytewise), then blobs (bytewise, UUIDs
//! included). The in-memory evaluator relies on this ordering to agree
//! with the SQL path.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The type tag of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    /// 64-bit signed integer.
    Int,
    /// Boolean, stored as 0/1.
    Bool,
    /// UTF-8 text.
    Text,
    /// 64-bit float.
    Real,
    /// UTC timestamp with microsecond precision.
    Date,
    /// 128-bit UUID.
    Uuid,
    /// Raw bytes.
    Blob,
}

impl ScalarType {
    /// The zero value of this type, used as the column default for
    /// non-optional fields.
    #[must_use]
    pub fn default_value(self) -> SqlValue {
        match self {
            Self::Int => SqlValue::Int(0),
            Self::Bool => SqlValue::Bool(false),
            Self::Text => SqlValue::Text(String::new()),
            Self::Real => SqlValue::Real(0.0),
            Self::Date => SqlValue::Date(DateTime::UNIX_EPOCH),
            Self::Uuid => SqlValue::Uuid(Uuid::nil()),
            Self::Blob => SqlValue::Blob(Vec::new()),
        }
    }

    /// Lowercase name, as used in the JSON schema files.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Text => "text",
            Self::Real => "real",
            Self::Date => "date",
            Self::Uuid => "uuid",
            Self::Blob => "blob",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
    /// Text value.
    Text(String),
    /// Floating point value.
    Real(f64),
    /// Timestamp value.
    Date(DateTime<Utc>),
    /// UUID value.
    Uuid(Uuid),
    /// Byte string value.
    Blob(Vec<u8>),
}

/// SQLite storage classes, in sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum StorageClass {
    Null,
    Numeric,
    Text,
    Blob,
}

impl SqlValue {
    /// Builds a date value truncated to microseconds, the precision the
    /// SQLite backend round-trips.
    #[must_use]
    pub fn date(value: DateTime<Utc>) -> Self {
        let micros = value.timestamp_micros();
        Self::Date(Utc.timestamp_micros(micros).single().unwrap_or(value))
    }

    /// Builds a date value from Unix-epoch seconds.
    #[must_use]
    pub fn date_from_seconds(seconds: f64) -> Option<Self> {
        #[allow(clippy::cast_possible_truncation)]
        let micros = (seconds * 1_000_000.0).round() as i64;
        Utc.timestamp_micros(micros).single().map(Self::Date)
    }

    /// Unix-epoch seconds of a date value.
    #[must_use]
    pub fn date_seconds(value: &DateTime<Utc>) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let micros = value.timestamp_micros() as f64;
        micros / 1_000_000.0
    }

    /// Returns true for [`SqlValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    const fn storage_class(&self) -> StorageClass {
        match self {
            Self::Null => StorageClass::Null,
            Self::Int(_) | Self::Bool(_) | Self::Real(_) | Self::Date(_) => StorageClass::Numeric,
            Self::Text(_) => StorageClass::Text,
            Self::Uuid(_) | Self::Blob(_) => StorageClass::Blob,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Bool(v) => Some(f64::from(u8::from(*v))),
            Self::Real(v) => Some(*v),
            Self::Date(v) => Some(Self::date_seconds(v)),
            _ => None,
        }
    }

    fn as_exact_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Uuid(v) => Some(v.as_bytes()),
            Self::Blob(v) => Some(v),
            _ => None,
        }
    }

    fn numeric_cmp(&self, other: &Self) -> Ordering {
        if let (Some(a), Some(b)) = (self.as_exact_int(), other.as_exact_int()) {
            return a.cmp(&b);
        }
        if let (Self::Date(a), Self::Date(b)) = (self, other) {
            return a.timestamp_micros().cmp(&b.timestamp_micros());
        }
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        }
    }

    /// Total order used for sorting: NULL first, then SQLite storage-class
    /// order, then by value within the class.
    #[must_use]
    pub fn sort_cmp(&self, other: &Self) -> Ordering {
        let (left, right) = (self.storage_class(), other.storage_class());
        if left != right {
            return left.cmp(&right);
        }
        match left {
            StorageClass::Null => Ordering::Equal,
            StorageClass::Numeric => self.numeric_cmp(other),
            StorageClass::Text => match (self, other) {
                (Self::Text(a), Self::Text(b)) => a.as_bytes().cmp(b.as_bytes()),
                _ => Ordering::Equal,
            },
            StorageClass::Blob => self.as_bytes().cmp(&other.as_bytes()),
        }
    }

    /// SQL comparison: `None` when either side is NULL.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            None
        } else {
            Some(self.sort_cmp(other))
        }
    }

    /// SQL equality: never true when either side is NULL.
    #[must_use]
    pub fn sql_eq(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// Short description used in conversion errors.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::Text(_) => "text",
            Self::Real(_) => "real",
            Self::Date(_) => "date",
            Self::Uuid(_) => "uuid",
            Self::Blob(_) => "blob",
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "'{v}'"),
            Self::Real(v) => write!(f, "{v:?}"),
            Self::Date(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Uuid(v) => write!(f, "{v}"),
            Self::Blob(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<Uuid> for SqlValue {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::date(value)
    }
}
