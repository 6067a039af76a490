#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub mod cache;
pub mod config;
pub mod connection;
pub mod dao;
pub mod driver;
pub mod kind;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod query;
pub mod record;
#[cfg(feature = "sqlite-rusqlite")]
pub mod rusqlite;
pub mod schema;
#[cfg(feature = "simulator")]
pub mod simulator;
pub mod statement;
pub mod transaction;

use std::num::TryFromIntError;

use chrono::NaiveDateTime;
use thiserror::Error;

pub use cache::StatementCache;
pub use connection::{
    Connection, Executor, instance, new_instance, new_instance_from_config, shutdown,
};
pub use dao::{Dao, Model, dao};
pub use driver::Dialect;
pub use kind::{ValueClass, ValueKind};
pub use query::Query;
pub use record::{Record, RecordDescriptor, descriptor};
pub use statement::Statement;
pub use transaction::Transaction;

pub(crate) const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Default)]
pub enum DatabaseValue {
    #[default]
    Null,
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Real32(f32),
    Real64(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(NaiveDateTime),
}

impl DatabaseValue {
    /// Decodes a raw driver byte buffer, keeping it as bytes only when it is not valid UTF-8.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(value) => Self::String(value),
            Err(e) => Self::Bytes(e.into_bytes()),
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        self.to_i128().and_then(|x| i64::try_from(x).ok())
    }

    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        self.to_i128().and_then(|x| u64::try_from(x).ok())
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        #[allow(clippy::cast_precision_loss)]
        match self {
            Self::Real32(value) => Some(f64::from(*value)),
            Self::Real64(value) => Some(*value),
            Self::Int64(value) => Some(*value as f64),
            Self::UInt64(value) => Some(*value as f64),
            Self::String(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            Self::Int64(value) => Some(*value != 0),
            Self::UInt64(value) => Some(*value != 0),
            Self::String(value) => match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    #[must_use]
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            Self::DateTime(value) => Some(*value),
            Self::String(value) => NaiveDateTime::parse_from_str(value, DATETIME_FORMAT)
                .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))
                .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
                .ok(),
            _ => None,
        }
    }

    /// Textual form used for string-kind conversions and for DDL rendering.
    #[must_use]
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(value) => Some(if *value { "1" } else { "0" }.to_string()),
            Self::Int64(value) => Some(value.to_string()),
            Self::UInt64(value) => Some(value.to_string()),
            Self::Real32(value) => Some(value.to_string()),
            Self::Real64(value) => Some(value.to_string()),
            Self::String(value) => Some(value.clone()),
            Self::Bytes(value) => Some(String::from_utf8_lossy(value).into_owned()),
            Self::DateTime(value) => Some(value.format(DATETIME_FORMAT).to_string()),
        }
    }

    fn to_i128(&self) -> Option<i128> {
        match self {
            Self::Bool(value) => Some(i128::from(*value)),
            Self::Int64(value) => Some(i128::from(*value)),
            Self::UInt64(value) => Some(i128::from(*value)),
            #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
            Self::Real64(value) if value.fract() == 0.0 => Some(*value as i128),
            #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
            Self::Real32(value) if value.fract() == 0.0 => Some(*value as i128),
            Self::String(value) => value.trim().parse().ok(),
            Self::Bytes(value) => std::str::from_utf8(value).ok()?.trim().parse().ok(),
            _ => None,
        }
    }
}

impl<T: Into<Self>> From<Option<T>> for DatabaseValue {
    fn from(val: Option<T>) -> Self {
        val.map_or(Self::Null, std::convert::Into::into)
    }
}

impl From<bool> for DatabaseValue {
    fn from(val: bool) -> Self {
        Self::Bool(val)
    }
}

impl From<&str> for DatabaseValue {
    fn from(val: &str) -> Self {
        Self::String(val.to_string())
    }
}

impl From<&String> for DatabaseValue {
    fn from(val: &String) -> Self {
        Self::String(val.clone())
    }
}

impl From<String> for DatabaseValue {
    fn from(val: String) -> Self {
        Self::String(val)
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(val: Vec<u8>) -> Self {
        Self::Bytes(val)
    }
}

impl From<f32> for DatabaseValue {
    fn from(val: f32) -> Self {
        Self::Real32(val)
    }
}

impl From<f64> for DatabaseValue {
    fn from(val: f64) -> Self {
        Self::Real64(val)
    }
}

impl From<NaiveDateTime> for DatabaseValue {
    fn from(val: NaiveDateTime) -> Self {
        Self::DateTime(val)
    }
}

impl From<&Self> for DatabaseValue {
    fn from(val: &Self) -> Self {
        val.clone()
    }
}

macro_rules! impl_from_signed {
    ($($t:ty),+ $(,)?) => {
        $(
            impl From<$t> for DatabaseValue {
                fn from(val: $t) -> Self {
                    Self::Int64(i64::from(val))
                }
            }
        )+
    };
}

macro_rules! impl_from_unsigned {
    ($($t:ty),+ $(,)?) => {
        $(
            impl From<$t> for DatabaseValue {
                fn from(val: $t) -> Self {
                    Self::UInt64(u64::from(val))
                }
            }
        )+
    };
}

impl_from_signed!(i8, i16, i32, i64);
impl_from_unsigned!(u8, u16, u32, u64);

impl From<isize> for DatabaseValue {
    fn from(val: isize) -> Self {
        Self::Int64(val as i64)
    }
}

impl From<usize> for DatabaseValue {
    fn from(val: usize) -> Self {
        Self::UInt64(val as u64)
    }
}

#[derive(Debug, Error)]
pub enum TryFromError {
    #[error("Could not convert to type '{0}'")]
    CouldNotConvert(String),
    #[error("Unexpected NULL for type '{0}'")]
    Null(String),
    #[error(transparent)]
    TryFromInt(#[from] TryFromIntError),
}

macro_rules! impl_try_from_int {
    ($($t:ty),+ $(,)?) => {
        $(
            impl TryFrom<DatabaseValue> for $t {
                type Error = TryFromError;

                fn try_from(value: DatabaseValue) -> Result<Self, Self::Error> {
                    if value.is_null() {
                        return Err(TryFromError::Null(stringify!($t).into()));
                    }
                    let wide = value
                        .to_i128()
                        .ok_or_else(|| TryFromError::CouldNotConvert(stringify!($t).into()))?;
                    Ok(Self::try_from(wide)?)
                }
            }
        )+
    };
}

impl_try_from_int!(i8, i16, i32, i64, u8, u16, u32, u64);

impl TryFrom<DatabaseValue> for bool {
    type Error = TryFromError;

    fn try_from(value: DatabaseValue) -> Result<Self, Self::Error> {
        if value.is_null() {
            return Err(TryFromError::Null("bool".into()));
        }
        value
            .as_bool()
            .ok_or_else(|| TryFromError::CouldNotConvert("bool".into()))
    }
}

impl TryFrom<DatabaseValue> for f64 {
    type Error = TryFromError;

    fn try_from(value: DatabaseValue) -> Result<Self, Self::Error> {
        if value.is_null() {
            return Err(TryFromError::Null("f64".into()));
        }
        value
            .as_f64()
            .ok_or_else(|| TryFromError::CouldNotConvert("f64".into()))
    }
}

impl TryFrom<DatabaseValue> for f32 {
    type Error = TryFromError;

    fn try_from(value: DatabaseValue) -> Result<Self, Self::Error> {
        #[allow(clippy::cast_possible_truncation)]
        match value {
            DatabaseValue::Real32(value) => Ok(value),
            DatabaseValue::Null => Err(TryFromError::Null("f32".into())),
            other => other
                .as_f64()
                .map(|x| x as Self)
                .ok_or_else(|| TryFromError::CouldNotConvert("f32".into())),
        }
    }
}

impl TryFrom<DatabaseValue> for String {
    type Error = TryFromError;

    fn try_from(value: DatabaseValue) -> Result<Self, Self::Error> {
        match value {
            DatabaseValue::String(value) => Ok(value),
            DatabaseValue::Bytes(value) => {
                Self::from_utf8(value).map_err(|_| TryFromError::CouldNotConvert("String".into()))
            }
            DatabaseValue::Null => Err(TryFromError::Null("String".into())),
            other => other
                .to_text()
                .ok_or_else(|| TryFromError::CouldNotConvert("String".into())),
        }
    }
}

impl TryFrom<DatabaseValue> for Vec<u8> {
    type Error = TryFromError;

    fn try_from(value: DatabaseValue) -> Result<Self, Self::Error> {
        match value {
            DatabaseValue::Bytes(value) => Ok(value),
            DatabaseValue::String(value) => Ok(value.into_bytes()),
            DatabaseValue::Null => Err(TryFromError::Null("Vec<u8>".into())),
            _ => Err(TryFromError::CouldNotConvert("Vec<u8>".into())),
        }
    }
}

impl TryFrom<DatabaseValue> for NaiveDateTime {
    type Error = TryFromError;

    fn try_from(value: DatabaseValue) -> Result<Self, Self::Error> {
        if value.is_null() {
            return Err(TryFromError::Null("NaiveDateTime".into()));
        }
        value
            .as_datetime()
            .ok_or_else(|| TryFromError::CouldNotConvert("NaiveDateTime".into()))
    }
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[cfg(feature = "mysql")]
    #[error(transparent)]
    Mysql(#[from] mysql::MysqlDatabaseError),
    #[cfg(feature = "sqlite-rusqlite")]
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::RusqliteDatabaseError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Conversion(#[from] TryFromError),
    #[error("Unknown database id '{0}'")]
    UnknownDatabase(String),
    #[error("Unsupported driver '{0}'")]
    UnsupportedDriver(String),
    #[error("Too many prepared statements: {0}")]
    TooManyStatements(String),
    #[error("Table '{0}' not found")]
    TableNotFound(String),
    #[error("Record not found")]
    NotFound,
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Connection closed")]
    Closed,
    #[error("Transaction already committed or rolled back")]
    TransactionDone,
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Failed to decode row: {0}")]
    RowScan(String),
    #[error("Hook failed: {0}")]
    Hook(String),
}

impl DatabaseError {
    /// Whether the server refused to compile another statement because its per-session
    /// prepared statement ceiling was reached.
    #[must_use]
    pub const fn is_too_many_statements(&self) -> bool {
        matches!(self, Self::TooManyStatements(_))
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub columns: Vec<(String, DatabaseValue)>,
}

impl Row {
    #[must_use]
    pub fn get(&self, column_name: &str) -> Option<DatabaseValue> {
        self.get_ref(column_name).cloned()
    }

    #[must_use]
    pub fn get_ref(&self, column_name: &str) -> Option<&DatabaseValue> {
        self.columns
            .iter()
            .find(|c| c.0 == column_name)
            .map(|c| &c.1)
    }

    /// Case-insensitive lookup, for metadata statements whose column casing varies by server.
    #[must_use]
    pub fn get_ignore_case(&self, column_name: &str) -> Option<&DatabaseValue> {
        self.columns
            .iter()
            .find(|c| c.0.eq_ignore_ascii_case(column_name))
            .map(|c| &c.1)
    }

    /// Text value of a column, `None` when missing or NULL.
    #[must_use]
    pub fn text(&self, column_name: &str) -> Option<String> {
        self.get_ignore_case(column_name)
            .and_then(DatabaseValue::to_text)
    }

    #[must_use]
    pub fn id(&self) -> Option<DatabaseValue> {
        self.get("id")
    }

    pub fn set(&mut self, column_name: &str, value: DatabaseValue) {
        if let Some(existing) = self.columns.iter_mut().find(|c| c.0 == column_name) {
            existing.1 = value;
        } else {
            self.columns.push((column_name.to_string(), value));
        }
    }

    #[must_use]
    pub fn first_value(&self) -> Option<&DatabaseValue> {
        self.columns.first().map(|c| &c.1)
    }
}

/// Ordered column names plus the rows a statement produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl RowSet {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn into_first(self) -> Option<Row> {
        self.rows.into_iter().next()
    }

    /// Values of the first column of every row.
    #[must_use]
    pub fn into_column(self) -> Vec<DatabaseValue> {
        self.rows
            .into_iter()
            .filter_map(|row| row.columns.into_iter().next().map(|c| c.1))
            .collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Row> {
        self.rows.iter()
    }
}

impl IntoIterator for RowSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl<'a> IntoIterator for &'a RowSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<u64>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn from_bytes_decodes_utf8_to_string() {
        assert_eq!(
            DatabaseValue::from_bytes(b"Lily".to_vec()),
            DatabaseValue::String("Lily".to_string())
        );
        assert_eq!(
            DatabaseValue::from_bytes(vec![0xff, 0xfe]),
            DatabaseValue::Bytes(vec![0xff, 0xfe])
        );
    }

    #[test_log::test]
    fn integer_conversions_respect_width() {
        assert_eq!(u8::try_from(DatabaseValue::Int64(255)).unwrap(), 255);
        assert!(u8::try_from(DatabaseValue::Int64(256)).is_err());
        assert!(u32::try_from(DatabaseValue::Int64(-1)).is_err());
        assert_eq!(i64::try_from(DatabaseValue::String("42".into())).unwrap(), 42);
        assert!(matches!(
            i32::try_from(DatabaseValue::Null),
            Err(TryFromError::Null(_))
        ));
    }

    #[test_log::test]
    fn bool_and_string_conversions() {
        assert!(bool::try_from(DatabaseValue::Int64(1)).unwrap());
        assert!(!bool::try_from(DatabaseValue::String("false".into())).unwrap());
        assert_eq!(
            String::try_from(DatabaseValue::UInt64(7)).unwrap(),
            "7".to_string()
        );
        assert_eq!(
            String::try_from(DatabaseValue::Bytes(b"abc".to_vec())).unwrap(),
            "abc".to_string()
        );
    }

    #[test_log::test]
    fn row_lookup_helpers() {
        let mut row = Row {
            columns: vec![
                ("Field".to_string(), DatabaseValue::String("id".into())),
                ("Null".to_string(), DatabaseValue::Null),
            ],
        };

        assert_eq!(row.text("field"), Some("id".to_string()));
        assert_eq!(row.text("null"), None);

        row.set("Null", DatabaseValue::String("YES".into()));
        row.set("Extra", DatabaseValue::String(String::new()));
        assert_eq!(row.columns.len(), 3);
        assert_eq!(row.text("Null"), Some("YES".to_string()));
    }
}
