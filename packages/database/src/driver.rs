//! Backend abstraction
//!
//! A backend provides three objects: a pool-level [`Driver`], the [`DriverTransaction`] it
//! begins, and the [`DriverStatement`]s either of them compiles. Both pool and transaction
//! implement [`Preparer`], which is all the statement cache needs to know about them.

use std::fmt;

use crate::{DatabaseError, DatabaseValue, ExecResult, RowSet};

/// Compiles SQL into a backend statement handle.
pub trait Preparer: Send + Sync {
    /// # Errors
    ///
    /// * If the backend fails to compile `sql`
    /// * [`DatabaseError::TooManyStatements`] if the server refused because its per-session
    ///   statement ceiling was reached
    fn prepare(&self, sql: &str) -> Result<Box<dyn DriverStatement>, DatabaseError>;
}

pub trait DriverStatement: Send + Sync {
    /// # Errors
    ///
    /// * If the backend fails to execute the statement or decode a row
    fn query(&self, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError>;

    /// # Errors
    ///
    /// * If the backend fails to execute the statement
    fn exec(&self, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError>;

    /// # Errors
    ///
    /// * If the backend fails to release the statement
    fn close(&self) -> Result<(), DatabaseError>;
}

pub trait DriverTransaction: Preparer {
    /// # Errors
    ///
    /// * If the backend fails to execute the query
    fn query(&self, sql: &str, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError>;

    /// # Errors
    ///
    /// * If the backend fails to execute the statement
    fn exec(&self, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError>;

    /// # Errors
    ///
    /// * If the backend fails to commit
    fn commit(&self) -> Result<(), DatabaseError>;

    /// # Errors
    ///
    /// * If the backend fails to roll back
    fn rollback(&self) -> Result<(), DatabaseError>;
}

/// A pooled group of physical connections to one logical database.
pub trait Driver: Preparer {
    fn dialect(&self) -> Dialect;

    /// # Errors
    ///
    /// * If the backend fails to execute the query
    fn query(&self, sql: &str, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError>;

    /// # Errors
    ///
    /// * If the backend fails to execute the statement
    fn exec(&self, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError>;

    /// # Errors
    ///
    /// * If a connection cannot be checked out or `BEGIN` fails
    fn begin(&self) -> Result<Box<dyn DriverTransaction>, DatabaseError>;

    /// # Errors
    ///
    /// * If the backend fails to release its connections
    fn close(&self) -> Result<(), DatabaseError>;
}

/// SQL flavor, used for identifier quoting and introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Mysql,
    Mssql,
    Sqlite,
    Generic,
}

impl Dialect {
    #[must_use]
    pub fn from_driver(driver: &str) -> Self {
        match driver.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Self::Mysql,
            "mssql" | "sqlserver" => Self::Mssql,
            "sqlite" | "sqlite3" | "simulator" => Self::Sqlite,
            _ => Self::Generic,
        }
    }

    #[must_use]
    pub const fn quote_chars(self) -> (char, char) {
        match self {
            Self::Mysql => ('`', '`'),
            Self::Mssql => ('[', ']'),
            Self::Sqlite | Self::Generic => ('"', '"'),
        }
    }

    /// Wraps a plain identifier in this dialect's quotes.
    #[must_use]
    pub fn quote(self, ident: &str) -> String {
        let (open, close) = self.quote_chars();
        format!("{open}{ident}{close}")
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mysql => "mysql",
            Self::Mssql => "mssql",
            Self::Sqlite => "sqlite",
            Self::Generic => "generic",
        })
    }
}
