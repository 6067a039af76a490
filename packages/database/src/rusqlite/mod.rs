//! `SQLite` backend using rusqlite
//!
//! # Connection Pool Architecture
//!
//! * Up to 5 connections per database, selected round-robin
//! * `:memory:` databases get a single connection since every connection would otherwise see
//!   its own private database
//! * Thread-safe access through `Arc<Mutex<Connection>>`
//!
//! # Statements
//!
//! A statement remembers its SQL text and, inside a transaction, the transaction's connection.
//! Compilation happens through rusqlite's per-connection statement cache, so closing a
//! statement is a no-op here. Statements prepared on the pool pick a free connection on every
//! call.
//!
//! # Transactions
//!
//! A transaction leases a connection out of the rotation, runs `BEGIN` on it and keeps it until
//! `COMMIT` or `ROLLBACK`. Pool-level calls never land on a leased connection. When every pooled
//! connection is leased, file databases open an extra unpooled connection and `:memory:`
//! databases fail with [`RusqliteDatabaseError::PoolExhausted`].
//!
//! `SQLite` allows one writer at a time, so pool-level writes made while a transaction holds
//! the write lock fail with a busy or locked error instead of joining the transaction.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use rusqlite::{CachedStatement, Connection, params_from_iter, types::Value};
use thiserror::Error;

use crate::{
    DATETIME_FORMAT, DatabaseError, DatabaseValue, ExecResult, Row, RowSet,
    driver::{Dialect, Driver, DriverStatement, DriverTransaction, Preparer},
};

const MAX_CONNECTIONS: usize = 5;
const STATEMENT_CACHE_CAPACITY: usize = 256;
const MEMORY_DSN: &str = ":memory:";

#[derive(Debug, Error)]
pub enum RusqliteDatabaseError {
    #[error(transparent)]
    Rusqlite(#[from] rusqlite::Error),
    #[error("Connection pool is empty")]
    EmptyPool,
    #[error("Every connection is leased to a transaction")]
    PoolExhausted,
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(value.into())
    }
}

#[derive(Debug)]
struct PooledConnection {
    connection: Arc<Mutex<Connection>>,
    leased: AtomicBool,
}

#[derive(Debug)]
struct Pool {
    connections: Vec<Arc<PooledConnection>>,
    next_connection: AtomicUsize,
    dsn: Option<String>,
}

impl Pool {
    /// Pooled connections in round-robin order, starting at the next one.
    fn rotation(&self) -> impl Iterator<Item = &Arc<PooledConnection>> {
        let start = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let len = self.connections.len();
        (0..len).map(move |i| &self.connections[(start + i) % len])
    }

    fn get_connection(&self) -> Result<Arc<Mutex<Connection>>, DatabaseError> {
        if let Some(pooled) = self
            .rotation()
            .find(|x| !x.leased.load(Ordering::SeqCst))
        {
            return Ok(pooled.connection.clone());
        }

        self.open_overflow("get_connection")
    }

    fn lease(&self) -> Result<Lease, DatabaseError> {
        if let Some(pooled) = self.rotation().find(|x| {
            x.leased
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        }) {
            return Ok(Lease {
                connection: pooled.connection.clone(),
                pooled: Some(pooled.clone()),
            });
        }

        Ok(Lease {
            connection: self.open_overflow("lease")?,
            pooled: None,
        })
    }

    fn open_overflow(&self, context: &str) -> Result<Arc<Mutex<Connection>>, DatabaseError> {
        match self.dsn.as_deref() {
            Some(dsn) if dsn != MEMORY_DSN => {
                log::debug!("{context}: every pooled connection is leased, opening one to {dsn}");
                Ok(Arc::new(Mutex::new(open_connection(dsn)?)))
            }
            _ => Err(RusqliteDatabaseError::PoolExhausted.into()),
        }
    }
}

/// A connection held by one transaction. Pooled connections go back into rotation on drop.
#[derive(Debug)]
struct Lease {
    connection: Arc<Mutex<Connection>>,
    pooled: Option<Arc<PooledConnection>>,
}

impl Lease {
    fn release(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            pooled.leased.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

/// `SQLite` connection pool using `rusqlite`
#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
pub struct RusqliteDatabase {
    pool: Arc<Pool>,
}

impl RusqliteDatabase {
    /// Creates a new `SQLite` database instance from a vector of connections
    ///
    /// The connections are used in round-robin fashion to distribute load.
    ///
    /// # Errors
    ///
    /// * If `connections` is empty
    pub fn new(connections: Vec<Arc<Mutex<Connection>>>) -> Result<Self, DatabaseError> {
        Self::with_dsn(connections, None)
    }

    fn with_dsn(
        connections: Vec<Arc<Mutex<Connection>>>,
        dsn: Option<String>,
    ) -> Result<Self, DatabaseError> {
        if connections.is_empty() {
            return Err(RusqliteDatabaseError::EmptyPool.into());
        }

        Ok(Self {
            pool: Arc::new(Pool {
                connections: connections
                    .into_iter()
                    .map(|connection| {
                        Arc::new(PooledConnection {
                            connection,
                            leased: AtomicBool::new(false),
                        })
                    })
                    .collect(),
                next_connection: AtomicUsize::new(0),
                dsn,
            }),
        })
    }

    /// Opens up to `max_connections` connections to `dsn`, a file path or `file:` URI.
    ///
    /// # Errors
    ///
    /// * If a connection fails to open
    pub fn open(dsn: &str, max_connections: usize) -> Result<Self, DatabaseError> {
        let count = if dsn == MEMORY_DSN {
            1
        } else {
            max_connections.clamp(1, MAX_CONNECTIONS)
        };

        log::debug!("open: opening {count} sqlite connection(s) to {dsn}");

        let mut connections = Vec::with_capacity(count);
        for _ in 0..count {
            connections.push(Arc::new(Mutex::new(open_connection(dsn)?)));
        }

        Self::with_dsn(connections, Some(dsn.to_string()))
    }

    fn get_connection(&self) -> Result<Arc<Mutex<Connection>>, DatabaseError> {
        self.pool.get_connection()
    }
}

/// Opens one connection with the settings every pooled connection shares.
///
/// # Errors
///
/// * If the connection fails to open or configure
pub fn open_connection(dsn: &str) -> Result<Connection, DatabaseError> {
    let connection = Connection::open(dsn)?;
    connection.busy_timeout(Duration::from_millis(10))?;
    connection.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
    Ok(connection)
}

#[derive(Debug)]
enum StatementTarget {
    Pool(Arc<Pool>),
    Pinned(Arc<Mutex<Connection>>),
}

impl StatementTarget {
    fn connection(&self) -> Result<Arc<Mutex<Connection>>, DatabaseError> {
        match self {
            Self::Pool(pool) => pool.get_connection(),
            Self::Pinned(connection) => Ok(connection.clone()),
        }
    }
}

#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
pub struct RusqliteStatement {
    target: StatementTarget,
    sql: String,
}

impl RusqliteStatement {
    fn compile(target: StatementTarget, sql: &str) -> Result<Self, DatabaseError> {
        target
            .connection()?
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .prepare_cached(sql)?;

        Ok(Self {
            target,
            sql: sql.to_string(),
        })
    }
}

impl DriverStatement for RusqliteStatement {
    fn query(&self, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError> {
        let connection = self.target.connection()?;
        let connection = connection.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = connection.prepare_cached(&self.sql)?;
        query_statement(&mut stmt, params)
    }

    fn exec(&self, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError> {
        let connection = self.target.connection()?;
        let connection = connection.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = connection.prepare_cached(&self.sql)?;
        let rows_affected = stmt.execute(params_from_iter(params.iter().map(to_sqlite_value)))?;
        drop(stmt);
        Ok(exec_result(&connection, &self.sql, rows_affected))
    }

    fn close(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

impl Preparer for RusqliteDatabase {
    fn prepare(&self, sql: &str) -> Result<Box<dyn DriverStatement>, DatabaseError> {
        Ok(Box::new(RusqliteStatement::compile(
            StatementTarget::Pool(self.pool.clone()),
            sql,
        )?))
    }
}

impl Driver for RusqliteDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(&self, sql: &str, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError> {
        log::trace!("query: {sql} with params: {params:?}");
        let connection = self.get_connection()?;
        let connection = connection.lock().unwrap_or_else(PoisonError::into_inner);
        query_connection(&connection, sql, params)
    }

    fn exec(&self, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError> {
        log::trace!("exec: {sql} with params: {params:?}");
        let connection = self.get_connection()?;
        let connection = connection.lock().unwrap_or_else(PoisonError::into_inner);
        exec_connection(&connection, sql, params)
    }

    fn begin(&self) -> Result<Box<dyn DriverTransaction>, DatabaseError> {
        let lease = self.pool.lease()?;

        lease
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute_batch("BEGIN")?;

        Ok(Box::new(RusqliteTransaction::new(lease)))
    }

    fn close(&self) -> Result<(), DatabaseError> {
        for pooled in &self.pool.connections {
            pooled
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .flush_prepared_statement_cache();
        }
        Ok(())
    }
}

/// `SQLite` transaction holding a leased connection
#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
pub struct RusqliteTransaction {
    lease: Mutex<Lease>,
    connection: Arc<Mutex<Connection>>,
    committed: AtomicBool,
    rolled_back: AtomicBool,
}

impl RusqliteTransaction {
    fn new(lease: Lease) -> Self {
        Self {
            connection: lease.connection.clone(),
            lease: Mutex::new(lease),
            committed: AtomicBool::new(false),
            rolled_back: AtomicBool::new(false),
        }
    }

    fn ensure_active(&self) -> Result<(), DatabaseError> {
        if self.committed.load(Ordering::SeqCst) || self.rolled_back.load(Ordering::SeqCst) {
            return Err(DatabaseError::TransactionDone);
        }
        Ok(())
    }

    fn finish(&self, sql: &str, done: &AtomicBool) -> Result<(), DatabaseError> {
        self.ensure_active()?;

        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute_batch(sql)?;

        done.store(true, Ordering::SeqCst);
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release();
        Ok(())
    }
}

impl Drop for RusqliteTransaction {
    fn drop(&mut self) {
        if self.ensure_active().is_ok() {
            log::debug!("drop: rolling back unfinished sqlite transaction");
            if let Err(e) = self
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .execute_batch("ROLLBACK")
            {
                log::warn!("drop: rollback failed: {e:?}");
            }
        }
    }
}

impl Preparer for RusqliteTransaction {
    fn prepare(&self, sql: &str) -> Result<Box<dyn DriverStatement>, DatabaseError> {
        self.ensure_active()?;
        Ok(Box::new(RusqliteStatement::compile(
            StatementTarget::Pinned(self.connection.clone()),
            sql,
        )?))
    }
}

impl DriverTransaction for RusqliteTransaction {
    fn query(&self, sql: &str, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError> {
        self.ensure_active()?;
        log::trace!("query: {sql} with params: {params:?}");
        let connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        query_connection(&connection, sql, params)
    }

    fn exec(&self, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError> {
        self.ensure_active()?;
        log::trace!("exec: {sql} with params: {params:?}");
        let connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        exec_connection(&connection, sql, params)
    }

    fn commit(&self) -> Result<(), DatabaseError> {
        self.finish("COMMIT", &self.committed)
    }

    fn rollback(&self) -> Result<(), DatabaseError> {
        self.finish("ROLLBACK", &self.rolled_back)
    }
}

fn query_connection(
    connection: &Connection,
    sql: &str,
    params: &[DatabaseValue],
) -> Result<RowSet, DatabaseError> {
    let mut stmt = connection.prepare_cached(sql)?;
    query_statement(&mut stmt, params)
}

fn exec_connection(
    connection: &Connection,
    sql: &str,
    params: &[DatabaseValue],
) -> Result<ExecResult, DatabaseError> {
    let rows_affected = if params.is_empty() && !sql.contains('?') {
        connection.execute_batch(sql)?;
        usize::try_from(connection.changes()).unwrap_or(usize::MAX)
    } else {
        connection.execute(sql, params_from_iter(params.iter().map(to_sqlite_value)))?
    };
    Ok(exec_result(connection, sql, rows_affected))
}

fn query_statement(
    stmt: &mut CachedStatement<'_>,
    params: &[DatabaseValue],
) -> Result<RowSet, DatabaseError> {
    let columns = stmt
        .column_names()
        .iter()
        .map(|&s| s.to_string())
        .collect::<Vec<_>>();

    let mut rows = stmt.query(params_from_iter(params.iter().map(to_sqlite_value)))?;
    let mut result = vec![];

    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            values.push((column.clone(), row.get::<_, Value>(i)?.into()));
        }
        result.push(Row { columns: values });
    }

    Ok(RowSet {
        columns,
        rows: result,
    })
}

fn exec_result(connection: &Connection, sql: &str, rows_affected: usize) -> ExecResult {
    let head = sql.trim_start().get(..7).unwrap_or_default();
    let inserted = head.eq_ignore_ascii_case("INSERT ") || head.eq_ignore_ascii_case("REPLACE");

    ExecResult {
        rows_affected: rows_affected as u64,
        last_insert_id: if inserted {
            u64::try_from(connection.last_insert_rowid())
                .ok()
                .filter(|x| *x > 0)
        } else {
            None
        },
    }
}

fn to_sqlite_value(value: &DatabaseValue) -> Value {
    match value {
        DatabaseValue::Null => Value::Null,
        DatabaseValue::Bool(x) => Value::Integer(i64::from(*x)),
        DatabaseValue::Int64(x) => Value::Integer(*x),
        DatabaseValue::UInt64(x) => {
            i64::try_from(*x).map_or_else(|_| Value::Text(x.to_string()), Value::Integer)
        }
        DatabaseValue::Real32(x) => Value::Real(f64::from(*x)),
        DatabaseValue::Real64(x) => Value::Real(*x),
        DatabaseValue::String(x) => Value::Text(x.clone()),
        DatabaseValue::Bytes(x) => Value::Blob(x.clone()),
        DatabaseValue::DateTime(x) => Value::Text(x.format(DATETIME_FORMAT).to_string()),
    }
}

impl From<Value> for DatabaseValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Integer(value) => Self::Int64(value),
            Value::Real(value) => Self::Real64(value),
            Value::Text(value) => Self::String(value),
            Value::Blob(value) => Self::from_bytes(value),
        }
    }
}
