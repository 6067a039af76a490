//! `MySQL` backend using the synchronous `mysql` crate
//!
//! Pool-level statements are compiled once on a pooled connection to surface errors early and
//! then executed by SQL text, which the driver resolves through each connection's own statement
//! cache. Transaction statements are compiled on the transaction's connection and released with
//! `COM_STMT_CLOSE` when closed.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Datelike, NaiveDate, Timelike};
use mysql::{
    Opts, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, TxOpts, UrlError, Value,
    prelude::Queryable,
};
use thiserror::Error;

use crate::{
    DatabaseError, DatabaseValue, ExecResult, Row, RowSet,
    config::Connections,
    driver::{Dialect, Driver, DriverStatement, DriverTransaction, Preparer},
};

/// `ER_MAX_PREPARED_STMT_COUNT_REACHED`
pub const ER_MAX_PREPARED_STMT_COUNT_REACHED: u16 = 1461;

#[derive(Debug, Error)]
pub enum MysqlDatabaseError {
    #[error(transparent)]
    Mysql(#[from] mysql::Error),
    #[error(transparent)]
    Url(#[from] UrlError),
    #[error("Invalid pool constraints min={min} max={max}")]
    InvalidPoolConstraints { min: usize, max: usize },
}

impl From<mysql::Error> for DatabaseError {
    fn from(value: mysql::Error) -> Self {
        match value {
            mysql::Error::MySqlError(e) if e.code == ER_MAX_PREPARED_STMT_COUNT_REACHED => {
                Self::TooManyStatements(e.message)
            }
            other => Self::Mysql(other.into()),
        }
    }
}

#[allow(clippy::module_name_repetitions)]
#[derive(Clone)]
pub struct MysqlDatabase {
    pool: Pool,
}

impl MysqlDatabase {
    /// Opens a pool for `dsn`, a `mysql://` URL, configured by [`pool_opts`].
    ///
    /// # Errors
    ///
    /// * If the URL is malformed
    /// * If the pool constraints are inconsistent
    /// * If the pool fails to open
    pub fn open(dsn: &str, connections: &Connections) -> Result<Self, DatabaseError> {
        let opts = Opts::from_url(dsn).map_err(MysqlDatabaseError::from)?;
        let opts = OptsBuilder::from_opts(opts).pool_opts(pool_opts(connections)?);

        log::debug!(
            "open: opening mysql pool idle={} max={} life={:?} idle_timeout={:?}",
            connections.pool,
            connections.max,
            connections.life,
            connections.idle_timeout
        );

        Ok(Self {
            pool: Pool::new(opts)?,
        })
    }
}

/// Pool settings for `connections`.
///
/// Connections open lazily up to `max`. A connection is closed once it has been idle for
/// `idle_timeout` or alive for `life`. `pool` is the idle size the reaping settles towards,
/// which the driver cannot cap separately, so it only shows up in logs.
///
/// # Errors
///
/// * If `max` is zero
pub fn pool_opts(connections: &Connections) -> Result<PoolOpts, DatabaseError> {
    let constraints = PoolConstraints::new(0, connections.max)
        .filter(|_| connections.max > 0)
        .ok_or(MysqlDatabaseError::InvalidPoolConstraints {
            min: 0,
            max: connections.max,
        })?;

    Ok(PoolOpts::default()
        .with_constraints(constraints)
        .with_inactive_connection_ttl(connections.idle_timeout)
        .with_abs_conn_ttl(connections.life))
}

impl Preparer for MysqlDatabase {
    fn prepare(&self, sql: &str) -> Result<Box<dyn DriverStatement>, DatabaseError> {
        let mut conn = self.pool.get_conn()?;
        conn.prep(sql)?;

        Ok(Box::new(MysqlPoolStatement {
            pool: self.pool.clone(),
            sql: sql.to_string(),
        }))
    }
}

impl Driver for MysqlDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    fn query(&self, sql: &str, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError> {
        log::trace!("query: {sql} with params: {params:?}");
        let mut conn = self.pool.get_conn()?;
        if params.is_empty() {
            read_rows(conn.query_iter(sql)?)
        } else {
            read_rows(conn.exec_iter(sql, to_params(params))?)
        }
    }

    fn exec(&self, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError> {
        log::trace!("exec: {sql} with params: {params:?}");
        let mut conn = self.pool.get_conn()?;
        if params.is_empty() {
            Ok(read_exec(&conn.query_iter(sql)?))
        } else {
            Ok(read_exec(&conn.exec_iter(sql, to_params(params))?))
        }
    }

    fn begin(&self) -> Result<Box<dyn DriverTransaction>, DatabaseError> {
        let tx = self.pool.start_transaction(TxOpts::default())?;
        log::debug!("begin: started mysql transaction");
        Ok(Box::new(MysqlTransaction {
            tx: Arc::new(Mutex::new(Some(tx))),
        }))
    }

    fn close(&self) -> Result<(), DatabaseError> {
        // Pooled connections are released when the last pool handle drops.
        Ok(())
    }
}

struct MysqlPoolStatement {
    pool: Pool,
    sql: String,
}

impl DriverStatement for MysqlPoolStatement {
    fn query(&self, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError> {
        let mut conn = self.pool.get_conn()?;
        read_rows(conn.exec_iter(self.sql.as_str(), to_params(params))?)
    }

    fn exec(&self, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError> {
        let mut conn = self.pool.get_conn()?;
        Ok(read_exec(&conn.exec_iter(self.sql.as_str(), to_params(params))?))
    }

    fn close(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

type SharedTransaction = Arc<Mutex<Option<mysql::Transaction<'static>>>>;

#[allow(clippy::module_name_repetitions)]
pub struct MysqlTransaction {
    tx: SharedTransaction,
}

impl MysqlTransaction {
    fn with_tx<T>(
        &self,
        f: impl FnOnce(&mut mysql::Transaction<'static>) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        with_tx(&self.tx, f)
    }
}

fn with_tx<T>(
    tx: &SharedTransaction,
    f: impl FnOnce(&mut mysql::Transaction<'static>) -> Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    let mut guard = tx.lock().unwrap_or_else(PoisonError::into_inner);
    let tx = guard.as_mut().ok_or(DatabaseError::TransactionDone)?;
    f(tx)
}

impl Preparer for MysqlTransaction {
    fn prepare(&self, sql: &str) -> Result<Box<dyn DriverStatement>, DatabaseError> {
        let statement = self.with_tx(|tx| Ok(tx.prep(sql)?))?;

        Ok(Box::new(MysqlTransactionStatement {
            tx: self.tx.clone(),
            statement,
        }))
    }
}

impl DriverTransaction for MysqlTransaction {
    fn query(&self, sql: &str, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError> {
        log::trace!("query: {sql} with params: {params:?}");
        self.with_tx(|tx| {
            if params.is_empty() {
                read_rows(tx.query_iter(sql)?)
            } else {
                read_rows(tx.exec_iter(sql, to_params(params))?)
            }
        })
    }

    fn exec(&self, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError> {
        log::trace!("exec: {sql} with params: {params:?}");
        self.with_tx(|tx| {
            if params.is_empty() {
                Ok(read_exec(&tx.query_iter(sql)?))
            } else {
                Ok(read_exec(&tx.exec_iter(sql, to_params(params))?))
            }
        })
    }

    fn commit(&self) -> Result<(), DatabaseError> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(DatabaseError::TransactionDone)?;
        tx.commit()?;
        Ok(())
    }

    fn rollback(&self) -> Result<(), DatabaseError> {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(DatabaseError::TransactionDone)?;
        tx.rollback()?;
        Ok(())
    }
}

struct MysqlTransactionStatement {
    tx: SharedTransaction,
    statement: mysql::Statement,
}

impl DriverStatement for MysqlTransactionStatement {
    fn query(&self, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError> {
        with_tx(&self.tx, |tx| {
            read_rows(tx.exec_iter(&self.statement, to_params(params))?)
        })
    }

    fn exec(&self, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError> {
        with_tx(&self.tx, |tx| {
            Ok(read_exec(&tx.exec_iter(&self.statement, to_params(params))?))
        })
    }

    fn close(&self) -> Result<(), DatabaseError> {
        let mut guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        // The server drops transaction statements with the session state once it has ended.
        let Some(tx) = guard.as_mut() else {
            return Ok(());
        };
        tx.close(self.statement.clone())?;
        Ok(())
    }
}

fn read_rows<P: mysql::prelude::Protocol>(
    mut result: mysql::QueryResult<'_, '_, '_, P>,
) -> Result<RowSet, DatabaseError> {
    let columns = result
        .columns()
        .as_ref()
        .iter()
        .map(|c| c.name_str().to_string())
        .collect::<Vec<_>>();

    let mut rows = vec![];

    if let Some(set) = result.iter() {
        for row in set {
            let values = row?.unwrap();
            rows.push(Row {
                columns: columns
                    .iter()
                    .cloned()
                    .zip(values.into_iter().map(from_mysql_value))
                    .collect(),
            });
        }
    }

    Ok(RowSet { columns, rows })
}

fn read_exec<P: mysql::prelude::Protocol>(
    result: &mysql::QueryResult<'_, '_, '_, P>,
) -> ExecResult {
    ExecResult {
        rows_affected: result.affected_rows(),
        last_insert_id: result.last_insert_id().filter(|x| *x > 0),
    }
}

fn to_params(params: &[DatabaseValue]) -> Params {
    if params.is_empty() {
        return Params::Empty;
    }
    Params::Positional(params.iter().map(to_mysql_value).collect())
}

fn to_mysql_value(value: &DatabaseValue) -> Value {
    match value {
        DatabaseValue::Null => Value::NULL,
        DatabaseValue::Bool(x) => Value::Int(i64::from(*x)),
        DatabaseValue::Int64(x) => Value::Int(*x),
        DatabaseValue::UInt64(x) => Value::UInt(*x),
        DatabaseValue::Real32(x) => Value::Float(*x),
        DatabaseValue::Real64(x) => Value::Double(*x),
        DatabaseValue::String(x) => Value::Bytes(x.as_bytes().to_vec()),
        DatabaseValue::Bytes(x) => Value::Bytes(x.clone()),
        #[allow(clippy::cast_possible_truncation)]
        DatabaseValue::DateTime(x) => Value::Date(
            u16::try_from(x.year()).unwrap_or_default(),
            x.month() as u8,
            x.day() as u8,
            x.hour() as u8,
            x.minute() as u8,
            x.second() as u8,
            x.nanosecond() / 1000,
        ),
    }
}

fn from_mysql_value(value: Value) -> DatabaseValue {
    match value {
        Value::NULL => DatabaseValue::Null,
        Value::Bytes(bytes) => DatabaseValue::from_bytes(bytes),
        Value::Int(x) => DatabaseValue::Int64(x),
        Value::UInt(x) => DatabaseValue::UInt64(x),
        Value::Float(x) => DatabaseValue::Real32(x),
        Value::Double(x) => DatabaseValue::Real64(x),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
                .and_then(|date| {
                    date.and_hms_micro_opt(
                        u32::from(hour),
                        u32::from(minute),
                        u32::from(second),
                        micros,
                    )
                })
                .map_or_else(
                    || {
                        DatabaseValue::String(format!(
                            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
                        ))
                    },
                    DatabaseValue::DateTime,
                )
        }
        Value::Time(negative, days, hours, minutes, seconds, _micros) => {
            let hours = days * 24 + u32::from(hours);
            let sign = if negative { "-" } else { "" };
            DatabaseValue::String(format!("{sign}{hours:02}:{minutes:02}:{seconds:02}"))
        }
    }
}
