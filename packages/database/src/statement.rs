use std::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::{DatabaseError, DatabaseValue, ExecResult, Row, RowSet, driver::DriverStatement};

/// A compiled statement plus the coarse time it was last used.
///
/// Statements handed out by [`crate::StatementCache::prepare_once`] with `was_cached == true`
/// belong to the cache and must not be closed by the caller. Every other statement is closed
/// when its last owner drops it, or earlier through [`Statement::close`].
pub struct Statement {
    sql: String,
    raw: Box<dyn DriverStatement>,
    last_access: AtomicU64,
    closed: AtomicBool,
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("last_access", &self.last_access)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Statement {
    #[must_use]
    pub fn new(sql: impl Into<String>, raw: Box<dyn DriverStatement>) -> Self {
        Self {
            sql: sql.into(),
            raw,
            last_access: AtomicU64::new(tea_time::clock::secs()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        self.last_access
            .store(tea_time::clock::secs(), Ordering::Relaxed);
    }

    fn check_open(&self) -> Result<(), DatabaseError> {
        if self.is_closed() {
            return Err(DatabaseError::Closed);
        }
        self.touch();
        Ok(())
    }

    /// # Errors
    ///
    /// * [`DatabaseError::Closed`] if the statement was closed
    /// * If the backend fails to run the query or decode a row
    pub fn query(&self, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError> {
        self.check_open()?;
        log::trace!("query: {} with params: {params:?}", self.sql);
        self.raw.query(params)
    }

    /// First row of the result, if any.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::Closed`] if the statement was closed
    /// * If the backend fails to run the query or decode a row
    pub fn query_row(&self, params: &[DatabaseValue]) -> Result<Option<Row>, DatabaseError> {
        Ok(self.query(params)?.into_first())
    }

    /// First column of every row.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::Closed`] if the statement was closed
    /// * If the backend fails to run the query or decode a row
    pub fn query_col(&self, params: &[DatabaseValue]) -> Result<Vec<DatabaseValue>, DatabaseError> {
        Ok(self.query(params)?.into_column())
    }

    /// # Errors
    ///
    /// * [`DatabaseError::Closed`] if the statement was closed
    /// * If the backend fails to execute the statement
    pub fn exec(&self, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError> {
        self.check_open()?;
        log::trace!("exec: {} with params: {params:?}", self.sql);
        self.raw.exec(params)
    }

    /// Releases the backend handle. Only the first call reaches the backend.
    ///
    /// # Errors
    ///
    /// * If the backend fails to release the statement
    pub fn close(&self) -> Result<(), DatabaseError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.raw.close()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, secs: u64) {
        self.last_access
            .store(tea_time::clock::secs().saturating_sub(secs), Ordering::Relaxed);
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("drop: failed to close statement '{}': {e:?}", self.sql);
        }
    }
}
