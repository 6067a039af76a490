use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::{
    DatabaseError, DatabaseValue, ExecResult, RowSet,
    cache::StatementCache,
    connection::Executor,
    driver::{Dialect, DriverTransaction},
    statement::Statement,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A database transaction.
///
/// Statements prepared with [`Executor::prepare_once`] are cached under the transaction id and
/// evicted when the transaction ends. [`Transaction::commit`] and [`Transaction::rollback`] are
/// idempotent: only the first of them reaches the database. A transaction dropped while still
/// active is rolled back.
pub struct Transaction {
    id: u64,
    raw: Box<dyn DriverTransaction>,
    cache: Arc<StatementCache>,
    dialect: Dialect,
    prefix: String,
    done: AtomicBool,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("dialect", &self.dialect)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    pub(crate) fn new(
        raw: Box<dyn DriverTransaction>,
        cache: Arc<StatementCache>,
        dialect: Dialect,
        prefix: String,
    ) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!("begin: transaction id={id}");

        Self {
            id,
            raw,
            cache,
            dialect,
            prefix,
            done: AtomicBool::new(false),
        }
    }

    /// Scope id used for statement caching. Never `0`.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn ensure_active(&self) -> Result<(), DatabaseError> {
        if self.is_done() {
            return Err(DatabaseError::TransactionDone);
        }
        Ok(())
    }

    /// Commits, rolling back if the commit fails.
    ///
    /// # Errors
    ///
    /// * If the database fails to commit
    pub fn commit(&self) -> Result<(), DatabaseError> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        log::debug!("commit: transaction id={}", self.id);

        let result = self.raw.commit();
        if let Err(e) = &result {
            log::debug!("commit: transaction id={} failed, rolling back: {e:?}", self.id);
            if let Err(e) = self.raw.rollback() {
                log::debug!("commit: rollback after failed commit failed: {e:?}");
            }
        }

        self.evict("commit");
        result
    }

    /// # Errors
    ///
    /// * If the database fails to roll back
    pub fn rollback(&self) -> Result<(), DatabaseError> {
        if self.done.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        log::debug!("rollback: transaction id={}", self.id);

        let result = self.raw.rollback();
        self.evict("rollback");
        result
    }

    fn evict(&self, context: &str) {
        if let Err(e) = self.cache.close_scope(self.id) {
            log::warn!(
                "{context}: failed to evict statements of transaction id={}: {e:?}",
                self.id
            );
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.is_done() {
            log::warn!("drop: transaction id={} was never finished, rolling back", self.id);
            if let Err(e) = self.rollback() {
                log::warn!("drop: rollback of transaction id={} failed: {e:?}", self.id);
            }
        }
    }
}

impl Executor for Transaction {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn table_prefix(&self) -> &str {
        &self.prefix
    }

    fn scope(&self) -> u64 {
        self.id
    }

    fn cache(&self) -> &StatementCache {
        &self.cache
    }

    fn prepare(&self, sql: &str) -> Result<Statement, DatabaseError> {
        self.ensure_active()?;
        self.cache.prepare(&*self.raw, sql)
    }

    fn prepare_once(&self, sql: &str) -> Result<(Arc<Statement>, bool), DatabaseError> {
        self.ensure_active()?;
        self.cache.prepare_once(&*self.raw, sql, self.id)
    }

    fn exec(&self, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError> {
        self.ensure_active()?;
        self.raw.exec(sql, params)
    }

    fn query(&self, sql: &str, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError> {
        self.ensure_active()?;
        self.raw.query(sql, params)
    }
}
