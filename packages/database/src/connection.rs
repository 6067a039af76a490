//! Connection handles
//!
//! A [`Connection`] owns the pool for one logical database id, the statement cache shared by
//! everything that runs on it, and the table prefix DAOs apply. Handles returned by
//! [`instance`] are cached for the life of the process; [`shutdown`] closes them all.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc, LazyLock, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    DatabaseError, DatabaseValue, ExecResult, Row, RowSet,
    cache::{self, PurgePolicy, StatementCache},
    config::{self, DbConfig},
    driver::{Dialect, Driver},
    schema::{self, Function, Table},
    statement::Statement,
    transaction::Transaction,
};

/// Something SQL can run on: a [`Connection`] or a [`Transaction`].
pub trait Executor: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn table_prefix(&self) -> &str;

    /// Statement cache scope, `0` for a connection and the transaction id otherwise.
    fn scope(&self) -> u64;

    fn cache(&self) -> &StatementCache;

    /// Compiles `sql` without caching it.
    ///
    /// # Errors
    ///
    /// * If the statement cache is closed or compilation fails
    fn prepare(&self, sql: &str) -> Result<Statement, DatabaseError>;

    /// Compiles `sql` once per scope. See [`StatementCache::prepare_once`].
    ///
    /// # Errors
    ///
    /// * If the statement cache is closed or compilation fails
    fn prepare_once(&self, sql: &str) -> Result<(Arc<Statement>, bool), DatabaseError>;

    /// Runs `sql` without preparing it.
    ///
    /// # Errors
    ///
    /// * If the database fails to execute `sql`
    fn exec(&self, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError>;

    /// Runs a row-returning `sql` without preparing it.
    ///
    /// # Errors
    ///
    /// * If the database fails to execute `sql` or decode a row
    fn query(&self, sql: &str, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError>;

    /// # Errors
    ///
    /// * If preparing or running `sql` fails
    fn find_ones(&self, sql: &str, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError> {
        self.prepare(sql)?.query(params)
    }

    /// # Errors
    ///
    /// * If preparing or running `sql` fails
    fn find_one(&self, sql: &str, params: &[DatabaseValue]) -> Result<Option<Row>, DatabaseError> {
        self.prepare(sql)?.query_row(params)
    }

    /// # Errors
    ///
    /// * If preparing or running `sql` fails
    fn find_col(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<Vec<DatabaseValue>, DatabaseError> {
        self.prepare(sql)?.query_col(params)
    }

    /// Like [`Executor::find_ones`] but through the statement cache.
    ///
    /// # Errors
    ///
    /// * If preparing or running `sql` fails
    fn find_prepared_ones(
        &self,
        sql: &str,
        params: &[DatabaseValue],
    ) -> Result<RowSet, DatabaseError> {
        let (statement, _) = self.prepare_once(sql)?;
        statement.query(params)
    }
}

pub struct Connection {
    id: String,
    driver_name: String,
    driver: Box<dyn Driver>,
    cache: Arc<StatementCache>,
    prefix: String,
    config: Option<DbConfig>,
    closed: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("driver", &self.driver_name)
            .field("prefix", &self.prefix)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

static INSTANCES: LazyLock<Mutex<BTreeMap<String, Arc<Connection>>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));

/// Shared handle for database `id`, opening it on first use. `""` means the default database.
///
/// # Errors
///
/// * If the configuration is missing or invalid
/// * [`DatabaseError::UnknownDatabase`] if `id` is not configured
/// * If the pool fails to open
pub fn instance(id: &str) -> Result<Arc<Connection>, DatabaseError> {
    let config = config::get()?;
    let id = config.resolve_id(id)?;

    let mut instances = INSTANCES.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(connection) = instances.get(id) {
        return Ok(connection.clone());
    }

    let db = config
        .db(id)
        .ok_or_else(|| DatabaseError::UnknownDatabase(id.to_string()))?;
    let connection = Arc::new(Connection::open(id, db, config.prefix_for(id))?);
    instances.insert(id.to_string(), connection.clone());
    drop(instances);

    Ok(connection)
}

/// Caches `connection` as the shared handle for its id, replacing any previous one.
pub fn register_instance(connection: Connection) -> Arc<Connection> {
    let connection = Arc::new(connection);
    INSTANCES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(connection.id.clone(), connection.clone());
    connection
}

/// A handle for `id` that is not shared through [`instance`].
///
/// # Errors
///
/// * If the configuration is missing or invalid
/// * [`DatabaseError::UnknownDatabase`] if `id` is not configured
/// * If the pool fails to open
pub fn new_instance(id: &str) -> Result<Connection, DatabaseError> {
    let config = config::get()?;
    let id = config.resolve_id(id)?;
    let db = config
        .db(id)
        .ok_or_else(|| DatabaseError::UnknownDatabase(id.to_string()))?;

    Connection::open(id, db, config.prefix_for(id))
}

/// A handle built from an explicit database entry, bypassing the configuration file.
///
/// # Errors
///
/// * If the pool fails to open
pub fn new_instance_from_config(id: &str, db: &DbConfig) -> Result<Connection, DatabaseError> {
    Connection::open(id, db, db.prefix.clone().unwrap_or_default())
}

/// Closes every cached handle: statement cache first, then pool.
///
/// # Errors
///
/// * The first error any handle reported while closing
pub fn shutdown() -> Result<(), DatabaseError> {
    let instances = std::mem::take(&mut *INSTANCES.lock().unwrap_or_else(PoisonError::into_inner));
    let mut first_error = None;

    for (id, connection) in instances {
        log::debug!("shutdown: closing database '{id}'");
        if let Err(e) = connection.close() {
            log::warn!("shutdown: failed to close database '{id}': {e:?}");
            first_error.get_or_insert(e);
        }
    }

    first_error.map_or(Ok(()), Err)
}

impl Connection {
    fn open(id: &str, db: &DbConfig, prefix: String) -> Result<Self, DatabaseError> {
        let connections = db.connections.resolve()?;
        let policy = db.statements.purge_policy()?;

        log::debug!("open: database '{id}' driver={}", db.driver);

        let driver: Box<dyn Driver> = match Dialect::from_driver(&db.driver) {
            #[cfg(feature = "mysql")]
            Dialect::Mysql => Box::new(crate::mysql::MysqlDatabase::open(&db.dsn, &connections)?),
            #[cfg(feature = "sqlite-rusqlite")]
            Dialect::Sqlite => Box::new(crate::rusqlite::RusqliteDatabase::open(
                &db.dsn,
                connections.max,
            )?),
            _ => return Err(DatabaseError::UnsupportedDriver(db.driver.clone())),
        };

        let mut connection =
            Self::from_driver(id, &db.driver, driver, prefix, policy, db.statements.max());
        connection.config = Some(db.clone());
        Ok(connection)
    }

    /// Wraps an already opened driver, sizing the statement cache from the server's limit.
    #[must_use]
    pub fn from_driver(
        id: &str,
        driver_name: &str,
        driver: Box<dyn Driver>,
        prefix: String,
        policy: PurgePolicy,
        max_statements: usize,
    ) -> Self {
        let connection = Self {
            id: id.to_string(),
            driver_name: driver_name.to_string(),
            driver,
            cache: Arc::new(StatementCache::new(max_statements, policy)),
            prefix,
            config: None,
            closed: AtomicBool::new(false),
        };

        match connection.statement_capacity() {
            Ok(Some(server_max)) => {
                let cap = usize::try_from(server_max / 16)
                    .unwrap_or(cache::MAX)
                    .min(max_statements);
                log::debug!(
                    "from_driver: database '{id}' max_prepared_stmt_count={server_max} cache cap={cap}"
                );
                connection.cache.set_cap(cap);
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("from_driver: failed to read statement capacity of '{id}': {e:?}");
            }
        }

        connection
    }

    fn statement_capacity(&self) -> Result<Option<u64>, DatabaseError> {
        match self.dialect() {
            Dialect::Mysql => schema::mysql::max_prepared_stmt_count(self),
            _ => Ok(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Entry this handle was opened from, if it came from configuration.
    #[must_use]
    pub const fn config(&self) -> Option<&DbConfig> {
        self.config.as_ref()
    }

    #[must_use]
    pub const fn statement_cache(&self) -> &Arc<StatementCache> {
        &self.cache
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// # Errors
    ///
    /// * If the handle is closed
    /// * If the driver fails to begin a transaction
    pub fn begin(&self) -> Result<Transaction, DatabaseError> {
        if self.is_closed() {
            return Err(DatabaseError::Closed);
        }

        Ok(Transaction::new(
            self.driver.begin()?,
            self.cache.clone(),
            self.dialect(),
            self.prefix.clone(),
        ))
    }

    /// Runs `f` in a transaction, committing when it succeeds and rolling back when it fails.
    ///
    /// # Errors
    ///
    /// * If beginning or committing fails
    /// * Whatever `f` returns
    pub fn run_tx<T, E: From<DatabaseError>>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, E>,
    ) -> Result<T, E> {
        let tx = self.begin()?;

        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    log::warn!("run_tx: rollback of transaction id={} failed: {rollback:?}", tx.id());
                }
                Err(e)
            }
        }
    }

    /// Closes the statement cache, then the pool. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// * If closing a cached statement or the pool fails
    pub fn close(&self) -> Result<(), DatabaseError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let cache_result = self.cache.close();
        let driver_result = self.driver.close();
        cache_result.and(driver_result)
    }

    /// Table names of the current schema.
    ///
    /// # Errors
    ///
    /// * If the dialect has no introspection support
    /// * If the metadata query fails
    pub fn table_names(&self) -> Result<Vec<String>, DatabaseError> {
        match self.dialect() {
            Dialect::Mysql => schema::mysql::table_names(self),
            Dialect::Sqlite => schema::sqlite::table_names(self),
            other => Err(unsupported(other)),
        }
    }

    /// Basic table attributes and fields. `None` if the table does not exist.
    ///
    /// # Errors
    ///
    /// * If the dialect has no introspection support
    /// * If a metadata query fails
    pub fn find_table(&self, name: &str) -> Result<Option<Table>, DatabaseError> {
        match self.dialect() {
            Dialect::Mysql => schema::mysql::find_table(self, name),
            Dialect::Sqlite => schema::sqlite::find_table(self, name),
            other => Err(unsupported(other)),
        }
    }

    /// Like [`Connection::find_table`], plus partitions, indexes and the creation DDL.
    ///
    /// # Errors
    ///
    /// * If the dialect has no introspection support
    /// * If a metadata query fails
    pub fn find_full_table(&self, name: &str) -> Result<Option<Table>, DatabaseError> {
        match self.dialect() {
            Dialect::Mysql => schema::mysql::find_full_table(self, name),
            Dialect::Sqlite => schema::sqlite::find_full_table(self, name),
            other => Err(unsupported(other)),
        }
    }

    /// Stored functions of the current schema.
    ///
    /// # Errors
    ///
    /// * If the dialect has no introspection support
    /// * If listing the functions fails
    pub fn find_functions(&self) -> Result<Vec<Function>, DatabaseError> {
        match self.dialect() {
            Dialect::Mysql => schema::mysql::find_functions(self),
            Dialect::Sqlite => Ok(vec![]),
            other => Err(unsupported(other)),
        }
    }
}

fn unsupported(dialect: Dialect) -> DatabaseError {
    DatabaseError::Unsupported(format!("schema introspection for {dialect}"))
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("drop: failed to close database '{}': {e:?}", self.id);
        }
    }
}

impl Executor for Connection {
    fn dialect(&self) -> Dialect {
        self.driver.dialect()
    }

    fn table_prefix(&self) -> &str {
        &self.prefix
    }

    fn scope(&self) -> u64 {
        0
    }

    fn cache(&self) -> &StatementCache {
        &self.cache
    }

    fn prepare(&self, sql: &str) -> Result<Statement, DatabaseError> {
        self.cache.prepare(&*self.driver, sql)
    }

    fn prepare_once(&self, sql: &str) -> Result<(Arc<Statement>, bool), DatabaseError> {
        self.cache.prepare_once(&*self.driver, sql, 0)
    }

    fn exec(&self, sql: &str, params: &[DatabaseValue]) -> Result<ExecResult, DatabaseError> {
        if self.is_closed() {
            return Err(DatabaseError::Closed);
        }
        self.driver.exec(sql, params)
    }

    fn query(&self, sql: &str, params: &[DatabaseValue]) -> Result<RowSet, DatabaseError> {
        if self.is_closed() {
            return Err(DatabaseError::Closed);
        }
        self.driver.query(sql, params)
    }
}
