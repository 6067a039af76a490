//! Prepared statement cache
//!
//! Statements are keyed by `"{scope}${sql}"`. Scope `0` is the connection itself; every other
//! scope is a transaction id. Transaction scopes keep a list of their keys so that ending a
//! transaction only touches its own statements. The connection scope has no list: its keys are
//! the ones that appear in no transaction list.
//!
//! Once the cache holds `cap` statements it purges entries that have not been used for
//! [`PurgePolicy::stale_after`], falling back to [`PurgePolicy::fallback_stale_after`] when the
//! first pass evicted less than [`PurgePolicy::min_ratio`] of the cache. If it is still full
//! the freshly compiled statement is handed to the caller uncached.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::{
    DatabaseError,
    driver::{DriverStatement, Preparer},
    statement::Statement,
};

/// Hard upper bound on cached statements per connection.
pub const MAX: usize = 32_768;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PurgePolicy {
    pub stale_after: Duration,
    pub fallback_stale_after: Duration,
    pub min_ratio: f64,
}

impl Default for PurgePolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(3600),
            fallback_stale_after: Duration::from_secs(1800),
            min_ratio: 0.01,
        }
    }
}

struct Entry {
    scope: u64,
    statement: Arc<Statement>,
}

#[derive(Default)]
struct CacheInner {
    statements: HashMap<String, Entry>,
    scopes: HashMap<u64, Vec<String>>,
}

impl CacheInner {
    fn evict_older_than(&mut self, now: u64, age: Duration) -> Vec<Arc<Statement>> {
        let age = age.as_secs();
        let stale = self
            .statements
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.statement.last_access()) > age)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        let mut scopes = BTreeSet::new();
        let mut evicted = Vec::with_capacity(stale.len());

        for key in &stale {
            if let Some(entry) = self.statements.remove(key) {
                if entry.scope > 0 {
                    scopes.insert(entry.scope);
                }
                evicted.push(entry.statement);
            }
        }

        for scope in scopes {
            let Some(keys) = self.scopes.get_mut(&scope) else {
                continue;
            };
            keys.retain(|key| self.statements.contains_key(key));
            if keys.is_empty() {
                self.scopes.remove(&scope);
            }
        }

        evicted
    }
}

pub struct StatementCache {
    inner: RwLock<CacheInner>,
    closed: AtomicBool,
    cap: AtomicUsize,
    policy: PurgePolicy,
}

impl std::fmt::Debug for StatementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCache")
            .field("len", &self.len())
            .field("cap", &self.cap())
            .field("closed", &self.is_closed())
            .field("policy", &self.policy)
            .finish()
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(MAX, PurgePolicy::default())
    }
}

impl StatementCache {
    #[must_use]
    pub fn new(cap: usize, policy: PurgePolicy) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            closed: AtomicBool::new(false),
            cap: AtomicUsize::new(cap.clamp(1, MAX)),
            policy,
        }
    }

    #[must_use]
    pub fn key(scope: u64, sql: &str) -> String {
        format!("{scope}${sql}")
    }

    #[must_use]
    pub fn cap(&self) -> usize {
        self.cap.load(Ordering::Relaxed)
    }

    pub fn set_cap(&self, cap: usize) {
        self.cap.store(cap.clamp(1, MAX), Ordering::Relaxed);
    }

    #[must_use]
    pub const fn policy(&self) -> PurgePolicy {
        self.policy
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .statements
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn contains(&self, scope: u64, sql: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .statements
            .contains_key(&Self::key(scope, sql))
    }

    /// Number of statements cached under `scope`.
    #[must_use]
    pub fn scope_len(&self, scope: u64) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if scope == 0 {
            inner.statements.values().filter(|x| x.scope == 0).count()
        } else {
            inner.scopes.get(&scope).map_or(0, Vec::len)
        }
    }

    fn ensure_open(&self) -> Result<(), DatabaseError> {
        if self.is_closed() {
            return Err(DatabaseError::Closed);
        }
        Ok(())
    }

    /// Compiles `sql`, purging and retrying once if the server ran out of statement slots.
    fn compile<P: Preparer + ?Sized>(
        &self,
        preparer: &P,
        sql: &str,
    ) -> Result<Box<dyn DriverStatement>, DatabaseError> {
        match preparer.prepare(sql) {
            Err(e) if e.is_too_many_statements() => {
                log::warn!("compile: server statement limit reached, purging and retrying: {e}");
                let evicted = {
                    let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
                    self.purge_locked(&mut inner)
                };
                close_evicted("compile", evicted);
                preparer.prepare(sql)
            }
            result => result,
        }
    }

    /// Compiles `sql` without caching it. The caller owns the returned statement.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::Closed`] if the cache was closed
    /// * If the backend fails to compile `sql`
    pub fn prepare<P: Preparer + ?Sized>(
        &self,
        preparer: &P,
        sql: &str,
    ) -> Result<Statement, DatabaseError> {
        self.ensure_open()?;
        log::trace!("prepare: {sql}");
        Ok(Statement::new(sql, self.compile(preparer, sql)?))
    }

    /// Returns the statement cached under `(scope, sql)`, compiling and caching it on a miss.
    ///
    /// The flag is `true` when the statement is owned by the cache. When it is `false` the
    /// cache was full and the caller owns the statement.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::Closed`] if the cache was closed
    /// * If the backend fails to compile `sql`
    pub fn prepare_once<P: Preparer + ?Sized>(
        &self,
        preparer: &P,
        sql: &str,
        scope: u64,
    ) -> Result<(Arc<Statement>, bool), DatabaseError> {
        self.ensure_open()?;
        let key = Self::key(scope, sql);

        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = inner.statements.get(&key) {
                entry.statement.touch();
                return Ok((entry.statement.clone(), true));
            }
        }

        let statement = Arc::new(Statement::new(sql, self.compile(preparer, sql)?));

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if self.is_closed() {
            return Err(DatabaseError::Closed);
        }

        if let Some(entry) = inner.statements.get(&key) {
            log::trace!("prepare_once: lost insertion race for scope={scope} sql={sql}");
            entry.statement.touch();
            let existing = entry.statement.clone();
            drop(inner);
            close_evicted("prepare_once", vec![statement]);
            return Ok((existing, true));
        }

        let mut evicted = vec![];
        let cap = self.cap();
        if inner.statements.len() >= cap {
            evicted = self.purge_locked(&mut inner);
        }

        let cached = inner.statements.len() < cap;
        if cached {
            log::trace!("prepare_once: caching scope={scope} sql={sql}");
            inner.statements.insert(
                key.clone(),
                Entry {
                    scope,
                    statement: statement.clone(),
                },
            );
            if scope > 0 {
                inner.scopes.entry(scope).or_default().push(key);
            }
        } else {
            log::warn!("prepare_once: statement cache full (cap={cap}), returning uncached");
        }
        drop(inner);

        close_evicted("prepare_once", evicted);

        Ok((statement, cached))
    }

    /// Evicts stale statements and returns how many were closed.
    pub fn purge(&self) -> usize {
        let evicted = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            self.purge_locked(&mut inner)
        };
        let count = evicted.len();
        close_evicted("purge", evicted);
        count
    }

    fn purge_locked(&self, inner: &mut CacheInner) -> Vec<Arc<Statement>> {
        let now = tea_time::clock::secs();
        let before = inner.statements.len();

        let mut evicted = inner.evict_older_than(now, self.policy.stale_after);

        #[allow(clippy::cast_precision_loss)]
        if (evicted.len() as f64) < before as f64 * self.policy.min_ratio {
            evicted.extend(inner.evict_older_than(now, self.policy.fallback_stale_after));
        }

        log::debug!(
            "purge: evicted {} of {before} statements",
            evicted.len()
        );

        evicted
    }

    /// Evicts and closes every statement cached under `scope`.
    ///
    /// # Errors
    ///
    /// * The first error returned while closing an evicted statement
    pub fn close_scope(&self, scope: u64) -> Result<(), DatabaseError> {
        let evicted = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if scope == 0 {
                let keys = inner
                    .statements
                    .iter()
                    .filter(|(_, entry)| entry.scope == 0)
                    .map(|(key, _)| key.clone())
                    .collect::<Vec<_>>();
                keys.iter()
                    .filter_map(|key| inner.statements.remove(key))
                    .map(|entry| entry.statement)
                    .collect::<Vec<_>>()
            } else {
                let keys = inner.scopes.remove(&scope).unwrap_or_default();
                keys.iter()
                    .filter_map(|key| inner.statements.remove(key))
                    .map(|entry| entry.statement)
                    .collect::<Vec<_>>()
            }
        };

        log::trace!("close_scope: scope={scope} evicting {}", evicted.len());

        close_evicted("close_scope", evicted).map_or(Ok(()), Err)
    }

    /// Marks the cache closed, then evicts and closes every statement. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// * The first error returned while closing an evicted statement
    pub fn close(&self) -> Result<(), DatabaseError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let evicted = {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            inner.scopes.clear();
            inner
                .statements
                .drain()
                .map(|(_, entry)| entry.statement)
                .collect::<Vec<_>>()
        };

        log::debug!("close: closing {} cached statements", evicted.len());

        close_evicted("close", evicted).map_or(Ok(()), Err)
    }
}

/// Closes evicted statements, logging every failure and returning the first one.
fn close_evicted(context: &str, statements: Vec<Arc<Statement>>) -> Option<DatabaseError> {
    let mut first_error = None;

    for statement in statements {
        if let Err(e) = statement.close() {
            log::error!(
                "{context}: failed to close evicted statement '{}': {e:?}",
                statement.sql()
            );
            first_error.get_or_insert(e);
        }
    }

    first_error
}
