//! Private in-memory databases for tests and simulations.
//!
//! Every call opens a fresh shared-cache `SQLite` database, so connections built here never see
//! each other's tables.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::UNIX_EPOCH,
};

use crate::{
    DatabaseError,
    cache::{self, PurgePolicy},
    connection::Connection,
    rusqlite::RusqliteDatabase,
};

/// Pooled connections per simulated database
pub const CONNECTIONS: usize = 5;

/// # Errors
///
/// * If the database connection fails to open in memory
pub fn connection() -> Result<Connection, DatabaseError> {
    connection_with_prefix("")
}

/// A fresh database whose DAOs use `prefix` in front of every table name.
///
/// # Errors
///
/// * If the database connection fails to open in memory
pub fn connection_with_prefix(prefix: &str) -> Result<Connection, DatabaseError> {
    static ID: AtomicU64 = AtomicU64::new(0);

    let id = ID.fetch_add(1, Ordering::Relaxed);
    let timestamp = tea_time::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |x| x.as_nanos());
    let dsn = format!("file:tea_memdb_{id}_{timestamp}?mode=memory&cache=shared");

    log::trace!("connection: opening simulated database {dsn}");

    let driver = RusqliteDatabase::open(&dsn, CONNECTIONS)?;

    Ok(Connection::from_driver(
        &format!("simulator_{id}"),
        "simulator",
        Box::new(driver),
        prefix.to_string(),
        PurgePolicy::default(),
        cache::MAX,
    ))
}
