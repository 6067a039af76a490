#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tea_database::{Connection, DatabaseError, Executor as _, Model, impl_record, simulator};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub age: u32,
    pub state: i8,
    pub created_at: i64,
    pub updated_at: i64,
}

impl_record!(User {
    id: u64,
    name: String,
    age: u32,
    state: i8,
    created_at: i64,
    updated_at: i64,
});

impl Model for User {
    const TABLE: &'static str = "users";
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: u64,
    pub user_id: u64,
    pub title: String,
}

impl_record!(Post {
    id: u64,
    user_id: u64,
    title: String,
});

impl Model for Post {
    const TABLE: &'static str = "posts";
}

/// Simulated database with `users` and `posts` tables.
pub fn database() -> Result<Arc<Connection>, DatabaseError> {
    let connection = simulator::connection()?;
    connection.exec(
        "CREATE TABLE users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name VARCHAR(64) NOT NULL DEFAULT '',
            age INT UNSIGNED NOT NULL DEFAULT 0,
            state TINYINT NOT NULL DEFAULT 1,
            created_at BIGINT NOT NULL DEFAULT 0,
            updated_at BIGINT NOT NULL DEFAULT 0
        )",
        &[],
    )?;
    connection.exec("CREATE INDEX idx_users_state ON users (state)", &[])?;
    connection.exec(
        "CREATE TABLE posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            title VARCHAR(128) NOT NULL
        )",
        &[],
    )?;
    Ok(Arc::new(connection))
}

/// Every statement a hook saw, as `(sql, params)`.
pub type Captured = Arc<Mutex<Vec<(String, Vec<tea_database::DatabaseValue>)>>>;
