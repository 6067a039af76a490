#![cfg(feature = "simulator")]

mod common;

use pretty_assertions::assert_eq;
use tea_database::{Dao, DatabaseError, Executor as _, Query};

use common::User;

#[test_log::test]
fn prepare_once_reuses_cached_statements() {
    let connection = common::database().unwrap();

    let (first, cached) = connection.prepare_once("SELECT 1").unwrap();
    assert!(cached);
    let (second, cached) = connection.prepare_once("SELECT 1").unwrap();
    assert!(cached);
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(connection.statement_cache().len(), 1);
}

#[test_log::test]
fn run_tx_evicts_statements_of_the_transaction_scope() {
    let connection = common::database().unwrap();
    connection
        .exec("CREATE TABLE t (v INTEGER NOT NULL)", &[])
        .unwrap();
    connection.exec("INSERT INTO t (v) VALUES (1)", &[]).unwrap();
    connection.prepare_once("SELECT v FROM t").unwrap();
    let before = connection.statement_cache().len();

    let scope = connection
        .run_tx(|tx| {
            let (statement, _) = tx.prepare_once("UPDATE t SET v=v+1")?;
            statement.exec(&[])?;

            assert!(
                connection
                    .statement_cache()
                    .contains(tx.id(), "UPDATE t SET v=v+1")
            );
            assert_eq!(connection.statement_cache().len(), before + 1);
            Ok::<_, DatabaseError>(tx.id())
        })
        .unwrap();

    assert!(
        !connection
            .statement_cache()
            .contains(scope, "UPDATE t SET v=v+1")
    );
    assert_eq!(connection.statement_cache().len(), before);
    assert_eq!(
        connection
            .find_col("SELECT v FROM t", &[])
            .unwrap()
            .into_iter()
            .map(|x| x.as_i64())
            .collect::<Vec<_>>(),
        vec![Some(2)]
    );
}

#[test_log::test]
fn run_tx_rolls_back_when_the_callback_fails() {
    let connection = common::database().unwrap();
    let dao = Dao::<User>::new(connection.clone()).unwrap();

    let result = connection.run_tx(|tx| {
        let mut user = User {
            name: "ghost".to_string(),
            ..Default::default()
        };
        dao.save_in_tx(tx, &mut user)?;
        assert_eq!(Query::new().in_tx(tx).table("users").count()?, 1);
        Err::<(), _>(DatabaseError::Hook("abort".to_string()))
    });

    assert!(matches!(result, Err(DatabaseError::Hook(_))));
    assert_eq!(dao.query().count().unwrap(), 0);
}

#[test_log::test]
fn connection_calls_never_join_an_open_transaction() {
    let connection = common::database().unwrap();
    let tx = connection.begin().unwrap();
    tx.exec("INSERT INTO users (name) VALUES ('pending')", &[])
        .unwrap();

    let outside = (0..5)
        .filter(|_| {
            connection
                .exec("INSERT INTO users (name) VALUES ('outside')", &[])
                .is_ok()
        })
        .count();

    tx.rollback().unwrap();

    assert!(
        connection
            .find_col("SELECT name FROM users WHERE name='pending'", &[])
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        Query::with(&*connection).table("users").count().unwrap(),
        i64::try_from(outside).unwrap()
    );
}

#[test_log::test]
fn finished_transactions_reject_statements() {
    let connection = common::database().unwrap();
    let tx = connection.begin().unwrap();

    tx.commit().unwrap();
    tx.commit().unwrap();
    tx.rollback().unwrap();

    assert!(tx.is_done());
    assert!(matches!(
        tx.exec("DELETE FROM users", &[]),
        Err(DatabaseError::TransactionDone)
    ));
}

#[test_log::test]
fn closed_connections_refuse_new_work() {
    let connection = common::database().unwrap();
    connection.prepare_once("SELECT 1").unwrap();

    connection.close().unwrap();
    connection.close().unwrap();

    assert!(connection.is_closed());
    assert!(connection.statement_cache().is_empty());
    assert!(matches!(connection.begin(), Err(DatabaseError::Closed)));
}
