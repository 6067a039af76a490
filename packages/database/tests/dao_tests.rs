#![cfg(feature = "simulator")]

mod common;

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use tea_database::{Dao, DatabaseValue, Dialect, Executor as _, Query};

use common::{Captured, Post, User};

fn capture(dao: &mut Dao<User>) -> Captured {
    let captured: Captured = Arc::new(Mutex::new(vec![]));

    let log = captured.clone();
    dao.on_insert(move |m| {
        log.lock()
            .unwrap()
            .push((m.sql.to_string(), m.params.to_vec()));
        Ok(())
    });
    let log = captured.clone();
    dao.on_update(move |m| {
        log.lock()
            .unwrap()
            .push((m.sql.to_string(), m.params.to_vec()));
        Ok(())
    });

    captured
}

#[test_log::test]
fn save_inserts_set_fields_and_assigns_the_generated_id() {
    let mut dao = Dao::<User>::new(common::database().unwrap()).unwrap();
    let captured = capture(&mut dao);

    let mut lily = User {
        name: "Lily".to_string(),
        ..Default::default()
    };
    dao.save(&mut lily).unwrap();

    assert_eq!(lily.id, 1);
    assert!(lily.created_at > 0);

    let captured = captured.lock().unwrap();
    assert_eq!(captured.len(), 1);
    assert_eq!(
        captured[0].0,
        r#"INSERT INTO "users" ("name","created_at") VALUES (?,?)"#
    );
    assert_eq!(
        captured[0].1,
        vec![
            DatabaseValue::String("Lily".to_string()),
            DatabaseValue::Int64(lily.created_at),
        ]
    );
    drop(captured);

    let stored = dao.get(1).unwrap();
    assert_eq!(stored, User {
        state: 1,
        ..lily
    });
}

#[test_log::test]
fn save_updates_by_primary_key_without_touching_created_at() {
    let mut dao = Dao::<User>::new(common::database().unwrap()).unwrap();
    dao.connection()
        .exec(
            "INSERT INTO users (id, name, created_at) VALUES (42, 'Lily', 1000)",
            &[],
        )
        .unwrap();
    let captured = capture(&mut dao);

    let mut renamed = User {
        id: 42,
        name: "Lily2".to_string(),
        ..Default::default()
    };
    let result = dao.save(&mut renamed).unwrap();

    assert_eq!(result.rows_affected, 1);
    let captured = captured.lock().unwrap();
    assert_eq!(
        captured[0].0,
        r#"UPDATE "users" SET "name"=?,"updated_at"=? WHERE "id"=?"#
    );
    assert_eq!(
        captured[0].1,
        vec![
            DatabaseValue::String("Lily2".to_string()),
            DatabaseValue::Int64(renamed.updated_at),
            DatabaseValue::UInt64(42),
        ]
    );
    drop(captured);

    let stored = dao.get(42).unwrap();
    assert_eq!(stored.name, "Lily2");
    assert_eq!(stored.created_at, 1000);
    assert_eq!(stored.updated_at, renamed.updated_at);
}

#[test_log::test]
fn query_round_trip_binds_in_placeholder_order() {
    let compiled = Query::new()
        .dialect(Dialect::Mysql)
        .table("users")
        .result(["id", "name"])
        .attr("state", 1)
        .where_clause("age>:a")
        .param("a", 18)
        .desc("id")
        .limit(10)
        .to_sql()
        .unwrap();

    assert_eq!(
        compiled.sql,
        "SELECT `id`,`name` FROM `users` WHERE `state`=? AND age>? ORDER BY `id` DESC LIMIT ?"
    );
    assert_eq!(
        compiled.params,
        vec![
            DatabaseValue::Int64(1),
            DatabaseValue::Int64(18),
            DatabaseValue::UInt64(10),
        ]
    );
}

#[test_log::test]
fn round_trip_query_selects_the_expected_rows() {
    let dao = Dao::<User>::new(common::database().unwrap()).unwrap();
    for (name, age, state) in [("ann", 30, 1), ("bo", 12, 1), ("cy", 45, 2), ("di", 19, 1)] {
        let mut user = User {
            name: name.to_string(),
            age,
            state,
            ..Default::default()
        };
        dao.save(&mut user).unwrap();
    }

    let names = dao
        .query()
        .result(["id", "name"])
        .attr("state", 1)
        .where_clause("age>:a")
        .param("a", 18)
        .desc("id")
        .limit(10)
        .find_all::<User>()
        .unwrap()
        .into_iter()
        .map(|x| x.name)
        .collect::<Vec<_>>();

    assert_eq!(names, vec!["di".to_string(), "ann".to_string()]);
}

#[test_log::test]
fn model_references_resolve_across_joined_daos() {
    let connection = common::database().unwrap();
    let users = Dao::<User>::new(connection.clone()).unwrap();
    let posts = Dao::<Post>::new(connection).unwrap();

    for (name, age) in [("ann", 30), ("bo", 12)] {
        let mut user = User {
            name: name.to_string(),
            age,
            ..Default::default()
        };
        users.save(&mut user).unwrap();
        for title in ["first", "second"] {
            let mut post = Post {
                user_id: user.id,
                title: format!("{name} {title}"),
                ..Default::default()
            };
            posts.save(&mut post).unwrap();
        }
    }

    let titles = posts
        .query()
        .result(["title"])
        .join(users.view(), "Post.user_id=User.id")
        .where_args("User.age>?", [18])
        .asc("title")
        .find_col()
        .unwrap();

    assert_eq!(
        titles,
        vec![
            DatabaseValue::String("ann first".to_string()),
            DatabaseValue::String("ann second".to_string()),
        ]
    );
}

#[test_log::test]
fn find_all_pages_through_rows() {
    let dao = Dao::<User>::new(common::database().unwrap()).unwrap();
    for i in 0..7 {
        let mut user = User {
            name: format!("user{i}"),
            age: i,
            ..Default::default()
        };
        dao.save(&mut user).unwrap();
    }

    let mut page: Vec<User> = vec![];
    let found = dao
        .query()
        .asc("id")
        .limit(3)
        .offset(3)
        .find_all_into(&mut page)
        .unwrap();

    assert_eq!(found, 3);
    assert_eq!(
        page.iter().map(|x| x.age).collect::<Vec<_>>(),
        vec![3, 4, 5]
    );
    assert_eq!(dao.query().gte("age", 5).count().unwrap(), 2);
    assert!(dao.query().attr("name", "user6").exist().unwrap());
}

#[test_log::test]
fn counters_increase_in_place() {
    let dao = Dao::<User>::new(common::database().unwrap()).unwrap();
    let mut user = User {
        name: "ann".to_string(),
        age: 30,
        ..Default::default()
    };
    dao.save(&mut user).unwrap();

    dao.query()
        .attr("id", user.id)
        .increase("age", 2)
        .update()
        .unwrap();

    assert_eq!(dao.get(user.id).unwrap().age, 32);
}
