//! `SQLite` introspection through `sqlite_master` and the `table_info`/`index_list`/`index_info`
//! pragmas. `SQLite` has no stored functions and no partitions.

use crate::{
    DatabaseError, DatabaseValue, Row,
    connection::Executor,
    schema::{Field, Index, Table, unquote},
};

const SCHEMA: &str = "main";
const ENGINE: &str = "sqlite";

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// # Errors
///
/// * If the query fails
pub fn table_names(exec: &dyn Executor) -> Result<Vec<String>, DatabaseError> {
    Ok(exec
        .query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            &[],
        )?
        .into_column()
        .iter()
        .filter_map(DatabaseValue::to_text)
        .collect())
}

/// # Errors
///
/// * If a metadata query fails
pub fn find_table(exec: &dyn Executor, name: &str) -> Result<Option<Table>, DatabaseError> {
    let Some(row) = exec
        .query(
            "SELECT name, sql FROM sqlite_master WHERE type='table' AND name=?",
            &[name.into()],
        )?
        .into_first()
    else {
        return Ok(None);
    };

    let columns = exec.query(&format!("PRAGMA table_info({})", quote(name)), &[])?;
    let fields = columns.iter().map(parse_field).collect::<Vec<_>>();
    let single_integer_pk = fields.iter().filter(|x| x.primary).count() == 1;

    Ok(Some(Table {
        name: row.text("name").unwrap_or_default(),
        schema: SCHEMA.to_string(),
        fields: fields
            .into_iter()
            .map(|mut field| {
                if single_integer_pk
                    && field.primary
                    && field.full_type.eq_ignore_ascii_case("INTEGER")
                {
                    field.auto_increment = true;
                }
                field
            })
            .collect(),
        engine: ENGINE.to_string(),
        ddl: row.text("sql").unwrap_or_default(),
        ..Default::default()
    }))
}

/// # Errors
///
/// * If a metadata query fails
pub fn find_full_table(exec: &dyn Executor, name: &str) -> Result<Option<Table>, DatabaseError> {
    let Some(mut table) = find_table(exec, name)? else {
        return Ok(None);
    };

    let mut indexes = vec![];
    for row in &exec.query(&format!("PRAGMA index_list({})", quote(name)), &[])? {
        let raw_name = row.text("name").unwrap_or_default();
        let columns = exec
            .query(&format!("PRAGMA index_info({})", quote(&raw_name)), &[])?
            .iter()
            .filter_map(|x| x.text("name"))
            .collect();

        indexes.push(parse_index(row, columns));
    }

    if !indexes.iter().any(Index::is_primary) {
        let primary = table
            .primary_key()
            .map(|x| x.name.clone())
            .collect::<Vec<_>>();
        if !primary.is_empty() {
            indexes.insert(
                0,
                Index {
                    name: "PRIMARY".to_string(),
                    unique: true,
                    columns: primary,
                    ..Default::default()
                },
            );
        }
    }

    table.indexes = indexes;
    Ok(Some(table))
}

/// One `PRAGMA table_info` row.
fn parse_field(row: &Row) -> Field {
    let mut field = Field::parse(
        row.text("name").unwrap_or_default(),
        row.text("type").unwrap_or_default(),
        false,
    );

    field.nullable = !flag(row, "notnull");
    field.primary = row
        .get_ignore_case("pk")
        .and_then(DatabaseValue::as_i64)
        .is_some_and(|x| x > 0);
    if field.primary {
        field.nullable = false;
    }
    field.set_default(
        row.text("dflt_value")
            .filter(|x| !x.eq_ignore_ascii_case("NULL"))
            .map(|x| unquote(&x)),
    );

    field
}

/// One `PRAGMA index_list` row plus its ordered columns.
fn parse_index(row: &Row, columns: Vec<String>) -> Index {
    let primary = row.text("origin").is_some_and(|x| x == "pk");

    Index {
        name: if primary {
            "PRIMARY".to_string()
        } else {
            row.text("name").unwrap_or_default()
        },
        unique: primary || flag(row, "unique"),
        columns,
        ..Default::default()
    }
}

fn flag(row: &Row, column: &str) -> bool {
    row.get_ignore_case(column)
        .and_then(DatabaseValue::as_bool)
        .unwrap_or_default()
}

#[cfg(all(test, feature = "simulator"))]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::{
        DatabaseValue, Executor as _,
        kind::{ValueClass, ValueKind},
        simulator,
    };

    fn connection() -> crate::Connection {
        let connection = simulator::connection().unwrap();
        connection
            .exec(
                "CREATE TABLE users (
                    id INTEGER PRIMARY KEY,
                    name VARCHAR(64) NOT NULL DEFAULT '',
                    state TINYINT DEFAULT 1,
                    created_at DATETIME
                )",
                &[],
            )
            .unwrap();
        connection
            .exec("CREATE UNIQUE INDEX idx_users_name ON users (name)", &[])
            .unwrap();
        connection
    }

    #[test_log::test]
    fn lists_user_tables() {
        let connection = connection();
        connection
            .exec("CREATE TABLE accounts (id INTEGER PRIMARY KEY)", &[])
            .unwrap();

        assert_eq!(
            connection.table_names().unwrap(),
            vec!["accounts".to_string(), "users".to_string()]
        );
    }

    #[test_log::test]
    fn missing_table_is_none() {
        let connection = connection();
        assert_eq!(connection.find_table("nope").unwrap(), None);
        assert_eq!(connection.find_full_table("nope").unwrap(), None);
    }

    #[test_log::test]
    fn reads_fields() {
        let table = connection().find_table("users").unwrap().unwrap();

        assert_eq!(table.name, "users");
        assert_eq!(table.schema, "main");
        assert_eq!(table.engine, "sqlite");
        assert!(table.ddl.starts_with("CREATE TABLE users"));

        let names = table.fields.iter().map(|x| x.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["id", "name", "state", "created_at"]);

        let id = table.field("id").unwrap();
        assert!(id.primary);
        assert!(id.auto_increment);
        assert_eq!(id.kind, ValueKind::Int64);

        let name = table.field("name").unwrap();
        assert!(!name.nullable);
        assert_eq!(name.default.as_deref(), Some(""));
        assert_eq!(name.class, ValueClass::String);

        let state = table.field("state").unwrap();
        assert_eq!(state.default_value, DatabaseValue::Int64(1));

        assert_eq!(table.field("created_at").unwrap().class, ValueClass::Time);
    }

    #[test_log::test]
    fn reads_indexes_with_primary_key() {
        let table = connection().find_full_table("users").unwrap().unwrap();

        let primary = table.index("PRIMARY").unwrap();
        assert_eq!(primary.columns, vec!["id".to_string()]);
        assert!(primary.unique);

        let by_name = table.index("idx_users_name").unwrap();
        assert!(by_name.unique);
        assert_eq!(by_name.columns, vec!["name".to_string()]);

        assert!(table.partitions.is_empty());
        assert!(connection().find_functions().unwrap().is_empty());
    }
}
