//! `MySQL`-family introspection
//!
//! * Tables: `SHOW TABLES`, `INFORMATION_SCHEMA.TABLES`, `SHOW FULL COLUMNS`, `SHOW CREATE TABLE`
//! * Partitions: `INFORMATION_SCHEMA.PARTITIONS`
//! * Indexes: `SHOW INDEX`, one row per indexed column, merged by key name
//! * Functions: `SHOW FUNCTION STATUS`, `SHOW CREATE FUNCTION`

use crate::{
    DatabaseError, DatabaseValue, Row,
    connection::Executor,
    schema::{Field, Function, Index, Partition, Table, quote_literal},
};

fn quote(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// # Errors
///
/// * If the query fails
pub fn current_schema(exec: &dyn Executor) -> Result<String, DatabaseError> {
    Ok(exec
        .query("SELECT DATABASE()", &[])?
        .into_first()
        .and_then(|row| row.first_value().and_then(DatabaseValue::to_text))
        .unwrap_or_default())
}

/// `None` when the server does not report the variable.
///
/// # Errors
///
/// * If the query fails
pub fn max_prepared_stmt_count(exec: &dyn Executor) -> Result<Option<u64>, DatabaseError> {
    Ok(exec
        .query("SELECT @@max_prepared_stmt_count", &[])?
        .into_first()
        .and_then(|row| row.first_value().and_then(DatabaseValue::as_u64)))
}

/// # Errors
///
/// * If the query fails
pub fn table_names(exec: &dyn Executor) -> Result<Vec<String>, DatabaseError> {
    Ok(exec
        .query("SHOW TABLES", &[])?
        .into_column()
        .iter()
        .filter_map(DatabaseValue::to_text)
        .collect())
}

/// # Errors
///
/// * If a metadata query fails
pub fn find_table(exec: &dyn Executor, name: &str) -> Result<Option<Table>, DatabaseError> {
    let schema = current_schema(exec)?;

    let Some(row) = exec
        .query(
            "SELECT * FROM INFORMATION_SCHEMA.TABLES WHERE table_schema=? AND table_name=?",
            &[schema.as_str().into(), name.into()],
        )?
        .into_first()
    else {
        return Ok(None);
    };

    let mut table = parse_table(&row);

    table.fields = exec
        .query(&format!("SHOW FULL COLUMNS FROM {}", quote(name)), &[])?
        .iter()
        .map(parse_field)
        .collect();

    Ok(Some(table))
}

/// Table with partitions, indexes and DDL. A detail that cannot be read is logged and left
/// empty so the rest of the table is still returned.
///
/// # Errors
///
/// * If the table or its columns cannot be read
pub fn find_full_table(exec: &dyn Executor, name: &str) -> Result<Option<Table>, DatabaseError> {
    let Some(mut table) = find_table(exec, name)? else {
        return Ok(None);
    };

    table.partitions = partial(
        name,
        "partitions",
        exec.query(
            "SELECT * FROM INFORMATION_SCHEMA.PARTITIONS WHERE TABLE_SCHEMA=? AND TABLE_NAME=?",
            &[table.schema.as_str().into(), name.into()],
        )
        .map(|rows| rows.iter().filter_map(parse_partition).collect()),
    );

    table.indexes = partial(
        name,
        "indexes",
        exec.query(&format!("SHOW INDEX FROM {}", quote(name)), &[])
            .map(|rows| merge_indexes(rows.iter())),
    );

    table.ddl = partial(
        name,
        "ddl",
        exec.query(&format!("SHOW CREATE TABLE {}", quote(name)), &[])
            .map(|rows| {
                rows.into_first()
                    .and_then(|row| row.text("Create Table"))
                    .unwrap_or_default()
            }),
    );

    Ok(Some(table))
}

fn partial<T: Default>(table: &str, detail: &str, result: Result<T, DatabaseError>) -> T {
    result.unwrap_or_else(|e| {
        log::warn!("find_full_table: failed to read {detail} of '{table}': {e:?}");
        T::default()
    })
}

/// Functions of the current schema. A function whose DDL cannot be read is returned without it.
///
/// # Errors
///
/// * If listing the functions fails
pub fn find_functions(exec: &dyn Executor) -> Result<Vec<Function>, DatabaseError> {
    let schema = current_schema(exec)?;
    let rows = exec.query(
        &format!("SHOW FUNCTION STATUS WHERE Db={}", quote_literal(&schema)),
        &[],
    )?;

    let mut functions = rows.iter().map(parse_function).collect::<Vec<_>>();

    for function in &mut functions {
        match exec.query(&format!("SHOW CREATE FUNCTION {}", quote(&function.name)), &[]) {
            Ok(rows) => {
                function.ddl = rows
                    .into_first()
                    .and_then(|row| row.text("Create Function"))
                    .unwrap_or_default();
            }
            Err(e) => {
                log::warn!(
                    "find_functions: failed to read definition of '{}': {e:?}",
                    function.name
                );
            }
        }
    }

    Ok(functions)
}

fn parse_table(row: &Row) -> Table {
    Table {
        name: row.text("TABLE_NAME").unwrap_or_default(),
        schema: row.text("TABLE_SCHEMA").unwrap_or_default(),
        engine: row.text("ENGINE").unwrap_or_default(),
        collation: row.text("TABLE_COLLATION").unwrap_or_default(),
        comment: row.text("TABLE_COMMENT").unwrap_or_default(),
        ..Default::default()
    }
}

/// One `SHOW FULL COLUMNS` row.
fn parse_field(row: &Row) -> Field {
    let mut field = Field::parse(
        row.text("Field").unwrap_or_default(),
        row.text("Type").unwrap_or_default(),
        false,
    );

    field.collation = row.text("Collation").unwrap_or_default();
    field.nullable = row
        .text("Null")
        .is_some_and(|x| x.eq_ignore_ascii_case("YES"));
    field.primary = row
        .text("Key")
        .is_some_and(|x| x.eq_ignore_ascii_case("PRI"));
    field.auto_increment = row
        .text("Extra")
        .is_some_and(|x| x.to_ascii_lowercase().contains("auto_increment"));
    field.comment = row.text("Comment").unwrap_or_default();
    field.set_default(row.text("Default"));

    field
}

/// One `INFORMATION_SCHEMA.PARTITIONS` row. Unpartitioned tables report one row with a NULL name.
fn parse_partition(row: &Row) -> Option<Partition> {
    let name = row.text("PARTITION_NAME")?;
    let number = |column: &str| {
        row.get_ignore_case(column)
            .and_then(DatabaseValue::as_u64)
            .unwrap_or_default()
    };

    Some(Partition {
        name,
        method: row.text("PARTITION_METHOD").unwrap_or_default(),
        expression: row.text("PARTITION_EXPRESSION").unwrap_or_default(),
        description: row.text("PARTITION_DESCRIPTION").unwrap_or_default(),
        ordinal_position: number("PARTITION_ORDINAL_POSITION"),
        node_group: row.text("NODEGROUP").unwrap_or_default(),
        row_count: number("TABLE_ROWS"),
    })
}

/// Folds `SHOW INDEX` rows into one [`Index`] per key name, columns in sequence order.
fn merge_indexes<'a>(rows: impl Iterator<Item = &'a Row>) -> Vec<Index> {
    let mut indexes: Vec<(Index, Vec<(u64, String)>)> = vec![];

    for row in rows {
        let name = row.text("Key_name").unwrap_or_default();
        let seq = row
            .get_ignore_case("Seq_in_index")
            .and_then(DatabaseValue::as_u64)
            .unwrap_or_default();
        let column = row.text("Column_name").unwrap_or_default();

        if let Some((_, columns)) = indexes.iter_mut().find(|(x, _)| x.name == name) {
            columns.push((seq, column));
            continue;
        }

        let unique = row
            .get_ignore_case("Non_unique")
            .and_then(DatabaseValue::as_i64)
            .is_some_and(|x| x == 0);

        indexes.push((
            Index {
                name,
                unique,
                columns: vec![],
                index_type: row.text("Index_type").unwrap_or_default(),
                comment: row.text("Index_comment").unwrap_or_default(),
            },
            vec![(seq, column)],
        ));
    }

    indexes
        .into_iter()
        .map(|(mut index, mut columns)| {
            columns.sort_by_key(|(seq, _)| *seq);
            index.columns = columns.into_iter().map(|(_, column)| column).collect();
            index
        })
        .collect()
}

fn parse_function(row: &Row) -> Function {
    Function {
        name: row.text("Name").unwrap_or_default(),
        schema: row.text("Db").unwrap_or_default(),
        definer: row.text("Definer").unwrap_or_default(),
        comment: row.text("Comment").unwrap_or_default(),
        ddl: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::kind::ValueKind;

    fn row(columns: &[(&str, DatabaseValue)]) -> Row {
        Row {
            columns: columns
                .iter()
                .map(|(name, value)| ((*name).to_string(), value.clone()))
                .collect(),
        }
    }

    fn text(value: &str) -> DatabaseValue {
        DatabaseValue::String(value.to_string())
    }

    #[test_log::test]
    fn parses_show_full_columns_row() {
        let field = parse_field(&row(&[
            ("Field", text("id")),
            ("Type", text("int(10) unsigned")),
            ("Collation", DatabaseValue::Null),
            ("Null", text("NO")),
            ("Key", text("PRI")),
            ("Default", DatabaseValue::Null),
            ("Extra", text("auto_increment")),
            ("Privileges", text("select,insert")),
            ("Comment", text("primary key")),
        ]));

        assert_eq!(field.name, "id");
        assert_eq!(field.kind, ValueKind::UInt32);
        assert!(field.primary);
        assert!(field.auto_increment);
        assert!(!field.nullable);
        assert_eq!(field.default, None);
        assert_eq!(field.comment, "primary key");
    }

    #[test_log::test]
    fn typed_default_follows_field_kind() {
        let field = parse_field(&row(&[
            ("Field", text("state")),
            ("Type", text("tinyint(4)")),
            ("Null", text("YES")),
            ("Default", text("1")),
        ]));

        assert_eq!(field.default.as_deref(), Some("1"));
        assert_eq!(field.default_value, DatabaseValue::Int64(1));
        assert!(field.nullable);
    }

    #[test_log::test]
    fn merges_multi_column_indexes_by_name() {
        let rows = [
            row(&[
                ("Key_name", text("PRIMARY")),
                ("Non_unique", DatabaseValue::Int64(0)),
                ("Seq_in_index", DatabaseValue::Int64(1)),
                ("Column_name", text("id")),
                ("Index_type", text("BTREE")),
                ("Index_comment", text("")),
            ]),
            row(&[
                ("Key_name", text("idx_name_state")),
                ("Non_unique", text("1")),
                ("Seq_in_index", DatabaseValue::Int64(2)),
                ("Column_name", text("state")),
                ("Index_type", text("BTREE")),
                ("Index_comment", text("")),
            ]),
            row(&[
                ("Key_name", text("idx_name_state")),
                ("Non_unique", text("1")),
                ("Seq_in_index", DatabaseValue::Int64(1)),
                ("Column_name", text("name")),
                ("Index_type", text("BTREE")),
                ("Index_comment", text("")),
            ]),
        ];

        let indexes = merge_indexes(rows.iter());

        assert_eq!(indexes.len(), 2);
        assert!(indexes[0].is_primary());
        assert!(indexes[0].unique);
        assert_eq!(indexes[1].name, "idx_name_state");
        assert!(!indexes[1].unique);
        assert_eq!(
            indexes[1].columns,
            vec!["name".to_string(), "state".to_string()]
        );
    }

    #[test_log::test]
    fn skips_unpartitioned_rows() {
        assert_eq!(
            parse_partition(&row(&[("PARTITION_NAME", DatabaseValue::Null)])),
            None
        );

        let partition = parse_partition(&row(&[
            ("PARTITION_NAME", text("p2024")),
            ("PARTITION_METHOD", text("RANGE")),
            ("PARTITION_EXPRESSION", text("year(`created_at`)")),
            ("PARTITION_DESCRIPTION", text("2025")),
            ("PARTITION_ORDINAL_POSITION", DatabaseValue::UInt64(1)),
            ("NODEGROUP", text("default")),
            ("TABLE_ROWS", DatabaseValue::UInt64(42)),
        ]))
        .unwrap();

        assert_eq!(partition.name, "p2024");
        assert_eq!(partition.method, "RANGE");
        assert_eq!(partition.ordinal_position, 1);
        assert_eq!(partition.row_count, 42);
    }

    #[test_log::test]
    fn unreadable_details_are_left_empty() {
        let indexes: Vec<Index> = partial(
            "users",
            "indexes",
            Err(DatabaseError::InvalidQuery("denied".to_string())),
        );
        assert!(indexes.is_empty());

        let ddl = partial("users", "ddl", Ok("CREATE TABLE users".to_string()));
        assert_eq!(ddl, "CREATE TABLE users");
    }

    #[cfg(feature = "mysql")]
    #[test_log::test]
    fn against_live_server() {
        let Ok(url) = std::env::var("MYSQL_TEST_URL") else {
            return;
        };

        let db = crate::config::DbConfig {
            driver: "mysql".to_string(),
            dsn: url,
            ..Default::default()
        };
        let connection = crate::connection::new_instance_from_config("mysql_test", &db).unwrap();

        let names = connection.table_names().unwrap();
        if let Some(name) = names.first() {
            let table = connection.find_full_table(name).unwrap().unwrap();
            assert_eq!(&table.name, name);
            assert!(!table.fields.is_empty());
            assert!(!table.ddl.is_empty());
        }
        assert!(connection.statement_cache().cap() >= 1);
        connection.find_functions().unwrap();
    }
}
