//! Schema introspection types
//!
//! [`Table`], [`Field`], [`Index`], [`Partition`] and [`Function`] describe what a connection
//! found in its database. They are produced per dialect by the `mysql` and `sqlite`
//! submodules and can be rendered back to `MySQL`-style DDL with the `definition` methods.
//! [`Field::from_definition`] and [`Index::from_definition`] parse single DDL lines, so a
//! rendered description parses back to an equivalent one.

pub mod mysql;
pub mod sqlite;

use std::fmt::Write as _;

use crate::{
    DatabaseValue,
    kind::{ValueClass, ValueKind},
};

/// Information about a table column
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Field {
    /// Column name
    pub name: String,
    /// Type text as reported by the database, e.g. `int(11) unsigned`
    pub full_type: String,
    pub kind: ValueKind,
    pub class: ValueClass,
    /// Whether this column is part of the primary key
    pub primary: bool,
    pub nullable: bool,
    pub unsigned: bool,
    pub auto_increment: bool,
    pub comment: String,
    pub collation: String,
    /// Default value as text, `None` when the column has no default
    pub default: Option<String>,
    /// Default value converted to [`Field::kind`]
    pub default_value: DatabaseValue,
}

impl Field {
    /// Builds a field from its name and type text, deriving kind, class and signedness.
    #[must_use]
    pub fn parse(name: impl Into<String>, full_type: impl Into<String>, unsigned: bool) -> Self {
        let full_type = full_type.into();
        let unsigned = unsigned || full_type.to_ascii_lowercase().contains("unsigned");
        let (kind, class) = parse_type(&full_type, unsigned);

        Self {
            name: name.into(),
            full_type,
            kind,
            class,
            nullable: true,
            unsigned,
            default_value: DatabaseValue::Null,
            ..Default::default()
        }
    }

    /// Sets the textual default and derives the typed one.
    pub fn set_default(&mut self, default: Option<String>) {
        self.default_value = typed_default(self.kind, self.class, default.as_deref());
        self.default = default;
    }

    /// Renders the column as a `CREATE TABLE` line.
    #[must_use]
    pub fn definition(&self) -> String {
        let mut def = format!("`{}` {}", self.name, self.full_type);

        if !self.collation.is_empty() {
            write!(def, " COLLATE {}", self.collation).ok();
        }
        if !self.nullable {
            def.push_str(" NOT NULL");
        }

        match &self.default {
            Some(default) if self.renders_bare_default(default) => {
                write!(def, " DEFAULT {default}").ok();
            }
            Some(default) => {
                write!(def, " DEFAULT {}", quote_literal(default)).ok();
            }
            None if self.nullable && !self.auto_increment => def.push_str(" DEFAULT NULL"),
            None => {}
        }

        if self.auto_increment {
            def.push_str(" AUTO_INCREMENT");
        }
        if !self.comment.is_empty() {
            write!(def, " COMMENT {}", quote_literal(&self.comment)).ok();
        }

        def
    }

    fn renders_bare_default(&self, default: &str) -> bool {
        match self.class {
            ValueClass::Number | ValueClass::Bool => default.parse::<f64>().is_ok(),
            ValueClass::Time => {
                let upper = default.to_ascii_uppercase();
                upper.starts_with("CURRENT_TIMESTAMP") || upper.starts_with("NOW(")
            }
            ValueClass::String | ValueClass::Invalid => false,
        }
    }

    /// Parses one column line of a `CREATE TABLE` body.
    #[must_use]
    pub fn from_definition(line: &str) -> Option<Self> {
        let tokens = tokenize(line.trim().trim_end_matches(','));
        let mut tokens = tokens.into_iter().peekable();

        let name = unquote(&tokens.next()?);
        let mut type_parts = vec![];
        while let Some(token) = tokens.peek() {
            if is_column_keyword(token) {
                break;
            }
            type_parts.push(tokens.next()?);
        }
        if type_parts.is_empty() {
            return None;
        }

        let mut field = Self::parse(name, type_parts.join(" "), false);
        let mut default = None;

        while let Some(token) = tokens.next() {
            match token.to_ascii_uppercase().as_str() {
                "NOT" => {
                    if tokens.next_if(|x| x.eq_ignore_ascii_case("NULL")).is_some() {
                        field.nullable = false;
                    }
                }
                "NULL" => field.nullable = true,
                "DEFAULT" => {
                    default = tokens.next().and_then(|x| {
                        if x.eq_ignore_ascii_case("NULL") {
                            None
                        } else {
                            Some(unquote(&x))
                        }
                    });
                }
                "AUTO_INCREMENT" | "AUTOINCREMENT" => field.auto_increment = true,
                "COMMENT" => field.comment = tokens.next().map(|x| unquote(&x)).unwrap_or_default(),
                "COLLATE" => field.collation = tokens.next().unwrap_or_default(),
                "CHARACTER" => {
                    tokens.next_if(|x| x.eq_ignore_ascii_case("SET"));
                    tokens.next();
                }
                "PRIMARY" => {
                    tokens.next_if(|x| x.eq_ignore_ascii_case("KEY"));
                    field.primary = true;
                }
                "ON" => {
                    tokens.next_if(|x| x.eq_ignore_ascii_case("UPDATE"));
                    tokens.next();
                }
                _ => {}
            }
        }

        field.set_default(default);
        Some(field)
    }
}

/// Derives kind and class from the leading type word of `full_type`.
#[must_use]
pub fn parse_type(full_type: &str, unsigned: bool) -> (ValueKind, ValueClass) {
    let lower = full_type.trim().to_ascii_lowercase();
    let base = lower
        .split(|c: char| c == '(' || c.is_whitespace())
        .next()
        .unwrap_or_default();

    let (kind, class) = match base {
        "bool" | "boolean" => (ValueKind::Bool, ValueClass::Bool),
        "bit" => {
            if lower.starts_with("bit(1)") || lower == "bit" {
                (ValueKind::Bool, ValueClass::Bool)
            } else {
                (ValueKind::UInt64, ValueClass::Number)
            }
        }
        "tinyint" => (ValueKind::Int8, ValueClass::Number),
        "smallint" => (ValueKind::Int16, ValueClass::Number),
        "mediumint" | "int" => (ValueKind::Int32, ValueClass::Number),
        "integer" | "bigint" => (ValueKind::Int64, ValueClass::Number),
        "float" => (ValueKind::Float32, ValueClass::Number),
        "double" | "real" | "decimal" | "numeric" | "dec" | "fixed" => {
            (ValueKind::Float64, ValueClass::Number)
        }
        "char" | "varchar" | "nchar" | "nvarchar" | "text" | "tinytext" | "mediumtext"
        | "longtext" | "enum" | "set" | "json" | "blob" | "tinyblob" | "mediumblob"
        | "longblob" | "binary" | "varbinary" | "clob" => (ValueKind::String, ValueClass::String),
        "date" | "datetime" | "timestamp" | "time" | "year" => {
            (ValueKind::String, ValueClass::Time)
        }
        _ => (ValueKind::String, ValueClass::Invalid),
    };

    let kind = if unsigned {
        kind.to_unsigned()
    } else {
        kind.to_signed()
    };

    (kind, class)
}

fn typed_default(kind: ValueKind, class: ValueClass, default: Option<&str>) -> DatabaseValue {
    let Some(default) = default else {
        return DatabaseValue::Null;
    };

    let text = DatabaseValue::String(default.to_string());
    if matches!(class, ValueClass::Time | ValueClass::Invalid) {
        return text;
    }

    kind.convert(text.clone()).unwrap_or(text)
}

fn is_column_keyword(token: &str) -> bool {
    matches!(
        token.to_ascii_uppercase().as_str(),
        "NOT"
            | "NULL"
            | "DEFAULT"
            | "AUTO_INCREMENT"
            | "AUTOINCREMENT"
            | "COMMENT"
            | "COLLATE"
            | "CHARACTER"
            | "PRIMARY"
            | "UNIQUE"
            | "ON"
            | "GENERATED"
            | "REFERENCES"
    )
}

/// Information about a database index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    /// Index name, `PRIMARY` for the primary key
    pub name: String,
    pub unique: bool,
    /// Ordered list of column names in the index
    pub columns: Vec<String>,
    /// Index method, e.g. `BTREE`, `HASH` or `FULLTEXT`
    pub index_type: String,
    pub comment: String,
}

impl Index {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.name.eq_ignore_ascii_case("PRIMARY")
    }

    /// Renders the index as a `KEY` clause.
    #[must_use]
    pub fn definition(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|x| format!("`{x}`"))
            .collect::<Vec<_>>()
            .join(",");
        let prefixed_type = matches!(
            self.index_type.to_ascii_uppercase().as_str(),
            "FULLTEXT" | "SPATIAL"
        );

        let mut def = if self.is_primary() {
            format!("PRIMARY KEY ({columns})")
        } else if prefixed_type {
            format!(
                "{} KEY `{}` ({columns})",
                self.index_type.to_ascii_uppercase(),
                self.name
            )
        } else if self.unique {
            format!("UNIQUE KEY `{}` ({columns})", self.name)
        } else {
            format!("KEY `{}` ({columns})", self.name)
        };

        if !self.index_type.is_empty() && !prefixed_type {
            write!(def, " USING {}", self.index_type).ok();
        }
        if !self.comment.is_empty() {
            write!(def, " COMMENT {}", quote_literal(&self.comment)).ok();
        }

        def
    }

    /// Parses a `KEY` clause of a `CREATE TABLE` body.
    #[must_use]
    pub fn from_definition(line: &str) -> Option<Self> {
        let tokens = tokenize(line.trim().trim_end_matches(','));
        let mut tokens = tokens.into_iter().peekable();
        let mut index = Self::default();

        let first = tokens.next()?;
        match first.to_ascii_uppercase().as_str() {
            "PRIMARY" => {
                index.name = "PRIMARY".to_string();
                index.unique = true;
            }
            "UNIQUE" => index.unique = true,
            "FULLTEXT" | "SPATIAL" => index.index_type = first.to_ascii_uppercase(),
            "KEY" | "INDEX" => {}
            _ => return None,
        }

        if !matches!(first.to_ascii_uppercase().as_str(), "KEY" | "INDEX") {
            tokens.next_if(|x| x.eq_ignore_ascii_case("KEY") || x.eq_ignore_ascii_case("INDEX"));
        }

        let mut columns = None;
        while let Some(token) = tokens.next() {
            if token.starts_with('(') {
                columns = Some(token);
                break;
            }
            if index.name.is_empty() {
                index.name = unquote(&token);
            }
        }

        index.columns = split_columns(&columns?);

        while let Some(token) = tokens.next() {
            match token.to_ascii_uppercase().as_str() {
                "USING" => index.index_type = tokens.next().unwrap_or_default(),
                "COMMENT" => index.comment = tokens.next().map(|x| unquote(&x)).unwrap_or_default(),
                _ => {}
            }
        }

        Some(index)
    }
}

fn split_columns(group: &str) -> Vec<String> {
    let inner = group
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')');

    inner
        .split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(|x| {
            let name = x.split('(').next().unwrap_or(x);
            unquote(name.split_whitespace().next().unwrap_or(name))
        })
        .collect()
}

/// Information about a table partition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    /// Partitioning method, e.g. `RANGE` or `HASH`
    pub method: String,
    pub expression: String,
    pub description: String,
    pub ordinal_position: u64,
    pub node_group: String,
    pub row_count: u64,
}

/// Information about a stored function
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub schema: String,
    pub definer: String,
    pub comment: String,
    /// `CREATE FUNCTION` text
    pub ddl: String,
}

/// Information about a table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub name: String,
    pub schema: String,
    /// Columns in ordinal order
    pub fields: Vec<Field>,
    pub engine: String,
    pub collation: String,
    pub comment: String,
    pub partitions: Vec<Partition>,
    pub indexes: Vec<Index>,
    /// `CREATE TABLE` text reported by the database
    pub ddl: String,
}

impl Table {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|x| x.name == name)
    }

    #[must_use]
    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|x| x.name == name)
    }

    #[must_use]
    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|x| x.name == name)
    }

    /// Primary key columns in table order.
    pub fn primary_key(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|x| x.primary)
    }

    /// Renders a `CREATE TABLE` statement from the parsed description.
    #[must_use]
    pub fn definition(&self) -> String {
        let mut lines = self.fields.iter().map(Field::definition).collect::<Vec<_>>();

        if !self.indexes.iter().any(Index::is_primary) {
            let primary = self.primary_key().map(|x| x.name.clone()).collect::<Vec<_>>();
            if !primary.is_empty() {
                lines.push(
                    Index {
                        name: "PRIMARY".to_string(),
                        unique: true,
                        columns: primary,
                        ..Default::default()
                    }
                    .definition(),
                );
            }
        }
        lines.extend(self.indexes.iter().map(Index::definition));

        let mut def = format!("CREATE TABLE `{}` (\n  {}\n)", self.name, lines.join(",\n  "));

        if !self.engine.is_empty() {
            write!(def, " ENGINE={}", self.engine).ok();
        }
        if !self.collation.is_empty() {
            write!(def, " DEFAULT COLLATE={}", self.collation).ok();
        }
        if !self.comment.is_empty() {
            write!(def, " COMMENT={}", quote_literal(&self.comment)).ok();
        }

        def
    }
}

/// Splits DDL text on whitespace, keeping quoted strings and parenthesized groups whole.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = vec![];
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote = None;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            current.push(c);
            if c == '\\' && q == '\'' {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            } else if c == q {
                if chars.peek() == Some(&q) {
                    current.push(q);
                    chars.next();
                } else {
                    quote = None;
                }
            }
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                current.push(c);
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

/// Strips one level of `'`, `"`, `` ` `` or `[]` quoting and resolves escapes.
pub(crate) fn unquote(token: &str) -> String {
    let mut chars = token.chars();
    let (Some(open), Some(close)) = (chars.next(), token.chars().last()) else {
        return token.to_string();
    };
    let expected = match open {
        '\'' | '"' | '`' => open,
        '[' => ']',
        _ => return token.to_string(),
    };
    if close != expected || token.len() < 2 {
        return token.to_string();
    }

    let inner = &token[open.len_utf8()..token.len() - close.len_utf8()];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' && open == '\'' {
            if let Some(next) = chars.next() {
                out.push(match next {
                    'n' => '\n',
                    't' => '\t',
                    '0' => '\0',
                    other => other,
                });
            }
        } else if c == close && chars.peek() == Some(&close) {
            out.push(c);
            chars.next();
        } else {
            out.push(c);
        }
    }

    out
}

/// Quotes `text` as a single-quoted SQL string literal.
pub(crate) fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn parses_type_prefixes() {
        assert_eq!(
            parse_type("tinyint(4)", false),
            (ValueKind::Int8, ValueClass::Number)
        );
        assert_eq!(
            parse_type("int(11) unsigned", true),
            (ValueKind::UInt32, ValueClass::Number)
        );
        assert_eq!(
            parse_type("bigint(20)", false),
            (ValueKind::Int64, ValueClass::Number)
        );
        assert_eq!(
            parse_type("decimal(10,2)", false),
            (ValueKind::Float64, ValueClass::Number)
        );
        assert_eq!(parse_type("bit(1)", false), (ValueKind::Bool, ValueClass::Bool));
        assert_eq!(
            parse_type("varchar(64)", false),
            (ValueKind::String, ValueClass::String)
        );
        assert_eq!(
            parse_type("datetime", false),
            (ValueKind::String, ValueClass::Time)
        );
        assert_eq!(
            parse_type("geometry", false),
            (ValueKind::String, ValueClass::Invalid)
        );
    }

    #[test_log::test]
    fn unsigned_marker_in_type_text_promotes_kind() {
        let field = Field::parse("id", "int(10) unsigned", false);
        assert!(field.unsigned);
        assert_eq!(field.kind, ValueKind::UInt32);
    }

    #[test_log::test]
    fn field_definition_round_trips() {
        let mut field = Field::parse("score", "int(11) unsigned", false);
        field.nullable = false;
        field.comment = "player's score".to_string();
        field.set_default(Some("0".to_string()));

        let definition = field.definition();
        assert_eq!(
            definition,
            "`score` int(11) unsigned NOT NULL DEFAULT 0 COMMENT 'player''s score'"
        );

        let parsed = Field::from_definition(&definition).unwrap();
        assert_eq!(parsed.kind, field.kind);
        assert_eq!(parsed.default, field.default);
        assert_eq!(parsed.default_value, DatabaseValue::UInt64(0));
        assert_eq!(parsed.unsigned, field.unsigned);
        assert_eq!(parsed.comment, field.comment);
        assert!(!parsed.nullable);
    }

    #[test_log::test]
    fn string_field_definition_round_trips() {
        let mut field = Field::parse("name", "varchar(64)", false);
        field.collation = "utf8mb4_general_ci".to_string();
        field.set_default(Some(String::new()));

        let parsed = Field::from_definition(&field.definition()).unwrap();
        assert_eq!(parsed, field);
    }

    #[test_log::test]
    fn parses_mysql_column_lines() {
        let field = Field::from_definition(
            "`created_at` timestamp NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP COMMENT 'created',",
        )
        .unwrap();

        assert_eq!(field.name, "created_at");
        assert_eq!(field.class, ValueClass::Time);
        assert_eq!(field.default.as_deref(), Some("CURRENT_TIMESTAMP"));
        assert_eq!(field.comment, "created");

        let field = Field::from_definition("`state` enum('on','off now') DEFAULT NULL").unwrap();
        assert_eq!(field.full_type, "enum('on','off now')");
        assert_eq!(field.default, None);
        assert!(field.nullable);
    }

    #[test_log::test]
    fn index_definition_round_trips() {
        let index = Index {
            name: "idx_name_state".to_string(),
            unique: true,
            columns: vec!["name".to_string(), "state".to_string()],
            index_type: "BTREE".to_string(),
            comment: "lookup".to_string(),
        };

        let definition = index.definition();
        assert_eq!(
            definition,
            "UNIQUE KEY `idx_name_state` (`name`,`state`) USING BTREE COMMENT 'lookup'"
        );
        assert_eq!(Index::from_definition(&definition).unwrap(), index);

        let primary = Index {
            name: "PRIMARY".to_string(),
            unique: true,
            columns: vec!["id".to_string()],
            index_type: "BTREE".to_string(),
            comment: String::new(),
        };
        assert_eq!(
            Index::from_definition(&primary.definition()).unwrap(),
            primary
        );
    }

    #[test_log::test]
    fn parses_prefix_length_index_columns() {
        let index = Index::from_definition("KEY `idx_title` (`title`(32),`id`)").unwrap();
        assert_eq!(index.columns, vec!["title".to_string(), "id".to_string()]);
        assert!(!index.unique);
        assert!(Index::from_definition("CONSTRAINT `fk` FOREIGN KEY (`a`)").is_none());
    }

    #[test_log::test]
    fn table_definition_includes_fields_and_keys() {
        let mut id = Field::parse("id", "bigint(20) unsigned", false);
        id.primary = true;
        id.nullable = false;
        id.auto_increment = true;

        let table = Table {
            name: "users".to_string(),
            engine: "InnoDB".to_string(),
            fields: vec![id, Field::parse("name", "varchar(64)", false)],
            ..Default::default()
        };

        assert_eq!(
            table.definition(),
            "CREATE TABLE `users` (\n  \
             `id` bigint(20) unsigned NOT NULL AUTO_INCREMENT,\n  \
             `name` varchar(64) DEFAULT NULL,\n  \
             PRIMARY KEY (`id`)\n\
             ) ENGINE=InnoDB"
        );
        assert_eq!(table.primary_key().count(), 1);
        assert!(table.field("name").is_some());
    }
}
