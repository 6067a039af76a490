use std::fmt;

use crate::query::Query;

/// A raw SQL expression such as a database function call. Emitted verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbFunc {
    pub expression: String,
}

impl DbFunc {
    #[must_use]
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
        }
    }

    /// `NAME(arg1,arg2,...)`
    #[must_use]
    pub fn call<I, S>(name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args = args
            .into_iter()
            .map(|x| x.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self::new(format!("{name}({args})"))
    }

    #[must_use]
    pub fn now() -> Self {
        Self::new("NOW()")
    }
}

impl fmt::Display for DbFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

/// Something that can be selected, ordered or grouped by.
pub enum Expr<'a> {
    /// An identifier, quoted on output
    Column(String),
    Func(DbFunc),
    Sub(Box<Query<'a>>),
}

impl fmt::Debug for Expr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(x) => f.debug_tuple("Column").field(x).finish(),
            Self::Func(x) => f.debug_tuple("Func").field(x).finish(),
            Self::Sub(x) => f.debug_tuple("Sub").field(x).finish(),
        }
    }
}

impl From<&str> for Expr<'_> {
    fn from(value: &str) -> Self {
        Self::Column(value.to_string())
    }
}

impl From<&String> for Expr<'_> {
    fn from(value: &String) -> Self {
        Self::Column(value.clone())
    }
}

impl From<String> for Expr<'_> {
    fn from(value: String) -> Self {
        Self::Column(value)
    }
}

impl From<DbFunc> for Expr<'_> {
    fn from(value: DbFunc) -> Self {
        Self::Func(value)
    }
}

impl<'a> From<Query<'a>> for Expr<'a> {
    fn from(value: Query<'a>) -> Self {
        Self::Sub(Box::new(value))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortDirection {
    /// No direction token is emitted
    #[default]
    Default,
    Asc,
    Desc,
}

impl SortDirection {
    #[must_use]
    pub const fn token(self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::Asc => Some("ASC"),
            Self::Desc => Some("DESC"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JoinKind {
    /// Comma join with the `ON` clause folded into `WHERE`
    #[default]
    Default,
    Left,
    Right,
}

/// The table side of a join: a table name plus the model name `Model.col` references resolve to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub model: Option<String>,
}

impl TableRef {
    #[must_use]
    pub fn new(table: impl Into<String>, model: Option<&str>) -> Self {
        Self {
            table: table.into(),
            model: model.map(ToString::to_string),
        }
    }
}

impl From<&str> for TableRef {
    fn from(value: &str) -> Self {
        Self::new(value, None)
    }
}

impl From<String> for TableRef {
    fn from(value: String) -> Self {
        Self::new(value, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub target: TableRef,
    pub kind: JoinKind,
    pub on: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexHintKind {
    Use,
    Ignore,
    Force,
}

impl IndexHintKind {
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Use => "USE",
            Self::Ignore => "IGNORE",
            Self::Force => "FORCE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHint {
    pub kind: IndexHintKind,
    /// `JOIN`, `ORDER BY` or `GROUP BY`
    pub scope: Option<String>,
    pub indexes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lock {
    Shared,
    Exclusive,
}

impl Lock {
    #[must_use]
    pub const fn clause(self) -> &'static str {
        match self {
            Self::Shared => "LOCK IN SHARE MODE",
            Self::Exclusive => "FOR UPDATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlCache {
    Cache,
    NoCache,
}

impl SqlCache {
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Cache => "SQL_CACHE",
            Self::NoCache => "SQL_NO_CACHE",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Action {
    #[default]
    Find,
    Exist,
    Insert,
    Update,
    Replace,
    InsertOrUpdate,
    Delete,
    Exec,
}

impl Action {
    #[must_use]
    pub const fn is_mutation(self) -> bool {
        !matches!(self, Self::Find | Self::Exist)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl Aggregate {
    #[must_use]
    pub const fn function(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Avg => "AVG",
        }
    }
}

/// Right-hand side of an attribute predicate.
pub(crate) enum Operand<'a> {
    /// Named parameter placeholder, `:NAME`
    Param(String),
    /// Named parameter placeholders for an `IN` list
    List(Vec<String>),
    Sub(Box<Query<'a>>),
}
