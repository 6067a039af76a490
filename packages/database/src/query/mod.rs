//! Fluent SQL builder
//!
//! A [`Query`] describes one operation. Combinators record table, predicates, ordering and so on;
//! a terminal operation (`find_ones`, `count`, `insert`, `delete`, ...) consumes the builder,
//! compiles it, runs it on the bound [`Executor`] and translates the result.
//!
//! Every value handed to a combinator is stored under a generated `:TEA_PARAM_N` name. Raw clauses
//! may reference their own names registered with [`Query::param`]. Compilation replaces each
//! `:name` with `?` and appends its value to the parameter vector, in textual order.
//!
//! ```rust,ignore
//! let rows = Query::with(&*connection)
//!     .table("users")
//!     .result(["id", "name"])
//!     .attr("state", 1)
//!     .where_clause("age>:a")
//!     .param("a", 18)
//!     .desc("id")
//!     .limit(10)
//!     .find_ones()?;
//! ```

mod compile;
pub mod expr;

use std::{collections::BTreeMap, fmt};

pub use compile::Compiled;
pub use expr::{
    Action, Aggregate, DbFunc, Expr, IndexHint, IndexHintKind, Join, JoinKind, Lock, SortDirection,
    SqlCache, TableRef,
};

use crate::{
    DatabaseError, DatabaseValue, ExecResult, Row, RowSet, TryFromError,
    connection::Executor,
    dao::{Hooks, Mutation},
    driver::Dialect,
    record::{Record, descriptor},
    transaction::Transaction,
};
use expr::Operand;

const PARAM_PREFIX: &str = "TEA_PARAM_";

/// A `WHERE` predicate other than attribute equality.
enum Condition<'a> {
    NotIn { column: String, operand: Operand<'a> },
    Compare {
        column: String,
        op: &'static str,
        param: String,
    },
    Between {
        column: String,
        low: String,
        high: String,
    },
    Raw(String),
}

/// Value side of a `SET` or `ON DUPLICATE` assignment.
enum Assignment {
    Param(String),
    Raw(String),
    Increase(String),
    Decrease(String),
}

type RowFilter<'a> = Box<dyn Fn(&Row) -> bool + 'a>;
type RowMapper<'a> = Box<dyn Fn(Row) -> Row + 'a>;

pub struct Query<'a> {
    executor: Option<&'a dyn Executor>,
    hooks: Option<&'a Hooks>,
    dialect: Dialect,
    table: Option<TableRef>,
    primary_key: String,
    action: Action,
    aggregate: Option<(Aggregate, Expr<'a>)>,
    raw_sql: Option<String>,
    params: BTreeMap<String, DatabaseValue>,
    param_index: usize,
    attrs: Vec<(String, Operand<'a>)>,
    conditions: Vec<Condition<'a>>,
    havings: Vec<String>,
    orders: Vec<(Expr<'a>, SortDirection)>,
    groups: Vec<Expr<'a>>,
    joins: Vec<Join>,
    index_hints: Vec<IndexHint>,
    results: Vec<Expr<'a>>,
    saving: Vec<(String, Assignment)>,
    replacing: Vec<(String, Assignment)>,
    limit: Option<String>,
    offset: Option<String>,
    lock: Option<Lock>,
    sql_cache: Option<SqlCache>,
    partitions: Vec<String>,
    distinct: bool,
    debug: bool,
    reusable: bool,
    filter: Option<RowFilter<'a>>,
    mapper: Option<RowMapper<'a>>,
    error: Option<String>,
}

impl fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.table)
            .field("action", &self.action)
            .field("dialect", &self.dialect)
            .field("params", &self.params)
            .field("raw_sql", &self.raw_sql)
            .finish_non_exhaustive()
    }
}

impl Default for Query<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Query<'a> {
    /// A builder with no executor, for sub-queries and [`Query::to_sql`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            executor: None,
            hooks: None,
            dialect: Dialect::Mysql,
            table: None,
            primary_key: "id".to_string(),
            action: Action::Find,
            aggregate: None,
            raw_sql: None,
            params: BTreeMap::new(),
            param_index: 0,
            attrs: vec![],
            conditions: vec![],
            havings: vec![],
            orders: vec![],
            groups: vec![],
            joins: vec![],
            index_hints: vec![],
            results: vec![],
            saving: vec![],
            replacing: vec![],
            limit: None,
            offset: None,
            lock: None,
            sql_cache: None,
            partitions: vec![],
            distinct: false,
            debug: false,
            reusable: true,
            filter: None,
            mapper: None,
            error: None,
        }
    }

    /// A builder that runs on `executor`.
    #[must_use]
    pub fn with(executor: &'a dyn Executor) -> Self {
        let mut query = Self::new();
        query.dialect = executor.dialect();
        query.executor = Some(executor);
        query
    }

    /// Runs the query inside `tx` instead of the executor it was built on.
    #[must_use]
    pub fn in_tx(mut self, tx: &'a Transaction) -> Self {
        self.dialect = tx.dialect();
        self.executor = Some(tx);
        self
    }

    #[must_use]
    pub(crate) const fn hooks(mut self, hooks: &'a Hooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Quoting dialect for a builder without an executor.
    #[must_use]
    pub const fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    #[must_use]
    pub fn table(mut self, table: impl Into<TableRef>) -> Self {
        let table = table.into();
        let model = self.table.take().and_then(|x| x.model);
        self.table = Some(TableRef {
            model: table.model.or(model),
            ..table
        });
        self
    }

    /// Name `Model.col` references in raw clauses resolve to the main table.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        let table = self.table.get_or_insert_with(TableRef::default);
        table.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn primary_key(mut self, primary_key: impl Into<String>) -> Self {
        self.primary_key = primary_key.into();
        self
    }

    /// Replaces the generated SQL. Named parameters still apply.
    #[must_use]
    pub fn sql(mut self, sql: impl Into<String>) -> Self {
        self.raw_sql = Some(sql.into());
        self
    }

    /// Binds `:name` for raw clauses.
    #[must_use]
    pub fn param(mut self, name: &str, value: impl Into<DatabaseValue>) -> Self {
        self.params
            .insert(name.trim_start_matches(':').to_string(), value.into());
        self
    }

    fn next_param(&mut self, value: DatabaseValue) -> String {
        self.param_index += 1;
        let name = format!("{PARAM_PREFIX}{}", self.param_index);
        self.params.insert(name.clone(), value);
        format!(":{name}")
    }

    fn fail(&mut self, message: String) {
        self.error.get_or_insert(message);
    }

    fn set_attr(&mut self, column: &str, operand: Operand<'a>) {
        if let Some(existing) = self.attrs.iter_mut().find(|(x, _)| x == column) {
            existing.1 = operand;
        } else {
            self.attrs.push((column.to_string(), operand));
        }
    }

    /// `column = value`. A later call for the same column replaces the earlier one.
    #[must_use]
    pub fn attr(mut self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        let param = self.next_param(value.into());
        self.set_attr(column, Operand::Param(param));
        self
    }

    /// `column IN (values)`. One value collapses to equality, none matches nothing.
    #[must_use]
    pub fn attr_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DatabaseValue>,
    {
        let params = values
            .into_iter()
            .map(|x| self.next_param(x.into()))
            .collect();
        self.set_attr(column, Operand::List(params));
        self
    }

    /// `column IN (SELECT ...)`
    #[must_use]
    pub fn attr_sub(mut self, column: &str, sub: Self) -> Self {
        self.set_attr(column, Operand::Sub(Box::new(sub)));
        self
    }

    #[must_use]
    pub fn not_in<I, V>(mut self, column: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DatabaseValue>,
    {
        let params = values
            .into_iter()
            .map(|x| self.next_param(x.into()))
            .collect();
        self.conditions.push(Condition::NotIn {
            column: column.to_string(),
            operand: Operand::List(params),
        });
        self
    }

    #[must_use]
    pub fn not_in_sub(mut self, column: &str, sub: Self) -> Self {
        self.conditions.push(Condition::NotIn {
            column: column.to_string(),
            operand: Operand::Sub(Box::new(sub)),
        });
        self
    }

    fn compare(mut self, column: &str, op: &'static str, value: DatabaseValue) -> Self {
        let param = self.next_param(value);
        self.conditions.push(Condition::Compare {
            column: column.to_string(),
            op,
            param,
        });
        self
    }

    #[must_use]
    pub fn neq(self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.compare(column, "!=", value.into())
    }

    #[must_use]
    pub fn gt(self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.compare(column, ">", value.into())
    }

    #[must_use]
    pub fn gte(self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.compare(column, ">=", value.into())
    }

    #[must_use]
    pub fn lt(self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.compare(column, "<", value.into())
    }

    #[must_use]
    pub fn lte(self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        self.compare(column, "<=", value.into())
    }

    #[must_use]
    pub fn like(self, column: &str, pattern: impl Into<DatabaseValue>) -> Self {
        self.compare(column, "LIKE", pattern.into())
    }

    #[must_use]
    pub fn between(
        mut self,
        column: &str,
        low: impl Into<DatabaseValue>,
        high: impl Into<DatabaseValue>,
    ) -> Self {
        let low = self.next_param(low.into());
        let high = self.next_param(high.into());
        self.conditions.push(Condition::Between {
            column: column.to_string(),
            low,
            high,
        });
        self
    }

    /// A raw `WHERE` clause, joined to the others with `AND`.
    #[must_use]
    pub fn where_clause(mut self, clause: impl Into<String>) -> Self {
        self.conditions.push(Condition::Raw(clause.into()));
        self
    }

    /// A raw `WHERE` clause whose `?` placeholders take `args` in order.
    #[must_use]
    pub fn where_args<I, V>(mut self, clause: &str, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DatabaseValue>,
    {
        match self.name_positional(clause, args) {
            Ok(clause) => self.conditions.push(Condition::Raw(clause)),
            Err(e) => self.fail(e),
        }
        self
    }

    #[must_use]
    pub fn having(mut self, clause: impl Into<String>) -> Self {
        self.havings.push(clause.into());
        self
    }

    #[must_use]
    pub fn having_args<I, V>(mut self, clause: &str, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<DatabaseValue>,
    {
        match self.name_positional(clause, args) {
            Ok(clause) => self.havings.push(clause),
            Err(e) => self.fail(e),
        }
        self
    }

    fn name_positional<I, V>(&mut self, clause: &str, args: I) -> Result<String, String>
    where
        I: IntoIterator<Item = V>,
        V: Into<DatabaseValue>,
    {
        let mut args = args.into_iter();
        let mut out = String::with_capacity(clause.len());
        let mut quote = None;

        for c in clause.chars() {
            match (quote, c) {
                (Some(q), c) if c == q => {
                    quote = None;
                    out.push(c);
                }
                (Some(_), c) => out.push(c),
                (None, '\'' | '"' | '`') => {
                    quote = Some(c);
                    out.push(c);
                }
                (None, '?') => {
                    let value = args
                        .next()
                        .ok_or_else(|| format!("too few arguments for '{clause}'"))?;
                    let param = self.next_param(value.into());
                    out.push_str(&param);
                }
                (None, c) => out.push(c),
            }
        }

        if args.next().is_some() {
            return Err(format!("too many arguments for '{clause}'"));
        }

        Ok(out)
    }

    /// Result expressions. Defaults to every column.
    #[must_use]
    pub fn result<I, E>(mut self, exprs: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr<'a>>,
    {
        self.results.extend(exprs.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub const fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    #[must_use]
    pub fn order(mut self, expr: impl Into<Expr<'a>>, direction: SortDirection) -> Self {
        self.orders.push((expr.into(), direction));
        self
    }

    #[must_use]
    pub fn asc(self, expr: impl Into<Expr<'a>>) -> Self {
        self.order(expr, SortDirection::Asc)
    }

    #[must_use]
    pub fn desc(self, expr: impl Into<Expr<'a>>) -> Self {
        self.order(expr, SortDirection::Desc)
    }

    #[must_use]
    pub fn group(mut self, expr: impl Into<Expr<'a>>) -> Self {
        self.groups.push(expr.into());
        self
    }

    fn push_join(mut self, target: impl Into<TableRef>, kind: JoinKind, on: &str) -> Self {
        self.joins.push(Join {
            target: target.into(),
            kind,
            on: on.to_string(),
        });
        self
    }

    /// Comma join, `on` is added to the `WHERE` conjunction.
    #[must_use]
    pub fn join(self, target: impl Into<TableRef>, on: &str) -> Self {
        self.push_join(target, JoinKind::Default, on)
    }

    #[must_use]
    pub fn left_join(self, target: impl Into<TableRef>, on: &str) -> Self {
        self.push_join(target, JoinKind::Left, on)
    }

    #[must_use]
    pub fn right_join(self, target: impl Into<TableRef>, on: &str) -> Self {
        self.push_join(target, JoinKind::Right, on)
    }

    fn push_hint<I, S>(mut self, kind: IndexHintKind, indexes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.index_hints.push(IndexHint {
            kind,
            scope: None,
            indexes: indexes.into_iter().map(Into::into).collect(),
        });
        self
    }

    #[must_use]
    pub fn use_index<I, S>(self, indexes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_hint(IndexHintKind::Use, indexes)
    }

    #[must_use]
    pub fn ignore_index<I, S>(self, indexes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_hint(IndexHintKind::Ignore, indexes)
    }

    #[must_use]
    pub fn force_index<I, S>(self, indexes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_hint(IndexHintKind::Force, indexes)
    }

    /// Scopes the most recent index hint, e.g. `index_for("ORDER BY")`.
    #[must_use]
    pub fn index_for(mut self, scope: &str) -> Self {
        if let Some(hint) = self.index_hints.last_mut() {
            hint.scope = Some(scope.to_string());
        } else {
            self.fail("index_for without an index hint".to_string());
        }
        self
    }

    #[must_use]
    pub fn partitions<I, S>(mut self, partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.partitions
            .extend(partitions.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(self.next_param(limit.into()));
        self
    }

    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(self.next_param(offset.into()));
        self
    }

    /// `LOCK IN SHARE MODE`
    #[must_use]
    pub const fn shared_lock(mut self) -> Self {
        self.lock = Some(Lock::Shared);
        self
    }

    /// `FOR UPDATE`
    #[must_use]
    pub const fn for_update(mut self) -> Self {
        self.lock = Some(Lock::Exclusive);
        self
    }

    #[must_use]
    pub const fn sql_cache(mut self, cache: SqlCache) -> Self {
        self.sql_cache = Some(cache);
        self
    }

    fn assign(&mut self, column: &str, assignment: Assignment) {
        if let Some(existing) = self.saving.iter_mut().find(|(x, _)| x == column) {
            existing.1 = assignment;
        } else {
            self.saving.push((column.to_string(), assignment));
        }
    }

    #[must_use]
    pub fn set(mut self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        let param = self.next_param(value.into());
        self.assign(column, Assignment::Param(param));
        self
    }

    /// `column = func`, e.g. `set_func("updated_at", DbFunc::now())`.
    #[must_use]
    pub fn set_func(mut self, column: &str, func: DbFunc) -> Self {
        self.assign(column, Assignment::Raw(func.expression));
        self
    }

    /// `column = expr` with `expr` emitted verbatim.
    #[must_use]
    pub fn set_expr(mut self, column: &str, expr: impl Into<String>) -> Self {
        self.assign(column, Assignment::Raw(expr.into()));
        self
    }

    /// `column = column + by`
    #[must_use]
    pub fn increase(mut self, column: &str, by: impl Into<DatabaseValue>) -> Self {
        let param = self.next_param(by.into());
        self.assign(column, Assignment::Increase(param));
        self
    }

    /// `column = column - by`
    #[must_use]
    pub fn decrease(mut self, column: &str, by: impl Into<DatabaseValue>) -> Self {
        let param = self.next_param(by.into());
        self.assign(column, Assignment::Decrease(param));
        self
    }

    /// Assignment applied when an upsert hits an existing key.
    #[must_use]
    pub fn on_duplicate(mut self, column: &str, value: impl Into<DatabaseValue>) -> Self {
        let param = self.next_param(value.into());
        if let Some(existing) = self.replacing.iter_mut().find(|(x, _)| x == column) {
            existing.1 = Assignment::Param(param);
        } else {
            self.replacing
                .push((column.to_string(), Assignment::Param(param)));
        }
        self
    }

    /// Logs the compiled SQL and parameters before running.
    #[must_use]
    pub const fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// `false` compiles a throwaway statement instead of going through the statement cache.
    #[must_use]
    pub const fn reusable(mut self, reusable: bool) -> Self {
        self.reusable = reusable;
        self
    }

    /// Keeps only rows `filter` accepts.
    #[must_use]
    pub fn filter_fn(mut self, filter: impl Fn(&Row) -> bool + 'a) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Transforms each row before it is returned.
    #[must_use]
    pub fn map_fn(mut self, mapper: impl Fn(Row) -> Row + 'a) -> Self {
        self.mapper = Some(Box::new(mapper));
        self
    }

    /// Sets the operation [`Query::to_sql`] compiles.
    #[must_use]
    pub const fn action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    /// Compiles without running.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::InvalidQuery`] if the builder is incomplete or misused
    pub fn to_sql(&self) -> Result<Compiled, DatabaseError> {
        if let Some(message) = &self.error {
            return Err(DatabaseError::InvalidQuery(message.clone()));
        }
        self.compile()
    }

    fn executor(&self) -> Result<&'a dyn Executor, DatabaseError> {
        self.executor.ok_or_else(|| {
            DatabaseError::InvalidQuery("query is not bound to a connection".to_string())
        })
    }

    fn prepare_compiled(mut self, action: Action) -> Result<(Self, Compiled), DatabaseError> {
        if let Some(message) = self.error.take() {
            return Err(DatabaseError::InvalidQuery(message));
        }
        self.action = action;
        let compiled = self.compile()?;

        log::trace!("query: {} params={:?}", compiled.sql, compiled.params);
        if self.debug {
            log::info!("query: {} params={:?}", compiled.sql, compiled.params);
        }

        Ok((self, compiled))
    }

    fn run_rows(self, action: Action) -> Result<RowSet, DatabaseError> {
        let (query, compiled) = self.prepare_compiled(action)?;
        let executor = query.executor()?;

        let mut rows = if query.reusable {
            let (statement, _) = executor.prepare_once(&compiled.sql)?;
            statement.query(&compiled.params)?
        } else {
            executor.prepare(&compiled.sql)?.query(&compiled.params)?
        };

        if let Some(filter) = &query.filter {
            rows.rows.retain(|row| filter(row));
        }
        if let Some(mapper) = &query.mapper {
            rows.rows = rows.rows.into_iter().map(mapper).collect();
        }

        Ok(rows)
    }

    fn run_exec(self, action: Action) -> Result<ExecResult, DatabaseError> {
        let (query, compiled) = self.prepare_compiled(action)?;
        let executor = query.executor()?;

        let result = if query.reusable {
            let (statement, _) = executor.prepare_once(&compiled.sql)?;
            statement.exec(&compiled.params)?
        } else {
            executor.prepare(&compiled.sql)?.exec(&compiled.params)?
        };

        if let Some(hooks) = query.hooks {
            hooks.fire(&Mutation {
                action,
                table: query.table.as_ref().map_or("", |x| x.table.as_str()),
                sql: &compiled.sql,
                params: &compiled.params,
                result,
            })?;
        }

        Ok(result)
    }

    /// Column names plus every row.
    ///
    /// # Errors
    ///
    /// * If compiling, preparing or running fails
    pub fn find_ones(self) -> Result<RowSet, DatabaseError> {
        self.run_rows(Action::Find)
    }

    /// First row. Limits the query to one row unless a limit was set.
    ///
    /// # Errors
    ///
    /// * If compiling, preparing or running fails
    pub fn find_one(self) -> Result<Option<Row>, DatabaseError> {
        let query = if self.limit.is_none() {
            self.limit(1)
        } else {
            self
        };
        Ok(query.find_ones()?.into_first())
    }

    /// First column of every row.
    ///
    /// # Errors
    ///
    /// * If compiling, preparing or running fails
    pub fn find_col(self) -> Result<Vec<DatabaseValue>, DatabaseError> {
        Ok(self.find_ones()?.into_column())
    }

    /// First row as a record. `None` when nothing matched.
    ///
    /// # Errors
    ///
    /// * If compiling, preparing or running fails
    /// * [`DatabaseError::RowScan`] if a column does not fit its attribute
    pub fn find<R: Record>(self) -> Result<Option<R>, DatabaseError> {
        self.find_one()?
            .map(|row| descriptor::<R>().from_row(&row))
            .transpose()
    }

    /// # Errors
    ///
    /// * If compiling, preparing or running fails
    /// * [`DatabaseError::RowScan`] if a column does not fit its attribute
    pub fn find_all<R: Record>(self) -> Result<Vec<R>, DatabaseError> {
        let mut records = vec![];
        self.find_all_into(&mut records)?;
        Ok(records)
    }

    /// Appends the matching records to `target`, returning how many were added.
    ///
    /// # Errors
    ///
    /// * If compiling, preparing or running fails
    /// * [`DatabaseError::RowScan`] if a column does not fit its attribute
    pub fn find_all_into<R: Record>(self, target: &mut Vec<R>) -> Result<usize, DatabaseError> {
        let rows = self.find_ones()?;
        let descriptor = descriptor::<R>();
        target.reserve(rows.len());

        for row in &rows {
            target.push(descriptor.from_row(row)?);
        }

        Ok(rows.len())
    }

    /// # Errors
    ///
    /// * If compiling, preparing or running fails
    pub fn exist(self) -> Result<bool, DatabaseError> {
        Ok(!self.run_rows(Action::Exist)?.is_empty())
    }

    fn aggregate<T>(mut self, aggregate: Aggregate, expr: Expr<'a>) -> Result<T, DatabaseError>
    where
        T: TryFrom<DatabaseValue, Error = TryFromError> + Default,
    {
        self.aggregate = Some((aggregate, expr));
        let value = self
            .run_rows(Action::Find)?
            .into_first()
            .and_then(|row| row.columns.into_iter().next().map(|c| c.1))
            .unwrap_or(DatabaseValue::Null);

        if value.is_null() {
            return Ok(T::default());
        }
        Ok(T::try_from(value)?)
    }

    /// `COUNT(*)`, or `COUNT(DISTINCT first result)` for a distinct query.
    ///
    /// # Errors
    ///
    /// * If compiling, preparing or running fails
    pub fn count(mut self) -> Result<i64, DatabaseError> {
        let expr = if self.distinct && !self.results.is_empty() {
            self.results.remove(0)
        } else {
            self.distinct = false;
            Expr::Column("*".to_string())
        };
        self.aggregate(Aggregate::Count, expr)
    }

    /// `SUM(expr)`, the type's default when no row matched.
    ///
    /// # Errors
    ///
    /// * If compiling, preparing or running fails
    /// * If the result does not convert to `T`
    pub fn sum<T>(self, expr: impl Into<Expr<'a>>) -> Result<T, DatabaseError>
    where
        T: TryFrom<DatabaseValue, Error = TryFromError> + Default,
    {
        self.aggregate(Aggregate::Sum, expr.into())
    }

    /// # Errors
    ///
    /// * If compiling, preparing or running fails
    /// * If the result does not convert to `T`
    pub fn min<T>(self, expr: impl Into<Expr<'a>>) -> Result<T, DatabaseError>
    where
        T: TryFrom<DatabaseValue, Error = TryFromError> + Default,
    {
        self.aggregate(Aggregate::Min, expr.into())
    }

    /// # Errors
    ///
    /// * If compiling, preparing or running fails
    /// * If the result does not convert to `T`
    pub fn max<T>(self, expr: impl Into<Expr<'a>>) -> Result<T, DatabaseError>
    where
        T: TryFrom<DatabaseValue, Error = TryFromError> + Default,
    {
        self.aggregate(Aggregate::Max, expr.into())
    }

    /// # Errors
    ///
    /// * If compiling, preparing or running fails
    /// * If the result does not convert to `T`
    pub fn avg<T>(self, expr: impl Into<Expr<'a>>) -> Result<T, DatabaseError>
    where
        T: TryFrom<DatabaseValue, Error = TryFromError> + Default,
    {
        self.aggregate(Aggregate::Avg, expr.into())
    }

    /// # Errors
    ///
    /// * [`DatabaseError::InvalidQuery`] without fields to insert
    /// * If preparing or running fails, or a hook fails
    pub fn insert(self) -> Result<ExecResult, DatabaseError> {
        self.run_exec(Action::Insert)
    }

    /// # Errors
    ///
    /// * [`DatabaseError::InvalidQuery`] without fields to replace
    /// * If preparing or running fails, or a hook fails
    pub fn replace(self) -> Result<ExecResult, DatabaseError> {
        self.run_exec(Action::Replace)
    }

    /// Insert that updates the existing row on a key conflict. Without explicit
    /// [`Query::on_duplicate`] assignments every non-key field is overwritten.
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::InvalidQuery`] without fields to insert
    /// * If preparing or running fails, or a hook fails
    pub fn insert_or_update(self) -> Result<ExecResult, DatabaseError> {
        self.run_exec(Action::InsertOrUpdate)
    }

    /// # Errors
    ///
    /// * [`DatabaseError::InvalidQuery`] without fields to set
    /// * If preparing or running fails, or a hook fails
    pub fn update(self) -> Result<ExecResult, DatabaseError> {
        self.run_exec(Action::Update)
    }

    /// # Errors
    ///
    /// * If compiling, preparing or running fails, or a hook fails
    pub fn delete(self) -> Result<ExecResult, DatabaseError> {
        self.run_exec(Action::Delete)
    }

    /// Runs the SQL given to [`Query::sql`].
    ///
    /// # Errors
    ///
    /// * [`DatabaseError::InvalidQuery`] without SQL
    /// * If preparing or running fails
    pub fn exec(self) -> Result<ExecResult, DatabaseError> {
        self.run_exec(Action::Exec)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn compiled(query: &Query<'_>) -> (String, Vec<DatabaseValue>) {
        let compiled = query.to_sql().unwrap();
        (compiled.sql, compiled.params)
    }

    #[test_log::test]
    fn select_with_attr_raw_where_order_and_limit() {
        let query = Query::new()
            .table("users")
            .result(["id", "name"])
            .attr("state", 1)
            .where_clause("age>:a")
            .param("a", 18)
            .desc("id")
            .limit(10);

        assert_eq!(
            compiled(&query),
            (
                "SELECT `id`,`name` FROM `users` WHERE `state`=? AND age>? ORDER BY `id` DESC LIMIT ?"
                    .to_string(),
                vec![
                    DatabaseValue::Int64(1),
                    DatabaseValue::Int64(18),
                    DatabaseValue::UInt64(10)
                ]
            )
        );
    }

    #[test_log::test]
    fn placeholder_count_matches_params() {
        let query = Query::new()
            .table("t")
            .attr_in("id", [1, 2, 3])
            .between("age", 10, 20)
            .like("name", "L%")
            .not_in("state", [4])
            .where_args("a=? OR b='?'", [5])
            .having_args("COUNT(*)>?", [1])
            .group("name")
            .limit(5)
            .offset(10);

        let (sql, params) = compiled(&query);
        assert_eq!(sql.matches('?').count() - 1, params.len());
        assert_eq!(
            sql,
            "SELECT * FROM `t` WHERE `id` IN (?,?,?) AND `age` BETWEEN ? AND ? AND `name` LIKE ? \
             AND `state` NOT IN (?) AND (a=? OR b='?') GROUP BY `name` HAVING COUNT(*)>? \
             LIMIT ? OFFSET ?"
        );
        assert_eq!(params.len(), 11);
        assert_eq!(params[7], DatabaseValue::Int64(5));
    }

    #[test_log::test]
    fn empty_params_leave_sql_unchanged() {
        let (sql, params) = compiled(&Query::new().sql("SELECT 1"));
        assert_eq!(sql, "SELECT 1");
        assert!(params.is_empty());
    }

    #[test_log::test]
    fn single_element_list_collapses_and_empty_list_matches_nothing() {
        let (sql, _) = compiled(&Query::new().table("t").attr_in("id", [7]));
        assert_eq!(sql, "SELECT * FROM `t` WHERE `id`=?");

        let (sql, params) = compiled(&Query::new().table("t").attr_in("id", Vec::<i64>::new()));
        assert_eq!(sql, "SELECT * FROM `t` WHERE 1=0");
        assert!(params.is_empty());
    }

    #[test_log::test]
    fn later_attr_replaces_earlier_one() {
        let (sql, params) = compiled(&Query::new().table("t").attr("a", 1).attr("a", 2));
        assert_eq!(sql, "SELECT * FROM `t` WHERE `a`=?");
        assert_eq!(params, vec![DatabaseValue::Int64(2)]);
    }

    #[test_log::test]
    fn sub_query_params_merge_in_textual_order() {
        let sub = Query::new()
            .table("orders")
            .result(["user_id"])
            .attr("paid", true)
            .where_clause("total>:min")
            .param("min", 100);

        let query = Query::new()
            .table("users")
            .attr("state", 1)
            .attr_sub("id", sub)
            .where_clause("age>:min")
            .param("min", 18);

        let (sql, params) = compiled(&query);
        assert_eq!(
            sql,
            "SELECT * FROM `users` WHERE `state`=? AND `id` IN (SELECT `user_id` FROM `orders` \
             WHERE `paid`=? AND total>?) AND age>?"
        );
        assert_eq!(
            params,
            vec![
                DatabaseValue::Int64(1),
                DatabaseValue::Bool(true),
                DatabaseValue::Int64(100),
                DatabaseValue::Int64(18),
            ]
        );
    }

    #[test_log::test]
    fn sub_query_as_result_expression() {
        let sub = Query::new()
            .table("orders")
            .result([DbFunc::new("COUNT(*)")])
            .where_clause("orders.user_id=users.id");

        let (sql, _) = compiled(&Query::new().table("users").result(["id"]).result([sub]));
        assert_eq!(
            sql,
            "SELECT `id`,(SELECT COUNT(*) FROM `orders` WHERE orders.user_id=users.id) FROM `users`"
        );
    }

    #[test_log::test]
    fn joins_qualify_and_rewrite_model_references() {
        let query = Query::new()
            .table(TableRef::new("tea_users", Some("User")))
            .result(["id", "self.name", "Order.total"])
            .join(TableRef::new("tea_orders", Some("Order")), "Order.user_id=self.id")
            .left_join("profiles", "profiles.user_id=User.id")
            .attr("state", 1)
            .asc("Order.created_at");

        let (sql, _) = compiled(&query);
        assert_eq!(
            sql,
            "SELECT `tea_users`.`id`,`tea_users`.`name`,`tea_orders`.`total` FROM `tea_users` \
             LEFT JOIN `profiles` ON profiles.user_id=`tea_users`.`id`,`tea_orders` \
             WHERE `tea_users`.`state`=? AND `tea_orders`.`user_id`=`tea_users`.`id` \
             ORDER BY `tea_orders`.`created_at` ASC"
        );
    }

    #[test_log::test]
    fn hints_partitions_and_locks() {
        let query = Query::new()
            .table("t")
            .partitions(["p0", "p1"])
            .force_index(["idx_a"])
            .use_index(["idx_b", "idx_c"])
            .index_for("ORDER BY")
            .sql_cache(SqlCache::NoCache)
            .distinct()
            .result(["a"])
            .for_update();

        let (sql, _) = compiled(&query);
        assert_eq!(
            sql,
            "SELECT SQL_NO_CACHE DISTINCT `a` FROM `t` PARTITION(p0,p1) FORCE INDEX (`idx_a`) \
             USE INDEX FOR ORDER BY (`idx_b`,`idx_c`) FOR UPDATE"
        );

        let (sql, _) = compiled(&Query::new().table("t").shared_lock());
        assert_eq!(sql, "SELECT * FROM `t` LOCK IN SHARE MODE");
    }

    #[test_log::test]
    fn aggregates_drop_order_and_limit() {
        let mut query = Query::new().table("t").attr("a", 1).desc("id").limit(3);
        query.aggregate = Some((Aggregate::Sum, "score".into()));

        let (sql, params) = compiled(&query);
        assert_eq!(sql, "SELECT SUM(`score`) FROM `t` WHERE `a`=?");
        assert_eq!(params, vec![DatabaseValue::Int64(1)]);
    }

    #[test_log::test]
    fn insert_update_replace_and_delete() {
        let insert = Query::new()
            .table("users")
            .set("name", "Lily")
            .set_func("created_at", DbFunc::now())
            .action(Action::Insert);
        assert_eq!(
            compiled(&insert).0,
            "INSERT INTO `users` (`name`,`created_at`) VALUES (?,NOW())"
        );

        let replace = Query::new()
            .table("users")
            .partitions(["p1"])
            .set("id", 1)
            .action(Action::Replace);
        assert_eq!(
            compiled(&replace).0,
            "REPLACE INTO `users` PARTITION(p1) (`id`) VALUES (?)"
        );

        let update = Query::new()
            .table("users")
            .set("name", "Lily2")
            .increase("visits", 1)
            .decrease("credits", 2)
            .attr("id", 42)
            .action(Action::Update);
        assert_eq!(
            compiled(&update),
            (
                "UPDATE `users` SET `name`=?,`visits`=`visits`+?,`credits`=`credits`-? WHERE `id`=?"
                    .to_string(),
                vec![
                    DatabaseValue::String("Lily2".to_string()),
                    DatabaseValue::Int64(1),
                    DatabaseValue::Int64(2),
                    DatabaseValue::Int64(42),
                ]
            )
        );

        let delete = Query::new()
            .table("users")
            .attr("id", 42)
            .limit(1)
            .action(Action::Delete);
        assert_eq!(
            compiled(&delete).0,
            "DELETE FROM `users` WHERE `id`=? LIMIT ?"
        );
    }

    #[test_log::test]
    fn upsert_per_dialect() {
        let upsert = |dialect| {
            Query::new()
                .dialect(dialect)
                .table("users")
                .set("id", 1)
                .set("name", "Lily")
                .action(Action::InsertOrUpdate)
        };

        assert_eq!(
            compiled(&upsert(Dialect::Mysql)).0,
            "INSERT INTO `users` (`id`,`name`) VALUES (?,?) ON DUPLICATE KEY UPDATE `name`=VALUES(`name`)"
        );
        assert_eq!(
            compiled(&upsert(Dialect::Sqlite)).0,
            "INSERT INTO \"users\" (\"id\",\"name\") VALUES (?,?) ON CONFLICT DO UPDATE SET \"name\"=excluded.\"name\""
        );

        let explicit = upsert(Dialect::Mysql).on_duplicate("name", "again");
        assert_eq!(
            compiled(&explicit),
            (
                "INSERT INTO `users` (`id`,`name`) VALUES (?,?) ON DUPLICATE KEY UPDATE `name`=?"
                    .to_string(),
                vec![
                    DatabaseValue::Int64(1),
                    DatabaseValue::String("Lily".to_string()),
                    DatabaseValue::String("again".to_string()),
                ]
            )
        );
    }

    #[test_log::test]
    fn misuse_is_reported() {
        assert!(matches!(
            Query::new().table("t").action(Action::Insert).to_sql(),
            Err(DatabaseError::InvalidQuery(_))
        ));
        assert!(matches!(
            Query::new().action(Action::Find).to_sql(),
            Err(DatabaseError::InvalidQuery(_))
        ));
        assert!(matches!(
            Query::new().table("t").where_args("a=? AND b=?", [1]).to_sql(),
            Err(DatabaseError::InvalidQuery(_))
        ));
        assert!(matches!(
            Query::new().table("t").where_clause("a=:missing").to_sql(),
            Err(DatabaseError::InvalidQuery(_))
        ));
        assert!(matches!(
            Query::new().table("t").find_ones(),
            Err(DatabaseError::InvalidQuery(_))
        ));
    }

    #[test_log::test]
    fn failed_sub_queries_fail_the_parent() {
        let mismatched = Query::new()
            .table("orders")
            .result(["user_id"])
            .where_args("total>? AND paid=?", [100]);
        assert!(matches!(
            Query::new().table("users").attr_sub("id", mismatched).to_sql(),
            Err(DatabaseError::InvalidQuery(_))
        ));

        let unhinted = Query::new().table("orders").index_for("ORDER BY");
        assert!(matches!(
            Query::new().table("users").not_in_sub("id", unhinted).to_sql(),
            Err(DatabaseError::InvalidQuery(message)) if message.contains("index_for")
        ));

        let counted = Query::new()
            .table("orders")
            .result([DbFunc::new("COUNT(*)")])
            .where_args("user_id=?", [1, 2]);
        assert!(matches!(
            Query::new().table("users").result([counted]).to_sql(),
            Err(DatabaseError::InvalidQuery(_))
        ));
    }

    #[test_log::test]
    fn round_trip_reuses_names_and_follows_the_dialect() {
        let query = Query::new()
            .dialect(Dialect::Sqlite)
            .table("users")
            .result(["name"])
            .where_clause("age>=:min OR parent_age>=:min")
            .attr_in("state", [1, 2])
            .param("min", 21)
            .asc("name")
            .desc("id")
            .limit(5)
            .offset(20);

        assert_eq!(
            compiled(&query),
            (
                "SELECT \"name\" FROM \"users\" WHERE \"state\" IN (?,?) \
                 AND (age>=? OR parent_age>=?) ORDER BY \"name\" ASC,\"id\" DESC LIMIT ? OFFSET ?"
                    .to_string(),
                vec![
                    DatabaseValue::Int64(1),
                    DatabaseValue::Int64(2),
                    DatabaseValue::Int64(21),
                    DatabaseValue::Int64(21),
                    DatabaseValue::UInt64(5),
                    DatabaseValue::UInt64(20),
                ]
            )
        );
    }

    #[test_log::test]
    fn brackets_for_mssql_and_double_quotes_for_sqlite() {
        let (sql, _) = compiled(&Query::new().dialect(Dialect::Mssql).table("t").attr("a", 1));
        assert_eq!(sql, "SELECT * FROM [t] WHERE [a]=?");

        let (sql, _) = compiled(&Query::new().dialect(Dialect::Sqlite).table("t").attr("a", 1));
        assert_eq!(sql, "SELECT * FROM \"t\" WHERE \"a\"=?");
    }
}
