//! SQL rendering and named-parameter binding
//!
//! A query renders to a list of text pieces and nested sub-queries. Each text piece has its
//! `self.`/`Model.` references qualified and its `:name` tokens bound against the owning query's
//! parameters, so a sub-query's parameters land in the parent's vector at the position where
//! the sub-query appears.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::{Captures, Regex};

use crate::{
    DatabaseError, DatabaseValue,
    driver::Dialect,
    query::{Assignment, Condition, Query, expr::Action, expr::Expr, expr::JoinKind, expr::Operand},
};

/// SQL with `?` placeholders and the values for them, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Compiled {
    pub sql: String,
    pub params: Vec<DatabaseValue>,
}

static MODEL_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(^|[^A-Za-z0-9_.`"\]])([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)"#)
        .expect("Invalid Regex")
});

enum Piece<'q, 'a> {
    Text(String),
    Sub(&'q Query<'a>),
}

struct Pieces<'q, 'a>(Vec<Piece<'q, 'a>>);

impl<'q, 'a> Pieces<'q, 'a> {
    fn text(&mut self, text: &str) {
        if let Some(Piece::Text(last)) = self.0.last_mut() {
            last.push_str(text);
        } else {
            self.0.push(Piece::Text(text.to_string()));
        }
    }

    fn sub(&mut self, query: &'q Query<'a>) {
        self.text("(");
        self.0.push(Piece::Sub(query));
        self.text(")");
    }

    fn list<T>(
        &mut self,
        items: impl IntoIterator<Item = T>,
        separator: &str,
        mut f: impl FnMut(&mut Self, T),
    ) {
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                self.text(separator);
            }
            f(self, item);
        }
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

static OR_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bOR\b").expect("Invalid Regex"));

/// Splits `text` into `(quoted, segment)` runs. Quoted runs keep their delimiters.
fn literal_segments(text: &str) -> Vec<(bool, &str)> {
    let mut segments = vec![];
    let mut start = 0;
    let mut quote = None;
    let mut chars = text.char_indices();

    while let Some((i, c)) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' && q != '`' {
                    chars.next();
                } else if c == q {
                    segments.push((true, &text[start..=i]));
                    start = i + 1;
                    quote = None;
                }
            }
            None if matches!(c, '\'' | '"' | '`') => {
                if i > start {
                    segments.push((false, &text[start..i]));
                }
                start = i;
                quote = Some(c);
            }
            None => {}
        }
    }

    if start < text.len() {
        segments.push((quote.is_some(), &text[start..]));
    }

    segments
}

/// Raw clauses containing `OR` are parenthesized before being joined with `AND`.
fn guarded(clause: &str) -> String {
    if literal_segments(clause)
        .iter()
        .any(|(quoted, x)| !quoted && OR_KEYWORD.is_match(x))
    {
        format!("({clause})")
    } else {
        clause.to_string()
    }
}

/// Replaces every `:name` outside quotes with `?` and appends its value.
fn bind(
    text: &str,
    params: &BTreeMap<String, DatabaseValue>,
    out: &mut Compiled,
) -> Result<(), DatabaseError> {
    let mut chars = text.char_indices().peekable();
    let mut quote = None;
    let mut prev = None;

    while let Some((i, c)) = chars.next() {
        if let Some(q) = quote {
            out.sql.push(c);
            if c == '\\' && q != '`' {
                if let Some((_, escaped)) = chars.next() {
                    out.sql.push(escaped);
                }
            } else if c == q {
                quote = None;
            }
            prev = Some(c);
            continue;
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                out.sql.push(c);
            }
            ':' if prev != Some(':')
                && chars
                    .peek()
                    .is_some_and(|&(_, next)| next.is_ascii_alphabetic() || next == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, next)) = chars.peek() {
                    if !(next.is_ascii_alphanumeric() || next == '_') {
                        break;
                    }
                    end = j + next.len_utf8();
                    chars.next();
                }

                let name = &text[start..end];
                let value = params.get(name).ok_or_else(|| {
                    DatabaseError::InvalidQuery(format!("missing parameter ':{name}'"))
                })?;
                out.sql.push('?');
                out.params.push(value.clone());
            }
            c => out.sql.push(c),
        }

        prev = Some(c);
    }

    Ok(())
}

/// Qualifies `self.col` and `Model.col` for every model name in `references`. Quoted text is
/// left alone.
fn qualify_references(text: &str, dialect: Dialect, references: &[(String, String)]) -> String {
    if references.is_empty() || !text.contains('.') {
        return text.to_string();
    }

    literal_segments(text)
        .into_iter()
        .map(|(quoted, segment)| {
            if quoted {
                return segment.to_string();
            }
            MODEL_REFERENCE
                .replace_all(segment, |caps: &Captures<'_>| {
                    references
                        .iter()
                        .find(|(model, _)| model == &caps[2])
                        .map_or_else(
                            || caps[0].to_string(),
                            |(_, table)| {
                                format!("{}{table}.{}", &caps[1], dialect.quote(&caps[3]))
                            },
                        )
                })
                .into_owned()
        })
        .collect()
}

impl<'a> Query<'a> {
    pub(super) fn compile(&self) -> Result<Compiled, DatabaseError> {
        let mut out = Compiled::default();
        self.write(self.dialect, &mut out)?;
        Ok(out)
    }

    fn write(&self, dialect: Dialect, out: &mut Compiled) -> Result<(), DatabaseError> {
        if let Some(message) = &self.error {
            return Err(DatabaseError::InvalidQuery(message.clone()));
        }
        let references = self.model_references(dialect);

        for piece in self.render(dialect)?.0 {
            match piece {
                Piece::Text(text) => {
                    bind(
                        &qualify_references(&text, dialect, &references),
                        &self.params,
                        out,
                    )?;
                }
                Piece::Sub(sub) => sub.write(dialect, out)?,
            }
        }

        Ok(())
    }

    fn model_references(&self, dialect: Dialect) -> Vec<(String, String)> {
        let mut references = vec![];

        if let Some(table) = &self.table {
            let quoted = dialect.quote(&table.table);
            references.push(("self".to_string(), quoted.clone()));
            if let Some(model) = &table.model {
                references.push((model.clone(), quoted));
            }
        }
        for join in &self.joins {
            if let Some(model) = &join.target.model {
                references.push((model.clone(), dialect.quote(&join.target.table)));
            }
        }

        references
    }

    fn column(&self, dialect: Dialect, name: &str, qualify: bool) -> String {
        if !is_identifier(name) {
            return name.to_string();
        }

        match &self.table {
            Some(table) if qualify && !self.joins.is_empty() => {
                format!("{}.{}", dialect.quote(&table.table), dialect.quote(name))
            }
            _ => dialect.quote(name),
        }
    }

    fn expr<'q>(&'q self, dialect: Dialect, expr: &'q Expr<'a>, sql: &mut Pieces<'q, 'a>) {
        match expr {
            Expr::Column(name) => sql.text(&self.column(dialect, name, true)),
            Expr::Func(func) => sql.text(&func.expression),
            Expr::Sub(sub) => sql.sub(sub),
        }
    }

    fn assignment(
        &self,
        dialect: Dialect,
        column: &str,
        assignment: &Assignment,
        qualify: bool,
    ) -> String {
        let quoted = self.column(dialect, column, qualify);
        match assignment {
            Assignment::Param(param) => param.clone(),
            Assignment::Raw(expr) => expr.clone(),
            Assignment::Increase(param) => format!("{quoted}+{param}"),
            Assignment::Decrease(param) => format!("{quoted}-{param}"),
        }
    }

    fn render<'q>(&'q self, dialect: Dialect) -> Result<Pieces<'q, 'a>, DatabaseError> {
        let mut sql = Pieces(vec![]);

        if let Some(raw) = &self.raw_sql {
            sql.text(raw);
            return Ok(sql);
        }

        let table = self
            .table
            .as_ref()
            .map(|x| x.table.as_str())
            .filter(|x| !x.is_empty())
            .ok_or_else(|| DatabaseError::InvalidQuery("query has no table".to_string()))?;

        match self.action {
            Action::Find | Action::Exist => self.render_select(dialect, table, &mut sql)?,
            Action::Insert | Action::Replace | Action::InsertOrUpdate => {
                self.render_insert(dialect, table, &mut sql)?;
            }
            Action::Update => self.render_update(dialect, &mut sql)?,
            Action::Delete => self.render_delete(dialect, table, &mut sql)?,
            Action::Exec => {
                return Err(DatabaseError::InvalidQuery("exec without SQL".to_string()));
            }
        }

        Ok(sql)
    }

    fn render_select<'q>(
        &'q self,
        dialect: Dialect,
        table: &str,
        sql: &mut Pieces<'q, 'a>,
    ) -> Result<(), DatabaseError> {
        sql.text("SELECT ");
        if let Some(cache) = self.sql_cache {
            sql.text(cache.keyword());
            sql.text(" ");
        }

        match (&self.aggregate, self.action) {
            (_, Action::Exist) => sql.text("1"),
            (Some((aggregate, expr)), _) => {
                sql.text(aggregate.function());
                sql.text("(");
                if self.distinct {
                    sql.text("DISTINCT ");
                }
                self.expr(dialect, expr, sql);
                sql.text(")");
            }
            (None, _) => {
                if self.distinct {
                    sql.text("DISTINCT ");
                }
                if self.results.is_empty() {
                    if self.joins.is_empty() {
                        sql.text("*");
                    } else {
                        sql.text(&format!("{}.*", dialect.quote(table)));
                    }
                } else {
                    sql.list(&self.results, ",", |sql, x| self.expr(dialect, x, sql));
                }
            }
        }

        sql.text(" FROM ");
        self.render_from(dialect, table, true, sql);
        self.render_where(dialect, sql);

        if !self.groups.is_empty() {
            sql.text(" GROUP BY ");
            sql.list(&self.groups, ",", |sql, x| self.expr(dialect, x, sql));
        }
        if !self.havings.is_empty() {
            sql.text(" HAVING ");
            sql.list(&self.havings, " AND ", |sql, x| sql.text(&guarded(x)));
        }

        if self.aggregate.is_some() {
            return Ok(());
        }

        if self.action == Action::Exist {
            sql.text(" LIMIT 1");
        } else {
            self.render_order(dialect, sql);
            self.render_limit(sql)?;
        }

        if let Some(lock) = self.lock {
            sql.text(" ");
            sql.text(lock.clause());
        }

        Ok(())
    }

    fn render_from<'q>(&'q self, dialect: Dialect, table: &str, hints: bool, sql: &mut Pieces<'q, 'a>) {
        sql.text(&dialect.quote(table));

        if !self.partitions.is_empty() {
            sql.text(&format!(" PARTITION({})", self.partitions.join(",")));
        }

        if hints {
            for hint in &self.index_hints {
                sql.text(&format!(" {} INDEX", hint.kind.keyword()));
                if let Some(scope) = &hint.scope {
                    sql.text(&format!(" FOR {scope}"));
                }
                let indexes = hint
                    .indexes
                    .iter()
                    .map(|x| dialect.quote(x))
                    .collect::<Vec<_>>()
                    .join(",");
                sql.text(&format!(" ({indexes})"));
            }
        }

        for join in self.joins.iter().filter(|x| x.kind != JoinKind::Default) {
            let keyword = if join.kind == JoinKind::Left {
                "LEFT"
            } else {
                "RIGHT"
            };
            sql.text(&format!(
                " {keyword} JOIN {} ON {}",
                dialect.quote(&join.target.table),
                join.on
            ));
        }
        for join in self.joins.iter().filter(|x| x.kind == JoinKind::Default) {
            sql.text(",");
            sql.text(&dialect.quote(&join.target.table));
        }
    }

    fn render_where<'q>(&'q self, dialect: Dialect, sql: &mut Pieces<'q, 'a>) {
        let mut first = true;
        let mut next = |sql: &mut Pieces<'q, 'a>| {
            sql.text(if first { " WHERE " } else { " AND " });
            first = false;
        };

        for (column, operand) in &self.attrs {
            next(sql);
            let column = self.column(dialect, column, true);
            match operand {
                Operand::Param(param) => sql.text(&format!("{column}={param}")),
                Operand::List(params) => match params.as_slice() {
                    [] => sql.text("1=0"),
                    [param] => sql.text(&format!("{column}={param}")),
                    params => sql.text(&format!("{column} IN ({})", params.join(","))),
                },
                Operand::Sub(sub) => {
                    sql.text(&format!("{column} IN "));
                    sql.sub(sub);
                }
            }
        }

        for condition in &self.conditions {
            next(sql);
            match condition {
                Condition::NotIn { column, operand } => {
                    let column = self.column(dialect, column, true);
                    match operand {
                        Operand::List(params) if params.is_empty() => sql.text("1=1"),
                        Operand::List(params) => {
                            sql.text(&format!("{column} NOT IN ({})", params.join(",")));
                        }
                        Operand::Param(param) => sql.text(&format!("{column}!={param}")),
                        Operand::Sub(sub) => {
                            sql.text(&format!("{column} NOT IN "));
                            sql.sub(sub);
                        }
                    }
                }
                Condition::Compare { column, op, param } => {
                    let column = self.column(dialect, column, true);
                    if op.chars().all(|c| c.is_ascii_alphabetic()) {
                        sql.text(&format!("{column} {op} {param}"));
                    } else {
                        sql.text(&format!("{column}{op}{param}"));
                    }
                }
                Condition::Between { column, low, high } => {
                    let column = self.column(dialect, column, true);
                    sql.text(&format!("{column} BETWEEN {low} AND {high}"));
                }
                Condition::Raw(clause) => sql.text(&guarded(clause)),
            }
        }

        for join in self.joins.iter().filter(|x| x.kind == JoinKind::Default) {
            next(sql);
            sql.text(&guarded(&join.on));
        }
    }

    fn render_order<'q>(&'q self, dialect: Dialect, sql: &mut Pieces<'q, 'a>) {
        if self.orders.is_empty() {
            return;
        }

        sql.text(" ORDER BY ");
        sql.list(&self.orders, ",", |sql, (expr, direction)| {
            self.expr(dialect, expr, sql);
            if let Some(token) = direction.token() {
                sql.text(" ");
                sql.text(token);
            }
        });
    }

    fn render_limit(&self, sql: &mut Pieces<'_, 'a>) -> Result<(), DatabaseError> {
        match (&self.limit, &self.offset) {
            (Some(limit), offset) => {
                sql.text(&format!(" LIMIT {limit}"));
                if let Some(offset) = offset {
                    sql.text(&format!(" OFFSET {offset}"));
                }
                Ok(())
            }
            (None, Some(_)) => Err(DatabaseError::InvalidQuery(
                "offset without limit".to_string(),
            )),
            (None, None) => Ok(()),
        }
    }

    fn render_insert(
        &self,
        dialect: Dialect,
        table: &str,
        sql: &mut Pieces<'_, 'a>,
    ) -> Result<(), DatabaseError> {
        if self.saving.is_empty() {
            return Err(DatabaseError::InvalidQuery(format!(
                "{:?} on '{table}' without fields",
                self.action
            )));
        }

        sql.text(if self.action == Action::Replace {
            "REPLACE INTO "
        } else {
            "INSERT INTO "
        });
        sql.text(&dialect.quote(table));
        if !self.partitions.is_empty() {
            sql.text(&format!(" PARTITION({})", self.partitions.join(",")));
        }

        let columns = self
            .saving
            .iter()
            .map(|(column, _)| self.column(dialect, column, false))
            .collect::<Vec<_>>();
        let values = self
            .saving
            .iter()
            .map(|(column, x)| self.assignment(dialect, column, x, false))
            .collect::<Vec<_>>();
        sql.text(&format!(
            " ({}) VALUES ({})",
            columns.join(","),
            values.join(",")
        ));

        if self.action != Action::InsertOrUpdate {
            return Ok(());
        }

        let assignments = if self.replacing.is_empty() {
            let mut updated = self
                .saving
                .iter()
                .filter(|(column, _)| column != &self.primary_key)
                .collect::<Vec<_>>();
            if updated.is_empty() {
                updated = self.saving.iter().collect();
            }
            updated
                .into_iter()
                .map(|(column, _)| {
                    let quoted = self.column(dialect, column, false);
                    if dialect == Dialect::Sqlite {
                        format!("{quoted}=excluded.{quoted}")
                    } else {
                        format!("{quoted}=VALUES({quoted})")
                    }
                })
                .collect::<Vec<_>>()
        } else {
            self.replacing
                .iter()
                .map(|(column, x)| {
                    format!(
                        "{}={}",
                        self.column(dialect, column, false),
                        self.assignment(dialect, column, x, false)
                    )
                })
                .collect()
        };

        sql.text(if dialect == Dialect::Sqlite {
            " ON CONFLICT DO UPDATE SET "
        } else {
            " ON DUPLICATE KEY UPDATE "
        });
        sql.text(&assignments.join(","));

        Ok(())
    }

    fn render_update<'q>(&'q self, dialect: Dialect, sql: &mut Pieces<'q, 'a>) -> Result<(), DatabaseError> {
        let Some(table) = &self.table else {
            return Err(DatabaseError::InvalidQuery("query has no table".to_string()));
        };
        if self.saving.is_empty() {
            return Err(DatabaseError::InvalidQuery(format!(
                "update on '{}' without fields",
                table.table
            )));
        }

        sql.text("UPDATE ");
        self.render_from(dialect, &table.table, false, sql);
        sql.text(" SET ");
        sql.list(&self.saving, ",", |sql, (column, x)| {
            sql.text(&format!(
                "{}={}",
                self.column(dialect, column, true),
                self.assignment(dialect, column, x, true)
            ));
        });
        self.render_where(dialect, sql);
        self.render_order(dialect, sql);
        self.render_limit(sql)
    }

    fn render_delete<'q>(
        &'q self,
        dialect: Dialect,
        table: &str,
        sql: &mut Pieces<'q, 'a>,
    ) -> Result<(), DatabaseError> {
        if self.joins.is_empty() {
            sql.text("DELETE FROM ");
        } else {
            sql.text(&format!("DELETE {} FROM ", dialect.quote(table)));
        }
        self.render_from(dialect, table, false, sql);
        self.render_where(dialect, sql);
        self.render_order(dialect, sql);
        self.render_limit(sql)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn bound(text: &str, params: &[(&str, DatabaseValue)]) -> Result<Compiled, DatabaseError> {
        let params = params
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect();
        let mut out = Compiled::default();
        bind(text, &params, &mut out)?;
        Ok(out)
    }

    #[test_log::test]
    fn binds_names_in_textual_order() {
        let out = bound(
            "a=:b AND c=:a AND d=:b",
            &[("a", DatabaseValue::Int64(1)), ("b", DatabaseValue::Int64(2))],
        )
        .unwrap();

        assert_eq!(out.sql, "a=? AND c=? AND d=?");
        assert_eq!(
            out.params,
            vec![
                DatabaseValue::Int64(2),
                DatabaseValue::Int64(1),
                DatabaseValue::Int64(2)
            ]
        );
    }

    #[test_log::test]
    fn leaves_quoted_text_casts_and_assignments_alone() {
        let out = bound(
            "SELECT '10:30', \"x:y\", 'it''s :a', @v:=1, a::text, `c:d` WHERE e=:a",
            &[("a", DatabaseValue::Int64(1))],
        )
        .unwrap();

        assert_eq!(
            out.sql,
            "SELECT '10:30', \"x:y\", 'it''s :a', @v:=1, a::text, `c:d` WHERE e=?"
        );
        assert_eq!(out.params.len(), 1);
    }

    #[test_log::test]
    fn unknown_name_is_an_error() {
        assert!(matches!(
            bound("a=:nope", &[]),
            Err(DatabaseError::InvalidQuery(_))
        ));
    }

    #[test_log::test]
    fn qualifies_only_known_bare_model_prefixes() {
        let references = vec![
            ("self".to_string(), "`users`".to_string()),
            ("User".to_string(), "`users`".to_string()),
            ("Order".to_string(), "`orders`".to_string()),
        ];

        assert_eq!(
            qualify_references(
                "self.id=Order.user_id AND x.User.id=1 AND Other.a=1.5 AND `User`.b",
                Dialect::Mysql,
                &references
            ),
            "`users`.`id`=`orders`.`user_id` AND x.User.id=1 AND Other.a=1.5 AND `User`.b"
        );
    }

    #[test_log::test]
    fn quoted_text_is_never_qualified() {
        let references = vec![("User".to_string(), "`users`".to_string())];

        assert_eq!(
            qualify_references(
                "User.name='User.name' AND note=\"see User.id\" AND User.id>0",
                Dialect::Mysql,
                &references
            ),
            "`users`.`name`='User.name' AND note=\"see User.id\" AND `users`.`id`>0"
        );
    }

    #[test_log::test]
    fn or_is_guarded_in_any_case_and_spacing() {
        assert_eq!(guarded("a=1 or b=2"), "(a=1 or b=2)");
        assert_eq!(guarded("a=1\nOR\tb=2"), "(a=1\nOR\tb=2)");
        assert_eq!(guarded("(a=1)Or(b=2)"), "((a=1)Or(b=2))");
        assert_eq!(guarded("name='x or y'"), "name='x or y'");
        assert_eq!(guarded("color='red' AND orders>1"), "color='red' AND orders>1");
    }
}
