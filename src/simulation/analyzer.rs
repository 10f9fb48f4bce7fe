//! Static SQL analyzer
//!
//! Validates a statement against the captured snapshot without a database
//! connection. Reports the first problem with the message Postgres would give,
//! so classification and repair behave the same as with a live dry run.
//! Unqualified columns are only checked when every relation in scope is a
//! real table.

use async_trait::async_trait;
use sqlparser::ast::{
    visit_expressions, visit_relations, BinaryOperator, Expr, FunctionArg, FunctionArgExpr, Query, Select,
    SelectItem, SetExpr, Statement, TableFactor, Value,
};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use super::{parse_read_only, SqlCheck, SqlValidator};
use crate::error::AppError;
use crate::introspection::{Column, SchemaSnapshot, Table};

const KNOWN_FUNCTIONS: &[&str] = &[
    "count", "sum", "avg", "min", "max", "round", "abs", "floor", "ceil", "coalesce", "nullif",
    "greatest", "least", "lower", "upper", "length", "trim", "concat", "substring", "replace",
    "date_trunc", "date_part", "extract", "now", "age", "to_char", "to_date", "current_date",
    "current_timestamp", "string_agg", "array_agg", "bool_and", "bool_or", "stddev", "variance",
    "percentile_cont", "row_number", "rank", "dense_rank", "lag", "lead", "first_value",
    "last_value", "ntile", "generate_series", "cast",
];

/// Aggregates that only accept numeric input
const NUMERIC_AGGREGATES: &[&str] = &["sum", "avg", "stddev", "variance"];

const BARE_KEYWORDS: &[&str] = &[
    "current_date", "current_timestamp", "current_time", "localtime", "localtimestamp", "current_user",
];

pub struct StaticAnalyzer;

impl StaticAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn check(sql: &str, snapshot: &SchemaSnapshot) -> SqlCheck {
        let statement = match parse_read_only(sql) {
            Ok(statement) => statement,
            Err(error) => return SqlCheck::invalid(error),
        };

        let mut scope = Scope::new(snapshot);
        if let Statement::Query(query) = &statement {
            scope.collect_query(query);
        }

        if let Err(error) = scope.check_relations(&statement) {
            return SqlCheck::invalid(error);
        }
        if let Err(error) = scope.check_expressions(&statement) {
            return SqlCheck::invalid(error);
        }
        SqlCheck::Valid
    }
}

impl Default for StaticAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SqlValidator for StaticAnalyzer {
    async fn validate(&self, sql: &str, snapshot: &SchemaSnapshot) -> Result<SqlCheck, AppError> {
        Ok(Self::check(sql, snapshot))
    }
}

/// Tables and names visible to a statement
struct Scope<'a> {
    snapshot: &'a SchemaSnapshot,
    /// lowercase table name or alias -> table
    tables: HashMap<String, &'a Table>,
    ctes: HashSet<String>,
    aliases: HashSet<String>,
    /// CTEs, derived tables or subqueries make unqualified names unresolvable
    opaque: bool,
}

impl<'a> Scope<'a> {
    fn new(snapshot: &'a SchemaSnapshot) -> Self {
        Self {
            snapshot,
            tables: HashMap::new(),
            ctes: HashSet::new(),
            aliases: HashSet::new(),
            opaque: false,
        }
    }

    fn collect_query(&mut self, query: &Query) {
        if let Some(with) = &query.with {
            self.opaque = true;
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
                self.collect_query(&cte.query);
            }
        }
        self.collect_set_expr(&query.body);
    }

    fn collect_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => self.collect_select(select),
            SetExpr::Query(query) => self.collect_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_set_expr(left);
                self.collect_set_expr(right);
            }
            _ => self.opaque = true,
        }
    }

    fn collect_select(&mut self, select: &Select) {
        for item in &select.projection {
            if let SelectItem::ExprWithAlias { alias, .. } = item {
                self.aliases.insert(alias.value.to_lowercase());
            }
        }
        for from in &select.from {
            self.collect_factor(&from.relation);
            for join in &from.joins {
                self.collect_factor(&join.relation);
            }
        }
    }

    fn collect_factor(&mut self, factor: &TableFactor) {
        match factor {
            TableFactor::Table { name, alias, .. } => {
                if let Some(table) = self.snapshot.find_table(&name.to_string()) {
                    self.tables.insert(table.name.to_lowercase(), table);
                    if let Some(alias) = alias {
                        self.tables.insert(alias.name.value.to_lowercase(), table);
                    }
                } else if self.ctes.contains(&name.to_string().to_lowercase()) {
                    if let Some(alias) = alias {
                        self.ctes.insert(alias.name.value.to_lowercase());
                    }
                }
            }
            TableFactor::Derived { subquery, alias, .. } => {
                self.opaque = true;
                if let Some(alias) = alias {
                    self.ctes.insert(alias.name.value.to_lowercase());
                }
                self.collect_query(subquery);
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.collect_factor(&table_with_joins.relation);
                for join in &table_with_joins.joins {
                    self.collect_factor(&join.relation);
                }
            }
            _ => self.opaque = true,
        }
    }

    fn check_relations(&self, statement: &Statement) -> Result<(), String> {
        let flow = visit_relations(statement, |relation| {
            let name = relation.to_string();
            if self.ctes.contains(&name.to_lowercase()) || self.snapshot.find_table(&name).is_some() {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(format!("relation \"{}\" does not exist", name.trim_matches('"')))
            }
        });
        match flow {
            ControlFlow::Break(error) => Err(error),
            ControlFlow::Continue(()) => Ok(()),
        }
    }

    fn check_expressions(&mut self, statement: &Statement) -> Result<(), String> {
        // Subqueries bring their own relations into scope
        let has_subquery = visit_expressions(statement, |expr| match expr {
            Expr::Subquery(_) | Expr::Exists { .. } | Expr::InSubquery { .. } => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        });
        if has_subquery.is_break() {
            self.opaque = true;
        }

        let flow = visit_expressions(statement, |expr| match self.check_expr(expr) {
            Ok(()) => ControlFlow::Continue(()),
            Err(error) => ControlFlow::Break(error),
        });
        match flow {
            ControlFlow::Break(error) => Err(error),
            ControlFlow::Continue(()) => Ok(()),
        }
    }

    fn check_expr(&self, expr: &Expr) -> Result<(), String> {
        match expr {
            Expr::Identifier(ident) => {
                let name = ident.value.to_lowercase();
                if self.opaque
                    || self.tables.is_empty()
                    || self.aliases.contains(&name)
                    || BARE_KEYWORDS.contains(&name.as_str())
                    || self.resolve_unqualified(&name).is_some()
                {
                    return Ok(());
                }
                Err(format!("column \"{}\" does not exist", ident.value))
            }
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let qualifier = parts[parts.len() - 2].value.to_lowercase();
                let column = &parts[parts.len() - 1].value;
                match self.tables.get(&qualifier) {
                    Some(table) if table.column(column).is_none() => {
                        Err(format!("column {}.{} does not exist", parts[parts.len() - 2].value, column))
                    }
                    Some(_) => Ok(()),
                    None if self.ctes.contains(&qualifier) || self.opaque => Ok(()),
                    None => Err(format!(
                        "missing FROM-clause entry for table \"{}\"",
                        parts[parts.len() - 2].value
                    )),
                }
            }
            Expr::Function(function) => {
                let name = function
                    .name
                    .0
                    .last()
                    .map(|i| i.value.to_lowercase())
                    .unwrap_or_default();
                let arg_types: Vec<String> = function
                    .args
                    .iter()
                    .map(|arg| match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) | FunctionArg::Named { arg: FunctionArgExpr::Expr(e), .. } => {
                            self.expr_type(e)
                        }
                        _ => "unknown".to_string(),
                    })
                    .collect();

                if !KNOWN_FUNCTIONS.contains(&name.as_str()) {
                    return Err(format!("function {}({}) does not exist", name, arg_types.join(", ")));
                }
                if NUMERIC_AGGREGATES.contains(&name.as_str()) {
                    if let Some(bad) = arg_types.iter().find(|t| is_non_numeric_type(t)) {
                        return Err(format!("function {}({}) does not exist", name, bad));
                    }
                }
                Ok(())
            }
            Expr::BinaryOp { left, op, right } if is_comparison(op) => {
                let (l, r) = (self.expr_type(left), self.expr_type(right));
                let text_vs_number = |a: &str, b: &str| is_text_type(a) && (b == "integer" || b == "numeric");
                if text_vs_number(&l, &r) || text_vs_number(&r, &l) {
                    return Err(format!("operator does not exist: {} {} {}", l, op, r));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn resolve_unqualified(&self, name: &str) -> Option<&'a Column> {
        self.tables.values().find_map(|t| t.columns.iter().find(|c| c.name.to_lowercase() == name))
    }

    /// Postgres type name of an expression where it is obvious, else `unknown`
    fn expr_type(&self, expr: &Expr) -> String {
        match expr {
            Expr::Identifier(ident) => self
                .resolve_unqualified(&ident.value.to_lowercase())
                .map(|c| c.data_type.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => self
                .tables
                .get(&parts[parts.len() - 2].value.to_lowercase())
                .and_then(|t| t.column(&parts[parts.len() - 1].value))
                .map(|c| c.data_type.clone())
                .unwrap_or_else(|| "unknown".to_string()),
            Expr::Value(Value::Number(n, _)) if n.contains('.') => "numeric".to_string(),
            Expr::Value(Value::Number(_, _)) => "integer".to_string(),
            Expr::Nested(inner) => self.expr_type(inner),
            _ => "unknown".to_string(),
        }
    }
}

fn is_comparison(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
    )
}

fn is_text_type(data_type: &str) -> bool {
    data_type == "text" || data_type.contains("char")
}

fn is_non_numeric_type(data_type: &str) -> bool {
    is_text_type(data_type)
        || data_type == "boolean"
        || data_type == "uuid"
        || data_type.starts_with("timestamp")
        || data_type == "date"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::orders_users_schema;
    use uuid::Uuid;

    fn snapshot() -> SchemaSnapshot {
        let (tables, fks) = orders_users_schema();
        SchemaSnapshot::new(Uuid::new_v4(), tables, fks)
    }

    fn error_of(sql: &str) -> String {
        match StaticAnalyzer::check(sql, &snapshot()) {
            SqlCheck::Invalid { error } => error,
            SqlCheck::Valid => panic!("expected {} to be invalid", sql),
        }
    }

    #[test]
    fn test_valid_queries_pass() {
        let snapshot = snapshot();
        for sql in [
            "SELECT SUM(total) AS revenue FROM orders",
            "SELECT u.name, COUNT(o.id) FROM users u JOIN orders o ON o.user_id = u.id GROUP BY u.name",
            "SELECT date_trunc('month', created_at) AS month, SUM(total) FROM orders GROUP BY month",
            "WITH recent AS (SELECT * FROM orders) SELECT COUNT(*) FROM recent",
        ] {
            assert_eq!(StaticAnalyzer::check(sql, &snapshot), SqlCheck::Valid, "{}", sql);
        }
    }

    #[test]
    fn test_reports_postgres_style_errors() {
        assert_eq!(error_of("SELECT SUM(amount) FROM orders"), "column \"amount\" does not exist");
        assert_eq!(error_of("SELECT COUNT(*) FROM customers"), "relation \"customers\" does not exist");
        assert_eq!(error_of("SELECT o.amount FROM orders o"), "column o.amount does not exist");
        assert_eq!(error_of("SELECT SUM(status) FROM orders"), "function sum(text) does not exist");
        assert_eq!(
            error_of("SELECT datediff(created_at, created_at) FROM orders"),
            "function datediff(timestamp with time zone, timestamp with time zone) does not exist"
        );
        assert_eq!(
            error_of("SELECT COUNT(*) FROM orders WHERE status = 1"),
            "operator does not exist: text = integer"
        );
        assert!(error_of("UPDATE orders SET total = 0").contains("read-only"));
    }
}
