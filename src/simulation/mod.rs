//! SQL simulation
//!
//! Checks generated SQL without running it: a static pass over the captured
//! snapshot, or `EXPLAIN` inside a rolled-back read-only transaction. Failed
//! checks carry a Postgres-style error message that the repair loop feeds back
//! to the generator.

mod analyzer;
mod classify;
mod dry_run;
mod retry;

pub use analyzer::StaticAnalyzer;
pub use classify::ErrorClass;
pub use dry_run::DryRunner;
pub use retry::{tables_in_sql, RepairOutcome, SqlRepairLoop};

use async_trait::async_trait;
use serde::Serialize;
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::AppError;
use crate::introspection::SchemaSnapshot;

/// Result of validating one statement
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SqlCheck {
    Valid,
    Invalid { error: String },
}

impl SqlCheck {
    pub fn invalid(error: impl Into<String>) -> Self {
        SqlCheck::Invalid { error: error.into() }
    }
}

#[async_trait]
pub trait SqlValidator: Send + Sync {
    /// `Err` only for infrastructure failures; a bad statement is `Ok(Invalid)`
    async fn validate(&self, sql: &str, snapshot: &SchemaSnapshot) -> Result<SqlCheck, AppError>;
}

/// Parse and require a single read-only query
pub(crate) fn parse_read_only(sql: &str) -> Result<Statement, String> {
    let dialect = PostgreSqlDialect {};
    let mut statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| format!("syntax error: {}", e))?;

    if statements.len() != 1 {
        return Err(format!(
            "expected exactly one statement, got {}",
            statements.len()
        ));
    }
    let statement = statements.remove(0);
    match &statement {
        Statement::Query(query) if query.locks.is_empty() => Ok(statement),
        Statement::Query(_) => Err("cannot execute SELECT FOR UPDATE in a read-only transaction".to_string()),
        _ => Err("cannot execute a data-modifying statement in a read-only transaction".to_string()),
    }
}
