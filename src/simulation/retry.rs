//! Validate-and-retry loop for glossary SQL
//!
//! Each failed attempt feeds the exact error, its classification hint, the real
//! columns of the tables the statement touched and the failed statement back
//! into the next prompt.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::visit_relations;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use tracing::{debug, info, warn};

use super::{ErrorClass, SqlCheck, SqlValidator};
use crate::error::AppError;
use crate::generation::{parse_structured, prompts, Generator};
use crate::introspection::{SchemaSnapshot, Table};
use crate::models::GlossaryTerm;
use crate::pipeline::context::{generate_bounded, CancelSignal};

#[derive(Debug, Deserialize)]
struct SqlDraft {
    sql: String,
    #[serde(default)]
    #[allow(dead_code)]
    explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    Valid {
        sql: String,
        attempts: u32,
    },
    Exhausted {
        attempts: u32,
        last_error: String,
        last_sql: Option<String>,
    },
}

/// The last reply that could not be used and why
struct FailedDraft {
    sql: String,
    error: String,
    class: ErrorClass,
}

pub struct SqlRepairLoop {
    generator: Arc<dyn Generator>,
    validator: Arc<dyn SqlValidator>,
    max_attempts: u32,
    timeout: Duration,
}

impl SqlRepairLoop {
    pub fn new(
        generator: Arc<dyn Generator>,
        validator: Arc<dyn SqlValidator>,
        max_attempts: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            generator,
            validator,
            max_attempts: max_attempts.max(1),
            timeout,
        }
    }

    /// Produce a validated statement for `term` or give up after the attempt
    /// budget. `Err` only for cancellation and validator infrastructure failures.
    pub async fn run(
        &self,
        term: &GlossaryTerm,
        snapshot: &SchemaSnapshot,
        cancel: &CancelSignal,
    ) -> Result<RepairOutcome, AppError> {
        let mut failed: Option<FailedDraft> = None;
        let mut last_error = String::new();
        let mut last_sql: Option<String> = None;

        for attempt in 1..=self.max_attempts {
            let prompt = match &failed {
                None => prompts::glossary_sql_prompt(term, snapshot),
                Some(previous) => prompts::glossary_retry_prompt(
                    term,
                    &previous.sql,
                    &previous.error,
                    previous.class.hint(),
                    &tables_in_sql(&previous.sql, snapshot),
                ),
            };

            let raw = match generate_bounded(self.generator.as_ref(), &prompt, self.timeout, cancel).await {
                Ok(raw) => raw,
                Err(AppError::Cancelled(reason)) => return Err(AppError::Cancelled(reason)),
                Err(e) => {
                    // No reply to repair: the same prompt goes out again
                    warn!(term = %term.term, attempt, error = %e, "SQL generation attempt failed");
                    last_error = e.to_string();
                    continue;
                }
            };

            let draft: SqlDraft = match parse_structured(&raw) {
                Ok(draft) => draft,
                Err(e) => {
                    warn!(term = %term.term, attempt, error = %e, "Unparseable SQL draft");
                    let error = format!("The reply could not be used: {}", e);
                    last_error = error.clone();
                    failed = Some(FailedDraft {
                        sql: raw.trim().to_string(),
                        error,
                        class: ErrorClass::Other,
                    });
                    continue;
                }
            };
            let sql = draft.sql.trim().to_string();

            match self.validator.validate(&sql, snapshot).await? {
                SqlCheck::Valid => {
                    info!(term = %term.term, attempts = attempt, "Glossary SQL validated");
                    return Ok(RepairOutcome::Valid { sql, attempts: attempt });
                }
                SqlCheck::Invalid { error } => {
                    let class = ErrorClass::classify(&error);
                    debug!(term = %term.term, attempt, ?class, error = %error, "Glossary SQL rejected");
                    last_error = error.clone();
                    last_sql = Some(sql.clone());
                    failed = Some(FailedDraft { sql, error, class });
                }
            }
        }

        Ok(RepairOutcome::Exhausted {
            attempts: self.max_attempts,
            last_error,
            last_sql,
        })
    }
}

static FROM_JOIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\b(?:from|join)\s+("?[\w]+"?(?:\."?[\w]+"?)?)"#).unwrap());

/// Snapshot tables a statement refers to. Falls back to a FROM/JOIN scan when
/// the statement does not parse, and to every table when nothing matches.
pub fn tables_in_sql<'a>(sql: &str, snapshot: &'a SchemaSnapshot) -> Vec<&'a Table> {
    let mut names: Vec<String> = Vec::new();
    match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) => {
            for statement in &statements {
                let _ = visit_relations(statement, |relation| {
                    names.push(relation.to_string());
                    ControlFlow::<()>::Continue(())
                });
            }
        }
        Err(_) => {
            names.extend(FROM_JOIN.captures_iter(sql).map(|c| c[1].to_string()));
        }
    }

    let mut seen = HashSet::new();
    let tables: Vec<&Table> = names
        .iter()
        .filter_map(|name| snapshot.find_table(name))
        .filter(|table| seen.insert(table.path()))
        .collect();

    if tables.is_empty() {
        snapshot.tables.iter().collect()
    } else {
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GlossaryFields;
    use crate::simulation::StaticAnalyzer;
    use crate::testing::{orders_users_schema, ScriptedGenerator};
    use uuid::Uuid;

    fn snapshot() -> SchemaSnapshot {
        let (tables, fks) = orders_users_schema();
        SchemaSnapshot::new(Uuid::new_v4(), tables, fks)
    }

    fn revenue() -> GlossaryTerm {
        GlossaryTerm::new(
            Uuid::new_v4(),
            "Revenue",
            GlossaryFields {
                definition: "Sum of order totals".to_string(),
                ..Default::default()
            },
        )
    }

    fn repair_loop(generator: Arc<ScriptedGenerator>, attempts: u32) -> SqlRepairLoop {
        SqlRepairLoop::new(generator, Arc::new(StaticAnalyzer::new()), attempts, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_missing_column_is_repaired_on_retry() {
        let generator = Arc::new(
            ScriptedGenerator::new()
                .on(
                    "computes the business term \"Revenue\"",
                    r#"{"sql": "SELECT SUM(amount) FROM orders", "explanation": "x"}"#,
                )
                .on(
                    "Your previous query for \"Revenue\"",
                    r#"{"sql": "SELECT SUM(total) AS revenue FROM orders", "explanation": "fixed"}"#,
                ),
        );
        let outcome = repair_loop(generator.clone(), 3)
            .run(&revenue(), &snapshot(), &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RepairOutcome::Valid {
                sql: "SELECT SUM(total) AS revenue FROM orders".to_string(),
                attempts: 2
            }
        );
        let retries = generator.prompts_containing("Your previous query for");
        assert_eq!(retries.len(), 1);
        assert!(retries[0].contains("column \"amount\" does not exist"));
        assert!(retries[0].contains("total"));
        assert!(retries[0].contains("SELECT SUM(amount) FROM orders"));
    }

    #[tokio::test]
    async fn test_exhaustion_keeps_last_error() {
        let generator = Arc::new(ScriptedGenerator::new().on(
            "Revenue",
            r#"{"sql": "SELECT SUM(amount) FROM orders", "explanation": "x"}"#,
        ));
        let outcome = repair_loop(generator.clone(), 3)
            .run(&revenue(), &snapshot(), &CancelSignal::never())
            .await
            .unwrap();

        match outcome {
            RepairOutcome::Exhausted { attempts, last_error, last_sql } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("amount"));
                assert_eq!(last_sql.as_deref(), Some("SELECT SUM(amount) FROM orders"));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(generator.prompts().len(), 3);
    }

    #[tokio::test]
    async fn test_generation_failure_counts_as_attempt() {
        let generator = Arc::new(
            ScriptedGenerator::new()
                .fail_on("computes the business term", "upstream 503")
                .on("computes the business term", r#"{"sql": "SELECT SUM(total) FROM orders"}"#),
        );
        let outcome = repair_loop(generator, 3)
            .run(&revenue(), &snapshot(), &CancelSignal::never())
            .await
            .unwrap();
        assert!(matches!(outcome, RepairOutcome::Valid { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_unusable_reply_is_explained_on_retry() {
        let generator = Arc::new(
            ScriptedGenerator::new()
                .on("computes the business term", "Revenue is the sum of order totals.")
                .on(
                    "Your previous query for \"Revenue\"",
                    r#"{"sql": "SELECT SUM(total) FROM orders"}"#,
                ),
        );
        let outcome = repair_loop(generator.clone(), 3)
            .run(&revenue(), &snapshot(), &CancelSignal::never())
            .await
            .unwrap();
        assert!(matches!(outcome, RepairOutcome::Valid { attempts: 2, .. }));

        let retries = generator.prompts_containing("Your previous query for");
        assert_eq!(retries.len(), 1);
        assert!(retries[0].contains("The reply could not be used"));
        assert!(retries[0].contains("Revenue is the sum of order totals."));
    }

    #[tokio::test]
    async fn test_unusable_reply_replaces_earlier_validation_error() {
        let generator = Arc::new(
            ScriptedGenerator::new()
                .on(
                    "computes the business term",
                    r#"{"sql": "SELECT SUM(amount) FROM orders"}"#,
                )
                .on("Your previous query for", "sorry, I cannot help")
                .on("Your previous query for", r#"{"sql": "SELECT SUM(total) FROM orders"}"#),
        );
        let outcome = repair_loop(generator.clone(), 3)
            .run(&revenue(), &snapshot(), &CancelSignal::never())
            .await
            .unwrap();
        assert!(matches!(outcome, RepairOutcome::Valid { attempts: 3, .. }));

        let retries = generator.prompts_containing("Your previous query for");
        assert_eq!(retries.len(), 2);
        assert!(retries[0].contains("column \"amount\" does not exist"));
        assert!(!retries[1].contains("column \"amount\" does not exist"));
        assert!(retries[1].contains("sorry, I cannot help"));
    }

    #[test]
    fn test_tables_in_sql() {
        let snapshot = snapshot();
        let tables = tables_in_sql("SELECT o.total FROM orders o JOIN users u ON u.id = o.user_id", &snapshot);
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["orders", "users"]);

        let fallback = tables_in_sql("SELEC total FROM orders WHERE", &snapshot);
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].name, "orders");

        assert_eq!(tables_in_sql("SELECT 1", &snapshot).len(), 2);
    }
}
