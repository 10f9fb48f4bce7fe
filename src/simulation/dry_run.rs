//! Dry run validator
//!
//! Plans a statement with `EXPLAIN` inside a read-only transaction that is
//! always rolled back. Nothing is executed against the target database.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use tracing::debug;

use super::{parse_read_only, SqlCheck, SqlValidator};
use crate::error::AppError;
use crate::introspection::SchemaSnapshot;

pub struct DryRunner {
    pool: Pool,
}

impl DryRunner {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SqlValidator for DryRunner {
    async fn validate(&self, sql: &str, _snapshot: &SchemaSnapshot) -> Result<SqlCheck, AppError> {
        // Refuse anything that is not a single read-only query before it
        // reaches the database
        if let Err(error) = parse_read_only(sql) {
            return Ok(SqlCheck::invalid(error));
        }

        let mut client = self.pool.get().await?;
        let transaction = client.transaction().await?;
        transaction.batch_execute("SET TRANSACTION READ ONLY").await?;

        let explain_query = format!("EXPLAIN (FORMAT TEXT) {}", sql.trim().trim_end_matches(';'));
        let check = match transaction.query(explain_query.as_str(), &[]).await {
            Ok(rows) => {
                debug!(plan_lines = rows.len(), "Dry run planned statement");
                SqlCheck::Valid
            }
            // Statement errors are results; connection problems are not
            Err(e) => match e.as_db_error() {
                Some(db) => SqlCheck::invalid(db.message()),
                None => return Err(AppError::Database(e)),
            },
        };

        // Always rollback - this is a dry run
        transaction.rollback().await?;
        Ok(check)
    }
}
