//! Durable record journal
//!
//! The store hands the journal one batch per commit. The PostgreSQL journal
//! writes a batch inside a single transaction; the memory journal keeps the
//! latest body per record for tests and database-less runs.

use super::RecordKey;
use crate::error::AppError;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Kind of persisted record; one table each
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKind {
    Ontology,
    Entity,
    Relationship,
    Column,
    Glossary,
    Question,
    Change,
    DagNode,
}

impl RecordKind {
    pub const ALL: [RecordKind; 8] = [
        RecordKind::Ontology,
        RecordKind::Entity,
        RecordKind::Relationship,
        RecordKind::Column,
        RecordKind::Glossary,
        RecordKind::Question,
        RecordKind::Change,
        RecordKind::DagNode,
    ];

    pub fn table(self) -> &'static str {
        match self {
            RecordKind::Ontology => "ontologies",
            RecordKind::Entity => "ontology_entities",
            RecordKind::Relationship => "ontology_relationships",
            RecordKind::Column => "ontology_column_annotations",
            RecordKind::Glossary => "ontology_glossary_terms",
            RecordKind::Question => "ontology_questions",
            RecordKind::Change => "ontology_pending_changes",
            RecordKind::DagNode => "ontology_dag_nodes",
        }
    }
}

/// One record write; `body: None` deletes the record
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub ontology_id: Uuid,
    pub key: RecordKey,
    pub body: Option<serde_json::Value>,
}

#[async_trait]
pub trait Journal: Send + Sync {
    /// Persist a batch atomically
    async fn write(&self, entries: &[JournalEntry]) -> Result<(), AppError>;

    /// Every stored record as `(ontology_id, kind, body)`
    async fn load(&self) -> Result<Vec<(Uuid, RecordKind, serde_json::Value)>, AppError>;
}

// ============================================================================
// Memory journal
// ============================================================================

pub struct MemoryJournal {
    records: Mutex<BTreeMap<(Uuid, RecordKind, String), serde_json::Value>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Journal for MemoryJournal {
    async fn write(&self, entries: &[JournalEntry]) -> Result<(), AppError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| AppError::Internal("journal lock poisoned".to_string()))?;
        for entry in entries {
            let key = (entry.ontology_id, entry.key.kind(), entry.key.as_key_string());
            match &entry.body {
                Some(body) => {
                    records.insert(key, body.clone());
                }
                None => {
                    records.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn load(&self) -> Result<Vec<(Uuid, RecordKind, serde_json::Value)>, AppError> {
        let records = self
            .records
            .lock()
            .map_err(|_| AppError::Internal("journal lock poisoned".to_string()))?;
        Ok(records
            .iter()
            .map(|((ontology_id, kind, _), body)| (*ontology_id, *kind, body.clone()))
            .collect())
    }
}

// ============================================================================
// PostgreSQL journal
// ============================================================================

pub struct PgJournal {
    pool: Pool,
}

impl PgJournal {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create the record tables if they do not exist
    pub async fn ensure_tables(&self) -> Result<(), AppError> {
        let client = self.pool.get().await?;

        for kind in RecordKind::ALL {
            let ddl = if kind == RecordKind::Relationship {
                // Rows are unique on the full four-part key so several
                // relationships between the same pair of tables coexist
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {table} (
                        ontology_id UUID NOT NULL,
                        record_key TEXT NOT NULL,
                        source_entity TEXT NOT NULL,
                        target_entity TEXT NOT NULL,
                        source_location TEXT NOT NULL,
                        target_location TEXT NOT NULL,
                        body JSONB NOT NULL,
                        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                        PRIMARY KEY (ontology_id, record_key),
                        UNIQUE (ontology_id, source_entity, target_entity, source_location, target_location)
                    )
                    "#,
                    table = kind.table()
                )
            } else {
                format!(
                    r#"
                    CREATE TABLE IF NOT EXISTS {table} (
                        ontology_id UUID NOT NULL,
                        record_key TEXT NOT NULL,
                        body JSONB NOT NULL,
                        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                        PRIMARY KEY (ontology_id, record_key)
                    )
                    "#,
                    table = kind.table()
                )
            };
            client.batch_execute(&ddl).await?;
        }

        info!("Ontology tables ready");
        Ok(())
    }
}

#[async_trait]
impl Journal for PgJournal {
    async fn write(&self, entries: &[JournalEntry]) -> Result<(), AppError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        for entry in entries {
            let table = entry.key.kind().table();
            let record_key = entry.key.as_key_string();
            match (&entry.body, &entry.key) {
                (None, _) => {
                    let sql = format!("DELETE FROM {} WHERE ontology_id = $1 AND record_key = $2", table);
                    tx.execute(sql.as_str(), &[&entry.ontology_id, &record_key]).await?;
                }
                (Some(body), RecordKey::Relationship(key)) => {
                    let sql = format!(
                        r#"
                        INSERT INTO {} (ontology_id, record_key, source_entity, target_entity,
                                        source_location, target_location, body, updated_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                        ON CONFLICT (ontology_id, record_key)
                        DO UPDATE SET body = EXCLUDED.body, updated_at = NOW()
                        "#,
                        table
                    );
                    tx.execute(
                        sql.as_str(),
                        &[
                            &entry.ontology_id,
                            &record_key,
                            &key.source_entity,
                            &key.target_entity,
                            &key.source_location.to_string(),
                            &key.target_location.to_string(),
                            body,
                        ],
                    )
                    .await?;
                }
                (Some(body), _) => {
                    let sql = format!(
                        r#"
                        INSERT INTO {} (ontology_id, record_key, body, updated_at)
                        VALUES ($1, $2, $3, NOW())
                        ON CONFLICT (ontology_id, record_key)
                        DO UPDATE SET body = EXCLUDED.body, updated_at = NOW()
                        "#,
                        table
                    );
                    tx.execute(sql.as_str(), &[&entry.ontology_id, &record_key, body]).await?;
                }
            }
        }

        tx.commit().await?;
        debug!(records = entries.len(), "Journal batch committed");
        Ok(())
    }

    async fn load(&self) -> Result<Vec<(Uuid, RecordKind, serde_json::Value)>, AppError> {
        let client = self.pool.get().await?;
        let mut records = Vec::new();

        for kind in RecordKind::ALL {
            let sql = format!("SELECT ontology_id, body FROM {} ORDER BY updated_at", kind.table());
            let rows = client.query(sql.as_str(), &[]).await?;
            for row in rows {
                let ontology_id: Uuid = row.get("ontology_id");
                let body: serde_json::Value = row.get("body");
                records.push((ontology_id, kind, body));
            }
        }

        info!(records = records.len(), "Loaded ontology records");
        Ok(records)
    }
}
