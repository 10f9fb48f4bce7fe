//! Ontology header record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::introspection::SchemaSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ontology {
    pub id: Uuid,
    pub name: String,
    /// Latest captured schema; read-only input to every stage
    pub snapshot: Option<SchemaSnapshot>,
    pub domain_summary: Option<DomainSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ontology {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            snapshot: None,
            domain_summary: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainSummary {
    pub summary: String,
    #[serde(default)]
    pub domains: Vec<String>,
    pub entity_count: usize,
    pub relationship_count: usize,
    pub glossary_count: usize,
}

/// Lightweight listing view
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OntologySummary {
    pub id: Uuid,
    pub name: String,
    pub snapshot_checksum: Option<String>,
    pub entity_count: usize,
    pub relationship_count: usize,
    pub pending_changes: usize,
    pub open_questions: usize,
    pub updated_at: DateTime<Utc>,
}
