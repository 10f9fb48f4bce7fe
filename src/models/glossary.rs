//! Business glossary terms

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EnrichmentStatus, ReviewState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlossaryTerm {
    pub id: Uuid,
    pub ontology_id: Uuid,
    pub term: String,
    pub fields: GlossaryFields,
    pub enrichment: EnrichmentStatus,
    pub attempt_count: u32,
    /// Raw error text from the last failed validation, verbatim
    pub last_error: Option<String>,
    pub review: ReviewState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlossaryFields {
    pub definition: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub sql_pattern: Option<String>,
}

impl GlossaryTerm {
    pub fn new(ontology_id: Uuid, term: impl Into<String>, fields: GlossaryFields) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            ontology_id,
            term: term.into(),
            fields,
            enrichment: EnrichmentStatus::Pending,
            attempt_count: 0,
            last_error: None,
            review: ReviewState::Staged,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_fields(&mut self, fields: &GlossaryFields) {
        self.fields = fields.clone();
        if self.fields.sql_pattern.is_some() {
            self.enrichment = EnrichmentStatus::Enriched;
            self.last_error = None;
        } else {
            // Without validated SQL the term goes back to the enrichment queue
            self.enrichment = EnrichmentStatus::Pending;
        }
        self.updated_at = Utc::now();
    }

    pub fn is_active(&self) -> bool {
        self.review != ReviewState::Rejected
    }
}

/// Glossary terms are keyed case-insensitively
pub fn glossary_key(term: &str) -> String {
    term.trim().to_lowercase()
}
