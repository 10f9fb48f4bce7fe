//! Column annotations produced by column enrichment

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ColumnLocation, EnrichmentStatus, ReviewState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnAnnotation {
    pub location: ColumnLocation,
    pub fields: ColumnFields,
    pub enrichment: EnrichmentStatus,
    pub review: ReviewState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnFields {
    pub business_name: Option<String>,
    pub description: Option<String>,
    /// e.g. `identifier`, `currency`, `email`, `timestamp`, `enum`
    pub semantic_type: Option<String>,
}

impl ColumnAnnotation {
    pub fn new(location: ColumnLocation, fields: ColumnFields) -> Self {
        Self {
            location,
            fields,
            enrichment: EnrichmentStatus::Enriched,
            review: ReviewState::Staged,
            updated_at: Utc::now(),
        }
    }
}
