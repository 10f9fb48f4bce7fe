//! Entities - domain concepts anchored to one schema column

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ColumnLocation, EnrichmentStatus, ReviewState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: Uuid,
    pub ontology_id: Uuid,
    /// Unique per ontology; the upsert key
    pub name: String,
    pub description: Option<String>,
    pub primary_location: ColumnLocation,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub confidence: f64,
    pub enrichment: EnrichmentStatus,
    pub review: ReviewState,
    #[serde(default)]
    pub is_deleted: bool,
    pub deletion_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(ontology_id: Uuid, name: impl Into<String>, primary_location: ColumnLocation) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            ontology_id,
            name: name.into(),
            description: None,
            primary_location,
            aliases: Vec::new(),
            confidence: 1.0,
            enrichment: EnrichmentStatus::Pending,
            review: ReviewState::Staged,
            is_deleted: false,
            deletion_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Editable fields, as carried in update diffs
    pub fn fields(&self) -> EntityFields {
        EntityFields {
            description: self.description.clone(),
            aliases: self.aliases.clone(),
            primary_location: self.primary_location.clone(),
        }
    }

    pub fn set_fields(&mut self, fields: &EntityFields) {
        self.description = fields.description.clone();
        self.aliases = fields.aliases.clone();
        self.primary_location = fields.primary_location.clone();
        self.enrichment = if self.description.is_some() {
            EnrichmentStatus::Enriched
        } else {
            EnrichmentStatus::Pending
        };
        self.updated_at = Utc::now();
    }

    /// Visible to later stages: not deleted and not rejected
    pub fn is_active(&self) -> bool {
        !self.is_deleted && self.review != ReviewState::Rejected
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityFields {
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub primary_location: ColumnLocation,
}

/// Convert a table name into an entity name: `order_items` -> `OrderItem`
pub fn entity_name_for_table(table: &str) -> String {
    pascal_case(&singularize(&table.to_lowercase()))
}

/// `sales_users` -> `SalesUsers`, no singularization
pub fn pascal_case(name: &str) -> String {
    name.to_lowercase()
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// `OrderItem` -> `order_item`
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// English plural stripping good enough for table names. Only the last
/// underscore-separated word is touched.
pub fn singularize(word: &str) -> String {
    if let Some((head, last)) = word.rsplit_once('_') {
        return format!("{}_{}", head, singularize(last));
    }
    if word.len() <= 2 || word.ends_with("ss") || word.ends_with("us") || word.ends_with("is") {
        return word.to_string();
    }
    if let Some(stem) = word.strip_suffix("ies") {
        return format!("{stem}y");
    }
    for suffix in ["sses", "xes", "ches", "shes", "zes"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    match word.strip_suffix('s') {
        Some(stem) => stem.to_string(),
        None => word.to_string(),
    }
}
