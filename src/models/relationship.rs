//! Relationship rows
//!
//! A logical foreign key is stored as two independent rows: the forward row
//! and its mirror with entities, locations and cardinality swapped. Rows are
//! keyed on the full (source entity, target entity, source location, target
//! location) tuple so several relationships between the same two tables never
//! collide.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{ColumnLocation, EnrichmentStatus, ReviewState};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipKey {
    pub source_entity: String,
    pub target_entity: String,
    pub source_location: ColumnLocation,
    pub target_location: ColumnLocation,
}

impl RelationshipKey {
    /// Key of the opposite direction
    pub fn reversed(&self) -> RelationshipKey {
        RelationshipKey {
            source_entity: self.target_entity.clone(),
            target_entity: self.source_entity.clone(),
            source_location: self.target_location.clone(),
            target_location: self.source_location.clone(),
        }
    }
}

impl fmt::Display for RelationshipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({} -> {})",
            self.source_entity, self.target_entity, self.source_location, self.target_location
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    #[serde(rename = "1:1")]
    OneToOne,
    #[serde(rename = "N:1")]
    ManyToOne,
    #[serde(rename = "1:N")]
    OneToMany,
    #[serde(rename = "N:M")]
    ManyToMany,
    #[serde(rename = "unknown")]
    Unknown,
}

impl Cardinality {
    pub fn reversed(self) -> Cardinality {
        match self {
            Cardinality::ManyToOne => Cardinality::OneToMany,
            Cardinality::OneToMany => Cardinality::ManyToOne,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    ForeignKey,
    NameMatch,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub id: Uuid,
    pub ontology_id: Uuid,
    pub source_entity: String,
    pub target_entity: String,
    pub source_location: ColumnLocation,
    pub target_location: ColumnLocation,
    pub cardinality: Cardinality,
    /// Semantic label for this direction, e.g. `placed_by`
    pub association: Option<String>,
    pub description: Option<String>,
    pub confidence: f64,
    pub method: DiscoveryMethod,
    pub enrichment: EnrichmentStatus,
    pub review: ReviewState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        ontology_id: Uuid,
        source_entity: impl Into<String>,
        target_entity: impl Into<String>,
        source_location: ColumnLocation,
        target_location: ColumnLocation,
        cardinality: Cardinality,
        method: DiscoveryMethod,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            ontology_id,
            source_entity: source_entity.into(),
            target_entity: target_entity.into(),
            source_location,
            target_location,
            cardinality,
            association: None,
            description: None,
            confidence: 1.0,
            method,
            enrichment: EnrichmentStatus::Pending,
            review: ReviewState::Staged,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn key(&self) -> RelationshipKey {
        RelationshipKey {
            source_entity: self.source_entity.clone(),
            target_entity: self.target_entity.clone(),
            source_location: self.source_location.clone(),
            target_location: self.target_location.clone(),
        }
    }

    /// The reverse row: entities, locations and cardinality swapped.
    /// Annotations are per direction, so the mirror starts unlabelled.
    pub fn mirror(&self) -> Relationship {
        let now = Utc::now();
        Relationship {
            id: Uuid::new_v4(),
            ontology_id: self.ontology_id,
            source_entity: self.target_entity.clone(),
            target_entity: self.source_entity.clone(),
            source_location: self.target_location.clone(),
            target_location: self.source_location.clone(),
            cardinality: self.cardinality.reversed(),
            association: None,
            description: None,
            confidence: self.confidence,
            method: self.method,
            enrichment: EnrichmentStatus::Pending,
            review: self.review,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn annotation(&self) -> RelationshipAnnotation {
        RelationshipAnnotation {
            association: self.association.clone(),
            description: self.description.clone(),
        }
    }

    pub fn set_annotation(&mut self, annotation: &RelationshipAnnotation) {
        self.association = annotation.association.clone();
        self.description = annotation.description.clone();
        self.enrichment = if self.association.is_some() {
            EnrichmentStatus::Enriched
        } else {
            EnrichmentStatus::Pending
        };
        self.updated_at = Utc::now();
    }

    pub fn is_self_reference(&self) -> bool {
        self.source_entity == self.target_entity
    }

    pub fn is_active(&self) -> bool {
        self.review != ReviewState::Rejected
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipAnnotation {
    pub association: Option<String>,
    pub description: Option<String>,
}

/// Both directions of one logical relationship. Either side may be missing
/// after a manual delete or an interrupted write.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipPair {
    pub forward: Option<Relationship>,
    pub reverse: Option<Relationship>,
}

impl RelationshipPair {
    pub fn is_complete(&self) -> bool {
        self.forward.is_some() && self.reverse.is_some()
    }
}
