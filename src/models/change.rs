//! Pending changes - staged, approvable mutations to an ontology

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{
    glossary_key, ColumnFields, ColumnLocation, DomainSummary, Entity, EntityFields, GlossaryFields,
    Relationship, RelationshipAnnotation, RelationshipKey,
};
use crate::pipeline::types::DagNode;

/// Status in the review workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl ChangeStatus {
    pub fn parse(value: &str) -> Option<ChangeStatus> {
        match value {
            "pending" => Some(ChangeStatus::Pending),
            "approved" => Some(ChangeStatus::Approved),
            "rejected" => Some(ChangeStatus::Rejected),
            _ => None,
        }
    }
}

/// Who produced a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeOrigin {
    Stage { node: DagNode },
    Manual { author: Option<String> },
}

impl fmt::Display for ChangeOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOrigin::Stage { node } => write!(f, "{}", node),
            ChangeOrigin::Manual { author: Some(author) } => write!(f, "manual:{}", author),
            ChangeOrigin::Manual { author: None } => f.write_str("manual"),
        }
    }
}

/// The object a change touches
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetRef {
    Entity { name: String },
    RelationshipPair { key: RelationshipKey },
    Relationship { key: RelationshipKey },
    Column { location: ColumnLocation },
    GlossaryTerm { term: String },
    Ontology,
}

impl TargetRef {
    /// Whether this target covers the relationship row with `key`
    pub fn covers_relationship(&self, key: &RelationshipKey) -> bool {
        match self {
            TargetRef::Relationship { key: k } => k == key,
            TargetRef::RelationshipPair { key: k } => k == key || k.reversed() == *key,
            _ => false,
        }
    }
}

/// Serialized diff payload. Update variants carry both sides so a rejected
/// change can restore the prior values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeDiff {
    CreateEntity {
        entity: Entity,
    },
    UpdateEntity {
        name: String,
        before: Option<EntityFields>,
        after: EntityFields,
    },
    DeleteEntity {
        name: String,
        reason: Option<String>,
    },
    CreateRelationshipPair {
        forward: Relationship,
        reverse: Relationship,
    },
    AnnotateRelationship {
        key: RelationshipKey,
        before: Option<RelationshipAnnotation>,
        after: RelationshipAnnotation,
    },
    DeleteRelationship {
        key: RelationshipKey,
    },
    AnnotateColumn {
        location: ColumnLocation,
        before: Option<ColumnFields>,
        after: ColumnFields,
    },
    UpsertGlossaryTerm {
        term: String,
        before: Option<GlossaryFields>,
        after: GlossaryFields,
    },
    SetDomainSummary {
        before: Option<DomainSummary>,
        after: DomainSummary,
    },
}

impl ChangeDiff {
    pub fn target(&self) -> TargetRef {
        match self {
            ChangeDiff::CreateEntity { entity } => TargetRef::Entity { name: entity.name.clone() },
            ChangeDiff::UpdateEntity { name, .. } | ChangeDiff::DeleteEntity { name, .. } => {
                TargetRef::Entity { name: name.clone() }
            }
            ChangeDiff::CreateRelationshipPair { forward, .. } => {
                TargetRef::RelationshipPair { key: forward.key() }
            }
            ChangeDiff::AnnotateRelationship { key, .. } | ChangeDiff::DeleteRelationship { key } => {
                TargetRef::Relationship { key: key.clone() }
            }
            ChangeDiff::AnnotateColumn { location, .. } => TargetRef::Column { location: location.clone() },
            ChangeDiff::UpsertGlossaryTerm { term, .. } => TargetRef::GlossaryTerm { term: glossary_key(term) },
            ChangeDiff::SetDomainSummary { .. } => TargetRef::Ontology,
        }
    }

    /// Human-readable description of the change
    pub fn description(&self) -> String {
        match self {
            ChangeDiff::CreateEntity { entity } => {
                format!("Create entity {} at {}", entity.name, entity.primary_location)
            }
            ChangeDiff::UpdateEntity { name, .. } => format!("Update entity {}", name),
            ChangeDiff::DeleteEntity { name, .. } => format!("Delete entity {}", name),
            ChangeDiff::CreateRelationshipPair { forward, .. } => {
                format!("Create relationship pair {}", forward.key())
            }
            ChangeDiff::AnnotateRelationship { key, after, .. } => format!(
                "Label {} as {}",
                key,
                after.association.as_deref().unwrap_or("<none>")
            ),
            ChangeDiff::DeleteRelationship { key } => format!("Delete relationship {}", key),
            ChangeDiff::AnnotateColumn { location, .. } => format!("Annotate column {}", location),
            ChangeDiff::UpsertGlossaryTerm { term, .. } => format!("Define glossary term {}", term),
            ChangeDiff::SetDomainSummary { .. } => "Set domain summary".to_string(),
        }
    }

    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            ChangeDiff::DeleteEntity { .. } | ChangeDiff::DeleteRelationship { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub id: Uuid,
    pub ontology_id: Uuid,
    pub target: TargetRef,
    pub diff: ChangeDiff,
    pub origin: ChangeOrigin,
    pub status: ChangeStatus,
    /// Rejection reason, or why the last approval attempt failed
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PendingChange {
    pub fn new(ontology_id: Uuid, diff: ChangeDiff, origin: ChangeOrigin) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            ontology_id,
            target: diff.target(),
            diff,
            origin,
            status: ChangeStatus::Pending,
            reason: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }
}
