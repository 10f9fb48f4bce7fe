//! Types for the extraction pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One named stage of the fixed extraction pipeline.
///
/// Declaration order is execution order; `Ord` follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DagNode {
    SchemaCapture,
    EntityDiscovery,
    EntityEnrichment,
    RelationshipDiscovery,
    RelationshipEnrichment,
    ColumnEnrichment,
    GlossaryDiscovery,
    GlossaryEnrichment,
    Finalization,
}

impl DagNode {
    pub const ALL: [DagNode; 9] = [
        DagNode::SchemaCapture,
        DagNode::EntityDiscovery,
        DagNode::EntityEnrichment,
        DagNode::RelationshipDiscovery,
        DagNode::RelationshipEnrichment,
        DagNode::ColumnEnrichment,
        DagNode::GlossaryDiscovery,
        DagNode::GlossaryEnrichment,
        DagNode::Finalization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DagNode::SchemaCapture => "schema_capture",
            DagNode::EntityDiscovery => "entity_discovery",
            DagNode::EntityEnrichment => "entity_enrichment",
            DagNode::RelationshipDiscovery => "relationship_discovery",
            DagNode::RelationshipEnrichment => "relationship_enrichment",
            DagNode::ColumnEnrichment => "column_enrichment",
            DagNode::GlossaryDiscovery => "glossary_discovery",
            DagNode::GlossaryEnrichment => "glossary_enrichment",
            DagNode::Finalization => "finalization",
        }
    }

    pub fn parse(value: &str) -> Option<DagNode> {
        DagNode::ALL.iter().copied().find(|n| n.as_str() == value)
    }
}

impl fmt::Display for DagNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Persisted execution state of one node for one ontology
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagNodeStatus {
    pub ontology_id: Uuid,
    pub node: DagNode,
    pub status: NodeStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Last progress note reported by the executor
    pub progress: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DagNodeStatus {
    pub fn pending(ontology_id: Uuid, node: DagNode) -> Self {
        Self {
            ontology_id,
            node,
            status: NodeStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            error: None,
            progress: None,
            updated_at: Utc::now(),
        }
    }
}

/// What an executor reports back on success
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub message: String,
}

impl NodeReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// Structured progress event broadcast while a run executes
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted { ontology_id: Uuid },
    NodeSkipped { ontology_id: Uuid, node: DagNode },
    NodeStarted { ontology_id: Uuid, node: DagNode },
    NodeProgress { ontology_id: Uuid, node: DagNode, done: usize, total: usize },
    NodeSucceeded { ontology_id: Uuid, node: DagNode, report: NodeReport },
    NodeFailed { ontology_id: Uuid, node: DagNode, error: String },
    RunFinished { ontology_id: Uuid },
}

/// Summary of a completed run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub ontology_id: Uuid,
    pub executed: Vec<DagNode>,
    pub skipped: Vec<DagNode>,
    pub finished_at: DateTime<Utc>,
}
