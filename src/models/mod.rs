//! Ontology data model
//!
//! Records owned by one ontology: entities, relationship rows, column
//! annotations, glossary terms, questions and pending changes. Every record
//! carries its `ontology_id`; whether it is live or still awaiting review is a
//! field on the record itself.

pub mod change;
pub mod column;
pub mod entity;
pub mod glossary;
pub mod location;
pub mod ontology;
pub mod question;
pub mod relationship;

pub use change::*;
pub use column::*;
pub use entity::*;
pub use glossary::*;
pub use location::*;
pub use ontology::*;
pub use question::*;
pub use relationship::*;

use serde::{Deserialize, Serialize};

/// Review state of an ontology object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    /// Written by a stage or edit that is still awaiting approval
    #[default]
    Staged,
    /// Approved, or no pending change touches it
    Live,
    /// Its creating change was rejected; kept in place, never promoted
    Rejected,
}

/// Annotation progress of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    #[default]
    Pending,
    Enriched,
    Failed,
}
