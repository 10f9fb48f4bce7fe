//! Extraction Pipeline Module
//!
//! The backbone that turns a captured schema into a reviewed ontology.
//! Nine nodes run in a fixed order:
//!
//! 1. **Capture**: snapshot tables, columns and foreign keys
//! 2. **Discovery**: entities and relationship pairs from the snapshot
//! 3. **Enrichment**: descriptions, labels and column meanings from generation
//! 4. **Glossary**: business terms with validated SQL
//! 5. **Finalization**: a domain summary
//!
//! Every node's progress is persisted, so a failed run resumes where it stopped.

pub mod context;
pub mod orchestrator;
pub mod stages;
pub mod types;

// Re-export main types for convenient access
pub use context::{CancelSignal, NodeContext};
pub use orchestrator::{DagOrchestrator, DagStatus, ExecutorRegistry, NodeExecutor};
pub use stages::{default_registry, Capabilities};
pub use types::{DagNode, DagNodeStatus, NodeStatus, ProgressEvent, RunReport};
