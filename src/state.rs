//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::config::Settings;
use crate::governance::GovernanceService;
use crate::pipeline::{default_registry, Capabilities, DagOrchestrator};
use crate::store::OntologyStore;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Ontology records, hydrated from the journal at startup
    pub store: Arc<OntologyStore>,

    /// Review surface over changes, questions and extraction
    pub governance: GovernanceService,
}

impl AppState {
    pub fn new(settings: &Settings, store: Arc<OntologyStore>, capabilities: Capabilities) -> Self {
        // Runs the extraction DAG; at most one run per ontology
        let orchestrator = Arc::new(DagOrchestrator::new(
            store.clone(),
            default_registry(&capabilities),
            settings.pipeline.clone(),
        ));
        let governance = GovernanceService::new(store.clone(), orchestrator.clone());

        Self { store, governance }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
