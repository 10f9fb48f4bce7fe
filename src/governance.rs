//! Governance surface
//!
//! The single entry point reviewers and agents use. Every operation returns a
//! [`ToolResponse`]: failures become a typed error payload, never a transport
//! failure.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{not_found_error, validation_error, AppError};
use crate::ledger::{ApproveAllReport, ChangeLedger};
use crate::models::{
    ChangeDiff, ChangeStatus, Entity, GlossaryTerm, Ontology, OntologySummary, PendingChange, Question,
    QuestionStatus, RelationshipKey, RelationshipPair,
};
use crate::occurrence::{entity_view, EntityView};
use crate::pipeline::{DagNode, DagOrchestrator, DagStatus};
use crate::questions::QuestionLedger;
use crate::store::OntologyStore;

#[derive(Debug, Clone, Serialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&AppError> for ToolError {
    fn from(error: &AppError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            retryable: error.retryable(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl<T> ToolResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: &AppError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    fn from_result(operation: &str, result: Result<T, AppError>) -> Self {
        match result {
            Ok(data) => {
                debug!(operation, "Governance operation succeeded");
                Self::ok(data)
            }
            Err(e) => {
                warn!(operation, code = e.code(), error = %e, "Governance operation failed");
                Self::failed(&e)
            }
        }
    }
}

/// Acknowledgement for a background extraction
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionStarted {
    pub ontology_id: Uuid,
}

pub struct GovernanceService {
    store: Arc<OntologyStore>,
    changes: ChangeLedger,
    questions: QuestionLedger,
    orchestrator: Arc<DagOrchestrator>,
}

impl GovernanceService {
    pub fn new(store: Arc<OntologyStore>, orchestrator: Arc<DagOrchestrator>) -> Self {
        Self {
            changes: ChangeLedger::new(store.clone()),
            questions: QuestionLedger::new(store.clone()),
            store,
            orchestrator,
        }
    }

    // ========================================================================
    // Ontologies
    // ========================================================================

    pub async fn create_ontology(&self, name: &str) -> ToolResponse<Ontology> {
        let result = async {
            let name = name.trim();
            if name.is_empty() {
                return Err(validation_error("Ontology name is required"));
            }
            self.store.create(Ontology::new(name)).await
        }
        .await;
        ToolResponse::from_result("create_ontology", result)
    }

    pub async fn list_ontologies(&self) -> ToolResponse<Vec<OntologySummary>> {
        ToolResponse::ok(self.store.list().await)
    }

    // ========================================================================
    // Pending changes
    // ========================================================================

    pub async fn list_pending_changes(
        &self,
        ontology_id: Uuid,
        status: Option<ChangeStatus>,
    ) -> ToolResponse<Vec<PendingChange>> {
        ToolResponse::from_result("list_pending_changes", self.changes.list(ontology_id, status).await)
    }

    pub async fn get_change(&self, ontology_id: Uuid, change_id: Uuid) -> ToolResponse<PendingChange> {
        ToolResponse::from_result("get_change", self.changes.get(ontology_id, change_id).await)
    }

    pub async fn propose_change(
        &self,
        ontology_id: Uuid,
        diff: ChangeDiff,
        author: Option<String>,
    ) -> ToolResponse<PendingChange> {
        ToolResponse::from_result("propose_change", self.changes.propose(ontology_id, diff, author).await)
    }

    pub async fn approve_change(&self, ontology_id: Uuid, change_id: Uuid) -> ToolResponse<PendingChange> {
        ToolResponse::from_result("approve_change", self.changes.approve(ontology_id, change_id).await)
    }

    pub async fn reject_change(
        &self,
        ontology_id: Uuid,
        change_id: Uuid,
        reason: Option<String>,
    ) -> ToolResponse<PendingChange> {
        ToolResponse::from_result("reject_change", self.changes.reject(ontology_id, change_id, reason).await)
    }

    pub async fn approve_all(&self, ontology_id: Uuid) -> ToolResponse<ApproveAllReport> {
        ToolResponse::from_result("approve_all", self.changes.approve_all(ontology_id).await)
    }

    // ========================================================================
    // Questions
    // ========================================================================

    pub async fn list_questions(
        &self,
        ontology_id: Uuid,
        status: Option<QuestionStatus>,
    ) -> ToolResponse<Vec<Question>> {
        ToolResponse::from_result("list_questions", self.questions.list(ontology_id, status).await)
    }

    pub async fn resolve_question(&self, ontology_id: Uuid, question_id: Uuid, answer: String) -> ToolResponse<Question> {
        ToolResponse::from_result(
            "resolve_question",
            self.questions.resolve(ontology_id, question_id, answer).await,
        )
    }

    pub async fn skip_question(&self, ontology_id: Uuid, question_id: Uuid) -> ToolResponse<Question> {
        ToolResponse::from_result("skip_question", self.questions.skip(ontology_id, question_id).await)
    }

    pub async fn dismiss_question(
        &self,
        ontology_id: Uuid,
        question_id: Uuid,
        reason: Option<String>,
    ) -> ToolResponse<Question> {
        ToolResponse::from_result(
            "dismiss_question",
            self.questions.dismiss(ontology_id, question_id, reason).await,
        )
    }

    pub async fn escalate_question(
        &self,
        ontology_id: Uuid,
        question_id: Uuid,
        reason: Option<String>,
    ) -> ToolResponse<Question> {
        ToolResponse::from_result(
            "escalate_question",
            self.questions.escalate(ontology_id, question_id, reason).await,
        )
    }

    // ========================================================================
    // Ontology content
    // ========================================================================

    /// Entity with its derived occurrences
    pub async fn get_entity(&self, ontology_id: Uuid, name: &str) -> ToolResponse<EntityView> {
        let result = self
            .store
            .read(ontology_id, |state| entity_view(state, name))
            .await
            .and_then(|view| view);
        ToolResponse::from_result("get_entity", result)
    }

    /// Entities that are not deleted, by name
    pub async fn list_entities(&self, ontology_id: Uuid) -> ToolResponse<Vec<Entity>> {
        let result = self
            .store
            .read(ontology_id, |state| {
                let mut entities: Vec<Entity> = state.entities().filter(|e| !e.is_deleted).cloned().collect();
                entities.sort_by(|a, b| a.name.cmp(&b.name));
                entities
            })
            .await;
        ToolResponse::from_result("list_entities", result)
    }

    /// Both rows of the pair containing `key`
    pub async fn get_relationship_pair(&self, ontology_id: Uuid, key: RelationshipKey) -> ToolResponse<RelationshipPair> {
        let result = self
            .store
            .read(ontology_id, |state| state.pair(&key))
            .await
            .and_then(|pair| {
                if pair.forward.is_none() && pair.reverse.is_none() {
                    Err(not_found_error(format!("Relationship {} not found", key)))
                } else {
                    Ok(pair)
                }
            });
        ToolResponse::from_result("get_relationship_pair", result)
    }

    pub async fn list_glossary(&self, ontology_id: Uuid) -> ToolResponse<Vec<GlossaryTerm>> {
        let result = self
            .store
            .read(ontology_id, |state| {
                let mut terms: Vec<GlossaryTerm> = state.glossary().cloned().collect();
                terms.sort_by(|a, b| a.term.to_lowercase().cmp(&b.term.to_lowercase()));
                terms
            })
            .await;
        ToolResponse::from_result("list_glossary", result)
    }

    // ========================================================================
    // Extraction
    // ========================================================================

    pub async fn start_extraction(&self, ontology_id: Uuid) -> ToolResponse<ExtractionStarted> {
        let result = self
            .orchestrator
            .begin(ontology_id)
            .await
            .map(|_| ExtractionStarted { ontology_id });
        ToolResponse::from_result("start_extraction", result)
    }

    pub async fn cancel_extraction(&self, ontology_id: Uuid) -> ToolResponse<DagStatus> {
        let result = async {
            self.orchestrator.cancel(ontology_id)?;
            self.orchestrator.status(ontology_id).await
        }
        .await;
        ToolResponse::from_result("cancel_extraction", result)
    }

    pub async fn reset_extraction(&self, ontology_id: Uuid, from: DagNode) -> ToolResponse<DagStatus> {
        ToolResponse::from_result("reset_extraction", self.orchestrator.reset(ontology_id, from).await)
    }

    pub async fn dag_status(&self, ontology_id: Uuid) -> ToolResponse<DagStatus> {
        ToolResponse::from_result("dag_status", self.orchestrator.status(ontology_id).await)
    }
}
