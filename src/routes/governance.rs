//! Governance route handlers
//!
//! Thin adapters over `GovernanceService`. Request bodies are validated here;
//! everything past validation comes back as a `ToolResponse`.

use crate::error::{validation_error, ApiResult};
use crate::governance::ToolResponse;
use crate::ledger::ApproveAllReport;
use crate::models::{
    ChangeDiff, ChangeStatus, ColumnLocation, Entity, GlossaryTerm, Ontology, OntologySummary, PendingChange,
    Question, QuestionStatus, RelationshipKey, RelationshipPair,
};
use crate::occurrence::EntityView;
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;
use validator::Validate;

// =============================================================================
// REQUEST TYPES
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOntologyRequest {
    #[validate(length(min = 1, max = 120, message = "Ontology name must be 1-120 characters"))]
    pub name: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ProposeChangeRequest {
    pub diff: ChangeDiff,
    #[validate(length(max = 120, message = "Author must be at most 120 characters"))]
    pub author: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ReasonRequest {
    #[validate(length(max = 2000, message = "Reason must be at most 2000 characters"))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResolveQuestionRequest {
    #[validate(length(min = 1, max = 4000, message = "Answer must be 1-4000 characters"))]
    pub answer: String,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipQuery {
    pub source_entity: String,
    pub target_entity: String,
    pub source_column: String,
    pub target_column: String,
}

impl RelationshipQuery {
    fn into_key(self) -> Result<RelationshipKey, crate::error::AppError> {
        let parse = |value: &str| {
            ColumnLocation::parse(value)
                .ok_or_else(|| validation_error(format!("'{}' is not a column location", value)))
        };
        Ok(RelationshipKey {
            source_location: parse(&self.source_column)?,
            target_location: parse(&self.target_column)?,
            source_entity: self.source_entity,
            target_entity: self.target_entity,
        })
    }
}

fn parse_optional<T>(value: Option<&str>, parse: fn(&str) -> Option<T>, what: &str) -> ApiResult<Option<T>> {
    match value {
        None => Ok(None),
        Some(raw) => parse(raw)
            .map(Some)
            .ok_or_else(|| validation_error(format!("Unknown {} '{}'", what, raw))),
    }
}

// =============================================================================
// ONTOLOGIES
// =============================================================================

pub async fn create_ontology(
    State(state): State<SharedState>,
    Json(payload): Json<CreateOntologyRequest>,
) -> ApiResult<Json<ToolResponse<Ontology>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    Ok(Json(state.governance.create_ontology(&payload.name).await))
}

pub async fn list_ontologies(State(state): State<SharedState>) -> Json<ToolResponse<Vec<OntologySummary>>> {
    Json(state.governance.list_ontologies().await)
}

pub async fn list_entities(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Json<ToolResponse<Vec<Entity>>> {
    Json(state.governance.list_entities(id).await)
}

pub async fn get_entity(
    State(state): State<SharedState>,
    Path((id, name)): Path<(Uuid, String)>,
) -> Json<ToolResponse<EntityView>> {
    Json(state.governance.get_entity(id, &name).await)
}

pub async fn get_relationship_pair(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<RelationshipQuery>,
) -> ApiResult<Json<ToolResponse<RelationshipPair>>> {
    let key = query.into_key()?;
    debug!(ontology_id = %id, key = %key, "Relationship pair requested");
    Ok(Json(state.governance.get_relationship_pair(id, key).await))
}

pub async fn list_glossary(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Json<ToolResponse<Vec<GlossaryTerm>>> {
    Json(state.governance.list_glossary(id).await)
}

// =============================================================================
// PENDING CHANGES
// =============================================================================

pub async fn list_changes(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<ToolResponse<Vec<PendingChange>>>> {
    let status = parse_optional(query.status.as_deref(), ChangeStatus::parse, "change status")?;
    Ok(Json(state.governance.list_pending_changes(id, status).await))
}

pub async fn get_change(
    State(state): State<SharedState>,
    Path((id, change_id)): Path<(Uuid, Uuid)>,
) -> Json<ToolResponse<PendingChange>> {
    Json(state.governance.get_change(id, change_id).await)
}

pub async fn propose_change(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ProposeChangeRequest>,
) -> ApiResult<Json<ToolResponse<PendingChange>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    Ok(Json(state.governance.propose_change(id, payload.diff, payload.author).await))
}

pub async fn approve_change(
    State(state): State<SharedState>,
    Path((id, change_id)): Path<(Uuid, Uuid)>,
) -> Json<ToolResponse<PendingChange>> {
    Json(state.governance.approve_change(id, change_id).await)
}

pub async fn reject_change(
    State(state): State<SharedState>,
    Path((id, change_id)): Path<(Uuid, Uuid)>,
    payload: Option<Json<ReasonRequest>>,
) -> ApiResult<Json<ToolResponse<PendingChange>>> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    Ok(Json(state.governance.reject_change(id, change_id, payload.reason).await))
}

pub async fn approve_all(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Json<ToolResponse<ApproveAllReport>> {
    Json(state.governance.approve_all(id).await)
}

// =============================================================================
// QUESTIONS
// =============================================================================

pub async fn list_questions(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<ToolResponse<Vec<Question>>>> {
    let status = parse_optional(query.status.as_deref(), QuestionStatus::parse, "question status")?;
    Ok(Json(state.governance.list_questions(id, status).await))
}

pub async fn resolve_question(
    State(state): State<SharedState>,
    Path((id, question_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<ResolveQuestionRequest>,
) -> ApiResult<Json<ToolResponse<Question>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    Ok(Json(state.governance.resolve_question(id, question_id, payload.answer).await))
}

pub async fn skip_question(
    State(state): State<SharedState>,
    Path((id, question_id)): Path<(Uuid, Uuid)>,
) -> Json<ToolResponse<Question>> {
    Json(state.governance.skip_question(id, question_id).await)
}

pub async fn dismiss_question(
    State(state): State<SharedState>,
    Path((id, question_id)): Path<(Uuid, Uuid)>,
    payload: Option<Json<ReasonRequest>>,
) -> ApiResult<Json<ToolResponse<Question>>> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    Ok(Json(state.governance.dismiss_question(id, question_id, payload.reason).await))
}

pub async fn escalate_question(
    State(state): State<SharedState>,
    Path((id, question_id)): Path<(Uuid, Uuid)>,
    payload: Option<Json<ReasonRequest>>,
) -> ApiResult<Json<ToolResponse<Question>>> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    Ok(Json(state.governance.escalate_question(id, question_id, payload.reason).await))
}
