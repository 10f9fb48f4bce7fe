//! Extraction routes
//!
//! Start, cancel, inspect and reset the extraction DAG of one ontology.

use crate::error::{validation_error, ApiResult};
use crate::governance::{ExtractionStarted, ToolResponse};
use crate::pipeline::{DagNode, DagStatus};
use crate::state::SharedState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    /// Node name, e.g. `entity_enrichment`
    pub from: String,
}

pub async fn start_extraction(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Json<ToolResponse<ExtractionStarted>> {
    info!(ontology_id = %id, "Extraction requested");
    Json(state.governance.start_extraction(id).await)
}

pub async fn cancel_extraction(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Json<ToolResponse<DagStatus>> {
    Json(state.governance.cancel_extraction(id).await)
}

pub async fn dag_status(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Json<ToolResponse<DagStatus>> {
    Json(state.governance.dag_status(id).await)
}

pub async fn reset_extraction(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ResetRequest>,
) -> ApiResult<Json<ToolResponse<DagStatus>>> {
    let from = DagNode::parse(payload.from.trim())
        .ok_or_else(|| validation_error(format!("Unknown DAG node '{}'", payload.from)))?;
    Ok(Json(state.governance.reset_extraction(id, from).await))
}
