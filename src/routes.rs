//! Route definitions and router setup
//!
//! Configures all API routes and middleware. Governance handlers answer with a
//! `ToolResponse` payload; only malformed requests are rejected with an HTTP
//! error status.

mod governance;
mod pipeline;

use crate::config::Settings;
use crate::state::SharedState;
use axum::{
    extract::State,
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    let cors = build_cors_layer(settings);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    Router::new()
        .route("/health", get(health_check))

        // Ontologies
        .route("/api/ontologies", get(governance::list_ontologies).post(governance::create_ontology))
        .route("/api/ontologies/{id}/entities", get(governance::list_entities))
        .route("/api/ontologies/{id}/entities/{name}", get(governance::get_entity))
        .route("/api/ontologies/{id}/relationships", get(governance::get_relationship_pair))
        .route("/api/ontologies/{id}/glossary", get(governance::list_glossary))

        // Pending changes
        .route(
            "/api/ontologies/{id}/changes",
            get(governance::list_changes).post(governance::propose_change),
        )
        .route("/api/ontologies/{id}/changes/approve-all", post(governance::approve_all))
        .route("/api/ontologies/{id}/changes/{change_id}", get(governance::get_change))
        .route("/api/ontologies/{id}/changes/{change_id}/approve", post(governance::approve_change))
        .route("/api/ontologies/{id}/changes/{change_id}/reject", post(governance::reject_change))

        // Questions
        .route("/api/ontologies/{id}/questions", get(governance::list_questions))
        .route("/api/ontologies/{id}/questions/{question_id}/resolve", post(governance::resolve_question))
        .route("/api/ontologies/{id}/questions/{question_id}/skip", post(governance::skip_question))
        .route("/api/ontologies/{id}/questions/{question_id}/dismiss", post(governance::dismiss_question))
        .route("/api/ontologies/{id}/questions/{question_id}/escalate", post(governance::escalate_question))

        // Extraction DAG
        .route("/api/ontologies/{id}/extraction", get(pipeline::dag_status))
        .route("/api/ontologies/{id}/extraction/start", post(pipeline::start_extraction))
        .route("/api/ontologies/{id}/extraction/cancel", post(pipeline::cancel_extraction))
        .route("/api/ontologies/{id}/extraction/reset", post(pipeline::reset_extraction))

        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}

/// Health check endpoint
async fn health_check(State(state): State<SharedState>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "ontologies": state.store.list().await.len(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}
