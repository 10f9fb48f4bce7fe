//! Error handling module
//!
//! Provides unified error types and handling for the entire application.
//! Every variant maps to a stable code, an HTTP status and a retry hint so the
//! governance surface can hand callers a typed payload instead of a transport
//! failure.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::pipeline::types::DagNode;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Generation call failed, timed out or returned unparseable output
    #[error("Generation error: {0}")]
    Generation(String),

    /// A referenced table or column is absent from the captured schema
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Node {node} failed: {cause}")]
    NodeExecution { node: DagNode, cause: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Pool(_) => "POOL_EXHAUSTED",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Generation(_) => "GENERATION_ERROR",
            AppError::SchemaMismatch(_) => "SCHEMA_MISMATCH",
            AppError::NodeExecution { .. } => "NODE_EXECUTION_ERROR",
            AppError::Cancelled(_) => "CANCELLED",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Database(_) | AppError::Internal(_) | AppError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Generation(_) => StatusCode::BAD_GATEWAY,
            AppError::SchemaMismatch(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::NodeExecution { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Cancelled(_) => StatusCode::CONFLICT,
        }
    }

    /// Whether a caller may retry the same request without changing it.
    /// Conflicts require a re-fetch first, validation errors never succeed on retry.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            AppError::Pool(_)
                | AppError::Generation(_)
                | AppError::NodeExecution { .. }
                | AppError::Cancelled(_)
        )
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, details) = match &self {
            AppError::Database(e) => {
                error!("Database error: {:?}", e);
                ("A database error occurred".to_string(), Some(e.to_string()))
            }
            AppError::Pool(e) => {
                error!("Pool error: {:?}", e);
                ("Database connection pool exhausted".to_string(), Some(e.to_string()))
            }
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                ("An internal error occurred".to_string(), Some(msg.clone()))
            }
            AppError::Config(msg) => {
                error!("Configuration error: {}", msg);
                ("A configuration error occurred".to_string(), Some(msg.clone()))
            }
            other => (other.to_string(), None),
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(self.code().to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}

/// Helper function to create a not found error
pub fn not_found_error(msg: impl Into<String>) -> AppError {
    AppError::NotFound(msg.into())
}

/// Helper function to create a conflict error
pub fn conflict_error(msg: impl Into<String>) -> AppError {
    AppError::Conflict(msg.into())
}
