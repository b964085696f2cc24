//! HTTP API error types.
//!
//! Provides a unified `ApiError` enum for consistent error responses
//! across the HTTP API layer, with conversions from the engine and
//! store error taxonomies. Implements Axum's `IntoResponse` trait so
//! handlers can bubble errors with `?`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use muster_core::identity::IdentityError;
use muster_core::store::StoreError;
use muster_engine::{ApprovalError, CoordinatorError, StreamError, SupervisorError};
use serde_json::json;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur in the HTTP API layer.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was malformed or invalid.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller is not a recognized approver.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The request lost a race or violates current state; re-read and
    /// retry with fresh state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The resume point predates the retention window.
    #[error("gone: {0}")]
    Gone(String),

    /// Valid request, but no squad member can act on it.
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// An internal server error occurred.
    #[error("internal error: {0}")]
    InternalError(String),
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Gone(msg) => (StatusCode::GONE, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": error_message
        }));

        (status, body).into_response()
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApiError::NotFound(format!("resource {id} not found")),
            StoreError::Duplicate(_) | StoreError::VersionConflict { .. } => {
                ApiError::Conflict(err.to_string())
            }
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::NoCapableAgent { .. } => ApiError::Unprocessable(err.to_string()),
            CoordinatorError::Conflict { .. }
            | CoordinatorError::RetriesExhausted { .. }
            | CoordinatorError::StateMachine(_) => ApiError::Conflict(err.to_string()),
            CoordinatorError::Store(e) => e.into(),
            CoordinatorError::Delivery { .. } => ApiError::InternalError(err.to_string()),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::NotFound(id) => {
                ApiError::NotFound(format!("approval request {id} not found"))
            }
            ApprovalError::AlreadyPending(_) => ApiError::Conflict(err.to_string()),
            ApprovalError::Store(e) => e.into(),
            ApprovalError::Coordinator(e) => e.into(),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Coordinator(e) => e.into(),
            SupervisorError::Approval(e) => e.into(),
            SupervisorError::Store(e) => e.into(),
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::CursorEvicted { .. } => ApiError::Gone(err.to_string()),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        ApiError::Unauthorized(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
