//! HTTP surface of the job service
//!
//! Every route except the ping requires `Authorization: Harbor-Secret <secret>`.

use crate::controller::Controller;
use crate::controller::types::{JobMetadata, StatusReport};
use crate::error::ReplicationError;
use crate::registry::auth::credential::SECRET_PREFIX;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ReplicationError> for ApiError {
    fn from(err: ReplicationError) -> Self {
        match err.root() {
            ReplicationError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ReplicationError::Validation(_) => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Clone)]
pub struct ApiState {
    pub controller: Controller,
    pub secret: Arc<str>,
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub policy_id: i64,
    #[serde(default)]
    pub metadata: Option<JobMetadata>,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub id: String,
}

pub fn create_router(controller: Controller, secret: impl Into<Arc<str>>) -> Router {
    let state = ApiState {
        controller,
        secret: secret.into(),
    };

    let jobs = Router::new()
        .route("/api/jobs/replication", post(create_job))
        .route("/api/jobs/replication/{id}", get(job_status))
        .route("/api/jobs/replication/{id}/stop", put(stop_job))
        .route_layer(middleware::from_fn_with_state(state.clone(), secret_middleware));

    Router::new()
        .route("/api/ping", get(ping))
        .merge(jobs)
        .with_state(state)
}

async fn secret_middleware(State(state): State<ApiState>, req: Request, next: Next) -> ApiResult<Response> {
    let presented = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(SECRET_PREFIX));
    match presented {
        Some(secret) if secret_matches(secret, &state.secret) => Ok(next.run(req).await),
        Some(_) => Err(ApiError::Unauthorized("invalid secret".to_string())),
        None => Err(ApiError::Unauthorized("missing secret".to_string())),
    }
}

/// Constant-time comparison; an empty configured secret matches nothing.
fn secret_matches(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

async fn ping() -> &'static str {
    "OK"
}

async fn create_job(
    State(state): State<ApiState>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<CreateJobResponse>)> {
    let id = state
        .controller
        .create_job(request.policy_id, request.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(CreateJobResponse { id })))
}

async fn job_status(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Json<StatusReport>> {
    Ok(Json(state.controller.status(&id)?))
}

async fn stop_job(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    if state.controller.cancel(&id)? {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::Conflict(format!("job {} already finished", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_comparison() {
        assert!(secret_matches("s3cr3t", "s3cr3t"));
        assert!(!secret_matches("s3cr3x", "s3cr3t"));
        assert!(!secret_matches("s3cr3", "s3cr3t"));
        assert!(!secret_matches("", ""));
    }

    #[test]
    fn errors_map_to_status_codes() {
        let not_found = ApiError::from(ReplicationError::NotFound("job x".to_string()));
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);
        let invalid = ApiError::from(ReplicationError::Validation("bad".to_string()));
        assert_eq!(invalid.status_code(), StatusCode::BAD_REQUEST);
    }
}
