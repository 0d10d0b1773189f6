//! HTTP surface: submit claims, poll their status, raise review events.
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::claims::{FnolClaim, PROCESS_CLAIM};
use crate::runtime::Runtime;
use crate::{RuntimeError, RuntimeStatus};

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request body.")]
    InvalidBody,
    #[error("No orchestration found with instance Id = {0}")]
    NotFound(String),
    #[error("Instance {0} is no longer running")]
    NotRunning(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidBody => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::NotRunning(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

impl From<RuntimeError> for ApiError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::NotFound(id) => ApiError::NotFound(id),
            RuntimeError::NotRunning(id) => ApiError::NotRunning(id),
            RuntimeError::InvalidInput(_) => ApiError::InvalidBody,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Accepted {
    instance_id: String,
    status_query_uri: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    instance_id: String,
    runtime_status: RuntimeStatus,
    custom_status: Option<serde_json::Value>,
    output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/claims", post(submit_claim))
        .route("/api/claims/status/:instance_id", get(claim_status))
        .route("/api/claims/:instance_id/events/:event_name", post(raise_event))
        .route("/api/claims/:instance_id/terminate", post(terminate))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn status_uri(instance_id: &str) -> String {
    format!("/api/claims/status/{instance_id}")
}

async fn submit_claim(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let claim: FnolClaim = serde_json::from_slice(&body).map_err(|_| ApiError::InvalidBody)?;
    if claim.claim_id.trim().is_empty() {
        return Err(ApiError::InvalidBody);
    }
    // Re-encode the decoded claim so the instance input is canonical JSON
    let input = serde_json::to_string(&claim).map_err(|e| ApiError::Internal(e.to_string()))?;
    let instance_id = state.runtime.schedule_instance(PROCESS_CLAIM, input).await?;
    info!(instance = %instance_id, claim_id = %claim.claim_id, "claim submitted");
    let uri = status_uri(&instance_id);
    Ok((
        StatusCode::ACCEPTED,
        [(header::LOCATION, uri.clone())],
        Json(Accepted {
            instance_id,
            status_query_uri: uri,
        }),
    )
        .into_response())
}

async fn claim_status(State(state): State<AppState>, Path(instance_id): Path<String>) -> ApiResult<Json<StatusBody>> {
    let status = state
        .runtime
        .get_status(&instance_id)
        .await
        .ok_or_else(|| ApiError::NotFound(instance_id.clone()))?;
    let output = status
        .output
        .map(|o| serde_json::from_str(&o).unwrap_or(serde_json::Value::String(o)));
    Ok(Json(StatusBody {
        instance_id,
        runtime_status: status.runtime_status,
        custom_status: status.custom_status,
        output,
        error: status.error,
    }))
}

async fn raise_event(
    State(state): State<AppState>,
    Path((instance_id, event_name)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let payload: serde_json::Value = serde_json::from_slice(&body).map_err(|_| ApiError::InvalidBody)?;
    state
        .runtime
        .raise_event(&instance_id, event_name, payload.to_string())
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn terminate(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let reason = if body.is_empty() {
        "terminated via API".to_string()
    } else {
        String::from_utf8_lossy(&body).into_owned()
    };
    state.runtime.terminate_instance(&instance_id, reason).await?;
    Ok(StatusCode::ACCEPTED)
}
