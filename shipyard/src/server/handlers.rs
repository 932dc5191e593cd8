//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::errors::PlatformError;
use crate::models::deployment::{Deployment, DeploymentTicket};
use crate::models::log_event::StoredLog;
use crate::models::project::{NewProject, Project};
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for PlatformError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status.is_server_error() && !matches!(self, PlatformError::LaunchError(_)) {
            error!("Request failed: {}", self);
            "something went wrong".to_string()
        } else {
            self.to_string()
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, PlatformError> {
    body.map(|Json(value)| value)
        .map_err(|e| PlatformError::ValidationError(e.body_text()))
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "shipyard".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Create project handler
pub async fn create_project_handler(
    State(state): State<Arc<ServerState>>,
    body: Result<Json<NewProject>, JsonRejection>,
) -> Result<(StatusCode, Json<Project>), PlatformError> {
    let input = json_body(body)?;
    let project = state.orchestrator.create_project(input).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// Project lookup handler
pub async fn get_project_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Project>, PlatformError> {
    Ok(Json(state.orchestrator.get_project(id).await?))
}

/// Deployment request
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub project_id: Uuid,
}

/// Request deployment handler
pub async fn create_deployment_handler(
    State(state): State<Arc<ServerState>>,
    body: Result<Json<DeploymentRequest>, JsonRejection>,
) -> Result<Json<DeploymentTicket>, PlatformError> {
    let request = json_body(body)?;
    let ticket = state.orchestrator.request_deployment(request.project_id).await?;
    Ok(Json(ticket))
}

/// Deployment lookup handler
pub async fn get_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Deployment>, PlatformError> {
    Ok(Json(state.orchestrator.get_deployment(id).await?))
}

/// Durable logs response
#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: Vec<StoredLog>,
}

/// Durable logs handler
pub async fn deployment_logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<LogsResponse>, PlatformError> {
    state.orchestrator.get_deployment(id).await?;
    let logs = state.log_store.query(id).await?;
    Ok(Json(LogsResponse { logs }))
}
