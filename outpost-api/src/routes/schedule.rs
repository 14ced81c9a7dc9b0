//! Per-workspace scheduling: TTL, autostart, deadline extension and the
//! activity signal agents send while a workspace is in use.

use crate::{
    auth::{check_workspace_owner, AuthenticatedUser},
    error::ApiResult,
    state::AppState,
};
use axum::{
    extract::{Path, State},
    routing::{post, put},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use outpost_orchestrator::{Workspace, WorkspaceBuild};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/workspaces/{id}/ttl", put(update_ttl))
        .route("/api/v1/workspaces/{id}/autostart", put(update_autostart))
        .route("/api/v1/workspaces/{id}/extend", put(extend_deadline))
        .route("/api/v1/workspaces/{id}/activity", post(report_activity))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateTtlRequest {
    /// `null` falls back to the template's policy.
    pub ttl_ms: Option<i64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateAutostartRequest {
    /// `[CRON_TZ=<zone>] <minute> <hour> * * <weekdays>`, or `null` to disable.
    pub schedule: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ExtendRequest {
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ActivityResponse {
    pub bumped: bool,
    pub deadline: Option<DateTime<Utc>>,
}

#[utoipa::path(
    put,
    path = "/api/v1/workspaces/{id}/ttl",
    tag = "schedule",
    params(("id" = String, Path, description = "Workspace ID")),
    request_body = UpdateTtlRequest,
    responses(
        (status = 200, description = "TTL updated", body = Workspace),
        (status = 400, description = "TTL too low, too high, or above the template maximum")
    )
)]
pub async fn update_ttl(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Json(req): Json<UpdateTtlRequest>,
) -> ApiResult<Json<Workspace>> {
    check_workspace_owner(&state, &id, &user).await?;
    let workspace = state.orchestrator.update_workspace_ttl(&id, req.ttl_ms).await?;

    Ok(Json(workspace))
}

#[utoipa::path(
    put,
    path = "/api/v1/workspaces/{id}/autostart",
    tag = "schedule",
    params(("id" = String, Path, description = "Workspace ID")),
    request_body = UpdateAutostartRequest,
    responses(
        (status = 200, description = "Autostart schedule updated", body = Workspace),
        (status = 400, description = "Bad schedule or autostart disabled by the template")
    )
)]
pub async fn update_autostart(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Json(req): Json<UpdateAutostartRequest>,
) -> ApiResult<Json<Workspace>> {
    check_workspace_owner(&state, &id, &user).await?;
    let workspace = state
        .orchestrator
        .update_workspace_autostart(&id, req.schedule.as_deref())
        .await?;

    Ok(Json(workspace))
}

#[utoipa::path(
    put,
    path = "/api/v1/workspaces/{id}/extend",
    tag = "schedule",
    params(("id" = String, Path, description = "Workspace ID")),
    request_body = ExtendRequest,
    responses(
        (status = 200, description = "Deadline moved", body = WorkspaceBuild),
        (status = 400, description = "Too soon, before the build started, or past the max deadline"),
        (status = 409, description = "Workspace is not running or has no deadline")
    )
)]
pub async fn extend_deadline(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Json(req): Json<ExtendRequest>,
) -> ApiResult<Json<WorkspaceBuild>> {
    check_workspace_owner(&state, &id, &user).await?;
    let build = state.orchestrator.extend_deadline(&id, req.deadline).await?;

    Ok(Json(build))
}

#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{id}/activity",
    tag = "schedule",
    params(("id" = String, Path, description = "Workspace ID")),
    responses((status = 200, description = "Activity recorded", body = ActivityResponse))
)]
pub async fn report_activity(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<ActivityResponse>> {
    check_workspace_owner(&state, &id, &user).await?;
    let deadline = state.orchestrator.activity_bump(&id).await?;

    Ok(Json(ActivityResponse {
        bumped: deadline.is_some(),
        deadline,
    }))
}
