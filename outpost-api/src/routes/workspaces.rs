use crate::{
    auth::{check_workspace_owner, AuthenticatedUser},
    error::ApiResult,
    state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Extension, Json, Router,
};
use outpost_orchestrator::{
    BuildParameter, BuildRequest, BuildTransition, CreateWorkspaceRequest, Workspace, WorkspaceBuild,
    WorkspaceFilters, WorkspaceView,
};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/workspaces",
            get(list_workspaces).post(create_workspace),
        )
        .route(
            "/api/v1/workspaces/{id}",
            get(get_workspace).delete(delete_workspace),
        )
        .route(
            "/api/v1/workspaces/{id}/builds",
            get(list_builds).post(create_build),
        )
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListQuery {
    /// Only honored for administrators; everyone else sees their own.
    pub owner: Option<String>,
    pub template_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateBuildRequest {
    pub transition: BuildTransition,
    pub template_version_id: Option<String>,
    #[serde(default)]
    pub parameters: Vec<BuildParameter>,
    /// New TTL for a `start` build.
    pub ttl_ms: Option<i64>,
}

#[utoipa::path(
    post,
    path = "/api/v1/workspaces",
    tag = "workspaces",
    request_body = CreateWorkspaceRequest,
    responses(
        (status = 201, description = "Workspace created and first build queued", body = WorkspaceView),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "Name already in use")
    )
)]
pub async fn create_workspace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(mut req): Json<CreateWorkspaceRequest>,
) -> ApiResult<(StatusCode, Json<WorkspaceView>)> {
    // Owner always comes from the authenticated caller
    req.owner = user.username.clone();

    let authorize = state.authorizer(&user);
    let (workspace, _build, _job) = state
        .orchestrator
        .create_workspace(req, &user.username, &authorize)
        .await?;
    let view = state.orchestrator.get_workspace_view(&workspace.id).await?;

    Ok((StatusCode::CREATED, Json(view)))
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces",
    tag = "workspaces",
    params(ListQuery),
    responses((status = 200, description = "Workspaces visible to the caller", body = [Workspace]))
)]
pub async fn list_workspaces(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Workspace>>> {
    let owner = if state.is_admin(&user) {
        query.owner
    } else {
        Some(user.username)
    };

    let workspaces = state
        .orchestrator
        .list_workspaces(WorkspaceFilters {
            owner,
            template_id: query.template_id,
            include_deleted: false,
        })
        .await?;

    Ok(Json(workspaces))
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{id}",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace ID")),
    responses(
        (status = 200, description = "Workspace with its latest build", body = WorkspaceView),
        (status = 403, description = "Owned by someone else"),
        (status = 404, description = "Not found")
    )
)]
pub async fn get_workspace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkspaceView>> {
    check_workspace_owner(&state, &id, &user).await?;
    let view = state.orchestrator.get_workspace_view(&id).await?;

    Ok(Json(view))
}

#[utoipa::path(
    delete,
    path = "/api/v1/workspaces/{id}",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace ID")),
    responses(
        (status = 202, description = "Delete build queued", body = WorkspaceBuild),
        (status = 409, description = "Another build is active")
    )
)]
pub async fn delete_workspace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<WorkspaceBuild>)> {
    let authorize = state.authorizer(&user);
    let (build, _job) = state
        .orchestrator
        .delete_workspace(&id, &user.username, &authorize)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(build)))
}

#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{id}/builds",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace ID")),
    request_body = CreateBuildRequest,
    responses(
        (status = 201, description = "Build queued", body = WorkspaceBuild),
        (status = 400, description = "Invalid version, parameters or TTL"),
        (status = 403, description = "Not allowed"),
        (status = 409, description = "Another build is active")
    )
)]
pub async fn create_build(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Json(req): Json<CreateBuildRequest>,
) -> ApiResult<(StatusCode, Json<WorkspaceBuild>)> {
    let mut build_req = BuildRequest::new(&id, req.transition, &user.username).parameters(req.parameters);
    if let Some(version_id) = req.template_version_id {
        build_req = build_req.template_version(version_id);
    }
    if let Some(ttl_ms) = req.ttl_ms {
        build_req = build_req.ttl_ms(ttl_ms);
    }

    let authorize = state.authorizer(&user);
    let (build, _job) = state.orchestrator.request_build(build_req, &authorize).await?;

    Ok((StatusCode::CREATED, Json(build)))
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{id}/builds",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace ID")),
    responses((status = 200, description = "Builds, newest first", body = [WorkspaceBuild]))
)]
pub async fn list_builds(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<WorkspaceBuild>>> {
    check_workspace_owner(&state, &id, &user).await?;
    let builds = state.orchestrator.list_builds(&id).await?;

    Ok(Json(builds))
}
