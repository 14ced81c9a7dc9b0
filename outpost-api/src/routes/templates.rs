use crate::{
    auth::{require_admin, AuthenticatedUser},
    error::ApiResult,
    state::AppState,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Extension, Json, Router,
};
use outpost_orchestrator::schedule::TemplateScheduleOptions;
use outpost_orchestrator::{
    CreateTemplateRequest, CreateTemplateVersionRequest, JobStatus, Template, TemplateVersion,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/templates", post(create_template))
        .route(
            "/api/v1/templates/{id}",
            get(get_template).delete(delete_template),
        )
        .route("/api/v1/templates/{id}/schedule", put(update_schedule))
        .route("/api/v1/templates/{id}/versions", post(create_version))
        .route(
            "/api/v1/templates/{id}/versions/{version_id}/promote",
            post(promote_version),
        )
        .route(
            "/api/v1/templates/{id}/versions/{version_id}/archive",
            post(archive_version),
        )
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateVersionResponse {
    pub version: TemplateVersion,
    /// Import job that has to succeed before the version can be built.
    pub job_id: String,
    pub job_status: JobStatus,
}

#[utoipa::path(
    post,
    path = "/api/v1/templates",
    tag = "templates",
    request_body = CreateTemplateRequest,
    responses(
        (status = 201, description = "Template created", body = Template),
        (status = 403, description = "Not an administrator"),
        (status = 409, description = "Name already in use")
    )
)]
pub async fn create_template(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<CreateTemplateRequest>,
) -> ApiResult<(StatusCode, Json<Template>)> {
    require_admin(&state, &user)?;
    let template = state.orchestrator.create_template(req).await?;

    Ok((StatusCode::CREATED, Json(template)))
}

#[utoipa::path(
    get,
    path = "/api/v1/templates/{id}",
    tag = "templates",
    params(("id" = String, Path, description = "Template ID")),
    responses((status = 200, description = "Template", body = Template))
)]
pub async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Template>> {
    let template = state.orchestrator.get_template(&id).await?;
    Ok(Json(template))
}

#[utoipa::path(
    delete,
    path = "/api/v1/templates/{id}",
    tag = "templates",
    params(("id" = String, Path, description = "Template ID")),
    responses((status = 204, description = "Template deleted"))
)]
pub async fn delete_template(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    require_admin(&state, &user)?;
    state.orchestrator.delete_template(&id).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    put,
    path = "/api/v1/templates/{id}/schedule",
    tag = "templates",
    params(("id" = String, Path, description = "Template ID")),
    request_body = TemplateScheduleOptions,
    responses(
        (status = 200, description = "Scheduling policy replaced", body = Template),
        (status = 400, description = "Invalid policy")
    )
)]
pub async fn update_schedule(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Json(options): Json<TemplateScheduleOptions>,
) -> ApiResult<Json<Template>> {
    require_admin(&state, &user)?;
    let template = state.orchestrator.update_template_schedule(&id, options).await?;

    Ok(Json(template))
}

#[utoipa::path(
    post,
    path = "/api/v1/templates/{id}/versions",
    tag = "templates",
    params(("id" = String, Path, description = "Template ID")),
    request_body = CreateTemplateVersionRequest,
    responses((status = 201, description = "Version created, import queued", body = CreateVersionResponse))
)]
pub async fn create_version(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Json(req): Json<CreateTemplateVersionRequest>,
) -> ApiResult<(StatusCode, Json<CreateVersionResponse>)> {
    require_admin(&state, &user)?;
    let (version, job) = state
        .orchestrator
        .create_template_version(&id, req, &user.username)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateVersionResponse {
            version,
            job_id: job.id,
            job_status: job.status,
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/api/v1/templates/{id}/versions/{version_id}/promote",
    tag = "templates",
    params(
        ("id" = String, Path, description = "Template ID"),
        ("version_id" = String, Path, description = "Version to make active")
    ),
    responses((status = 200, description = "Active version changed", body = Template))
)]
pub async fn promote_version(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((id, version_id)): Path<(String, String)>,
) -> ApiResult<Json<Template>> {
    require_admin(&state, &user)?;
    let template = state
        .orchestrator
        .promote_template_version(&id, &version_id)
        .await?;

    Ok(Json(template))
}

#[utoipa::path(
    post,
    path = "/api/v1/templates/{id}/versions/{version_id}/archive",
    tag = "templates",
    params(
        ("id" = String, Path, description = "Template ID"),
        ("version_id" = String, Path, description = "Version to archive")
    ),
    responses(
        (status = 204, description = "Version archived"),
        (status = 409, description = "Version is the active one")
    )
)]
pub async fn archive_version(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path((id, version_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    require_admin(&state, &user)?;
    let version = state.orchestrator.get_template_version(&version_id).await?;
    if version.template_id != id {
        return Err(crate::error::ApiError::NotFound(format!(
            "Not found: version {version_id} of template {id}"
        )));
    }
    state.orchestrator.archive_template_version(&version_id).await?;

    Ok(StatusCode::NO_CONTENT)
}
