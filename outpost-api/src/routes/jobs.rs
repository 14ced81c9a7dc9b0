use crate::{
    auth::{check_workspace_owner, require_admin, AuthenticatedUser},
    error::ApiResult,
    state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    routing::get,
    Extension, Json, Router,
};
use outpost_orchestrator::JobLog;
use serde::Deserialize;
use utoipa::IntoParams;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/jobs/{id}/logs", get(job_logs))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct LogsQuery {
    /// Only lines with a larger id; lets clients resume.
    #[serde(default)]
    pub after: i64,
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}/logs",
    tag = "jobs",
    params(("id" = String, Path, description = "Job ID"), LogsQuery),
    responses(
        (status = 200, description = "Log lines in order", body = [JobLog]),
        (status = 404, description = "Job not found")
    )
)]
pub async fn job_logs(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<JobLog>>> {
    let job = state.orchestrator.get_job(&id).await?;
    // Build logs belong to the workspace owner; import logs to admins.
    match job.payload.workspace_id() {
        Some(workspace_id) => {
            check_workspace_owner(&state, workspace_id, &user).await?;
        }
        None => require_admin(&state, &user)?,
    }

    let logs = state.orchestrator.job_logs(&id, query.after).await?;
    Ok(Json(logs))
}
