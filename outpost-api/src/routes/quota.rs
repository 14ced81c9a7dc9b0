use crate::{
    auth::{require_admin, AuthenticatedUser},
    error::ApiResult,
    state::AppState,
};
use axum::{
    extract::{Path, State},
    routing::{get, put},
    Extension, Json, Router,
};
use outpost_orchestrator::QuotaStatus;
use serde::Deserialize;
use utoipa::ToSchema;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/quota", get(my_quota))
        .route("/api/v1/quota/{owner}", put(set_allowance))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AllowanceRequest {
    /// Daily credits; 0 removes the limit.
    pub budget: i64,
}

#[utoipa::path(
    get,
    path = "/api/v1/quota",
    tag = "quota",
    responses((status = 200, description = "Caller's budget and consumption", body = QuotaStatus))
)]
pub async fn my_quota(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Json<QuotaStatus>> {
    let status = state.orchestrator.quota_status(&user.username).await?;
    Ok(Json(status))
}

#[utoipa::path(
    put,
    path = "/api/v1/quota/{owner}",
    tag = "quota",
    params(("owner" = String, Path, description = "User whose allowance changes")),
    request_body = AllowanceRequest,
    responses(
        (status = 200, description = "Allowance stored", body = QuotaStatus),
        (status = 403, description = "Not an administrator")
    )
)]
pub async fn set_allowance(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(owner): Path<String>,
    Json(req): Json<AllowanceRequest>,
) -> ApiResult<Json<QuotaStatus>> {
    require_admin(&state, &user)?;
    state.orchestrator.set_quota_allowance(&owner, req.budget).await?;
    let status = state.orchestrator.quota_status(&owner).await?;

    Ok(Json(status))
}
