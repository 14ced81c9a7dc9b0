use crate::error::ApiError;
use crate::state::AppState;
use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use outpost_orchestrator::{Action, AuthObject, Workspace};

#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub username: String,
    pub email: Option<String>,
}

/// Auth middleware - extracts the caller from headers set by the auth proxy
///
/// Outpost does no login of its own. A proxy in front of it verifies the
/// user and sets `X-Outpost-User`; `X-Forwarded-User` (oauth2-proxy) and a
/// bare `X-User` for local development are accepted as well.
pub async fn auth_middleware(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let username = req
        .headers()
        .get("x-outpost-user")
        .or_else(|| req.headers().get("x-forwarded-user"))
        .or_else(|| req.headers().get("x-user"))
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let email = req
        .headers()
        .get("x-outpost-email")
        .or_else(|| req.headers().get("x-forwarded-email"))
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    let username = username.ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut()
        .insert(AuthenticatedUser { username, email });

    Ok(next.run(req).await)
}

/// Capability check for `user`: admins may do anything, everyone else may
/// act on their own workspaces and read templates.
pub fn authorizer(
    user: &AuthenticatedUser,
    is_admin: bool,
) -> impl Fn(Action, &AuthObject) -> bool + Send + Sync {
    let username = user.username.clone();
    move |action, object| {
        if is_admin {
            return true;
        }
        match object {
            AuthObject::Workspace { owner, .. } => *owner == username,
            AuthObject::Template { .. } => action == Action::Read,
        }
    }
}

/// Loads a workspace the caller may act on
///
/// Returns:
/// - ApiError::NotFound if the workspace doesn't exist
/// - ApiError::Forbidden if it exists but belongs to someone else
pub async fn check_workspace_owner(
    state: &AppState,
    workspace_id: &str,
    user: &AuthenticatedUser,
) -> Result<Workspace, ApiError> {
    let workspace = state.orchestrator.get_workspace(workspace_id).await?;

    if workspace.owner != user.username && !state.is_admin(user) {
        return Err(ApiError::Forbidden(format!(
            "Access denied: workspace {} is owned by {}",
            workspace_id, workspace.owner
        )));
    }

    Ok(workspace)
}

pub fn require_admin(state: &AppState, user: &AuthenticatedUser) -> Result<(), ApiError> {
    if state.is_admin(user) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "{} is not an administrator",
            user.username
        )))
    }
}
