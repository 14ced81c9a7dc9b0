use crate::{
    auth::{check_workspace_owner, AuthenticatedUser},
    error::ApiResult,
    state::AppState,
};
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Extension, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use outpost_orchestrator::pubsub::{workspace_channel, Subscription};
use outpost_orchestrator::WorkspaceOrchestrator;
use std::convert::Infallible;
use tracing::debug;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/workspaces/{id}/watch", get(watch_workspace))
}

/// Server-sent events for one workspace: a `ping` right away, then a `data`
/// event with a fresh [`WorkspaceView`](outpost_orchestrator::WorkspaceView)
/// every time the workspace changes.
#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{id}/watch",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace ID")),
    responses((status = 200, description = "text/event-stream of workspace snapshots"))
)]
pub async fn watch_workspace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    check_workspace_owner(&state, &id, &user).await?;

    // Subscribe before answering so no change slips between the two.
    let subscription = state.orchestrator.pubsub().subscribe(&workspace_channel(&id));
    let ping = stream::once(async { Ok(Event::default().event("ping")) });
    let updates = snapshots(state.orchestrator.clone(), id, subscription).map(Ok);

    Ok(Sse::new(ping.chain(updates)).keep_alive(KeepAlive::default()))
}

fn snapshots(
    orchestrator: WorkspaceOrchestrator,
    workspace_id: String,
    subscription: Subscription,
) -> impl Stream<Item = Event> {
    stream::unfold(
        (orchestrator, workspace_id, subscription),
        |(orchestrator, workspace_id, mut subscription)| async move {
            subscription.recv().await?;
            let event = match orchestrator.get_workspace_view(&workspace_id).await {
                Ok(view) => Event::default()
                    .event("data")
                    .json_data(&view)
                    .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())),
                Err(e) => {
                    debug!(workspace_id = %workspace_id, error = %e, "watch snapshot failed");
                    Event::default().event("error").data(e.to_string())
                }
            };
            Some((event, (orchestrator, workspace_id, subscription)))
        },
    )
}
