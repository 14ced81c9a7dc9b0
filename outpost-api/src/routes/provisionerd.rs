//! Worker RPC over a WebSocket.
//!
//! A daemon connects with `?name=<name>&tags=a,b`, is registered, and then
//! sends [`RpcCall`] text frames. Each call is served on its own task so a
//! long-polling `acquire_job` never holds up a heartbeat; replies carry the
//! call's `id` and may arrive out of order.

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use outpost_orchestrator::provisionerd::proto::{RpcCall, RpcError, RpcReply};
use outpost_orchestrator::provisionerd::{dispatch, DaemonSession};
use outpost_orchestrator::ProvisionerDaemon;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::IntoParams;

pub use outpost_orchestrator::provisionerd::proto::PSK_HEADER;
use outpost_orchestrator::provisionerd::proto::SERVE_PATH;

pub fn routes() -> Router<AppState> {
    Router::new().route(SERVE_PATH, get(serve))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ServeQuery {
    pub name: String,
    /// Comma separated capabilities.
    #[serde(default)]
    pub tags: String,
}

pub fn parse_tags(tags: &str) -> BTreeSet<String> {
    tags.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[utoipa::path(
    get,
    path = "/api/v1/provisionerd/serve",
    tag = "provisionerd",
    params(ServeQuery),
    responses(
        (status = 101, description = "Upgraded to the worker RPC WebSocket"),
        (status = 401, description = "Missing or wrong provisioner key")
    )
)]
pub async fn serve(
    State(state): State<AppState>,
    Query(query): Query<ServeQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    if let Some(psk) = &state.provisioner_psk {
        let presented = headers.get(PSK_HEADER).and_then(|v| v.to_str().ok());
        if presented != Some(psk.as_ref()) {
            return Err(ApiError::Unauthorized("invalid provisioner key".to_string()));
        }
    }

    let name = query.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("daemon name is required".to_string()));
    }

    let daemon = state
        .orchestrator
        .register_daemon(name, parse_tags(&query.tags))
        .await?;
    info!(daemon = %daemon.name, daemon_id = %daemon.id, tags = ?daemon.tags, "provisioner daemon connected");

    Ok(ws.on_upgrade(move |socket| serve_daemon(socket, state, daemon)))
}

async fn serve_daemon(socket: WebSocket, state: AppState, daemon: ProvisionerDaemon) {
    let name = daemon.name.clone();
    let cancel = CancellationToken::new();
    let session = Arc::new(
        DaemonSession::new(state.orchestrator.clone(), daemon, state.acquire_timeout)
            .with_cancellation(cancel.clone()),
    );

    let (mut sink, mut stream) = socket.split();
    let (replies, mut outbox) = mpsc::channel::<RpcReply>(32);

    let writer = tokio::spawn(async move {
        while let Some(reply) = outbox.recv().await {
            let text = match serde_json::to_string(&reply) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, id = reply.id, "failed to encode rpc reply");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        sink.close().await.ok();
    });

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(daemon = %name, error = %e, "provisioner socket error");
                break;
            }
        };

        let call: RpcCall = match serde_json::from_str(text.as_str()) {
            Ok(call) => call,
            Err(e) => {
                warn!(daemon = %name, error = %e, "malformed rpc call");
                continue;
            }
        };

        let session = Arc::clone(&session);
        let replies = replies.clone();
        tokio::spawn(async move {
            let result = dispatch(session.as_ref(), call.request)
                .await
                .map_err(|e| RpcError::from(&e));
            replies.send(RpcReply { id: call.id, result }).await.ok();
        });
    }

    // Wake any acquire still waiting for this daemon.
    cancel.cancel();
    drop(replies);
    writer.await.ok();
    info!(daemon = %name, "provisioner daemon disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags(" docker, ,gpu,docker");
        assert_eq!(tags.into_iter().collect::<Vec<_>>(), vec!["docker", "gpu"]);
    }
}
