//! WebSocket transport for the worker RPC.
//!
//! Calls are multiplexed over one connection and matched to replies by id,
//! so a long-polling `acquire_job` never holds up job updates.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use outpost_orchestrator::provisionerd::proto::{
    AcquiredJob, CommitQuotaRequest, CommitQuotaResponse, CompletedJob, FailedJob, RpcCall, RpcError,
    RpcReply, RpcRequest, RpcResponse, UpdateJobRequest, UpdateJobResponse, PSK_HEADER, SERVE_PATH,
};
use outpost_orchestrator::provisionerd::ProvisionerApi;
use outpost_orchestrator::{OrchestratorError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    #[error("invalid provisioner key")]
    InvalidKey,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Where to connect and how to introduce this daemon.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL; `http(s)://` is rewritten to `ws(s)://`.
    pub server_url: String,
    pub name: String,
    pub tags: Vec<String>,
    pub psk: Option<String>,
}

impl ClientConfig {
    /// Full URL of the serve endpoint, daemon identity in the query.
    pub fn serve_url(&self) -> std::result::Result<String, ClientError> {
        let base = self.server_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            return Err(ClientError::InvalidUrl(self.server_url.clone()));
        };

        let mut url = format!("{base}{SERVE_PATH}?name={}", encode_query(&self.name));
        if !self.tags.is_empty() {
            url.push_str("&tags=");
            url.push_str(&encode_query(&self.tags.join(",")));
        }
        Ok(url)
    }
}

/// Percent-encodes everything outside the unreserved set, keeping commas.
fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b',' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<std::result::Result<RpcResponse, RpcError>>>>>;

/// [`ProvisionerApi`] backed by a live connection to the server.
pub struct RemoteProvisionerApi {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    closed: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RemoteProvisionerApi {
    /// Opens the socket and starts the reader and writer tasks.
    pub async fn connect(config: &ClientConfig) -> std::result::Result<Self, ClientError> {
        let url = config.serve_url()?;
        let mut request = url.as_str().into_client_request()?;
        if let Some(psk) = &config.psk {
            let value = HeaderValue::from_str(psk).map_err(|_| ClientError::InvalidKey)?;
            request.headers_mut().insert(PSK_HEADER, value);
        }

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        info!(name = %config.name, "connected to server");
        let (mut sink, mut stream) = socket.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Pending = Arc::default();
        let closed = CancellationToken::new();

        let writer = {
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = closed.cancelled() => break,
                        message = outgoing_rx.recv() => message,
                    };
                    let Some(message) = message else { break };
                    if let Err(e) = sink.send(message).await {
                        warn!(error = %e, "failed to write to server");
                        closed.cancel();
                        break;
                    }
                }
                sink.close().await.ok();
            })
        };

        let reader = {
            let pending = Arc::clone(&pending);
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = closed.cancelled() => break,
                        frame = stream.next() => frame,
                    };
                    match frame {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<RpcReply>(text.as_str()) {
                            Ok(reply) => {
                                if let Some(waiter) = pending.lock().remove(&reply.id) {
                                    waiter.send(reply.result).ok();
                                } else {
                                    debug!(id = reply.id, "reply for unknown call");
                                }
                            }
                            Err(e) => warn!(error = %e, "undecodable reply"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "server closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "connection error");
                            break;
                        }
                        None => break,
                    }
                }
                // Cancel before draining so a call registered concurrently
                // either sees the flag or gets dropped here.
                closed.cancel();
                pending.lock().clear();
            })
        };

        Ok(Self {
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            tasks: vec![writer, reader],
        })
    }

    /// Fires once the connection is gone.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Sends a close frame and stops the background tasks.
    pub async fn close(mut self) {
        self.outgoing.send(Message::Close(None)).ok();
        if let Some(writer) = self.tasks.first_mut() {
            tokio::time::timeout(std::time::Duration::from_secs(1), writer).await.ok();
        }
        self.closed.cancel();
    }

    async fn call(&self, request: RpcRequest) -> Result<RpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if self.closed.is_cancelled() {
            self.pending.lock().remove(&id);
            return Err(disconnected());
        }

        let text = serde_json::to_string(&RpcCall { id, request })?;
        if self.outgoing.send(Message::Text(text.into())).is_err() {
            self.pending.lock().remove(&id);
            return Err(disconnected());
        }

        match rx.await {
            Ok(result) => result.map_err(OrchestratorError::from),
            Err(_) => Err(disconnected()),
        }
    }
}

impl Drop for RemoteProvisionerApi {
    fn drop(&mut self) {
        self.closed.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn disconnected() -> OrchestratorError {
    OrchestratorError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        "connection to server lost",
    ))
}

fn unexpected(response: RpcResponse) -> OrchestratorError {
    OrchestratorError::Protocol(format!("unexpected response: {response:?}"))
}

#[async_trait]
impl ProvisionerApi for RemoteProvisionerApi {
    async fn acquire_job(&self) -> Result<Option<AcquiredJob>> {
        match self.call(RpcRequest::AcquireJob).await? {
            RpcResponse::AcquiredJob(job) => Ok(job),
            other => Err(unexpected(other)),
        }
    }

    async fn commit_quota(&self, req: CommitQuotaRequest) -> Result<CommitQuotaResponse> {
        match self.call(RpcRequest::CommitQuota(req)).await? {
            RpcResponse::CommitQuota(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    async fn update_job(&self, req: UpdateJobRequest) -> Result<UpdateJobResponse> {
        match self.call(RpcRequest::UpdateJob(req)).await? {
            RpcResponse::UpdateJob(resp) => Ok(resp),
            other => Err(unexpected(other)),
        }
    }

    async fn fail_job(&self, req: FailedJob) -> Result<()> {
        match self.call(RpcRequest::FailJob(req)).await? {
            RpcResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn complete_job(&self, req: CompletedJob) -> Result<()> {
        match self.call(RpcRequest::CompleteJob(req)).await? {
            RpcResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
