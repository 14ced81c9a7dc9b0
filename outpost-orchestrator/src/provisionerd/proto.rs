//! Messages exchanged between the orchestrator and provisioner daemons.

use crate::error::OrchestratorError;
use crate::job::{base64_bytes, base64_bytes_opt, JobPayload, JobType, LogEntry, ProvisionerJob};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Upper bound on log lines accepted in a single `UpdateJob`.
pub const MAX_LOGS_PER_UPDATE: usize = 500;

/// Header carrying the pre-shared provisioner key on the serve handshake.
pub const PSK_HEADER: &str = "x-provisioner-key";

/// Path the server upgrades to the RPC socket.
pub const SERVE_PATH: &str = "/api/v1/provisionerd/serve";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquiredJob {
    pub job_id: String,
    pub job_type: JobType,
    pub payload: JobPayload,
    pub tags: BTreeSet<String>,
    pub initiator: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl From<ProvisionerJob> for AcquiredJob {
    fn from(job: ProvisionerJob) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            payload: job.payload,
            tags: job.tags,
            initiator: job.initiator,
            created_at: job.created_at,
            started_at: job.started_at,
        }
    }
}

/// Progress report and heartbeat. `seq` starts at 1 and increases by one
/// per update; a repeated `seq` is a retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateJobRequest {
    pub job_id: String,
    pub seq: i64,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(with = "base64_bytes_opt", default)]
    pub state: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateJobResponse {
    pub canceled: bool,
}

/// Quota commit sent by the worker after a successful `start` build. The
/// worker sums `daily_cost` over the resources the build produced; the
/// orchestrator checks it against the owner's allowance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitQuotaRequest {
    pub job_id: String,
    /// Summed by the worker, not recomputed here.
    pub daily_cost: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitQuotaResponse {
    pub ok: bool,
    pub credits_consumed: i64,
    pub budget: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJob {
    pub job_id: String,
    pub error: String,
    #[serde(with = "base64_bytes_opt", default)]
    pub state: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedJob {
    pub job_id: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(with = "base64_bytes", default)]
    pub state: Vec<u8>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub daily_cost: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum RpcRequest {
    AcquireJob,
    CommitQuota(CommitQuotaRequest),
    UpdateJob(UpdateJobRequest),
    FailJob(FailedJob),
    CompleteJob(CompletedJob),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub id: u64,
    pub request: RpcRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RpcResponse {
    AcquiredJob(Option<AcquiredJob>),
    CommitQuota(CommitQuotaResponse),
    UpdateJob(UpdateJobResponse),
    Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorKind {
    Protocol,
    Conflict,
    NotFound,
    InvalidInput,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    pub id: u64,
    pub result: Result<RpcResponse, RpcError>,
}

impl From<&OrchestratorError> for RpcError {
    fn from(err: &OrchestratorError) -> Self {
        let kind = match err {
            OrchestratorError::Protocol(_) => RpcErrorKind::Protocol,
            OrchestratorError::Conflict(_) => RpcErrorKind::Conflict,
            OrchestratorError::NotFound(_) => RpcErrorKind::NotFound,
            OrchestratorError::InvalidInput(_) | OrchestratorError::Validation { .. } => {
                RpcErrorKind::InvalidInput
            }
            _ => RpcErrorKind::Internal,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<RpcError> for OrchestratorError {
    fn from(err: RpcError) -> Self {
        match err.kind {
            RpcErrorKind::Protocol => Self::Protocol(err.message),
            RpcErrorKind::Conflict => Self::Conflict(err.message),
            RpcErrorKind::NotFound => Self::NotFound(err.message),
            RpcErrorKind::InvalidInput => Self::InvalidInput(err.message),
            RpcErrorKind::Internal => Self::Provider(anyhow::anyhow!(err.message)),
        }
    }
}
