use super::proto::{
    AcquiredJob, CommitQuotaRequest, CommitQuotaResponse, CompletedJob, FailedJob, RpcRequest,
    RpcResponse, UpdateJobRequest, UpdateJobResponse,
};
use crate::error::Result;
use async_trait::async_trait;

/// The five calls a daemon makes. Implemented in-process by
/// [`DaemonSession`](super::DaemonSession) and over the network by the
/// daemon binary's client.
#[async_trait]
pub trait ProvisionerApi: Send + Sync {
    /// Long-polls for a job. `None` after the acquire timeout.
    async fn acquire_job(&self) -> Result<Option<AcquiredJob>>;
    async fn commit_quota(&self, req: CommitQuotaRequest) -> Result<CommitQuotaResponse>;
    async fn update_job(&self, req: UpdateJobRequest) -> Result<UpdateJobResponse>;
    async fn fail_job(&self, req: FailedJob) -> Result<()>;
    async fn complete_job(&self, req: CompletedJob) -> Result<()>;
}

/// Routes a decoded request to the matching call.
pub async fn dispatch(api: &dyn ProvisionerApi, request: RpcRequest) -> Result<RpcResponse> {
    Ok(match request {
        RpcRequest::AcquireJob => RpcResponse::AcquiredJob(api.acquire_job().await?),
        RpcRequest::CommitQuota(req) => RpcResponse::CommitQuota(api.commit_quota(req).await?),
        RpcRequest::UpdateJob(req) => RpcResponse::UpdateJob(api.update_job(req).await?),
        RpcRequest::FailJob(req) => {
            api.fail_job(req).await?;
            RpcResponse::Ack
        }
        RpcRequest::CompleteJob(req) => {
            api.complete_job(req).await?;
            RpcResponse::Ack
        }
    })
}
