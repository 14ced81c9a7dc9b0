use super::api::ProvisionerApi;
use super::proto::{
    AcquiredJob, CommitQuotaRequest, CommitQuotaResponse, CompletedJob, FailedJob, UpdateJobRequest,
    UpdateJobResponse,
};
use crate::daemon::ProvisionerDaemon;
use crate::error::Result;
use crate::pubsub::JOB_POSTED_CHANNEL;
use crate::workspace::WorkspaceOrchestrator;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A registered daemon's view of the queue. Every call is checked against
/// the daemon's identity.
pub struct DaemonSession {
    orchestrator: WorkspaceOrchestrator,
    daemon: ProvisionerDaemon,
    acquire_timeout: Duration,
    cancel: CancellationToken,
}

impl DaemonSession {
    pub fn new(orchestrator: WorkspaceOrchestrator, daemon: ProvisionerDaemon, acquire_timeout: Duration) -> Self {
        Self {
            orchestrator,
            daemon,
            acquire_timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Ends outstanding long polls early, e.g. when the connection closes.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn daemon(&self) -> &ProvisionerDaemon {
        &self.daemon
    }
}

#[async_trait]
impl ProvisionerApi for DaemonSession {
    async fn acquire_job(&self) -> Result<Option<AcquiredJob>> {
        // Subscribe before the first attempt so a job posted in between
        // still wakes us.
        let mut posted = self.orchestrator.pubsub().subscribe(JOB_POSTED_CHANNEL);
        let deadline = Instant::now() + self.acquire_timeout;

        loop {
            if let Some(job) = self.orchestrator.acquire_job(&self.daemon).await? {
                return Ok(Some(job));
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
                message = posted.recv() => {
                    if message.is_none() {
                        return Ok(None);
                    }
                    trace!(daemon = %self.daemon.name, "job posted, retrying acquire");
                }
            }
        }
    }

    async fn commit_quota(&self, req: CommitQuotaRequest) -> Result<CommitQuotaResponse> {
        self.orchestrator.commit_quota(&self.daemon.id, req).await
    }

    async fn update_job(&self, req: UpdateJobRequest) -> Result<UpdateJobResponse> {
        self.orchestrator.update_job(&self.daemon.id, req).await
    }

    async fn fail_job(&self, req: FailedJob) -> Result<()> {
        self.orchestrator.fail_job(&self.daemon.id, req).await
    }

    async fn complete_job(&self, req: CompletedJob) -> Result<()> {
        self.orchestrator.complete_job(&self.daemon.id, req).await
    }
}
