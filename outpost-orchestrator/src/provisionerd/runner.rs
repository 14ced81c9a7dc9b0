//! The daemon loop: acquire a job, run it, report progress, finish it.

use super::api::ProvisionerApi;
use super::logs::LogBuffer;
use super::proto::{
    AcquiredJob, CommitQuotaRequest, CompletedJob, FailedJob, Resource, UpdateJobRequest,
    MAX_LOGS_PER_UPDATE,
};
use crate::build::BuildTransition;
use crate::clock::{Clock, SystemClock};
use crate::error::{OrchestratorError, Result};
use crate::job::{JobPayload, LogEntry, LogLevel};
use crate::quota::sum_daily_cost;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What a successful run produced.
#[derive(Debug, Clone, Default)]
pub struct ProvisionOutcome {
    pub resources: Vec<Resource>,
    pub state: Vec<u8>,
    pub metadata: serde_json::Value,
}

/// Handle a provisioner uses to report back while it runs.
#[derive(Clone)]
pub struct JobProgress {
    clock: Arc<dyn Clock>,
    logs: Arc<LogBuffer>,
    state: Arc<Mutex<Option<Vec<u8>>>>,
    cancel: CancellationToken,
}

impl JobProgress {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            logs: Arc::new(LogBuffer::new(log_capacity)),
            state: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        }
    }

    /// Stamps log lines with `clock` instead of the system time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn log(&self, level: LogLevel, stage: &str, output: impl Into<String>) {
        self.logs.push(LogEntry::new(self.clock.now(), level, stage, output));
    }

    /// Latest state token; sent with the next update.
    pub fn set_state(&self, state: Vec<u8>) {
        *self.state.lock() = Some(state);
    }

    /// Fires when the orchestrator or the daemon asks the job to stop.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn take_state(&self) -> Option<Vec<u8>> {
        self.state.lock().take()
    }

    fn peek_state(&self) -> Option<Vec<u8>> {
        self.state.lock().clone()
    }
}

/// The opaque thing that turns a job into infrastructure.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    async fn provision(&self, job: &AcquiredJob, progress: &JobProgress) -> anyhow::Result<ProvisionOutcome>;
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub poll_interval: Duration,
    pub poll_jitter: Duration,
    pub update_interval: Duration,
    pub log_capacity: usize,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(100),
            update_interval: Duration::from_secs(1),
            log_capacity: 1024,
        }
    }
}

pub struct ProvisionerDaemonRunner<A, P> {
    api: Arc<A>,
    provisioner: Arc<P>,
    options: DaemonOptions,
    clock: Arc<dyn Clock>,
}

impl<A, P> ProvisionerDaemonRunner<A, P>
where
    A: ProvisionerApi + 'static,
    P: Provisioner,
{
    pub fn new(api: Arc<A>, provisioner: Arc<P>, options: DaemonOptions) -> Self {
        Self {
            api,
            provisioner,
            options,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs jobs one at a time until `shutdown` fires. A job in flight at
    /// shutdown is canceled and reported before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("provisioner daemon started");
        while !shutdown.is_cancelled() {
            let acquired = tokio::select! {
                _ = shutdown.cancelled() => break,
                acquired = self.api.acquire_job() => acquired,
            };

            match acquired {
                Ok(Some(job)) => {
                    if let Err(e) = self.run_job(job, &shutdown).await {
                        error!(error = %e, "job reporting failed");
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "acquire failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_delay()) => {}
            }
        }
        info!("provisioner daemon stopped");
    }

    fn poll_delay(&self) -> Duration {
        let jitter = self.options.poll_jitter.as_millis() as u64;
        if jitter == 0 {
            return self.options.poll_interval;
        }
        self.options.poll_interval + Duration::from_millis(rand::rng().random_range(0..=jitter))
    }

    /// Runs one acquired job to completion and reports the outcome.
    #[instrument(skip(self, job, shutdown), fields(job_id = %job.job_id, job_type = ?job.job_type))]
    pub async fn run_job(&self, job: AcquiredJob, shutdown: &CancellationToken) -> Result<()> {
        info!("running job");
        let progress = JobProgress::new(self.options.log_capacity).with_clock(Arc::clone(&self.clock));
        let mut handle = {
            let provisioner = Arc::clone(&self.provisioner);
            let job = job.clone();
            let progress = progress.clone();
            tokio::spawn(async move { provisioner.provision(&job, &progress).await })
        };

        let mut updates = Updates::new(&job.job_id);
        let mut ticker = tokio::time::interval(self.options.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let joined = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                _ = ticker.tick() => {
                    match updates.send(self.api.as_ref(), &progress).await {
                        Delivery::Sent { canceled: true } | Delivery::Rejected => progress.cancel.cancel(),
                        Delivery::Sent { .. } | Delivery::Retry => {}
                    }
                }
                _ = shutdown.cancelled(), if !progress.is_canceled() => {
                    info!("daemon shutting down, canceling job");
                    progress.cancel.cancel();
                }
            }
        };

        // Flush what the provisioner wrote after the last tick.
        let mut retries = 0;
        while !progress.logs.is_empty() || updates.pending.is_some() {
            match updates.send(self.api.as_ref(), &progress).await {
                Delivery::Sent { .. } => {}
                Delivery::Rejected => break,
                Delivery::Retry if retries < FLUSH_RETRIES => retries += 1,
                Delivery::Retry => {
                    warn!("giving up on flushing logs");
                    break;
                }
            }
        }

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => Err(anyhow::anyhow!("provisioner task aborted: {e}")),
        };

        match outcome {
            Ok(outcome) => self.finish(&job, outcome).await,
            Err(e) => {
                warn!(error = %e, "job failed");
                self.api
                    .fail_job(FailedJob {
                        job_id: job.job_id.clone(),
                        error: e.to_string(),
                        state: progress.take_state(),
                    })
                    .await
            }
        }
    }

    async fn finish(&self, job: &AcquiredJob, outcome: ProvisionOutcome) -> Result<()> {
        let is_start = matches!(
            &job.payload,
            JobPayload::WorkspaceBuild(p) if p.transition == BuildTransition::Start
        );
        if is_start {
            let daily_cost = sum_daily_cost(&outcome.resources);
            match self
                .api
                .commit_quota(CommitQuotaRequest {
                    job_id: job.job_id.clone(),
                    daily_cost,
                })
                .await
            {
                Ok(quota) if !quota.ok => warn!(
                    consumed = quota.credits_consumed,
                    budget = quota.budget,
                    "owner is over quota"
                ),
                Ok(_) => debug!(daily_cost, "quota committed"),
                Err(e) => warn!(error = %e, "quota commit failed"),
            }
        }

        info!(resources = outcome.resources.len(), "job completed");
        self.api
            .complete_job(CompletedJob {
                job_id: job.job_id.clone(),
                resources: outcome.resources,
                state: outcome.state,
                metadata: outcome.metadata,
            })
            .await
    }
}

const FLUSH_RETRIES: usize = 3;

enum Delivery {
    Sent { canceled: bool },
    /// The orchestrator no longer accepts updates for this job.
    Rejected,
    /// Transport or storage failure; the same update goes out next time.
    Retry,
}

/// Sequenced progress reports for one job. An update that failed in
/// transit is resent with the same `seq`, which the orchestrator treats as
/// a retry.
struct Updates {
    job_id: String,
    seq: i64,
    pending: Option<UpdateJobRequest>,
}

impl Updates {
    fn new(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            seq: 0,
            pending: None,
        }
    }

    async fn send(&mut self, api: &dyn ProvisionerApi, progress: &JobProgress) -> Delivery {
        let req = match self.pending.take() {
            Some(req) => req,
            None => {
                self.seq += 1;
                UpdateJobRequest {
                    job_id: self.job_id.clone(),
                    seq: self.seq,
                    logs: progress.logs.drain(MAX_LOGS_PER_UPDATE, progress.clock.now()),
                    state: progress.peek_state(),
                }
            }
        };

        match api.update_job(req.clone()).await {
            Ok(resp) => {
                if resp.canceled && !progress.is_canceled() {
                    info!("orchestrator canceled job");
                }
                Delivery::Sent {
                    canceled: resp.canceled,
                }
            }
            Err(OrchestratorError::Protocol(msg)) => {
                warn!(%msg, "update rejected, abandoning job");
                Delivery::Rejected
            }
            Err(e) => {
                warn!(error = %e, seq = req.seq, "update failed, will retry");
                self.pending = Some(req);
                Delivery::Retry
            }
        }
    }
}
