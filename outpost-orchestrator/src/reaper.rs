use crate::error::Result;
use crate::lifecycle::jittered;
use crate::workspace::WorkspaceOrchestrator;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaperStats {
    pub canceled: usize,
    pub finalized: usize,
}

/// Cancels jobs whose worker stopped heartbeating and finalizes
/// cancellations no worker acknowledged.
pub struct JobReaper {
    orchestrator: WorkspaceOrchestrator,
    force_cancel_interval: Duration,
    grace_period: Duration,
}

impl JobReaper {
    pub fn new(
        orchestrator: WorkspaceOrchestrator,
        force_cancel_interval: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            orchestrator,
            force_cancel_interval,
            grace_period,
        }
    }

    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<ReaperStats> {
        let now = self.orchestrator.now();
        let mut stats = ReaperStats::default();

        let hung_cutoff = now - to_chrono(self.force_cancel_interval);
        for job_id in self.orchestrator.hung_jobs(hung_cutoff).await? {
            let reason = format!(
                "no heartbeat for {}s, force-canceled",
                self.force_cancel_interval.as_secs()
            );
            match self.orchestrator.force_cancel_job(&job_id, &reason).await {
                Ok(true) => stats.canceled += 1,
                Ok(false) => {}
                Err(e) => warn!(%job_id, error = %e, "force cancel failed"),
            }
        }

        let grace_cutoff = now - to_chrono(self.grace_period);
        stats.finalized = self.orchestrator.finalize_canceled_jobs(grace_cutoff).await?.len();

        Ok(stats)
    }

    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "job reaper running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(jittered(interval)) => {}
            }
            match self.run_once().await {
                Ok(stats) if stats.canceled > 0 || stats.finalized > 0 => {
                    info!(canceled = stats.canceled, finalized = stats.finalized, "reaped jobs")
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "job reaper sweep failed"),
            }
        }
        info!("job reaper stopped");
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
