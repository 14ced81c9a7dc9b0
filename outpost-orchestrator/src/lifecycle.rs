//! Autostart and autostop.
//!
//! Each tick looks at every live workspace and queues the build its schedule
//! calls for, through the same path a user request takes.

use crate::build::{self, BuildReason, BuildTransition, WorkspaceBuild};
use crate::builder::BuildRequest;
use crate::db::begin_immediate;
use crate::error::{OrchestratorError, Result};
use crate::job::{self, JobStatus, ProvisionerJob};
use crate::rbac::allow_all;
use crate::schedule::TemplateScheduleOptions;
use crate::template;
use crate::workspace::{fetch_workspace, Workspace, WorkspaceOrchestrator};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Initiator recorded on builds the executor queues.
pub const SYSTEM_INITIATOR: &str = "system";

/// The transition a workspace is due for at `now`, if any.
pub fn next_autobuild_transition(
    workspace: &Workspace,
    latest: &WorkspaceBuild,
    job: &ProvisionerJob,
    options: &TemplateScheduleOptions,
    now: DateTime<Utc>,
) -> Option<(BuildTransition, BuildReason)> {
    if workspace.deleted || job.status != JobStatus::Succeeded {
        return None;
    }

    match latest.transition {
        BuildTransition::Stop => {
            if !options.user_autostart_enabled {
                return None;
            }
            let next = workspace.autostart_schedule.as_ref()?.next(latest.created_at)?;
            (next <= now).then_some((BuildTransition::Start, BuildReason::Autostart))
        }
        BuildTransition::Start => {
            let due = latest.deadline.is_some_and(|d| d <= now)
                || latest.max_deadline.is_some_and(|d| d <= now);
            due.then_some((BuildTransition::Stop, BuildReason::Autostop))
        }
        BuildTransition::Delete => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleStats {
    pub transitions: usize,
    pub errors: usize,
}

pub struct LifecycleExecutor {
    orchestrator: WorkspaceOrchestrator,
}

impl LifecycleExecutor {
    pub fn new(orchestrator: WorkspaceOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Evaluates every live workspace once.
    #[instrument(skip(self))]
    pub async fn run_tick(&self) -> Result<LifecycleStats> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM workspaces WHERE deleted = 0 ORDER BY id")
            .fetch_all(self.orchestrator.pool())
            .await?;

        let mut stats = LifecycleStats::default();
        for id in ids {
            match self.evaluate(&id).await {
                Ok(Some(build)) => {
                    stats.transitions += 1;
                    info!(
                        workspace_id = %id,
                        transition = %build.transition,
                        reason = ?build.reason,
                        "lifecycle build queued"
                    );
                    self.orchestrator.publish_workspace_update(&id);
                }
                Ok(None) => {}
                // Someone else queued a build between our read and write.
                Err(OrchestratorError::Conflict(msg)) => debug!(workspace_id = %id, %msg, "lifecycle build skipped"),
                Err(e) => {
                    stats.errors += 1;
                    warn!(workspace_id = %id, error = %e, "lifecycle evaluation failed");
                }
            }
        }

        if stats.transitions > 0 {
            self.orchestrator.publish_job_posted();
        }
        Ok(stats)
    }

    async fn evaluate(&self, workspace_id: &str) -> Result<Option<WorkspaceBuild>> {
        let now = self.orchestrator.now();
        let mut tx = begin_immediate(self.orchestrator.pool()).await?;

        let workspace = fetch_workspace(&mut tx, workspace_id).await?;
        let Some(latest) = build::latest_build(&mut tx, workspace_id).await? else {
            return Ok(None);
        };
        let job = job::fetch_job(&mut tx, &latest.job_id).await?;
        let template = template::fetch_template(&mut tx, &workspace.template_id).await?;

        let Some((transition, reason)) =
            next_autobuild_transition(&workspace, &latest, &job, &template.schedule, now)
        else {
            return Ok(None);
        };

        let req = BuildRequest::new(workspace_id, transition, SYSTEM_INITIATOR).reason(reason);
        let (build, _job) = self.orchestrator.build_in_tx(&mut tx, req, &allow_all).await?;
        tx.commit().await?;
        Ok(Some(build))
    }

    /// Ticks every `interval` (plus jitter) until `shutdown` fires.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "lifecycle executor running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(jittered(interval)) => {}
            }
            match self.run_tick().await {
                Ok(stats) if stats.transitions > 0 || stats.errors > 0 => {
                    info!(transitions = stats.transitions, errors = stats.errors, "lifecycle tick")
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "lifecycle tick failed"),
            }
        }
        info!("lifecycle executor stopped");
    }
}

/// `base` plus up to 10% random jitter so replicas do not tick in lockstep.
pub(crate) fn jittered(base: Duration) -> Duration {
    let spread = (base.as_millis() / 10) as u64;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..=spread))
}
