//! Deadline changes driven by the workspace's users rather than its builds.

use crate::build::{self, BuildTransition, WorkspaceBuild};
use crate::db::{begin_immediate, to_millis};
use crate::error::{OrchestratorError, Result};
use crate::job::{self, JobStatus};
use crate::schedule::{self, DeadlineError};
use crate::template;
use crate::workspace::{fetch_workspace, WorkspaceOrchestrator};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

impl WorkspaceOrchestrator {
    /// Records activity on a running workspace and pushes its deadline out
    /// by one TTL from now. Returns the new deadline when it moved.
    #[instrument(skip(self))]
    pub async fn activity_bump(&self, workspace_id: &str) -> Result<Option<DateTime<Utc>>> {
        let now = self.now();
        let mut tx = begin_immediate(self.pool()).await?;
        let workspace = fetch_workspace(&mut tx, workspace_id).await?;

        sqlx::query("UPDATE workspaces SET last_used_at = ? WHERE id = ?")
            .bind(to_millis(now))
            .bind(workspace_id)
            .execute(&mut *tx)
            .await?;

        let Some(latest) = build::latest_build(&mut tx, workspace_id).await? else {
            tx.commit().await?;
            return Ok(None);
        };
        let job = job::fetch_job(&mut tx, &latest.job_id).await?;
        if latest.transition != BuildTransition::Start || job.status != JobStatus::Succeeded {
            tx.commit().await?;
            debug!("workspace not running, no bump");
            return Ok(None);
        }

        let template = template::fetch_template(&mut tx, &workspace.template_id).await?;
        let ttl = workspace.ttl().or_else(|| template.schedule.default_ttl());
        let bumped = schedule::bump_deadline(latest.deadline, latest.max_deadline, ttl, now)
            .map_err(|e: DeadlineError| OrchestratorError::validation("deadline", e))?;

        if let Some(deadline) = bumped {
            build::update_deadlines(&mut tx, &latest.id, Some(deadline), latest.max_deadline, now).await?;
        }
        tx.commit().await?;

        if let Some(deadline) = bumped {
            debug!(%deadline, "deadline bumped");
            self.publish_workspace_update(workspace_id);
        }
        Ok(bumped)
    }

    /// Moves the deadline of the running build to `new_deadline`. Extensions
    /// past the max deadline are rejected rather than clamped.
    #[instrument(skip(self))]
    pub async fn extend_deadline(
        &self,
        workspace_id: &str,
        new_deadline: DateTime<Utc>,
    ) -> Result<WorkspaceBuild> {
        let now = self.now();
        let mut tx = begin_immediate(self.pool()).await?;
        fetch_workspace(&mut tx, workspace_id).await?;

        let latest = build::latest_build(&mut tx, workspace_id)
            .await?
            .ok_or_else(|| OrchestratorError::Conflict("workspace has no builds".to_string()))?;
        if latest.transition != BuildTransition::Start {
            return Err(OrchestratorError::Conflict("workspace must be started".to_string()));
        }
        let job = job::fetch_job(&mut tx, &latest.job_id).await?;
        let started_at = match (job.status, job.started_at) {
            (JobStatus::Succeeded, Some(started_at)) => started_at,
            _ => {
                return Err(OrchestratorError::Conflict(
                    "workspace is still building".to_string(),
                ))
            }
        };
        if latest.deadline.is_none() {
            return Err(OrchestratorError::Conflict(
                "workspace shutdown is manual".to_string(),
            ));
        }

        schedule::validate_deadline_extension(now, started_at, new_deadline, latest.max_deadline)
            .map_err(|e: DeadlineError| OrchestratorError::validation("deadline", e))?;

        build::update_deadlines(&mut tx, &latest.id, Some(new_deadline), latest.max_deadline, now).await?;
        let updated = build::fetch_build(&mut tx, &latest.id).await?;
        tx.commit().await?;

        info!(deadline = %new_deadline, "deadline extended");
        self.publish_workspace_update(workspace_id);
        Ok(updated)
    }
}
