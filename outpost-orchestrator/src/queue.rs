//! Job state machine as seen by workers and by the orchestrator's sweeps.
//!
//! ```text
//! pending -> running -> succeeded | failed
//!            running -> canceling -> canceled
//! ```
//!
//! Every transition is a compare-and-swap on the current status, so two
//! writers racing on the same job cannot both win.

use crate::build::BuildTransition;
use crate::daemon::{self, ProvisionerDaemon};
use crate::db::{begin_immediate, to_millis};
use crate::error::{OrchestratorError, Result};
use crate::job::{self, JobLog, JobPayload, JobStatus, ProvisionerJob};
use crate::provisionerd::proto::{
    AcquiredJob, CompletedJob, FailedJob, Resource, UpdateJobRequest, UpdateJobResponse,
    MAX_LOGS_PER_UPDATE,
};
use crate::quota::sum_daily_cost;
use crate::schedule::{calculate_autostop, AutostopTimes};
use crate::template::fetch_template;
use crate::workspace::{fetch_workspace, WorkspaceOrchestrator};
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// How many pending candidates a single acquire attempt races for.
const ACQUIRE_BATCH: i64 = 16;

fn ensure_assigned(job: &ProvisionerJob, daemon_id: &str) -> Result<()> {
    if job.worker_id.as_deref() != Some(daemon_id) {
        return Err(OrchestratorError::Protocol(format!(
            "job {} is not assigned to this daemon",
            job.id
        )));
    }
    Ok(())
}

impl WorkspaceOrchestrator {
    /// Claims the oldest pending job the daemon can run. `None` when nothing
    /// matches; losing a race for one candidate moves on to the next.
    #[instrument(skip(self, daemon), fields(daemon = %daemon.name))]
    pub async fn acquire_job(&self, daemon: &ProvisionerDaemon) -> Result<Option<AcquiredJob>> {
        let now = self.now();
        let mut conn = self.pool().acquire().await?;
        daemon::touch(&mut conn, &daemon.id, now).await?;

        let candidates = job::pending_jobs_matching(&mut conn, &daemon.tags, ACQUIRE_BATCH).await?;
        for candidate in candidates {
            if !daemon.can_run(&candidate.tags) {
                continue;
            }
            if job::try_claim(&mut conn, &candidate.id, &daemon.id, now).await? {
                let job = job::fetch_job(&mut conn, &candidate.id).await?;
                info!(job_id = %job.id, job_type = ?job.job_type, "job acquired");
                if let Some(workspace_id) = job.payload.workspace_id() {
                    self.publish_workspace_update(workspace_id);
                }
                return Ok(Some(job.into()));
            }
            debug!(job_id = %candidate.id, "lost acquire race");
        }

        Ok(None)
    }

    /// Applies a progress report. Returns whether the job has been asked to
    /// cancel so the worker can stop early.
    #[instrument(skip(self, req), fields(job_id = %req.job_id, seq = req.seq, logs = req.logs.len()))]
    pub async fn update_job(&self, daemon_id: &str, req: UpdateJobRequest) -> Result<UpdateJobResponse> {
        if req.logs.len() > MAX_LOGS_PER_UPDATE {
            return Err(OrchestratorError::Protocol(format!(
                "update carries {} log lines, at most {MAX_LOGS_PER_UPDATE} are accepted",
                req.logs.len()
            )));
        }

        let now = self.now();
        let mut tx = begin_immediate(self.pool()).await?;
        let job = job::fetch_job(&mut tx, &req.job_id).await?;
        ensure_assigned(&job, daemon_id)?;

        match job.status {
            JobStatus::Running | JobStatus::Canceling => {}
            status => {
                return Err(OrchestratorError::Protocol(format!(
                    "job {} is {status}, updates are no longer accepted",
                    job.id
                )))
            }
        }
        let canceled = job.status == JobStatus::Canceling;

        if req.seq == job.last_update_seq {
            debug!("duplicate update ignored");
            return Ok(UpdateJobResponse { canceled });
        }
        if req.seq < job.last_update_seq {
            return Err(OrchestratorError::Protocol(format!(
                "stale update: seq {} is behind {}",
                req.seq, job.last_update_seq
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE provisioner_jobs
            SET last_update_seq = ?, updated_at = ?, state = COALESCE(?, state)
            WHERE id = ? AND last_update_seq < ?
            "#,
        )
        .bind(req.seq)
        .bind(to_millis(now))
        .bind(req.state.as_deref())
        .bind(&job.id)
        .bind(req.seq)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::Conflict(format!(
                "job {} was updated concurrently",
                job.id
            )));
        }
        job::insert_logs(&mut tx, &job.id, &req.logs).await?;
        tx.commit().await?;

        Ok(UpdateJobResponse { canceled })
    }

    /// `running -> failed`, or `canceling -> canceled` when the failure is
    /// the worker acknowledging a cancellation. No-op on jobs that are not
    /// in flight.
    #[instrument(skip(self, req), fields(job_id = %req.job_id))]
    pub async fn fail_job(&self, daemon_id: &str, req: FailedJob) -> Result<()> {
        let now = self.now();
        let mut tx = begin_immediate(self.pool()).await?;
        let job = job::fetch_job(&mut tx, &req.job_id).await?;

        let to = match job.status {
            JobStatus::Running => JobStatus::Failed,
            JobStatus::Canceling => JobStatus::Canceled,
            status => {
                debug!(%status, "fail ignored, job not in flight");
                return Ok(());
            }
        };
        ensure_assigned(&job, daemon_id)?;

        if !job::transition(&mut tx, &job.id, job.status, to, Some(&req.error), now).await? {
            debug!("job moved concurrently, fail ignored");
            return Ok(());
        }

        if let JobPayload::WorkspaceBuild(payload) = &job.payload {
            let state = match req.state {
                Some(state) => Some(state),
                None => job::fetch_job_state(&mut tx, &job.id).await?,
            };
            if let Some(state) = state {
                sqlx::query("UPDATE workspace_builds SET provisioner_state = ?, updated_at = ? WHERE id = ?")
                    .bind(state)
                    .bind(to_millis(now))
                    .bind(&payload.build_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;

        warn!(status = %to, error = %req.error, "job failed");
        if let Some(workspace_id) = job.payload.workspace_id() {
            self.publish_workspace_update(workspace_id);
        }
        Ok(())
    }

    /// `running -> succeeded`, applying the job's results. A `canceling` job
    /// is acknowledged as `canceled` and its results discarded. No-op on jobs
    /// that are not in flight.
    #[instrument(skip(self, req), fields(job_id = %req.job_id, resources = req.resources.len()))]
    pub async fn complete_job(&self, daemon_id: &str, req: CompletedJob) -> Result<()> {
        if let Some(bad) = req.resources.iter().find(|r| r.daily_cost < 0) {
            return Err(OrchestratorError::Protocol(format!(
                "resource {} has a negative daily cost",
                bad.name
            )));
        }

        let now = self.now();
        let mut tx = begin_immediate(self.pool()).await?;
        let job = job::fetch_job(&mut tx, &req.job_id).await?;

        match job.status {
            JobStatus::Running => {}
            JobStatus::Canceling => {
                ensure_assigned(&job, daemon_id)?;
                job::transition(&mut tx, &job.id, JobStatus::Canceling, JobStatus::Canceled, None, now)
                    .await?;
                tx.commit().await?;
                info!("canceled job completed, results discarded");
                if let Some(workspace_id) = job.payload.workspace_id() {
                    self.publish_workspace_update(workspace_id);
                }
                return Ok(());
            }
            status => {
                debug!(%status, "complete ignored, job not in flight");
                return Ok(());
            }
        }
        ensure_assigned(&job, daemon_id)?;

        if !job::transition(&mut tx, &job.id, JobStatus::Running, JobStatus::Succeeded, None, now).await? {
            debug!("job moved concurrently, complete ignored");
            return Ok(());
        }

        sqlx::query("UPDATE provisioner_jobs SET state = ?, result = ? WHERE id = ?")
            .bind(&req.state)
            .bind(serde_json::to_string(&req.metadata)?)
            .bind(&job.id)
            .execute(&mut *tx)
            .await?;
        insert_resources(&mut tx, &job.id, &req.resources, now).await?;

        match &job.payload {
            JobPayload::WorkspaceBuild(payload) => {
                let times = match payload.transition {
                    BuildTransition::Start => {
                        let workspace = fetch_workspace(&mut tx, &payload.workspace_id).await?;
                        let template = fetch_template(&mut tx, &workspace.template_id).await?;
                        calculate_autostop(now, workspace.ttl(), &template.schedule)
                            .map_err(|e| OrchestratorError::validation("deadline", e))?
                    }
                    _ => AutostopTimes::default(),
                };

                sqlx::query(
                    r#"
                    UPDATE workspace_builds
                    SET provisioner_state = ?, daily_cost = ?, deadline = ?, max_deadline = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&req.state)
                .bind(sum_daily_cost(&req.resources))
                .bind(times.deadline.map(to_millis))
                .bind(times.max_deadline.map(to_millis))
                .bind(to_millis(now))
                .bind(&payload.build_id)
                .execute(&mut *tx)
                .await?;

                if payload.transition == BuildTransition::Delete {
                    sqlx::query("UPDATE workspaces SET deleted = 1, updated_at = ? WHERE id = ?")
                        .bind(to_millis(now))
                        .bind(&payload.workspace_id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
            JobPayload::TemplateVersionImport(payload) => {
                // The first imported version of a template becomes active.
                sqlx::query(
                    "UPDATE templates SET active_version_id = ?, updated_at = ? WHERE id = ? AND active_version_id IS NULL",
                )
                .bind(&payload.template_version_id)
                .bind(to_millis(now))
                .bind(&payload.template_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        info!("job succeeded");
        if let Some(workspace_id) = job.payload.workspace_id() {
            self.publish_workspace_update(workspace_id);
        }
        Ok(())
    }

    /// `running -> canceling`. The worker learns about it on its next update;
    /// the reaper finalizes the job if it never does. Returns whether this
    /// call moved the job.
    #[instrument(skip(self))]
    pub async fn force_cancel_job(&self, job_id: &str, reason: &str) -> Result<bool> {
        let now = self.now();
        let mut conn = self.pool().acquire().await?;
        let job = job::fetch_job(&mut conn, job_id).await?;

        let moved = job::transition(
            &mut conn,
            job_id,
            JobStatus::Running,
            JobStatus::Canceling,
            Some(reason),
            now,
        )
        .await?;

        if moved {
            warn!(reason, "job force-canceled");
            if let Some(workspace_id) = job.payload.workspace_id() {
                self.publish_workspace_update(workspace_id);
            }
        }
        Ok(moved)
    }

    /// Cancels a job that no worker has picked up yet.
    pub async fn cancel_pending_job(&self, job_id: &str) -> Result<bool> {
        let now = self.now();
        let mut conn = self.pool().acquire().await?;
        let job = job::fetch_job(&mut conn, job_id).await?;
        let moved = job::transition(
            &mut conn,
            job_id,
            JobStatus::Pending,
            JobStatus::Canceled,
            Some("canceled before a provisioner picked it up"),
            now,
        )
        .await?;
        if moved {
            if let Some(workspace_id) = job.payload.workspace_id() {
                self.publish_workspace_update(workspace_id);
            }
        }
        Ok(moved)
    }

    /// Running jobs that stopped heartbeating at or before `cutoff`.
    pub async fn hung_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let mut conn = self.pool().acquire().await?;
        job::hung_jobs(&mut conn, cutoff).await
    }

    /// `canceling -> canceled` for jobs whose worker never acknowledged a
    /// cancellation requested at or before `cutoff`.
    pub async fn finalize_canceled_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let now = self.now();
        let mut conn = self.pool().acquire().await?;
        let stale = job::stale_canceling_jobs(&mut conn, cutoff).await?;

        let mut finalized = Vec::new();
        for id in stale {
            if job::transition(&mut conn, &id, JobStatus::Canceling, JobStatus::Canceled, None, now).await? {
                let job = job::fetch_job(&mut conn, &id).await?;
                if let Some(workspace_id) = job.payload.workspace_id() {
                    self.publish_workspace_update(workspace_id);
                }
                finalized.push(id);
            }
        }
        Ok(finalized)
    }

    pub async fn get_job(&self, id: &str) -> Result<ProvisionerJob> {
        let mut conn = self.pool().acquire().await?;
        job::fetch_job(&mut conn, id).await
    }

    /// Log lines with an id greater than `after`, oldest first.
    pub async fn job_logs(&self, job_id: &str, after: i64) -> Result<Vec<JobLog>> {
        let mut conn = self.pool().acquire().await?;
        job::fetch_job(&mut conn, job_id).await?;
        job::fetch_logs(&mut conn, job_id, after).await
    }

    pub async fn job_resources(&self, job_id: &str) -> Result<Vec<Resource>> {
        let rows: Vec<(String, String, i64, Option<String>)> = sqlx::query_as(
            "SELECT name, resource_type, daily_cost, metadata FROM workspace_resources WHERE job_id = ? ORDER BY name",
        )
        .bind(job_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|(name, resource_type, daily_cost, metadata)| {
                let metadata = match metadata {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => serde_json::Value::Null,
                };
                Ok(Resource {
                    name,
                    resource_type,
                    daily_cost,
                    metadata,
                })
            })
            .collect()
    }
}

async fn insert_resources(
    conn: &mut SqliteConnection,
    job_id: &str,
    resources: &[Resource],
    now: DateTime<Utc>,
) -> Result<()> {
    for resource in resources {
        sqlx::query(
            r#"
            INSERT INTO workspace_resources (id, job_id, name, resource_type, daily_cost, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(job_id)
        .bind(&resource.name)
        .bind(&resource.resource_type)
        .bind(resource.daily_cost)
        .bind(serde_json::to_string(&resource.metadata)?)
        .bind(to_millis(now))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}
