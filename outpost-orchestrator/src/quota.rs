//! Quota ledger.
//!
//! Accounting is post-hoc: a commit records whether the owner was within
//! budget but never fails the job that produced the cost.

use crate::db::{begin_immediate, to_millis};
use crate::error::{OrchestratorError, Result};
use crate::job::{self, JobPayload};
use crate::provisionerd::proto::{CommitQuotaRequest, CommitQuotaResponse, Resource};
use crate::workspace::{fetch_workspace, WorkspaceOrchestrator};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

pub fn sum_daily_cost(resources: &[Resource]) -> i64 {
    resources
        .iter()
        .fold(0i64, |total, r| total.saturating_add(r.daily_cost))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QuotaStatus {
    pub owner: String,
    /// 0 means no budget applies.
    pub budget: i64,
    pub consumed: i64,
}

pub(crate) async fn owner_budget(conn: &mut SqliteConnection, owner: &str, default: i64) -> Result<i64> {
    let budget: Option<i64> = sqlx::query_scalar("SELECT budget FROM quota_allowances WHERE owner = ?")
        .bind(owner)
        .fetch_optional(conn)
        .await?;
    Ok(budget.unwrap_or(default))
}

/// Daily cost of the owner's running workspaces: the latest build of each
/// non-deleted workspace, if it is a succeeded `start`.
pub(crate) async fn consumed_by_owner(
    conn: &mut SqliteConnection,
    owner: &str,
    exclude_workspace: Option<&str>,
) -> Result<i64> {
    let consumed: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(b.daily_cost), 0)
        FROM workspace_builds b
        JOIN workspaces w ON w.id = b.workspace_id
        JOIN provisioner_jobs j ON j.id = b.job_id
        WHERE w.owner = ?
          AND w.deleted = 0
          AND w.id != COALESCE(?, '')
          AND b.transition = 'start'
          AND j.status = 'succeeded'
          AND b.build_number = (
              SELECT MAX(build_number) FROM workspace_builds WHERE workspace_id = w.id
          )
        "#,
    )
    .bind(owner)
    .bind(exclude_workspace)
    .fetch_one(conn)
    .await?;
    Ok(consumed)
}

impl WorkspaceOrchestrator {
    /// Records the cost of the build a job is producing and reports whether
    /// the owner stays within budget.
    #[instrument(skip(self, req), fields(job_id = %req.job_id, daily_cost = req.daily_cost))]
    pub async fn commit_quota(
        &self,
        daemon_id: &str,
        req: CommitQuotaRequest,
    ) -> Result<CommitQuotaResponse> {
        if req.daily_cost < 0 {
            return Err(OrchestratorError::Protocol("daily cost must not be negative".to_string()));
        }

        let now = self.now();
        let mut tx = begin_immediate(self.pool()).await?;
        let job = job::fetch_job(&mut tx, &req.job_id).await?;
        if job.worker_id.as_deref() != Some(daemon_id) {
            return Err(OrchestratorError::Protocol(format!(
                "job {} is not assigned to this daemon",
                job.id
            )));
        }
        if job.status.is_terminal() {
            return Err(OrchestratorError::Protocol(format!("job {} is already {}", job.id, job.status)));
        }
        let JobPayload::WorkspaceBuild(payload) = &job.payload else {
            return Err(OrchestratorError::Protocol(format!(
                "job {} is not a workspace build",
                job.id
            )));
        };

        let workspace = fetch_workspace(&mut tx, &payload.workspace_id).await?;
        let budget = owner_budget(&mut tx, &workspace.owner, self.default_quota_budget()).await?;
        let others = consumed_by_owner(&mut tx, &workspace.owner, Some(&workspace.id)).await?;
        let consumed = others.saturating_add(req.daily_cost);
        let ok = budget <= 0 || consumed <= budget;

        sqlx::query(
            r#"
            INSERT INTO quota_commits (job_id, owner, daily_cost, consumed, budget, permitted, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                daily_cost = excluded.daily_cost,
                consumed = excluded.consumed,
                budget = excluded.budget,
                permitted = excluded.permitted,
                created_at = excluded.created_at
            "#,
        )
        .bind(&job.id)
        .bind(&workspace.owner)
        .bind(req.daily_cost)
        .bind(consumed)
        .bind(budget)
        .bind(ok)
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE workspace_builds SET daily_cost = ?, updated_at = ? WHERE id = ?")
            .bind(req.daily_cost)
            .bind(to_millis(now))
            .bind(&payload.build_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if ok {
            info!(owner = %workspace.owner, consumed, budget, "quota committed");
        } else {
            warn!(owner = %workspace.owner, consumed, budget, "quota exceeded");
        }

        Ok(CommitQuotaResponse {
            ok,
            credits_consumed: consumed,
            budget,
        })
    }

    pub async fn quota_status(&self, owner: &str) -> Result<QuotaStatus> {
        let mut conn = self.pool().acquire().await?;
        let budget = owner_budget(&mut conn, owner, self.default_quota_budget()).await?;
        let consumed = consumed_by_owner(&mut conn, owner, None).await?;
        Ok(QuotaStatus {
            owner: owner.to_string(),
            budget,
            consumed,
        })
    }

    pub async fn set_quota_allowance(&self, owner: &str, budget: i64) -> Result<()> {
        if budget < 0 {
            return Err(OrchestratorError::validation("budget", "must not be negative"));
        }
        sqlx::query(
            r#"
            INSERT INTO quota_allowances (owner, budget, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(owner) DO UPDATE SET budget = excluded.budget, updated_at = excluded.updated_at
            "#,
        )
        .bind(owner)
        .bind(budget)
        .bind(to_millis(self.now()))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
