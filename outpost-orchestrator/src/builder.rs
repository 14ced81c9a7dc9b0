//! Turning a requested transition into a build and its job.

use crate::build::{self, BuildParameter, BuildReason, BuildTransition, WorkspaceBuild};
use crate::db::begin_immediate;
use crate::error::{OrchestratorError, Result};
use crate::job::{self, JobPayload, ProvisionerJob, WorkspaceBuildPayload};
use crate::rbac::{Action, AuthObject, Authorizer};
use crate::schedule::{self, AutostopTimes};
use crate::template;
use crate::workspace::{fetch_workspace, WorkspaceOrchestrator};
use sqlx::SqliteConnection;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub workspace_id: String,
    pub transition: BuildTransition,
    pub initiator: String,
    pub reason: BuildReason,
    pub options: BuildOptions,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Build this version instead of the one the transition would pick.
    pub template_version_id: Option<String>,
    /// Values that override the previous build's parameters by name.
    pub parameters: Vec<BuildParameter>,
    /// New workspace TTL, applied only to `start` builds.
    pub ttl_ms: Option<i64>,
}

impl BuildRequest {
    pub fn new(
        workspace_id: impl Into<String>,
        transition: BuildTransition,
        initiator: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            transition,
            initiator: initiator.into(),
            reason: BuildReason::Initiator,
            options: BuildOptions::default(),
        }
    }

    pub fn reason(mut self, reason: BuildReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn template_version(mut self, version_id: impl Into<String>) -> Self {
        self.options.template_version_id = Some(version_id.into());
        self
    }

    pub fn parameters(mut self, parameters: Vec<BuildParameter>) -> Self {
        self.options.parameters = parameters;
        self
    }

    pub fn ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.options.ttl_ms = Some(ttl_ms);
        self
    }
}

impl WorkspaceOrchestrator {
    /// Validates, authorizes and inserts a build plus its `pending` job in a
    /// single transaction, then notifies watchers and idle workers.
    #[instrument(skip(self, req, authorize), fields(workspace_id = %req.workspace_id, transition = %req.transition))]
    pub async fn request_build(
        &self,
        req: BuildRequest,
        authorize: &Authorizer,
    ) -> Result<(WorkspaceBuild, ProvisionerJob)> {
        let mut tx = begin_immediate(self.pool()).await?;
        let (build, job) = self.build_in_tx(&mut tx, req, authorize).await?;
        tx.commit().await?;

        info!(
            build_id = %build.id,
            build_number = build.build_number,
            job_id = %job.id,
            reason = ?build.reason,
            "build queued"
        );
        self.publish_workspace_update(&build.workspace_id);
        self.publish_job_posted();
        Ok((build, job))
    }

    pub(crate) async fn build_in_tx(
        &self,
        conn: &mut SqliteConnection,
        req: BuildRequest,
        authorize: &Authorizer,
    ) -> Result<(WorkspaceBuild, ProvisionerJob)> {
        let now = self.now();
        let workspace = fetch_workspace(conn, &req.workspace_id).await?;
        if workspace.deleted {
            return Err(OrchestratorError::NotFound(format!("workspace {}", workspace.id)));
        }

        // 1. one active build at a time
        let previous = build::latest_build(conn, &workspace.id).await?;
        if let Some(prev) = &previous {
            let prev_job = job::fetch_job(conn, &prev.job_id).await?;
            if !prev_job.status.is_terminal() {
                return Err(OrchestratorError::Conflict(format!(
                    "workspace {} already has an active build (#{} is {})",
                    workspace.name, prev.build_number, prev_job.status
                )));
            }
        }

        // 2. template version
        let template = template::fetch_template(conn, &workspace.template_id).await?;
        if template.deleted {
            return Err(OrchestratorError::validation("template_id", "template has been deleted"));
        }
        let pinned = req.options.template_version_id.clone();
        let version_id = match (&pinned, req.transition, &previous) {
            (Some(id), _, _) => Some(id.clone()),
            (None, BuildTransition::Start, _) => template.active_version_id.clone(),
            (None, _, Some(prev)) => Some(prev.template_version_id.clone()),
            (None, _, None) => template.active_version_id.clone(),
        };
        let version_id = version_id.ok_or_else(|| {
            OrchestratorError::validation("template_version_id", "template has no active version")
        })?;
        let version = match template::fetch_version(conn, &version_id).await {
            Ok(v) => v,
            Err(OrchestratorError::NotFound(_)) => {
                return Err(OrchestratorError::validation(
                    "template_version_id",
                    format!("version {version_id} does not exist"),
                ))
            }
            Err(e) => return Err(e),
        };
        template::ensure_buildable(
            conn,
            &template.id,
            &version,
            req.transition != BuildTransition::Start,
        )
        .await?;

        // 3. schedule options and TTL override
        let options = &template.schedule;
        let mut ttl = workspace.ttl();
        let ttl_override = match (req.transition, req.options.ttl_ms) {
            (BuildTransition::Start, Some(ms)) => {
                if !options.user_autostop_enabled {
                    return Err(OrchestratorError::validation(
                        "ttl_ms",
                        "custom autostop TTL is not allowed for workspaces using this template",
                    ));
                }
                ttl = schedule::validate_workspace_ttl(Some(ms), None, options.max_ttl())
                    .map_err(|e| OrchestratorError::validation("ttl_ms", e))?;
                true
            }
            _ => false,
        };

        // 4. provisional deadlines; recomputed when the job completes
        let times = match req.transition {
            BuildTransition::Start => schedule::calculate_autostop(now, ttl, options)
                .map_err(|e| OrchestratorError::validation("ttl_ms", e))?,
            _ => AutostopTimes::default(),
        };

        // 5. authorization
        let action = match req.transition {
            BuildTransition::Delete => Action::Delete,
            _ => Action::Update,
        };
        if !authorize(action, &AuthObject::workspace(&workspace.id, &workspace.owner)) {
            return Err(OrchestratorError::Forbidden(format!(
                "{} may not {} workspace {}",
                req.initiator, req.transition, workspace.name
            )));
        }
        let off_active = template.active_version_id.as_deref() != Some(version.id.as_str());
        if pinned.is_some() && off_active && !authorize(Action::Update, &AuthObject::template(&template.id)) {
            return Err(OrchestratorError::Forbidden(format!(
                "{} may not build non-active version {}",
                req.initiator, version.id
            )));
        }

        // 6. persist
        if ttl_override {
            sqlx::query("UPDATE workspaces SET ttl_ms = ?, updated_at = ? WHERE id = ?")
                .bind(ttl.map(|d| d.num_milliseconds()))
                .bind(now.timestamp_millis())
                .bind(&workspace.id)
                .execute(&mut *conn)
                .await?;
        }

        let previous_params = match &previous {
            Some(prev) => build::fetch_parameters(conn, &prev.id).await?,
            None => Vec::new(),
        };
        let parameters = build::merge_parameters(previous_params, &req.options.parameters);
        let state = previous
            .as_ref()
            .map(|prev| prev.provisioner_state.clone())
            .unwrap_or_default();

        let build_id = Uuid::new_v4().to_string();
        let payload = JobPayload::WorkspaceBuild(WorkspaceBuildPayload {
            build_id: build_id.clone(),
            workspace_id: workspace.id.clone(),
            workspace_name: workspace.name.clone(),
            owner: workspace.owner.clone(),
            template_version_id: version.id.clone(),
            transition: req.transition,
            parameters: parameters.clone(),
            state: state.clone(),
        });
        let job = job::new_job(payload, version.tags.clone(), &req.initiator, now);
        job::insert_job(conn, &job).await?;

        let build = WorkspaceBuild {
            id: build_id,
            workspace_id: workspace.id.clone(),
            template_version_id: version.id.clone(),
            build_number: previous.as_ref().map_or(1, |prev| prev.build_number + 1),
            transition: req.transition,
            initiator: req.initiator.clone(),
            reason: req.reason,
            job_id: job.id.clone(),
            deadline: times.deadline,
            max_deadline: times.max_deadline,
            daily_cost: 0,
            created_at: now,
            updated_at: now,
            provisioner_state: state,
        };
        build::insert_build(conn, &build).await.map_err(|e| match e {
            OrchestratorError::Conflict(_) => OrchestratorError::Conflict(format!(
                "workspace {} build #{} was created concurrently",
                workspace.name, build.build_number
            )),
            other => other,
        })?;
        build::insert_parameters(conn, &build.id, &parameters).await?;

        Ok((build, job))
    }
}
