use crate::build::{self, BuildParameter, BuildReason, BuildTransition, WorkspaceBuild};
use crate::builder::BuildRequest;
use crate::clock::{Clock, SystemClock};
use crate::db::{begin_immediate, from_millis, to_millis};
use crate::error::{OrchestratorError, Result};
use crate::job::{self, JobStatus, ProvisionerJob};
use crate::pubsub::{workspace_channel, MemoryPubsub, Pubsub, JOB_POSTED_CHANNEL};
use crate::rbac::{Action, AuthObject, Authorizer};
use crate::schedule::{self, WeeklySchedule};
use crate::template;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

pub const MAX_WORKSPACE_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub template_id: String,
    #[schema(value_type = Option<String>)]
    pub autostart_schedule: Option<WeeklySchedule>,
    pub ttl_ms: Option<i64>,
    pub last_used_at: DateTime<Utc>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::milliseconds)
    }
}

/// Status derived from the latest build's transition and job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Canceling,
    Canceled,
    Deleting,
    Deleted,
}

impl WorkspaceStatus {
    pub fn from_build(transition: BuildTransition, job_status: JobStatus) -> Self {
        match (job_status, transition) {
            (JobStatus::Pending, _) => Self::Pending,
            (JobStatus::Running, BuildTransition::Start) => Self::Starting,
            (JobStatus::Running, BuildTransition::Stop) => Self::Stopping,
            (JobStatus::Running, BuildTransition::Delete) => Self::Deleting,
            (JobStatus::Succeeded, BuildTransition::Start) => Self::Running,
            (JobStatus::Succeeded, BuildTransition::Stop) => Self::Stopped,
            (JobStatus::Succeeded, BuildTransition::Delete) => Self::Deleted,
            (JobStatus::Failed, _) => Self::Failed,
            (JobStatus::Canceling, _) => Self::Canceling,
            (JobStatus::Canceled, _) => Self::Canceled,
        }
    }
}

/// A workspace with its derived state, as served to callers and watchers.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkspaceView {
    pub workspace: Workspace,
    pub status: WorkspaceStatus,
    pub latest_build: Option<WorkspaceBuild>,
    pub job_status: Option<JobStatus>,
    /// The latest build does not use the template's active version.
    pub outdated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    #[serde(default)]
    pub owner: String,
    pub template_id: String,
    pub template_version_id: Option<String>,
    pub autostart_schedule: Option<String>,
    pub ttl_ms: Option<i64>,
    #[serde(default)]
    pub parameters: Vec<BuildParameter>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceFilters {
    pub owner: Option<String>,
    pub template_id: Option<String>,
    pub include_deleted: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    name: String,
    owner: String,
    template_id: String,
    autostart_schedule: Option<String>,
    ttl_ms: Option<i64>,
    last_used_at: i64,
    deleted: bool,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<WorkspaceRow> for Workspace {
    type Error = OrchestratorError;

    fn try_from(row: WorkspaceRow) -> Result<Self> {
        let autostart_schedule = row
            .autostart_schedule
            .as_deref()
            .map(str::parse::<WeeklySchedule>)
            .transpose()
            .map_err(|e| {
                OrchestratorError::InvalidState(format!("workspace {} schedule: {e}", row.id))
            })?;

        Ok(Self {
            id: row.id,
            name: row.name,
            owner: row.owner,
            template_id: row.template_id,
            autostart_schedule,
            ttl_ms: row.ttl_ms,
            last_used_at: from_millis(row.last_used_at),
            deleted: row.deleted,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

/// Like [`fetch_workspace`], but a soft-deleted workspace is not found.
async fn fetch_live_workspace(conn: &mut SqliteConnection, id: &str) -> Result<Workspace> {
    let workspace = fetch_workspace(conn, id).await?;
    if workspace.deleted {
        return Err(OrchestratorError::NotFound(format!("workspace {id}")));
    }
    Ok(workspace)
}

pub(crate) async fn fetch_workspace(conn: &mut SqliteConnection, id: &str) -> Result<Workspace> {
    sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("workspace {id}")))?
        .try_into()
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_WORKSPACE_NAME_LEN {
        return Err(OrchestratorError::validation(
            "name",
            format!("must be 1-{MAX_WORKSPACE_NAME_LEN} characters"),
        ));
    }
    let valid = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if !valid {
        return Err(OrchestratorError::validation(
            "name",
            "may only contain letters, digits and inner hyphens",
        ));
    }
    Ok(())
}

fn parse_schedule(raw: Option<&str>) -> Result<Option<WeeklySchedule>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| OrchestratorError::validation("autostart_schedule", e)),
    }
}

/// Entry point for everything that reads or changes workspaces and their
/// builds.
#[derive(Clone)]
pub struct WorkspaceOrchestrator {
    pool: SqlitePool,
    pubsub: Arc<dyn Pubsub>,
    clock: Arc<dyn Clock>,
    default_quota_budget: i64,
}

impl WorkspaceOrchestrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            pubsub: Arc::new(MemoryPubsub::new()),
            clock: Arc::new(SystemClock),
            default_quota_budget: 0,
        }
    }

    pub fn with_pubsub(mut self, pubsub: Arc<dyn Pubsub>) -> Self {
        self.pubsub = pubsub;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Budget for owners without an explicit allowance. 0 disables it.
    pub fn with_default_quota_budget(mut self, budget: i64) -> Self {
        self.default_quota_budget = budget;
        self
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn pubsub(&self) -> &Arc<dyn Pubsub> {
        &self.pubsub
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn default_quota_budget(&self) -> i64 {
        self.default_quota_budget
    }

    /// Best effort: subscribers re-read the store, so a lost message only
    /// delays them.
    pub(crate) fn publish_workspace_update(&self, workspace_id: &str) {
        if let Err(e) = self.pubsub.publish(&workspace_channel(workspace_id), &[]) {
            warn!(workspace_id, error = %e, "failed to publish workspace update");
        }
    }

    pub(crate) fn publish_job_posted(&self) {
        if let Err(e) = self.pubsub.publish(JOB_POSTED_CHANNEL, &[]) {
            warn!(error = %e, "failed to publish job posted");
        }
    }

    /// Create a workspace and queue its first `start` build
    #[instrument(skip(self, req, authorize), fields(name = %req.name, owner = %req.owner))]
    pub async fn create_workspace(
        &self,
        req: CreateWorkspaceRequest,
        initiator: &str,
        authorize: &Authorizer,
    ) -> Result<(Workspace, WorkspaceBuild, ProvisionerJob)> {
        validate_name(&req.name)?;
        if !authorize(Action::Create, &AuthObject::workspace("", &req.owner)) {
            return Err(OrchestratorError::Forbidden(format!(
                "{initiator} may not create workspaces for {}",
                req.owner
            )));
        }

        let schedule = parse_schedule(req.autostart_schedule.as_deref())?;
        let now = self.now();
        let mut tx = begin_immediate(&self.pool).await?;

        let template = match template::fetch_template(&mut tx, &req.template_id).await {
            Ok(t) if !t.deleted => t,
            Ok(_) => {
                return Err(OrchestratorError::validation("template_id", "template has been deleted"))
            }
            Err(OrchestratorError::NotFound(_)) => {
                return Err(OrchestratorError::validation("template_id", "template does not exist"))
            }
            Err(e) => return Err(e),
        };
        if schedule.is_some() && !template.schedule.user_autostart_enabled {
            return Err(OrchestratorError::validation(
                "autostart_schedule",
                "autostart is not allowed for workspaces using this template",
            ));
        }
        if req.ttl_ms.is_some_and(|ms| ms != 0) && !template.schedule.user_autostop_enabled {
            return Err(OrchestratorError::validation(
                "ttl_ms",
                "custom autostop TTL is not allowed for workspaces using this template",
            ));
        }
        let ttl = schedule::validate_workspace_ttl(
            req.ttl_ms,
            template.schedule.default_ttl(),
            template.schedule.max_ttl(),
        )
        .map_err(|e| OrchestratorError::validation("ttl_ms", e))?;

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, owner, template_id, autostart_schedule, ttl_ms, last_used_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&req.name)
        .bind(&req.owner)
        .bind(&template.id)
        .bind(schedule.as_ref().map(|s| s.to_string()))
        .bind(ttl.map(|d| d.num_milliseconds()))
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await
        .map_err(|e| match OrchestratorError::from(e) {
            OrchestratorError::Conflict(_) => OrchestratorError::Conflict(format!(
                "workspace {} already exists for {}",
                req.name, req.owner
            )),
            other => other,
        })?;

        let mut build_req = BuildRequest::new(&id, BuildTransition::Start, initiator)
            .parameters(req.parameters);
        if let Some(version) = req.template_version_id {
            build_req = build_req.template_version(version);
        }
        let (build, job) = self.build_in_tx(&mut tx, build_req, authorize).await?;
        let workspace = fetch_workspace(&mut tx, &id).await?;
        tx.commit().await?;

        info!(workspace_id = %id, build_id = %build.id, "workspace created");
        self.publish_workspace_update(&id);
        self.publish_job_posted();
        Ok((workspace, build, job))
    }

    /// List workspaces with optional filters
    pub async fn list_workspaces(&self, filters: WorkspaceFilters) -> Result<Vec<Workspace>> {
        let mut query = "SELECT * FROM workspaces WHERE 1=1".to_string();

        if filters.owner.is_some() {
            query.push_str(" AND owner = ?");
        }
        if filters.template_id.is_some() {
            query.push_str(" AND template_id = ?");
        }
        if !filters.include_deleted {
            query.push_str(" AND deleted = 0");
        }

        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query_as::<_, WorkspaceRow>(&query);

        if let Some(owner) = &filters.owner {
            q = q.bind(owner);
        }
        if let Some(template_id) = &filters.template_id {
            q = q.bind(template_id);
        }

        let rows = q.fetch_all(&self.pool).await?;

        rows.into_iter().map(Workspace::try_from).collect()
    }

    /// Get a single workspace by ID
    pub async fn get_workspace(&self, id: &str) -> Result<Workspace> {
        let mut conn = self.pool.acquire().await?;
        fetch_workspace(&mut conn, id).await
    }

    /// Workspace plus latest build and derived status, as one consistent read.
    pub async fn get_workspace_view(&self, id: &str) -> Result<WorkspaceView> {
        let mut tx = begin_immediate(&self.pool).await?;
        let workspace = fetch_workspace(&mut tx, id).await?;
        let latest_build = build::latest_build(&mut tx, id).await?;

        let (status, job_status) = match &latest_build {
            Some(build) => {
                let job = job::fetch_job(&mut tx, &build.job_id).await?;
                (
                    WorkspaceStatus::from_build(build.transition, job.status),
                    Some(job.status),
                )
            }
            None => (WorkspaceStatus::Pending, None),
        };
        let template = template::fetch_template(&mut tx, &workspace.template_id).await?;
        tx.commit().await?;

        let outdated = match (&latest_build, &template.active_version_id) {
            (Some(build), Some(active)) => &build.template_version_id != active,
            _ => false,
        };

        Ok(WorkspaceView {
            workspace,
            status,
            latest_build,
            job_status,
            outdated,
        })
    }

    pub async fn list_builds(&self, workspace_id: &str) -> Result<Vec<WorkspaceBuild>> {
        let mut conn = self.pool.acquire().await?;
        fetch_workspace(&mut conn, workspace_id).await?;
        build::list_builds(&mut conn, workspace_id).await
    }

    pub async fn latest_build(&self, workspace_id: &str) -> Result<Option<WorkspaceBuild>> {
        let mut conn = self.pool.acquire().await?;
        build::latest_build(&mut conn, workspace_id).await
    }

    pub async fn get_build(&self, build_id: &str) -> Result<WorkspaceBuild> {
        let mut conn = self.pool.acquire().await?;
        build::fetch_build(&mut conn, build_id).await
    }

    pub async fn build_parameters(&self, build_id: &str) -> Result<Vec<BuildParameter>> {
        let mut conn = self.pool.acquire().await?;
        build::fetch_parameters(&mut conn, build_id).await
    }

    /// Sets the workspace TTL used by future `start` builds. `None` or 0
    /// means manual shutdown unless the template enforces a maximum.
    #[instrument(skip(self))]
    pub async fn update_workspace_ttl(&self, id: &str, ttl_ms: Option<i64>) -> Result<Workspace> {
        let mut tx = begin_immediate(&self.pool).await?;
        let workspace = fetch_live_workspace(&mut tx, id).await?;
        let template = template::fetch_template(&mut tx, &workspace.template_id).await?;

        if !template.schedule.user_autostop_enabled {
            return Err(OrchestratorError::validation(
                "ttl_ms",
                "custom autostop TTL is not allowed for workspaces using this template",
            ));
        }

        // The template default only seeds new workspaces; clearing falls
        // back to the template maximum, if any.
        let ttl = schedule::validate_workspace_ttl(ttl_ms, None, template.schedule.max_ttl())
            .map_err(|e| OrchestratorError::validation("ttl_ms", e))?;

        sqlx::query("UPDATE workspaces SET ttl_ms = ?, updated_at = ? WHERE id = ?")
            .bind(ttl.map(|d| d.num_milliseconds()))
            .bind(to_millis(self.now()))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let workspace = fetch_workspace(&mut tx, id).await?;
        tx.commit().await?;

        self.publish_workspace_update(id);
        Ok(workspace)
    }

    #[instrument(skip(self))]
    pub async fn update_workspace_autostart(
        &self,
        id: &str,
        schedule: Option<&str>,
    ) -> Result<Workspace> {
        let schedule = parse_schedule(schedule)?;

        let mut tx = begin_immediate(&self.pool).await?;
        let workspace = fetch_live_workspace(&mut tx, id).await?;
        let template = template::fetch_template(&mut tx, &workspace.template_id).await?;

        if !template.schedule.user_autostart_enabled {
            return Err(OrchestratorError::validation(
                "autostart_schedule",
                "autostart is not allowed for workspaces using this template",
            ));
        }

        sqlx::query("UPDATE workspaces SET autostart_schedule = ?, updated_at = ? WHERE id = ?")
            .bind(schedule.as_ref().map(|s| s.to_string()))
            .bind(to_millis(self.now()))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let workspace = fetch_workspace(&mut tx, id).await?;
        tx.commit().await?;

        self.publish_workspace_update(id);
        Ok(workspace)
    }

    /// Requests a `delete` build; the workspace row is soft-deleted once that
    /// build's job succeeds.
    pub async fn delete_workspace(
        &self,
        id: &str,
        initiator: &str,
        authorize: &Authorizer,
    ) -> Result<(WorkspaceBuild, ProvisionerJob)> {
        self.request_build(
            BuildRequest::new(id, BuildTransition::Delete, initiator).reason(BuildReason::Initiator),
            authorize,
        )
        .await
    }
}
