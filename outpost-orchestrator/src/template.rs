use crate::db::{begin_immediate, from_millis, to_millis};
use crate::error::{OrchestratorError, Result};
use crate::job::{self, JobPayload, JobStatus, ProvisionerJob, TemplateImportPayload};
use crate::schedule::{AutostopRequirement, TemplateScheduleOptions, WeeklySchedule, TTL_MAX};
use crate::workspace::WorkspaceOrchestrator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::collections::BTreeSet;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub active_version_id: Option<String>,
    pub deleted: bool,
    pub schedule: TemplateScheduleOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TemplateVersion {
    pub id: String,
    pub template_id: String,
    pub name: String,
    pub archived: bool,
    #[schema(value_type = Vec<String>)]
    pub tags: BTreeSet<String>,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateTemplateRequest {
    pub name: String,
    #[serde(default)]
    pub schedule: TemplateScheduleOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateTemplateVersionRequest {
    pub name: String,
    /// Capabilities a provisioner daemon needs to build this version.
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    pub tags: BTreeSet<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct TemplateRow {
    id: String,
    name: String,
    active_version_id: Option<String>,
    deleted: bool,
    user_autostart_enabled: bool,
    user_autostop_enabled: bool,
    default_ttl_ms: i64,
    max_ttl_ms: i64,
    autostop_days_of_week: i64,
    autostop_weeks: i64,
    quiet_hours_schedule: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<TemplateRow> for Template {
    type Error = OrchestratorError;

    fn try_from(row: TemplateRow) -> Result<Self> {
        let quiet_hours = row
            .quiet_hours_schedule
            .as_deref()
            .map(str::parse::<WeeklySchedule>)
            .transpose()
            .map_err(|e| {
                OrchestratorError::InvalidState(format!("template {} quiet hours: {e}", row.id))
            })?;

        Ok(Self {
            id: row.id,
            name: row.name,
            active_version_id: row.active_version_id,
            deleted: row.deleted,
            schedule: TemplateScheduleOptions {
                user_autostart_enabled: row.user_autostart_enabled,
                user_autostop_enabled: row.user_autostop_enabled,
                default_ttl_ms: row.default_ttl_ms,
                max_ttl_ms: row.max_ttl_ms,
                autostop_requirement: AutostopRequirement {
                    days_of_week: u8::try_from(row.autostop_days_of_week).unwrap_or(0),
                    weeks: row.autostop_weeks,
                    quiet_hours,
                },
            },
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct VersionRow {
    id: String,
    template_id: String,
    name: String,
    archived: bool,
    tags: String,
    job_id: String,
    created_at: i64,
}

impl TryFrom<VersionRow> for TemplateVersion {
    type Error = OrchestratorError;

    fn try_from(row: VersionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            template_id: row.template_id,
            name: row.name,
            archived: row.archived,
            tags: serde_json::from_str(&row.tags)?,
            job_id: row.job_id,
            created_at: from_millis(row.created_at),
        })
    }
}

fn validate_schedule_options(options: &TemplateScheduleOptions) -> Result<()> {
    if options.default_ttl_ms < 0 {
        return Err(OrchestratorError::validation("default_ttl_ms", "must not be negative"));
    }
    if options.max_ttl_ms < 0 {
        return Err(OrchestratorError::validation("max_ttl_ms", "must not be negative"));
    }
    let ceiling = TTL_MAX.num_milliseconds();
    if options.default_ttl_ms > ceiling {
        return Err(OrchestratorError::validation("default_ttl_ms", "must not exceed 7 days"));
    }
    if options.max_ttl_ms > ceiling {
        return Err(OrchestratorError::validation("max_ttl_ms", "must not exceed 7 days"));
    }
    if options.max_ttl_ms > 0 && options.default_ttl_ms > options.max_ttl_ms {
        return Err(OrchestratorError::validation(
            "default_ttl_ms",
            "must be less than or equal to max_ttl_ms",
        ));
    }
    options
        .autostop_requirement
        .validate()
        .map_err(|detail| OrchestratorError::validation("autostop_requirement", detail))
}

pub(crate) async fn fetch_template(conn: &mut SqliteConnection, id: &str) -> Result<Template> {
    sqlx::query_as::<_, TemplateRow>("SELECT * FROM templates WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("template {id}")))?
        .try_into()
}

pub(crate) async fn fetch_version(conn: &mut SqliteConnection, id: &str) -> Result<TemplateVersion> {
    sqlx::query_as::<_, VersionRow>("SELECT * FROM template_versions WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("template version {id}")))?
        .try_into()
}

impl WorkspaceOrchestrator {
    pub async fn create_template(&self, req: CreateTemplateRequest) -> Result<Template> {
        if req.name.trim().is_empty() {
            return Err(OrchestratorError::validation("name", "must not be empty"));
        }
        validate_schedule_options(&req.schedule)?;

        let id = Uuid::new_v4().to_string();
        let now = to_millis(self.now());
        let opts = &req.schedule;

        sqlx::query(
            r#"
            INSERT INTO templates (
                id, name, user_autostart_enabled, user_autostop_enabled, default_ttl_ms, max_ttl_ms,
                autostop_days_of_week, autostop_weeks, quiet_hours_schedule, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&req.name)
        .bind(opts.user_autostart_enabled)
        .bind(opts.user_autostop_enabled)
        .bind(opts.default_ttl_ms)
        .bind(opts.max_ttl_ms)
        .bind(i64::from(opts.autostop_requirement.days_of_week))
        .bind(opts.autostop_requirement.weeks)
        .bind(opts.autostop_requirement.quiet_hours.as_ref().map(|s| s.to_string()))
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        info!(template_id = %id, name = %req.name, "template created");
        self.get_template(&id).await
    }

    pub async fn get_template(&self, id: &str) -> Result<Template> {
        let mut conn = self.pool().acquire().await?;
        fetch_template(&mut conn, id).await
    }

    pub async fn update_template_schedule(
        &self,
        id: &str,
        options: TemplateScheduleOptions,
    ) -> Result<Template> {
        validate_schedule_options(&options)?;

        let result = sqlx::query(
            r#"
            UPDATE templates
            SET user_autostart_enabled = ?, user_autostop_enabled = ?, default_ttl_ms = ?, max_ttl_ms = ?,
                autostop_days_of_week = ?, autostop_weeks = ?, quiet_hours_schedule = ?, updated_at = ?
            WHERE id = ? AND deleted = 0
            "#,
        )
        .bind(options.user_autostart_enabled)
        .bind(options.user_autostop_enabled)
        .bind(options.default_ttl_ms)
        .bind(options.max_ttl_ms)
        .bind(i64::from(options.autostop_requirement.days_of_week))
        .bind(options.autostop_requirement.weeks)
        .bind(options.autostop_requirement.quiet_hours.as_ref().map(|s| s.to_string()))
        .bind(to_millis(self.now()))
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("template {id}")));
        }
        self.get_template(id).await
    }

    /// Soft-deletes a template. Refused while any live workspace still uses
    /// it.
    pub async fn delete_template(&self, id: &str) -> Result<()> {
        let mut tx = begin_immediate(self.pool()).await?;
        let (in_use,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM workspaces WHERE template_id = ? AND deleted = 0")
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
        if in_use > 0 {
            return Err(OrchestratorError::Conflict(format!(
                "template {id} is used by {in_use} workspace(s)"
            )));
        }

        let result = sqlx::query("UPDATE templates SET deleted = 1, updated_at = ? WHERE id = ? AND deleted = 0")
            .bind(to_millis(self.now()))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("template {id}")));
        }
        tx.commit().await?;

        info!(template_id = %id, "template deleted");
        Ok(())
    }

    /// Creates a version along with the `pending` import job that validates
    /// it. The version becomes buildable once that job succeeds.
    pub async fn create_template_version(
        &self,
        template_id: &str,
        req: CreateTemplateVersionRequest,
        initiator: &str,
    ) -> Result<(TemplateVersion, ProvisionerJob)> {
        let now = self.now();
        let mut tx = begin_immediate(self.pool()).await?;

        let template = fetch_template(&mut tx, template_id).await?;
        if template.deleted {
            return Err(OrchestratorError::validation("template_id", "template has been deleted"));
        }

        let version_id = Uuid::new_v4().to_string();
        let payload = JobPayload::TemplateVersionImport(TemplateImportPayload {
            template_id: template.id.clone(),
            template_version_id: version_id.clone(),
        });
        let job = job::new_job(payload, req.tags.clone(), initiator, now);
        job::insert_job(&mut tx, &job).await?;

        sqlx::query(
            "INSERT INTO template_versions (id, template_id, name, tags, job_id, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&version_id)
        .bind(&template.id)
        .bind(&req.name)
        .bind(serde_json::to_string(&req.tags)?)
        .bind(&job.id)
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await?;

        let version = fetch_version(&mut tx, &version_id).await?;
        tx.commit().await?;

        info!(template_id, version_id = %version.id, job_id = %job.id, "template version import queued");
        self.publish_job_posted();
        Ok((version, job))
    }

    pub async fn get_template_version(&self, id: &str) -> Result<TemplateVersion> {
        let mut conn = self.pool().acquire().await?;
        fetch_version(&mut conn, id).await
    }

    /// Makes `version_id` the version new `start` builds use.
    pub async fn promote_template_version(&self, template_id: &str, version_id: &str) -> Result<Template> {
        let mut tx = begin_immediate(self.pool()).await?;
        let version = fetch_version(&mut tx, version_id).await?;
        ensure_buildable(&mut tx, template_id, &version, false).await?;

        sqlx::query("UPDATE templates SET active_version_id = ?, updated_at = ? WHERE id = ?")
            .bind(version_id)
            .bind(to_millis(self.now()))
            .bind(template_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.get_template(template_id).await
    }

    pub async fn archive_template_version(&self, version_id: &str) -> Result<()> {
        let mut tx = begin_immediate(self.pool()).await?;
        let version = fetch_version(&mut tx, version_id).await?;
        let template = fetch_template(&mut tx, &version.template_id).await?;
        if template.active_version_id.as_deref() == Some(version_id) {
            return Err(OrchestratorError::Conflict(
                "the active template version cannot be archived".to_string(),
            ));
        }

        sqlx::query("UPDATE template_versions SET archived = 1 WHERE id = ?")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Rejects versions that belong to another template or have not finished
/// importing. Archived versions are rejected unless `allow_archived`, which
/// lets workspaces on an archived version still stop and delete.
pub(crate) async fn ensure_buildable(
    conn: &mut SqliteConnection,
    template_id: &str,
    version: &TemplateVersion,
    allow_archived: bool,
) -> Result<()> {
    if version.template_id != template_id {
        return Err(OrchestratorError::validation(
            "template_version_id",
            format!("version {} does not belong to template {template_id}", version.id),
        ));
    }
    if version.archived && !allow_archived {
        return Err(OrchestratorError::validation(
            "template_version_id",
            format!("version {} is archived", version.id),
        ));
    }

    let import = job::fetch_job(conn, &version.job_id).await?;
    if import.status != JobStatus::Succeeded {
        return Err(OrchestratorError::validation(
            "template_version_id",
            format!("version {} import is {}", version.id, import.status),
        ));
    }
    Ok(())
}
