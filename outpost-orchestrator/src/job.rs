use crate::build::{BuildParameter, BuildTransition};
use crate::db::{from_millis, to_millis};
use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::collections::BTreeSet;
use std::fmt;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceling,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    WorkspaceBuild,
    TemplateVersionImport,
}

/// Typed input handed to the worker that acquires a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    WorkspaceBuild(WorkspaceBuildPayload),
    TemplateVersionImport(TemplateImportPayload),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::WorkspaceBuild(_) => JobType::WorkspaceBuild,
            Self::TemplateVersionImport(_) => JobType::TemplateVersionImport,
        }
    }

    pub fn workspace_id(&self) -> Option<&str> {
        match self {
            Self::WorkspaceBuild(p) => Some(&p.workspace_id),
            Self::TemplateVersionImport(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceBuildPayload {
    pub build_id: String,
    pub workspace_id: String,
    pub workspace_name: String,
    pub owner: String,
    pub template_version_id: String,
    pub transition: BuildTransition,
    pub parameters: Vec<BuildParameter>,
    /// Provisioner state left behind by the previous build.
    #[serde(with = "base64_bytes", default)]
    pub state: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateImportPayload {
    pub template_id: String,
    pub template_version_id: String,
}

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod base64_bytes_opt {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerJob {
    pub id: String,
    pub job_type: JobType,
    pub payload: JobPayload,
    /// Capabilities a daemon must advertise to run this job.
    pub tags: BTreeSet<String>,
    pub status: JobStatus,
    pub worker_id: Option<String>,
    pub initiator: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub last_update_seq: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct LogEntry {
    pub created_at: DateTime<Utc>,
    pub level: LogLevel,
    pub stage: String,
    pub output: String,
}

impl LogEntry {
    pub fn new(
        created_at: DateTime<Utc>,
        level: LogLevel,
        stage: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            created_at,
            level,
            stage: stage.into(),
            output: output.into(),
        }
    }
}

/// A stored log line; `id` orders lines within a job.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobLog {
    pub id: i64,
    pub job_id: String,
    #[serde(flatten)]
    pub entry: LogEntry,
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    job_type: JobType,
    input: String,
    tags: String,
    status: JobStatus,
    worker_id: Option<String>,
    initiator: String,
    created_at: i64,
    updated_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    canceled_at: Option<i64>,
    error: Option<String>,
    last_update_seq: i64,
}

impl TryFrom<JobRow> for ProvisionerJob {
    type Error = OrchestratorError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            job_type: row.job_type,
            payload: serde_json::from_str(&row.input)?,
            tags: serde_json::from_str(&row.tags)?,
            status: row.status,
            worker_id: row.worker_id,
            initiator: row.initiator,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
            started_at: row.started_at.map(from_millis),
            completed_at: row.completed_at.map(from_millis),
            canceled_at: row.canceled_at.map(from_millis),
            error: row.error,
            last_update_seq: row.last_update_seq,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobLogRow {
    id: i64,
    job_id: String,
    created_at: i64,
    level: LogLevel,
    stage: String,
    output: String,
}

impl From<JobLogRow> for JobLog {
    fn from(row: JobLogRow) -> Self {
        Self {
            id: row.id,
            job_id: row.job_id,
            entry: LogEntry {
                created_at: from_millis(row.created_at),
                level: row.level,
                stage: row.stage,
                output: row.output,
            },
        }
    }
}

/// A fresh `pending` job.
pub(crate) fn new_job(
    payload: JobPayload,
    tags: BTreeSet<String>,
    initiator: &str,
    now: DateTime<Utc>,
) -> ProvisionerJob {
    ProvisionerJob {
        id: uuid::Uuid::new_v4().to_string(),
        job_type: payload.job_type(),
        payload,
        tags,
        status: JobStatus::Pending,
        worker_id: None,
        initiator: initiator.to_string(),
        created_at: now,
        updated_at: now,
        started_at: None,
        completed_at: None,
        canceled_at: None,
        error: None,
        last_update_seq: 0,
    }
}

pub(crate) async fn insert_job(conn: &mut SqliteConnection, job: &ProvisionerJob) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO provisioner_jobs (id, job_type, input, tags, status, initiator, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&job.id)
    .bind(job.job_type)
    .bind(serde_json::to_string(&job.payload)?)
    .bind(serde_json::to_string(&job.tags)?)
    .bind(job.status)
    .bind(&job.initiator)
    .bind(to_millis(job.created_at))
    .bind(to_millis(job.updated_at))
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) async fn fetch_job(conn: &mut SqliteConnection, id: &str) -> Result<ProvisionerJob> {
    sqlx::query_as::<_, JobRow>("SELECT * FROM provisioner_jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("job {id}")))?
        .try_into()
}

/// Latest state token a worker reported for the job.
pub(crate) async fn fetch_job_state(conn: &mut SqliteConnection, id: &str) -> Result<Option<Vec<u8>>> {
    let state: Option<Option<Vec<u8>>> =
        sqlx::query_scalar("SELECT state FROM provisioner_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(conn)
            .await?;
    Ok(state.flatten())
}

/// Oldest pending jobs whose required tags are all in `tags`.
pub(crate) async fn pending_jobs_matching(
    conn: &mut SqliteConnection,
    tags: &BTreeSet<String>,
    limit: i64,
) -> Result<Vec<ProvisionerJob>> {
    let rows = sqlx::query_as::<_, JobRow>(
        r#"
        SELECT * FROM provisioner_jobs
        WHERE status = 'pending'
          AND NOT EXISTS (
              SELECT 1 FROM json_each(provisioner_jobs.tags) AS required
              WHERE required.value NOT IN (SELECT value FROM json_each(?))
          )
        ORDER BY created_at ASC, id ASC
        LIMIT ?
        "#,
    )
    .bind(serde_json::to_string(tags)?)
    .bind(limit)
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(ProvisionerJob::try_from).collect()
}

/// `pending -> running`, only if nobody else got there first.
pub(crate) async fn try_claim(
    conn: &mut SqliteConnection,
    id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE provisioner_jobs
        SET status = 'running', worker_id = ?, started_at = ?, updated_at = ?
        WHERE id = ? AND status = 'pending'
        "#,
    )
    .bind(worker_id)
    .bind(to_millis(now))
    .bind(to_millis(now))
    .bind(id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Moves a job out of `from`; `false` when another writer moved it first.
pub(crate) async fn transition(
    conn: &mut SqliteConnection,
    id: &str,
    from: JobStatus,
    to: JobStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let completed_at = to.is_terminal().then(|| to_millis(now));
    let canceled_at = (to == JobStatus::Canceling).then(|| to_millis(now));

    let result = sqlx::query(
        r#"
        UPDATE provisioner_jobs
        SET status = ?,
            updated_at = ?,
            completed_at = COALESCE(?, completed_at),
            canceled_at = COALESCE(?, canceled_at),
            error = COALESCE(?, error)
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(to)
    .bind(to_millis(now))
    .bind(completed_at)
    .bind(canceled_at)
    .bind(error)
    .bind(id)
    .bind(from)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub(crate) async fn insert_logs(
    conn: &mut SqliteConnection,
    job_id: &str,
    logs: &[LogEntry],
) -> Result<()> {
    for log in logs {
        sqlx::query(
            "INSERT INTO provisioner_job_logs (job_id, created_at, level, stage, output) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(to_millis(log.created_at))
        .bind(log.level)
        .bind(&log.stage)
        .bind(&log.output)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub(crate) async fn fetch_logs(
    conn: &mut SqliteConnection,
    job_id: &str,
    after: i64,
) -> Result<Vec<JobLog>> {
    let rows = sqlx::query_as::<_, JobLogRow>(
        "SELECT * FROM provisioner_job_logs WHERE job_id = ? AND id > ? ORDER BY id ASC",
    )
    .bind(job_id)
    .bind(after)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(JobLog::from).collect())
}

/// Running jobs whose last heartbeat is at or before `cutoff`.
pub(crate) async fn hung_jobs(conn: &mut SqliteConnection, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT id FROM provisioner_jobs WHERE status = 'running' AND updated_at <= ? ORDER BY updated_at",
    )
    .bind(to_millis(cutoff))
    .fetch_all(conn)
    .await?;
    Ok(ids)
}

/// Canceling jobs whose cancellation was requested at or before `cutoff`.
pub(crate) async fn stale_canceling_jobs(
    conn: &mut SqliteConnection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT id FROM provisioner_jobs WHERE status = 'canceling' AND canceled_at <= ? ORDER BY canceled_at",
    )
    .bind(to_millis(cutoff))
    .fetch_all(conn)
    .await?;
    Ok(ids)
}
