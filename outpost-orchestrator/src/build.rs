use crate::db::{from_millis, to_millis};
use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::fmt;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BuildTransition {
    Start,
    Stop,
    Delete,
}

impl fmt::Display for BuildTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BuildReason {
    Initiator,
    Autostart,
    Autostop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BuildParameter {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkspaceBuild {
    pub id: String,
    pub workspace_id: String,
    pub template_version_id: String,
    pub build_number: i64,
    pub transition: BuildTransition,
    pub initiator: String,
    pub reason: BuildReason,
    pub job_id: String,
    pub deadline: Option<DateTime<Utc>>,
    pub max_deadline: Option<DateTime<Utc>>,
    pub daily_cost: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub provisioner_state: Vec<u8>,
}

#[derive(Debug, sqlx::FromRow)]
struct BuildRow {
    id: String,
    workspace_id: String,
    template_version_id: String,
    build_number: i64,
    transition: BuildTransition,
    initiator: String,
    reason: BuildReason,
    job_id: String,
    deadline: Option<i64>,
    max_deadline: Option<i64>,
    provisioner_state: Option<Vec<u8>>,
    daily_cost: i64,
    created_at: i64,
    updated_at: i64,
}

impl From<BuildRow> for WorkspaceBuild {
    fn from(row: BuildRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            template_version_id: row.template_version_id,
            build_number: row.build_number,
            transition: row.transition,
            initiator: row.initiator,
            reason: row.reason,
            job_id: row.job_id,
            deadline: row.deadline.map(from_millis),
            max_deadline: row.max_deadline.map(from_millis),
            daily_cost: row.daily_cost,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
            provisioner_state: row.provisioner_state.unwrap_or_default(),
        }
    }
}

pub(crate) async fn insert_build(conn: &mut SqliteConnection, build: &WorkspaceBuild) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO workspace_builds (
            id, workspace_id, template_version_id, build_number, transition, initiator, reason,
            job_id, deadline, max_deadline, provisioner_state, daily_cost, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&build.id)
    .bind(&build.workspace_id)
    .bind(&build.template_version_id)
    .bind(build.build_number)
    .bind(build.transition)
    .bind(&build.initiator)
    .bind(build.reason)
    .bind(&build.job_id)
    .bind(build.deadline.map(to_millis))
    .bind(build.max_deadline.map(to_millis))
    .bind(&build.provisioner_state)
    .bind(build.daily_cost)
    .bind(to_millis(build.created_at))
    .bind(to_millis(build.updated_at))
    .execute(conn)
    .await?;

    Ok(())
}

pub(crate) async fn fetch_build(conn: &mut SqliteConnection, id: &str) -> Result<WorkspaceBuild> {
    let row = sqlx::query_as::<_, BuildRow>("SELECT * FROM workspace_builds WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("build {id}")))?;

    Ok(row.into())
}

/// The build with the highest build number, if the workspace has any.
pub(crate) async fn latest_build(
    conn: &mut SqliteConnection,
    workspace_id: &str,
) -> Result<Option<WorkspaceBuild>> {
    let row = sqlx::query_as::<_, BuildRow>(
        "SELECT * FROM workspace_builds WHERE workspace_id = ? ORDER BY build_number DESC LIMIT 1",
    )
    .bind(workspace_id)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(WorkspaceBuild::from))
}

pub(crate) async fn list_builds(
    conn: &mut SqliteConnection,
    workspace_id: &str,
) -> Result<Vec<WorkspaceBuild>> {
    let rows = sqlx::query_as::<_, BuildRow>(
        "SELECT * FROM workspace_builds WHERE workspace_id = ? ORDER BY build_number DESC",
    )
    .bind(workspace_id)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(WorkspaceBuild::from).collect())
}

pub(crate) async fn insert_parameters(
    conn: &mut SqliteConnection,
    build_id: &str,
    parameters: &[BuildParameter],
) -> Result<()> {
    for param in parameters {
        sqlx::query("INSERT INTO workspace_build_parameters (build_id, name, value) VALUES (?, ?, ?)")
            .bind(build_id)
            .bind(&param.name)
            .bind(&param.value)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub(crate) async fn fetch_parameters(
    conn: &mut SqliteConnection,
    build_id: &str,
) -> Result<Vec<BuildParameter>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT name, value FROM workspace_build_parameters WHERE build_id = ? ORDER BY name",
    )
    .bind(build_id)
    .fetch_all(conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(name, value)| BuildParameter { name, value })
        .collect())
}

pub(crate) async fn update_deadlines(
    conn: &mut SqliteConnection,
    build_id: &str,
    deadline: Option<DateTime<Utc>>,
    max_deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE workspace_builds SET deadline = ?, max_deadline = ?, updated_at = ? WHERE id = ?")
        .bind(deadline.map(to_millis))
        .bind(max_deadline.map(to_millis))
        .bind(to_millis(now))
        .bind(build_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Previous values carried forward, with explicit values winning by name.
pub(crate) fn merge_parameters(
    previous: Vec<BuildParameter>,
    overrides: &[BuildParameter],
) -> Vec<BuildParameter> {
    let mut merged: Vec<BuildParameter> = previous
        .into_iter()
        .filter(|p| !overrides.iter().any(|o| o.name == p.name))
        .collect();
    merged.extend(overrides.iter().cloned());
    merged.sort_by(|a, b| a.name.cmp(&b.name));
    merged.dedup_by(|a, b| a.name == b.name);
    merged
}
