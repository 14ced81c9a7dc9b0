use crate::db::{from_millis, to_millis};
use crate::error::{OrchestratorError, Result};
use crate::workspace::WorkspaceOrchestrator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::collections::BTreeSet;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

/// A registered worker process and the capabilities it advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProvisionerDaemon {
    pub id: String,
    pub name: String,
    #[schema(value_type = Vec<String>)]
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl ProvisionerDaemon {
    /// Whether this daemon may run a job requiring `required`.
    pub fn can_run(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.tags)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DaemonRow {
    id: String,
    name: String,
    tags: String,
    created_at: i64,
    last_seen_at: Option<i64>,
}

impl TryFrom<DaemonRow> for ProvisionerDaemon {
    type Error = OrchestratorError;

    fn try_from(row: DaemonRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            name: row.name,
            tags: serde_json::from_str(&row.tags)?,
            created_at: from_millis(row.created_at),
            last_seen_at: row.last_seen_at.map(from_millis),
        })
    }
}

pub(crate) async fn touch(conn: &mut SqliteConnection, id: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE provisioner_daemons SET last_seen_at = ? WHERE id = ?")
        .bind(to_millis(now))
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

impl WorkspaceOrchestrator {
    /// Registers a daemon by name. Reconnecting under the same name keeps the
    /// daemon's id and replaces its tags.
    pub async fn register_daemon(&self, name: &str, tags: BTreeSet<String>) -> Result<ProvisionerDaemon> {
        if name.trim().is_empty() {
            return Err(OrchestratorError::validation("name", "daemon name must not be empty"));
        }
        let now = to_millis(self.now());

        sqlx::query(
            r#"
            INSERT INTO provisioner_daemons (id, name, tags, created_at, last_seen_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET tags = excluded.tags, last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(serde_json::to_string(&tags)?)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        let daemon: ProvisionerDaemon =
            sqlx::query_as::<_, DaemonRow>("SELECT * FROM provisioner_daemons WHERE name = ?")
                .bind(name)
                .fetch_one(self.pool())
                .await?
                .try_into()?;

        info!(daemon_id = %daemon.id, name, tags = ?daemon.tags, "provisioner daemon registered");
        Ok(daemon)
    }

    pub async fn list_daemons(&self) -> Result<Vec<ProvisionerDaemon>> {
        let rows = sqlx::query_as::<_, DaemonRow>("SELECT * FROM provisioner_daemons ORDER BY name")
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(ProvisionerDaemon::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_run_requires_subset() {
        let daemon = ProvisionerDaemon {
            id: "d".into(),
            name: "gpu-1".into(),
            tags: ["gpu".to_string(), "linux".to_string()].into(),
            created_at: Utc::now(),
            last_seen_at: None,
        };
        assert!(daemon.can_run(&BTreeSet::new()));
        assert!(daemon.can_run(&["gpu".to_string()].into()));
        assert!(!daemon.can_run(&["arm64".to_string()].into()));
    }
}
