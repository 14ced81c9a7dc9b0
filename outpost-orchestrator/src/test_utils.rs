//! Fixtures shared with downstream crates' tests.

use crate::provisionerd::proto::CompletedJob;
use crate::rbac::allow_all;
use crate::schedule::TemplateScheduleOptions;
use crate::template::{CreateTemplateRequest, CreateTemplateVersionRequest, Template, TemplateVersion};
use crate::workspace::{CreateWorkspaceRequest, Workspace, WorkspaceOrchestrator};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// Name of the daemon fixtures use to complete jobs.
pub const FIXTURE_DAEMON: &str = "fixture-provisioner";

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // Every connection to `sqlite::memory:` is its own database, so keep
    // exactly one alive for the lifetime of the pool.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Acquires and succeeds every pending job a tagless daemon can run.
pub async fn complete_pending_jobs(orchestrator: &WorkspaceOrchestrator) -> usize {
    let daemon = orchestrator
        .register_daemon(FIXTURE_DAEMON, Default::default())
        .await
        .expect("Failed to register fixture daemon");

    let mut completed = 0;
    while let Some(job) = orchestrator
        .acquire_job(&daemon)
        .await
        .expect("Failed to acquire job")
    {
        orchestrator
            .complete_job(
                &daemon.id,
                CompletedJob {
                    job_id: job.job_id,
                    resources: Vec::new(),
                    state: Vec::new(),
                    metadata: serde_json::Value::Null,
                },
            )
            .await
            .expect("Failed to complete job");
        completed += 1;
    }
    completed
}

/// Fixture: a template with one imported, active version
pub async fn fixture_template(
    orchestrator: &WorkspaceOrchestrator,
    name: &str,
    schedule: TemplateScheduleOptions,
) -> (Template, TemplateVersion) {
    let template = orchestrator
        .create_template(CreateTemplateRequest {
            name: name.to_string(),
            schedule,
        })
        .await
        .expect("Failed to create fixture template");

    let (version, _job) = orchestrator
        .create_template_version(
            &template.id,
            CreateTemplateVersionRequest {
                name: "v1".to_string(),
                tags: Default::default(),
            },
            "admin",
        )
        .await
        .expect("Failed to create fixture template version");
    complete_pending_jobs(orchestrator).await;

    let template = orchestrator
        .get_template(&template.id)
        .await
        .expect("Failed to reload fixture template");
    (template, version)
}

/// Fixture: a running workspace whose first `start` build succeeded
pub async fn fixture_workspace(
    orchestrator: &WorkspaceOrchestrator,
    template_id: &str,
    name: &str,
    owner: &str,
) -> Workspace {
    let (workspace, _build, _job) = orchestrator
        .create_workspace(
            CreateWorkspaceRequest {
                name: name.to_string(),
                owner: owner.to_string(),
                template_id: template_id.to_string(),
                template_version_id: None,
                autostart_schedule: None,
                ttl_ms: None,
                parameters: Vec::new(),
            },
            owner,
            &allow_all,
        )
        .await
        .expect("Failed to create fixture workspace");
    complete_pending_jobs(orchestrator).await;
    workspace
}
