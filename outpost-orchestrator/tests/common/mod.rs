//! Shared fixtures for the orchestrator integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use outpost_orchestrator::db;
use outpost_orchestrator::provisionerd::proto::{CompletedJob, Resource};
use outpost_orchestrator::schedule::TemplateScheduleOptions;
use outpost_orchestrator::{
    allow_all, CreateTemplateRequest, CreateTemplateVersionRequest, CreateWorkspaceRequest,
    FakeClock, ProvisionerDaemon, Template, TemplateVersion, Workspace, WorkspaceBuild,
    WorkspaceOrchestrator,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

/// Helper to create an in-memory test database with migrations
pub async fn create_test_db() -> SqlitePool {
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

pub fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("Failed to parse timestamp")
        .with_timezone(&Utc)
}

/// Orchestrator on a file-backed database with a multi-connection pool, the
/// way the service runs. Keep the directory alive for the test's duration.
pub async fn file_orchestrator_at(start: &str) -> (WorkspaceOrchestrator, FakeClock, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let pool = db::create_pool(&dir.path().join("outpost.db"))
        .await
        .expect("Failed to open database");
    db::run_migrations(&pool).await.expect("Failed to run migrations");

    let clock = FakeClock::new(at(start));
    let orchestrator = WorkspaceOrchestrator::new(pool).with_clock(Arc::new(clock.clone()));
    (orchestrator, clock, dir)
}

/// Orchestrator on a fresh database whose clock starts at `start`
pub async fn orchestrator_at(start: &str) -> (WorkspaceOrchestrator, FakeClock) {
    let clock = FakeClock::new(at(start));
    let orchestrator =
        WorkspaceOrchestrator::new(create_test_db().await).with_clock(Arc::new(clock.clone()));
    (orchestrator, clock)
}

pub fn tags(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub async fn register(orchestrator: &WorkspaceOrchestrator, name: &str, with_tags: &[&str]) -> ProvisionerDaemon {
    orchestrator
        .register_daemon(name, tags(with_tags))
        .await
        .expect("Failed to register daemon")
}

pub fn completed(job_id: &str, resources: Vec<Resource>) -> CompletedJob {
    CompletedJob {
        job_id: job_id.to_string(),
        resources,
        state: b"state".to_vec(),
        metadata: serde_json::Value::Null,
    }
}

pub fn resource(name: &str, daily_cost: i64) -> Resource {
    Resource {
        name: name.to_string(),
        resource_type: "instance".to_string(),
        daily_cost,
        metadata: serde_json::Value::Null,
    }
}

/// Acquires and succeeds every pending job a daemon with `with_tags` can run
pub async fn drain_queue(orchestrator: &WorkspaceOrchestrator, with_tags: &[&str]) -> usize {
    let name = format!("drain-{}", with_tags.join("-"));
    let daemon = register(orchestrator, &name, with_tags).await;

    let mut count = 0;
    while let Some(job) = orchestrator
        .acquire_job(&daemon)
        .await
        .expect("Failed to acquire job")
    {
        orchestrator
            .complete_job(&daemon.id, completed(&job.job_id, Vec::new()))
            .await
            .expect("Failed to complete job");
        count += 1;
    }
    count
}

pub async fn fixture_template(
    orchestrator: &WorkspaceOrchestrator,
    name: &str,
    schedule: TemplateScheduleOptions,
) -> (Template, TemplateVersion) {
    fixture_template_with_tags(orchestrator, name, schedule, &[]).await
}

/// Fixture: template whose first version's import has succeeded
pub async fn fixture_template_with_tags(
    orchestrator: &WorkspaceOrchestrator,
    name: &str,
    schedule: TemplateScheduleOptions,
    version_tags: &[&str],
) -> (Template, TemplateVersion) {
    let template = orchestrator
        .create_template(CreateTemplateRequest {
            name: name.to_string(),
            schedule,
        })
        .await
        .expect("Failed to create template");
    let version = fixture_version(orchestrator, &template.id, "v1", version_tags).await;
    let template = orchestrator
        .get_template(&template.id)
        .await
        .expect("Failed to reload template");
    (template, version)
}

/// Fixture: an additional imported version of `template_id`
pub async fn fixture_version(
    orchestrator: &WorkspaceOrchestrator,
    template_id: &str,
    name: &str,
    version_tags: &[&str],
) -> TemplateVersion {
    let (version, _job) = orchestrator
        .create_template_version(
            template_id,
            CreateTemplateVersionRequest {
                name: name.to_string(),
                tags: tags(version_tags),
            },
            "admin",
        )
        .await
        .expect("Failed to create template version");
    drain_queue(orchestrator, version_tags).await;
    orchestrator
        .get_template_version(&version.id)
        .await
        .expect("Failed to reload template version")
}

pub fn workspace_request(name: &str, owner: &str, template_id: &str) -> CreateWorkspaceRequest {
    CreateWorkspaceRequest {
        name: name.to_string(),
        owner: owner.to_string(),
        template_id: template_id.to_string(),
        template_version_id: None,
        autostart_schedule: None,
        ttl_ms: None,
        parameters: Vec::new(),
    }
}

/// Fixture: workspace with a queued (not yet acquired) first build
pub async fn fixture_pending_workspace(
    orchestrator: &WorkspaceOrchestrator,
    req: CreateWorkspaceRequest,
) -> (Workspace, WorkspaceBuild) {
    let owner = req.owner.clone();
    let (workspace, build, _job) = orchestrator
        .create_workspace(req, &owner, &allow_all)
        .await
        .expect("Failed to create workspace");
    (workspace, build)
}

/// Fixture: workspace whose first `start` build has succeeded
pub async fn fixture_running_workspace(
    orchestrator: &WorkspaceOrchestrator,
    req: CreateWorkspaceRequest,
) -> (Workspace, WorkspaceBuild) {
    let (workspace, _) = fixture_pending_workspace(orchestrator, req).await;
    drain_queue(orchestrator, &[]).await;
    let build = orchestrator
        .latest_build(&workspace.id)
        .await
        .expect("Failed to load latest build")
        .expect("Workspace has no build");
    (workspace, build)
}
