//! Integration tests for REST API endpoints
//!
//! Workspaces, builds, scheduling, job logs, quota and template
//! administration, driven through the router with `oneshot`.

mod common;

use axum::http::StatusCode;
use chrono::Duration;
use common::{extract_json_body, TestClient, ADMIN};
use outpost_api::routes::schedule::ActivityResponse;
use outpost_api::routes::templates::CreateVersionResponse;
use outpost_orchestrator::schedule::TemplateScheduleOptions;
use outpost_orchestrator::{
    BuildTransition, Clock, JobLog, JobStatus, QuotaStatus, Template, Workspace, WorkspaceBuild,
    WorkspaceStatus, WorkspaceView,
};
use serde_json::{json, Value};

const HOUR_MS: i64 = 3_600_000;

async fn create_workspace(client: &TestClient, template_id: &str, name: &str, owner: &str) -> WorkspaceView {
    let response = client
        .post(
            "/api/v1/workspaces",
            &json!({ "name": name, "owner": "ignored", "template_id": template_id }),
            Some(owner),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    extract_json_body(response).await
}

#[tokio::test]
async fn test_create_workspace_endpoint() {
    let client = TestClient::new().await;
    let template = common::fixture_template(&client.orchestrator, Default::default()).await;

    let view = create_workspace(&client, &template.id, "test-workspace", "testuser").await;

    assert_eq!(view.workspace.name, "test-workspace");
    assert_eq!(view.workspace.owner, "testuser"); // Should be from auth header
    assert_eq!(view.status, WorkspaceStatus::Pending);
    let build = view.latest_build.expect("First build missing");
    assert_eq!(build.transition, BuildTransition::Start);
    assert_eq!(build.build_number, 1);
}

#[tokio::test]
async fn test_create_workspace_without_auth_fails() {
    let client = TestClient::new().await;
    let template = common::fixture_template(&client.orchestrator, Default::default()).await;

    let response = client
        .post(
            "/api/v1/workspaces",
            &json!({ "name": "dev", "template_id": template.id }),
            None,
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_workspace_validation_errors() {
    let client = TestClient::new().await;
    let template = common::fixture_template(&client.orchestrator, Default::default()).await;

    let response = client
        .post(
            "/api/v1/workspaces",
            &json!({ "name": "dev", "template_id": template.id, "ttl_ms": 1_000 }),
            Some("alice"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["field"], "ttl_ms");

    let response = client
        .post(
            "/api/v1/workspaces",
            &json!({ "name": "dev", "template_id": "no-such-template" }),
            Some("alice"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["field"], "template_id");
}

#[tokio::test]
async fn test_duplicate_workspace_name_conflicts() {
    let client = TestClient::new().await;
    let template = common::fixture_template(&client.orchestrator, Default::default()).await;
    create_workspace(&client, &template.id, "dev", "alice").await;

    let response = client
        .post(
            "/api/v1/workspaces",
            &json!({ "name": "dev", "template_id": template.id }),
            Some("alice"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_list_workspaces_filters_by_owner() {
    let client = TestClient::new().await;
    let template = common::fixture_template(&client.orchestrator, Default::default()).await;
    for i in 0..3 {
        common::fixture_workspace(&client.orchestrator, &template.id, &format!("alice-{i}"), "alice").await;
    }
    common::fixture_workspace(&client.orchestrator, &template.id, "bob-0", "bob").await;

    let response = client.get("/api/v1/workspaces", Some("bob")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let workspaces: Vec<Workspace> = extract_json_body(response).await;
    assert_eq!(workspaces.len(), 1);
    assert!(workspaces.iter().all(|w| w.owner == "bob"));

    // Asking for someone else's only works for admins
    let response = client.get("/api/v1/workspaces?owner=alice", Some("bob")).await;
    let workspaces: Vec<Workspace> = extract_json_body(response).await;
    assert!(workspaces.iter().all(|w| w.owner == "bob"));

    let response = client.get("/api/v1/workspaces?owner=alice", Some(ADMIN)).await;
    let workspaces: Vec<Workspace> = extract_json_body(response).await;
    assert_eq!(workspaces.len(), 3);
}

#[tokio::test]
async fn test_get_workspace_ownership() {
    let client = TestClient::new().await;
    let template = common::fixture_template(&client.orchestrator, Default::default()).await;
    let workspace = common::fixture_workspace(&client.orchestrator, &template.id, "dev", "alice").await;
    let uri = format!("/api/v1/workspaces/{}", workspace.id);

    let response = client.get(&uri, Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let view: WorkspaceView = extract_json_body(response).await;
    assert_eq!(view.status, WorkspaceStatus::Running);
    assert_eq!(view.job_status, Some(JobStatus::Succeeded));

    assert_eq!(client.get(&uri, Some("mallory")).await.status(), StatusCode::FORBIDDEN);
    assert_eq!(client.get(&uri, Some(ADMIN)).await.status(), StatusCode::OK);
    assert_eq!(
        client.get("/api/v1/workspaces/nonexistent-id", Some("alice")).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_build_lifecycle_endpoints() {
    let client = TestClient::new().await;
    let template = common::fixture_template(&client.orchestrator, Default::default()).await;
    let workspace = common::fixture_workspace(&client.orchestrator, &template.id, "dev", "alice").await;
    let builds_uri = format!("/api/v1/workspaces/{}/builds", workspace.id);

    let response = client.post(&builds_uri, &json!({ "transition": "stop" }), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let stop: WorkspaceBuild = extract_json_body(response).await;
    assert_eq!(stop.transition, BuildTransition::Stop);
    assert_eq!(stop.build_number, 2);
    assert_eq!(stop.initiator, "alice");

    // Still pending, so a second request conflicts
    let response = client.post(&builds_uri, &json!({ "transition": "start" }), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Someone else's workspace
    let response = client.post(&builds_uri, &json!({ "transition": "start" }), Some("mallory")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    common::complete_pending_jobs(&client.orchestrator).await;

    let response = client.get(&builds_uri, Some("alice")).await;
    let builds: Vec<WorkspaceBuild> = extract_json_body(response).await;
    assert_eq!(
        builds.iter().map(|b| b.build_number).collect::<Vec<_>>(),
        vec![2, 1]
    );
}

#[tokio::test]
async fn test_delete_workspace_endpoint() {
    let client = TestClient::new().await;
    let template = common::fixture_template(&client.orchestrator, Default::default()).await;
    let workspace = common::fixture_workspace(&client.orchestrator, &template.id, "dev", "alice").await;

    let response = client
        .delete(&format!("/api/v1/workspaces/{}", workspace.id), Some("alice"))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let build: WorkspaceBuild = extract_json_body(response).await;
    assert_eq!(build.transition, BuildTransition::Delete);

    common::complete_pending_jobs(&client.orchestrator).await;

    let response = client.get("/api/v1/workspaces", Some("alice")).await;
    let workspaces: Vec<Workspace> = extract_json_body(response).await;
    assert!(workspaces.is_empty());

    let response = client.delete("/api/v1/workspaces/nonexistent-id", Some("alice")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ttl_endpoint_errors() {
    let client = TestClient::new().await;
    let template = common::fixture_template(
        &client.orchestrator,
        TemplateScheduleOptions {
            max_ttl_ms: 2 * HOUR_MS,
            ..Default::default()
        },
    )
    .await;
    let workspace = common::fixture_workspace(&client.orchestrator, &template.id, "dev", "alice").await;
    let uri = format!("/api/v1/workspaces/{}/ttl", workspace.id);

    for (ttl_ms, expected) in [
        (30_000, "at least one minute"),
        (8 * 24 * HOUR_MS, "less than 7 days"),
        (3 * HOUR_MS, "maximum TTL"),
    ] {
        let response = client.put(&uri, &json!({ "ttl_ms": ttl_ms }), Some("alice")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "ttl {ttl_ms}");
        let body: Value = extract_json_body(response).await;
        let message = body["error"].as_str().unwrap_or_default();
        assert!(message.contains(expected), "{message} should mention {expected}");
    }

    let response = client.put(&uri, &json!({ "ttl_ms": HOUR_MS }), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let workspace: Workspace = extract_json_body(response).await;
    assert_eq!(workspace.ttl_ms, Some(HOUR_MS));
}

#[tokio::test]
async fn test_autostart_endpoint_respects_template() {
    let client = TestClient::new().await;
    let template = common::fixture_template(
        &client.orchestrator,
        TemplateScheduleOptions {
            user_autostart_enabled: false,
            ..Default::default()
        },
    )
    .await;
    let workspace = common::fixture_workspace(&client.orchestrator, &template.id, "dev", "alice").await;

    let response = client
        .put(
            &format!("/api/v1/workspaces/{}/autostart", workspace.id),
            &json!({ "schedule": "CRON_TZ=UTC 0 9 * * 1-5" }),
            Some("alice"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["field"], "autostart_schedule");
}

#[tokio::test]
async fn test_extend_and_activity_endpoints() {
    let client = TestClient::new().await;
    let template = common::fixture_template(&client.orchestrator, Default::default()).await;
    let response = client
        .post(
            "/api/v1/workspaces",
            &json!({ "name": "dev", "template_id": template.id, "ttl_ms": HOUR_MS }),
            Some("alice"),
        )
        .await;
    let view: WorkspaceView = extract_json_body(response).await;
    let id = view.workspace.id;

    // Not built yet
    let extend_uri = format!("/api/v1/workspaces/{id}/extend");
    let soon = client.clock.now() + Duration::hours(2);
    let response = client.put(&extend_uri, &json!({ "deadline": soon }), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    common::complete_pending_jobs(&client.orchestrator).await;

    let too_soon = client.clock.now() + Duration::minutes(10);
    let response = client.put(&extend_uri, &json!({ "deadline": too_soon }), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client.put(&extend_uri, &json!({ "deadline": soon }), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let build: WorkspaceBuild = extract_json_body(response).await;
    assert_eq!(build.deadline, Some(soon));

    // A bump to now + 1h lands before the extended deadline, so nothing moves
    let activity_uri = format!("/api/v1/workspaces/{id}/activity");
    let response = client.post_empty(&activity_uri, Some("alice")).await;
    let activity: ActivityResponse = extract_json_body(response).await;
    assert!(!activity.bumped);

    client.clock.advance(Duration::minutes(90));
    let response = client.post_empty(&activity_uri, Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let activity: ActivityResponse = extract_json_body(response).await;
    assert!(activity.bumped);
    assert_eq!(activity.deadline, Some(client.clock.now() + Duration::hours(1)));
}

#[tokio::test]
async fn test_job_logs_endpoint() {
    let client = TestClient::new().await;
    let template = common::fixture_template(&client.orchestrator, Default::default()).await;
    let view = create_workspace(&client, &template.id, "dev", "alice").await;
    let job_id = view.latest_build.expect("No build").job_id;

    let uri = format!("/api/v1/jobs/{job_id}/logs");
    let response = client.get(&uri, Some("alice")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let logs: Vec<JobLog> = extract_json_body(response).await;
    assert!(logs.is_empty());

    assert_eq!(client.get(&uri, Some("mallory")).await.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        client.get("/api/v1/jobs/missing/logs", Some("alice")).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_quota_endpoints() {
    let client = TestClient::new().await;

    let response = client.get("/api/v1/quota", Some("alice")).await;
    let status: QuotaStatus = extract_json_body(response).await;
    assert_eq!(status.budget, 0);
    assert_eq!(status.consumed, 0);

    let response = client.put("/api/v1/quota/alice", &json!({ "budget": 20 }), Some("alice")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client.put("/api/v1/quota/alice", &json!({ "budget": 20 }), Some(ADMIN)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = client.get("/api/v1/quota", Some("alice")).await;
    let status: QuotaStatus = extract_json_body(response).await;
    assert_eq!(status.budget, 20);
}

#[tokio::test]
async fn test_template_admin_endpoints() {
    let client = TestClient::new().await;

    let response = client
        .post("/api/v1/templates", &json!({ "name": "docker" }), Some("alice"))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client
        .post("/api/v1/templates", &json!({ "name": "docker" }), Some(ADMIN))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let template: Template = extract_json_body(response).await;
    assert!(template.active_version_id.is_none());

    let response = client
        .post(
            &format!("/api/v1/templates/{}/versions", template.id),
            &json!({ "name": "v1", "tags": ["docker"] }),
            Some(ADMIN),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: CreateVersionResponse = extract_json_body(response).await;
    assert_eq!(created.job_status, JobStatus::Pending);

    // Building before the import finished is rejected
    let response = client
        .post(
            "/api/v1/workspaces",
            &json!({ "name": "dev", "template_id": template.id }),
            Some("alice"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Any user may read a template
    let response = client
        .get(&format!("/api/v1/templates/{}", template.id), Some("alice"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = client
        .put(
            &format!("/api/v1/templates/{}/schedule", template.id),
            &json!({
                "user_autostart_enabled": true,
                "user_autostop_enabled": true,
                "default_ttl_ms": HOUR_MS,
                "max_ttl_ms": 4 * HOUR_MS
            }),
            Some(ADMIN),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let template: Template = extract_json_body(response).await;
    assert_eq!(template.schedule.default_ttl_ms, HOUR_MS);

    let response = client
        .post_empty(
            &format!(
                "/api/v1/templates/{}/versions/{}/archive",
                template.id, created.version.id
            ),
            Some(ADMIN),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}
