//! Autostart and autostop driven by the lifecycle executor.

mod common;

use chrono::Duration;
use common::*;
use outpost_orchestrator::lifecycle::SYSTEM_INITIATOR;
use outpost_orchestrator::schedule::{AutostopRequirement, TemplateScheduleOptions};
use outpost_orchestrator::{
    allow_all, BuildReason, BuildRequest, BuildTransition, LifecycleExecutor, LifecycleStats,
    WorkspaceOrchestrator,
};

async fn latest(orchestrator: &WorkspaceOrchestrator, workspace_id: &str) -> outpost_orchestrator::WorkspaceBuild {
    orchestrator
        .latest_build(workspace_id)
        .await
        .expect("Failed to load build")
        .expect("No build")
}

#[tokio::test]
async fn test_autostop_after_deadline() {
    let (orchestrator, clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (template, _) = fixture_template(&orchestrator, "docker", Default::default()).await;
    let mut req = workspace_request("dev", "alice", &template.id);
    req.ttl_ms = Some(3_600_000);
    let (workspace, _) = fixture_running_workspace(&orchestrator, req).await;
    let executor = LifecycleExecutor::new(orchestrator.clone());

    clock.advance(Duration::minutes(59));
    assert_eq!(
        executor.run_tick().await.expect("Tick failed"),
        LifecycleStats::default()
    );

    clock.advance(Duration::minutes(1));
    let stats = executor.run_tick().await.expect("Tick failed");
    assert_eq!(stats.transitions, 1);
    assert_eq!(stats.errors, 0);

    let build = latest(&orchestrator, &workspace.id).await;
    assert_eq!(build.transition, BuildTransition::Stop);
    assert_eq!(build.reason, BuildReason::Autostop);
    assert_eq!(build.initiator, SYSTEM_INITIATOR);

    // The stop is queued, not finished: nothing more to do yet.
    let stats = executor.run_tick().await.expect("Tick failed");
    assert_eq!(stats.transitions, 0);
}

#[tokio::test]
async fn test_autostop_at_max_deadline_without_ttl() {
    let (orchestrator, clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let schedule = TemplateScheduleOptions {
        autostop_requirement: AutostopRequirement {
            days_of_week: 0b111_1111,
            weeks: 1,
            quiet_hours: Some("CRON_TZ=UTC 0 23 * * *".parse().expect("Failed to parse schedule")),
        },
        ..Default::default()
    };
    let (template, _) = fixture_template(&orchestrator, "quiet", schedule).await;
    let (workspace, build) =
        fixture_running_workspace(&orchestrator, workspace_request("dev", "alice", &template.id)).await;
    assert_eq!(build.deadline, None);
    assert_eq!(build.max_deadline, Some(at("2024-05-06T23:00:00Z")));

    let executor = LifecycleExecutor::new(orchestrator.clone());
    clock.set(at("2024-05-06T23:00:00Z"));
    assert_eq!(executor.run_tick().await.expect("Tick failed").transitions, 1);
    assert_eq!(latest(&orchestrator, &workspace.id).await.reason, BuildReason::Autostop);
}

#[tokio::test]
async fn test_autostart_on_schedule() {
    let (orchestrator, clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (template, _) = fixture_template(&orchestrator, "docker", Default::default()).await;
    let (workspace, _) =
        fixture_running_workspace(&orchestrator, workspace_request("dev", "alice", &template.id)).await;
    orchestrator
        .update_workspace_autostart(&workspace.id, Some("CRON_TZ=UTC 0 9 * * 1-5"))
        .await
        .expect("Failed to set autostart");

    clock.set(at("2024-05-06T10:00:00Z"));
    orchestrator
        .request_build(BuildRequest::new(&workspace.id, BuildTransition::Stop, "alice"), &allow_all)
        .await
        .expect("Failed to stop");
    drain_queue(&orchestrator, &[]).await;

    let executor = LifecycleExecutor::new(orchestrator.clone());
    clock.set(at("2024-05-07T08:59:00Z"));
    assert_eq!(executor.run_tick().await.expect("Tick failed").transitions, 0);

    clock.set(at("2024-05-07T09:00:30Z"));
    assert_eq!(executor.run_tick().await.expect("Tick failed").transitions, 1);
    let build = latest(&orchestrator, &workspace.id).await;
    assert_eq!(build.transition, BuildTransition::Start);
    assert_eq!(build.reason, BuildReason::Autostart);
}

#[tokio::test]
async fn test_autostart_respects_template_gate() {
    let (orchestrator, clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (template, _) = fixture_template(&orchestrator, "docker", Default::default()).await;
    let (workspace, _) =
        fixture_running_workspace(&orchestrator, workspace_request("dev", "alice", &template.id)).await;
    orchestrator
        .update_workspace_autostart(&workspace.id, Some("CRON_TZ=UTC 0 9 * * *"))
        .await
        .expect("Failed to set autostart");
    orchestrator
        .request_build(BuildRequest::new(&workspace.id, BuildTransition::Stop, "alice"), &allow_all)
        .await
        .expect("Failed to stop");
    drain_queue(&orchestrator, &[]).await;

    // The template turns autostart off after the workspace opted in.
    orchestrator
        .update_template_schedule(
            &template.id,
            TemplateScheduleOptions {
                user_autostart_enabled: false,
                ..Default::default()
            },
        )
        .await
        .expect("Failed to update template");

    clock.advance(Duration::days(2));
    let executor = LifecycleExecutor::new(orchestrator.clone());
    assert_eq!(executor.run_tick().await.expect("Tick failed").transitions, 0);
}

#[tokio::test]
async fn test_deleted_workspaces_are_ignored() {
    let (orchestrator, clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (template, _) = fixture_template(&orchestrator, "docker", Default::default()).await;
    let mut req = workspace_request("dev", "alice", &template.id);
    req.ttl_ms = Some(3_600_000);
    let (workspace, _) = fixture_running_workspace(&orchestrator, req).await;
    orchestrator
        .delete_workspace(&workspace.id, "alice", &allow_all)
        .await
        .expect("Failed to delete");
    drain_queue(&orchestrator, &[]).await;

    clock.advance(Duration::days(1));
    let executor = LifecycleExecutor::new(orchestrator.clone());
    assert_eq!(
        executor.run_tick().await.expect("Tick failed"),
        LifecycleStats::default()
    );
}
