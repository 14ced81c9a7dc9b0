//! Worker protocol: acquisition, progress updates, completion, cancellation
//! and quota commits.

mod common;

use chrono::Duration;
use common::*;
use outpost_orchestrator::job::{LogEntry, LogLevel};
use outpost_orchestrator::provisionerd::proto::{
    CommitQuotaRequest, FailedJob, UpdateJobRequest, MAX_LOGS_PER_UPDATE,
};
use outpost_orchestrator::pubsub::workspace_channel;
use outpost_orchestrator::{
    Clock, JobReaper, JobStatus, OrchestratorError, ReaperStats, WorkspaceOrchestrator,
    WorkspaceStatus,
};

fn update(job_id: &str, seq: i64, lines: &[&str]) -> UpdateJobRequest {
    UpdateJobRequest {
        job_id: job_id.to_string(),
        seq,
        logs: lines
            .iter()
            .map(|l| LogEntry::new(at("2024-05-06T09:00:00Z"), LogLevel::Info, "apply", *l))
            .collect(),
        state: None,
    }
}

async fn running_job(orchestrator: &WorkspaceOrchestrator) -> (String, String) {
    let (template, _) = fixture_template(orchestrator, "docker", Default::default()).await;
    fixture_pending_workspace(orchestrator, workspace_request("dev", "alice", &template.id)).await;
    let daemon = register(orchestrator, "worker-1", &[]).await;
    let job = orchestrator
        .acquire_job(&daemon)
        .await
        .expect("Failed to acquire")
        .expect("No job to acquire");
    (daemon.id, job.job_id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acquire_is_exclusive() {
    let (orchestrator, _clock, _dir) = file_orchestrator_at("2024-05-06T09:00:00Z").await;
    let (template, _) = fixture_template(&orchestrator, "docker", Default::default()).await;
    fixture_pending_workspace(&orchestrator, workspace_request("dev", "alice", &template.id)).await;

    let mut daemons = Vec::new();
    for i in 0..8 {
        daemons.push(register(&orchestrator, &format!("worker-{i}"), &[]).await);
    }
    let racers: Vec<_> = daemons
        .iter()
        .cloned()
        .map(|daemon| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.acquire_job(&daemon).await })
        })
        .collect();

    let mut acquired = Vec::new();
    for racer in racers {
        let result = racer.await.expect("Acquire task panicked");
        if let Some(job) = result.expect("Acquire should not fail") {
            acquired.push(job);
        }
    }
    assert_eq!(acquired.len(), 1);

    let job = orchestrator
        .get_job(&acquired[0].job_id)
        .await
        .expect("Failed to load job");
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.started_at.is_some());
    assert!(daemons.iter().any(|d| job.worker_id.as_deref() == Some(d.id.as_str())));
}

#[tokio::test]
async fn test_acquire_oldest_first() {
    let (orchestrator, clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (template, _) = fixture_template(&orchestrator, "docker", Default::default()).await;
    let (older, _) =
        fixture_pending_workspace(&orchestrator, workspace_request("one", "alice", &template.id)).await;
    clock.advance(Duration::seconds(1));
    fixture_pending_workspace(&orchestrator, workspace_request("two", "alice", &template.id)).await;

    let daemon = register(&orchestrator, "worker-1", &[]).await;
    let job = orchestrator
        .acquire_job(&daemon)
        .await
        .expect("Failed to acquire")
        .expect("No job to acquire");
    assert_eq!(job.payload.workspace_id(), Some(older.id.as_str()));
}

#[tokio::test]
async fn test_acquire_matches_tags() {
    let (orchestrator, _clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (template, _) =
        fixture_template_with_tags(&orchestrator, "gpu", Default::default(), &["gpu"]).await;
    fixture_pending_workspace(&orchestrator, workspace_request("dev", "alice", &template.id)).await;

    let plain = register(&orchestrator, "plain", &["linux"]).await;
    let none = orchestrator.acquire_job(&plain).await.expect("Failed to acquire");
    assert!(none.is_none(), "a daemon without the gpu tag must not get the job");

    let gpu = register(&orchestrator, "gpu-box", &["gpu", "linux"]).await;
    let job = orchestrator
        .acquire_job(&gpu)
        .await
        .expect("Failed to acquire")
        .expect("gpu daemon should get the job");
    assert!(job.tags.contains("gpu"));

    let daemons = orchestrator.list_daemons().await.expect("Failed to list daemons");
    let gpu = daemons
        .iter()
        .find(|d| d.name == "gpu-box")
        .expect("Daemon not listed");
    assert!(gpu.last_seen_at.is_some());
}

#[tokio::test]
async fn test_empty_queue_returns_none() {
    let (orchestrator, _clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let daemon = register(&orchestrator, "worker-1", &[]).await;
    let job = orchestrator.acquire_job(&daemon).await.expect("Failed to acquire");
    assert!(job.is_none());
}

#[tokio::test]
async fn test_update_sequence_numbers() {
    let (orchestrator, _clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (daemon_id, job_id) = running_job(&orchestrator).await;

    let resp = orchestrator
        .update_job(&daemon_id, update(&job_id, 1, &["plan", "apply"]))
        .await
        .expect("Failed to send update");
    assert!(!resp.canceled);

    // A retry of the same update is accepted but not applied twice.
    orchestrator
        .update_job(&daemon_id, update(&job_id, 1, &["plan", "apply"]))
        .await
        .expect("Failed to resend update");

    orchestrator
        .update_job(&daemon_id, update(&job_id, 2, &["done"]))
        .await
        .expect("Failed to send update");

    let stale = orchestrator.update_job(&daemon_id, update(&job_id, 1, &["late"])).await;
    match stale {
        Err(OrchestratorError::Protocol(msg)) => assert!(msg.contains("stale")),
        other => panic!("Expected stale update rejection, got {other:?}"),
    }

    let logs = orchestrator.job_logs(&job_id, 0).await.expect("Failed to load logs");
    let outputs: Vec<_> = logs.iter().map(|l| l.entry.output.as_str()).collect();
    assert_eq!(outputs, ["plan", "apply", "done"]);

    let after = orchestrator
        .job_logs(&job_id, logs[1].id)
        .await
        .expect("Failed to load logs");
    assert_eq!(after.len(), 1);

    let job = orchestrator.get_job(&job_id).await.expect("Failed to load job");
    assert_eq!(job.last_update_seq, 2);
}

#[tokio::test]
async fn test_update_rejects_other_daemon_and_oversized_batches() {
    let (orchestrator, _clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (daemon_id, job_id) = running_job(&orchestrator).await;
    let intruder = register(&orchestrator, "worker-2", &[]).await;

    let result = orchestrator.update_job(&intruder.id, update(&job_id, 1, &[])).await;
    assert!(matches!(result, Err(OrchestratorError::Protocol(_))));

    let lines: Vec<String> = (0..=MAX_LOGS_PER_UPDATE).map(|n| n.to_string()).collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let result = orchestrator.update_job(&daemon_id, update(&job_id, 1, &refs)).await;
    assert!(matches!(result, Err(OrchestratorError::Protocol(_))));
}

#[tokio::test]
async fn test_update_heartbeats_and_stores_state() {
    let (orchestrator, clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (daemon_id, job_id) = running_job(&orchestrator).await;

    clock.advance(Duration::minutes(5));
    let mut req = update(&job_id, 1, &[]);
    req.state = Some(b"partial".to_vec());
    orchestrator
        .update_job(&daemon_id, req)
        .await
        .expect("Failed to send update");

    let job = orchestrator.get_job(&job_id).await.expect("Failed to load job");
    assert_eq!(job.updated_at, clock.now());

    // A failure without state falls back to the last reported state.
    orchestrator
        .fail_job(
            &daemon_id,
            FailedJob {
                job_id: job_id.clone(),
                error: "apply failed".to_string(),
                state: None,
            },
        )
        .await
        .expect("Failed to fail job");

    let job = orchestrator.get_job(&job_id).await.expect("Failed to load job");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("apply failed"));

    let workspace_id = job.payload.workspace_id().expect("Build job").to_string();
    let build = orchestrator
        .latest_build(&workspace_id)
        .await
        .expect("Failed to load build")
        .expect("No build");
    assert_eq!(build.provisioner_state, b"partial".to_vec());

    let view = orchestrator
        .get_workspace_view(&workspace_id)
        .await
        .expect("Failed to load view");
    assert_eq!(view.status, WorkspaceStatus::Failed);
}

#[tokio::test]
async fn test_terminal_jobs_ignore_late_reports() {
    let (orchestrator, _clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (daemon_id, job_id) = running_job(&orchestrator).await;

    orchestrator
        .complete_job(&daemon_id, completed(&job_id, vec![resource("vm", 4)]))
        .await
        .expect("Failed to complete job");

    // Retries of the final report are no-ops.
    orchestrator
        .complete_job(&daemon_id, completed(&job_id, vec![resource("vm", 99)]))
        .await
        .expect("Repeated complete should be a no-op");
    orchestrator
        .fail_job(
            &daemon_id,
            FailedJob {
                job_id: job_id.clone(),
                error: "late".to_string(),
                state: None,
            },
        )
        .await
        .expect("Fail after complete should be a no-op");

    let job = orchestrator.get_job(&job_id).await.expect("Failed to load job");
    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(job.error.is_none());
    assert!(job.completed_at.is_some());

    let resources = orchestrator
        .job_resources(&job_id)
        .await
        .expect("Failed to load resources");
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].daily_cost, 4);

    let result = orchestrator.update_job(&daemon_id, update(&job_id, 1, &[])).await;
    assert!(matches!(result, Err(OrchestratorError::Protocol(_))));
}

#[tokio::test]
async fn test_force_cancel_is_acknowledged() {
    let (orchestrator, _clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (daemon_id, job_id) = running_job(&orchestrator).await;

    assert!(orchestrator
        .force_cancel_job(&job_id, "canceled by admin")
        .await
        .expect("Failed to cancel"));
    assert!(!orchestrator
        .force_cancel_job(&job_id, "again")
        .await
        .expect("Second cancel should be a no-op"));

    let resp = orchestrator
        .update_job(&daemon_id, update(&job_id, 1, &["stopping"]))
        .await
        .expect("Updates are accepted while canceling");
    assert!(resp.canceled);

    // The worker finished anyway; its results are discarded.
    orchestrator
        .complete_job(&daemon_id, completed(&job_id, vec![resource("vm", 4)]))
        .await
        .expect("Failed to acknowledge");

    let job = orchestrator.get_job(&job_id).await.expect("Failed to load job");
    assert_eq!(job.status, JobStatus::Canceled);
    assert_eq!(job.error.as_deref(), Some("canceled by admin"));
    assert!(job.canceled_at.is_some());
    let resources = orchestrator
        .job_resources(&job_id)
        .await
        .expect("Failed to load resources");
    assert!(resources.is_empty());
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let (orchestrator, _clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (template, _) = fixture_template(&orchestrator, "docker", Default::default()).await;
    let (_, build) =
        fixture_pending_workspace(&orchestrator, workspace_request("dev", "alice", &template.id)).await;

    assert!(orchestrator
        .cancel_pending_job(&build.job_id)
        .await
        .expect("Failed to cancel"));
    let daemon = register(&orchestrator, "worker-1", &[]).await;
    assert!(orchestrator
        .acquire_job(&daemon)
        .await
        .expect("Failed to acquire")
        .is_none());
}

#[tokio::test]
async fn test_reaper_cancels_hung_jobs_then_finalizes() {
    let (orchestrator, clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (daemon_id, job_id) = running_job(&orchestrator).await;
    let reaper = JobReaper::new(
        orchestrator.clone(),
        std::time::Duration::from_secs(600),
        std::time::Duration::from_secs(60),
    );

    clock.advance(Duration::minutes(9));
    orchestrator
        .update_job(&daemon_id, update(&job_id, 1, &[]))
        .await
        .expect("Failed to heartbeat");
    clock.advance(Duration::minutes(9));
    assert_eq!(reaper.run_once().await.expect("Sweep failed"), ReaperStats::default());

    clock.advance(Duration::minutes(2));
    let stats = reaper.run_once().await.expect("Sweep failed");
    assert_eq!(stats.canceled, 1);
    assert_eq!(stats.finalized, 0);
    let job = orchestrator.get_job(&job_id).await.expect("Failed to load job");
    assert_eq!(job.status, JobStatus::Canceling);

    clock.advance(Duration::seconds(61));
    let stats = reaper.run_once().await.expect("Sweep failed");
    assert_eq!(stats.finalized, 1);
    let job = orchestrator.get_job(&job_id).await.expect("Failed to load job");
    assert_eq!(job.status, JobStatus::Canceled);

    // The worker coming back late is told the job is gone.
    let result = orchestrator.update_job(&daemon_id, update(&job_id, 2, &[])).await;
    assert!(matches!(result, Err(OrchestratorError::Protocol(_))));
}

#[tokio::test]
async fn test_first_import_activates_version() {
    let (orchestrator, _clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (template, v1) = fixture_template(&orchestrator, "docker", Default::default()).await;
    assert_eq!(template.active_version_id.as_deref(), Some(v1.id.as_str()));

    fixture_version(&orchestrator, &template.id, "v2", &[]).await;
    let template = orchestrator
        .get_template(&template.id)
        .await
        .expect("Failed to reload template");
    assert_eq!(template.active_version_id.as_deref(), Some(v1.id.as_str()));
}

#[tokio::test]
async fn test_start_completion_sets_cost_and_notifies() {
    let (orchestrator, _clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (daemon_id, job_id) = running_job(&orchestrator).await;
    let job = orchestrator.get_job(&job_id).await.expect("Failed to load job");
    let workspace_id = job.payload.workspace_id().expect("Build job").to_string();
    let mut events = orchestrator.pubsub().subscribe(&workspace_channel(&workspace_id));

    orchestrator
        .complete_job(&daemon_id, completed(&job_id, vec![resource("vm", 3), resource("disk", 2)]))
        .await
        .expect("Failed to complete job");

    tokio_test::assert_ok!(
        tokio::time::timeout(std::time::Duration::from_secs(1), events.recv()).await
    );
    let view = orchestrator
        .get_workspace_view(&workspace_id)
        .await
        .expect("Failed to load view");
    assert_eq!(view.status, WorkspaceStatus::Running);
    assert_eq!(view.latest_build.expect("No build").daily_cost, 5);
}

#[tokio::test]
async fn test_quota_commit_permits_then_denies() {
    let (orchestrator, _clock) = orchestrator_at("2024-05-06T09:00:00Z").await;
    let (template, _) = fixture_template(&orchestrator, "docker", Default::default()).await;
    orchestrator
        .set_quota_allowance("alice", 10)
        .await
        .expect("Failed to set allowance");
    let daemon = register(&orchestrator, "worker-1", &[]).await;

    // First workspace runs at 6 per day.
    fixture_pending_workspace(&orchestrator, workspace_request("one", "alice", &template.id)).await;
    let first = orchestrator
        .acquire_job(&daemon)
        .await
        .expect("Failed to acquire")
        .expect("No job");
    orchestrator
        .complete_job(&daemon.id, completed(&first.job_id, vec![resource("vm", 6)]))
        .await
        .expect("Failed to complete");

    fixture_pending_workspace(&orchestrator, workspace_request("two", "alice", &template.id)).await;
    let second = orchestrator
        .acquire_job(&daemon)
        .await
        .expect("Failed to acquire")
        .expect("No job");

    let permitted = orchestrator
        .commit_quota(
            &daemon.id,
            CommitQuotaRequest {
                job_id: second.job_id.clone(),
                daily_cost: 3,
            },
        )
        .await
        .expect("Failed to commit quota");
    assert!(permitted.ok);
    assert_eq!(permitted.credits_consumed, 9);
    assert_eq!(permitted.budget, 10);

    let denied = orchestrator
        .commit_quota(
            &daemon.id,
            CommitQuotaRequest {
                job_id: second.job_id.clone(),
                daily_cost: 5,
            },
        )
        .await
        .expect("Failed to commit quota");
    assert!(!denied.ok);
    assert_eq!(denied.credits_consumed, 11);

    // Over budget is recorded, never enforced on the job.
    let job = orchestrator.get_job(&second.job_id).await.expect("Failed to load job");
    assert_eq!(job.status, JobStatus::Running);

    let status = orchestrator.quota_status("alice").await.expect("Failed to load quota");
    assert_eq!(status.budget, 10);
    assert_eq!(status.consumed, 6);

    let result = orchestrator
        .commit_quota(
            &daemon.id,
            CommitQuotaRequest {
                job_id: second.job_id,
                daily_cost: -1,
            },
        )
        .await;
    assert!(matches!(result, Err(OrchestratorError::Protocol(_))));
}
