//! Provisioner that pretends to build infrastructure.
//!
//! Useful for exercising the server end to end: it logs what it was asked
//! to do, waits a configurable delay, and reports one resource per started
//! workspace.

use async_trait::async_trait;
use outpost_orchestrator::job::WorkspaceBuildPayload;
use outpost_orchestrator::provisionerd::proto::{AcquiredJob, Resource};
use outpost_orchestrator::provisionerd::{JobProgress, ProvisionOutcome, Provisioner};
use outpost_orchestrator::{BuildTransition, JobPayload, LogLevel};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct EchoProvisioner {
    delay: Duration,
    daily_cost: i64,
}

impl EchoProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time spent "applying" each job.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Cost reported for the resource of a started workspace.
    pub fn with_daily_cost(mut self, daily_cost: i64) -> Self {
        self.daily_cost = daily_cost;
        self
    }

    async fn wait(&self, progress: &JobProgress) -> anyhow::Result<()> {
        if self.delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = progress.cancellation().cancelled() => {
                progress.log(LogLevel::Warn, "apply", "interrupted");
                anyhow::bail!("canceled")
            }
            _ = tokio::time::sleep(self.delay) => Ok(()),
        }
    }

    fn build(&self, build: &WorkspaceBuildPayload, progress: &JobProgress) -> ProvisionOutcome {
        for param in &build.parameters {
            progress.log(LogLevel::Debug, "plan", format!("{} = {}", param.name, param.value));
        }

        let state = format!("echo:{}:{}", build.workspace_name, build.transition);
        progress.set_state(state.clone().into_bytes());

        let resources = match build.transition {
            BuildTransition::Start => vec![Resource {
                name: build.workspace_name.clone(),
                resource_type: "echo_instance".to_string(),
                daily_cost: self.daily_cost,
                metadata: serde_json::json!({ "owner": build.owner }),
            }],
            BuildTransition::Stop | BuildTransition::Delete => Vec::new(),
        };

        progress.log(
            LogLevel::Info,
            "apply",
            format!("{} {} resource(s)", build.transition, resources.len()),
        );
        ProvisionOutcome {
            resources,
            state: state.into_bytes(),
            metadata: serde_json::Value::Null,
        }
    }
}

#[async_trait]
impl Provisioner for EchoProvisioner {
    async fn provision(&self, job: &AcquiredJob, progress: &JobProgress) -> anyhow::Result<ProvisionOutcome> {
        match &job.payload {
            JobPayload::WorkspaceBuild(build) => {
                progress.log(
                    LogLevel::Info,
                    "init",
                    format!(
                        "{} workspace {} for {}",
                        build.transition, build.workspace_name, build.owner
                    ),
                );
                self.wait(progress).await?;
                Ok(self.build(build, progress))
            }
            JobPayload::TemplateVersionImport(import) => {
                progress.log(
                    LogLevel::Info,
                    "parse",
                    format!("importing template version {}", import.template_version_id),
                );
                self.wait(progress).await?;
                Ok(ProvisionOutcome::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use outpost_orchestrator::job::TemplateImportPayload;
    use outpost_orchestrator::JobType;

    fn job(payload: JobPayload) -> AcquiredJob {
        AcquiredJob {
            job_id: "job-1".to_string(),
            job_type: payload.job_type(),
            payload,
            tags: Default::default(),
            initiator: "alice".to_string(),
            created_at: Utc::now(),
            started_at: None,
        }
    }

    fn build(transition: BuildTransition) -> JobPayload {
        JobPayload::WorkspaceBuild(WorkspaceBuildPayload {
            build_id: "build-1".to_string(),
            workspace_id: "ws-1".to_string(),
            workspace_name: "dev".to_string(),
            owner: "alice".to_string(),
            template_version_id: "tv-1".to_string(),
            transition,
            parameters: Vec::new(),
            state: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_start_reports_costed_resource() {
        let echo = EchoProvisioner::new().with_daily_cost(4);
        let outcome = echo
            .provision(&job(build(BuildTransition::Start)), &JobProgress::new(16))
            .await
            .unwrap();

        assert_eq!(outcome.resources.len(), 1);
        assert_eq!(outcome.resources[0].daily_cost, 4);
        assert_eq!(outcome.state, b"echo:dev:start");
    }

    #[tokio::test]
    async fn test_stop_has_no_resources() {
        let outcome = EchoProvisioner::new()
            .provision(&job(build(BuildTransition::Stop)), &JobProgress::new(16))
            .await
            .unwrap();
        assert!(outcome.resources.is_empty());
    }

    #[tokio::test]
    async fn test_import_succeeds() {
        let payload = JobPayload::TemplateVersionImport(TemplateImportPayload {
            template_id: "tpl-1".to_string(),
            template_version_id: "tv-1".to_string(),
        });
        let job = job(payload);
        assert_eq!(job.job_type, JobType::TemplateVersionImport);

        let outcome = EchoProvisioner::new().provision(&job, &JobProgress::new(16)).await.unwrap();
        assert!(outcome.resources.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_delay() {
        let echo = EchoProvisioner::new().with_delay(Duration::from_secs(60));
        let progress = JobProgress::new(16);
        progress.cancellation().cancel();

        let result = echo.provision(&job(build(BuildTransition::Start)), &progress).await;
        assert!(result.is_err());
    }
}
